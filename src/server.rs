use anyhow::{Context, Result};
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::{Instant, interval_at, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::ServerConfig,
    error::TunnelError,
    link::{self, ControlLink},
    protocol::{self, Message},
    registry::{TunnelRegistry, is_port_allowed},
    relay::{self, Tunnel},
    security::SecurityGate,
};

/// Deadline for the `TUNNEL` request after a control connection is accepted.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Period of the rate-window sweep and status line.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// The public relay: accepts control connections, gates them, binds public
/// ports and runs the relay engine for every admitted tunnel.
#[derive(Debug)]
pub struct RelayServer {
    config: ServerConfig,
    idle_timeout: Duration,
    registry: TunnelRegistry,
    gate: Arc<SecurityGate>,
    shutdown: CancellationToken,
    next_id: AtomicU64,
}

impl RelayServer {
    /// Every tunnel's cancellation derives from `shutdown`.
    pub fn new(config: ServerConfig, shutdown: CancellationToken) -> Result<Self> {
        let gate = SecurityGate::new(&config).context("Failed to build security gate")?;
        Ok(Self {
            idle_timeout: config.idle_timeout(),
            config,
            registry: TunnelRegistry::new(),
            gate: Arc::new(gate),
            shutdown,
            next_id: AtomicU64::new(1),
        })
    }

    /// Overrides the control idle timeout derived from `timeout_minutes`.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = idle;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    #[must_use]
    pub fn gate(&self) -> &SecurityGate {
        &self.gate
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.listen_addr();
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to address {addr}"))
    }

    /// Binds the configured control port and serves until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local_addr = listener
            .local_addr()
            .context("Failed to get control listener local address")?;
        info!(
            listen_addr = %local_addr,
            security = self.config.security.enabled,
            max_connections = self.config.max_connections,
            rate_limit = self.config.rate_limit,
            allowed_ports = ?self.config.allowed_ports,
            idle_timeout = ?self.idle_timeout,
            "Relay server listening"
        );

        let sweep = tokio::spawn(Arc::clone(&self).sweep_loop());

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            server.handle_connection(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }

        drop(listener);
        for tunnel in self.registry.snapshot() {
            tunnel.cancel();
        }
        let _ = sweep.await;

        info!(listen_addr = %local_addr, "Relay server stopped");
        Ok(())
    }

    #[tracing::instrument(skip(self, stream), fields(client_addr = %peer))]
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let ip = peer.ip().to_canonical();
        info!(ip = %ip, "Client connected");

        if let Err(rejection) = self.gate.admit(ip) {
            let e = TunnelError::from(rejection);
            warn!(ip = %ip, reason = %rejection, error = %e, "Connection rejected");
            return;
        }

        let guard = self.gate.track(ip);
        info!(ip = %ip, active = guard.count(), "Connection admitted");

        if let Err(e) = self.serve_control(stream, peer).await {
            if e.is_reported() {
                debug!(error = %e, "Control connection closed after denial");
            } else {
                warn!(error = %e, "Control connection failed");
            }
        }

        drop(guard);
        debug!(ip = %ip, remaining = self.gate.active_connections(ip), "Control connection closed");
    }

    async fn serve_control(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<(), TunnelError> {
        let raw = timeout(HANDSHAKE_TIMEOUT, protocol::read_message(&mut stream))
            .await
            .map_err(|_| TunnelError::IdleTimeout(HANDSHAKE_TIMEOUT))??;

        let Some(requested) = protocol::parse_request(&raw) else {
            return Err(TunnelError::ProtocolViolation(format!(
                "invalid tunnel request: {raw:?}"
            )));
        };

        let (mut reader, link) = link::split(stream)?;

        if !is_port_allowed(requested, &self.config.allowed_ports) {
            return deny(&link, TunnelError::PortNotAllowed(requested)).await;
        }

        let port = match u16::try_from(requested) {
            Ok(port) if port != 0 => port,
            _ => return deny(&link, TunnelError::PortOutOfRange(requested)).await,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tunnel = Arc::new(Tunnel::new(
            id,
            port,
            Arc::clone(&link),
            self.shutdown.child_token(),
        ));

        if let Err(e) = self.registry.register(Arc::clone(&tunnel)) {
            return deny(&link, e).await;
        }

        let listener = match TcpListener::bind((self.config.bind_ip.as_str(), port)).await {
            Ok(listener) => listener,
            Err(source) => {
                self.registry.unregister(port, id);
                return deny(&link, TunnelError::Bind { port, source }).await;
            }
        };

        let accept = relay::spawn_accept_loop(Arc::clone(&tunnel), listener);

        let established = Message::Ok(format!("Tunnel established on port {port}"));
        if let Err(e) = link.send_message(&established).await {
            self.cleanup_tunnel(&tunnel, accept).await;
            return Err(e);
        }
        info!(port, client_addr = %peer, tunnel_id = id, "Tunnel created");

        let end = relay::keepalive(&tunnel, &mut reader, self.idle_timeout).await;
        match &end {
            TunnelError::IdleTimeout(idle) => {
                info!(port, client_addr = %peer, idle = ?idle, "Tunnel timed out");
            }
            other => {
                info!(port, client_addr = %peer, reason = %other, "Client disconnected");
            }
        }

        self.cleanup_tunnel(&tunnel, accept).await;
        Ok(())
    }

    /// Tears a tunnel down: cancel, close the public listener, close the
    /// control connection, release the port. Runs at most once per tunnel.
    async fn cleanup_tunnel(&self, tunnel: &Tunnel, accept: JoinHandle<()>) {
        if !tunnel.begin_cleanup() {
            return;
        }

        tunnel.cancel();
        if let Err(e) = accept.await {
            error!(port = tunnel.port(), error = %e, "Public accept loop panicked");
        }
        tunnel.link().shutdown().await;
        self.registry.unregister(tunnel.port(), tunnel.id());

        let lifetime = SystemTime::now()
            .duration_since(tunnel.created_at())
            .unwrap_or_default();
        info!(
            port = tunnel.port(),
            client_addr = %tunnel.client_addr(),
            lifetime = ?lifetime,
            "Tunnel cleaned up"
        );
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = interval_at(Instant::now() + SWEEP_INTERVAL, SWEEP_INTERVAL);
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let pruned = self.gate.prune_rate_windows();
                    info!(
                        active_tunnels = self.registry.len(),
                        unique_ips = self.gate.unique_ips(),
                        pruned_rate_windows = pruned,
                        "Relay status"
                    );
                }
            }
        }
    }
}

/// Reports an admission failure as `ERROR <reason>` and closes the connection.
async fn deny(link: &ControlLink, e: TunnelError) -> Result<(), TunnelError> {
    warn!(client_addr = %link.peer_addr(), reason = %e, "Tunnel request denied");
    if let Err(send_error) = link.send_message(&Message::Error(e.to_string())).await {
        debug!(error = %send_error, "Failed to deliver denial");
    }
    link.shutdown().await;
    Err(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        time::sleep,
    };

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);
    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    /// Finds an unused port by binding to port 0
    async fn find_free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    fn test_config(allowed_ports: Vec<u16>) -> ServerConfig {
        ServerConfig {
            bind_ip: "127.0.0.1".to_string(),
            allowed_ports,
            ..ServerConfig::default()
        }
    }

    /// Starts a relay on a free loopback port
    async fn start_relay(server: RelayServer) -> (Arc<RelayServer>, SocketAddr) {
        let server = Arc::new(server);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&server).serve(listener));
        (server, addr)
    }

    async fn start_default_relay(config: ServerConfig) -> (Arc<RelayServer>, SocketAddr) {
        start_relay(RelayServer::new(config, CancellationToken::new()).unwrap()).await
    }

    /// Opens a control connection, sends `TUNNEL <port>` and returns the reply
    async fn request_tunnel(relay: SocketAddr, port: u16) -> (TcpStream, String) {
        send_request(relay, &format!("TUNNEL {port}")).await
    }

    async fn send_request(relay: SocketAddr, request: &str) -> (TcpStream, String) {
        let mut stream = TcpStream::connect(relay).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let reply = read_reply(&mut stream).await;
        (stream, reply)
    }

    /// Reads one reply; an empty string means the relay closed the connection
    async fn read_reply(stream: &mut TcpStream) -> String {
        let mut buffer = [0u8; 1024];
        match timeout(TEST_TIMEOUT, stream.read(&mut buffer)).await {
            Ok(Ok(n)) => String::from_utf8_lossy(&buffer[..n]).into_owned(),
            Ok(Err(_)) => String::new(),
            Err(_) => panic!("Timeout waiting for relay reply"),
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + TEST_TIMEOUT;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            sleep(Duration::from_millis(20)).await;
        }
    }

    mod handshake {
        use super::*;

        #[tokio::test]
        async fn grants_allowed_port() {
            let port = find_free_port().await;
            let (server, relay) = start_default_relay(test_config(vec![port])).await;

            let (_control, reply) = request_tunnel(relay, port).await;
            assert_eq!(reply, format!("OK Tunnel established on port {port}"));
            assert!(server.registry().contains(port));
        }

        #[tokio::test]
        async fn empty_whitelist_allows_any_port() {
            let port = find_free_port().await;
            let (_server, relay) = start_default_relay(test_config(vec![])).await;

            let (_control, reply) = request_tunnel(relay, port).await;
            assert_eq!(reply, format!("OK Tunnel established on port {port}"));
        }

        #[tokio::test]
        async fn denies_port_outside_whitelist() {
            let allowed = find_free_port().await;
            let denied = find_free_port().await;
            let (server, relay) = start_default_relay(test_config(vec![allowed])).await;

            let (mut control, reply) = request_tunnel(relay, denied).await;
            assert_eq!(reply, format!("ERROR Port {denied} not allowed"));
            assert_eq!(read_reply(&mut control).await, "");
            assert!(!server.registry().contains(denied));
        }

        #[tokio::test]
        async fn second_claim_reports_current_owner() {
            let port = find_free_port().await;
            let (_server, relay) = start_default_relay(test_config(vec![port])).await;

            let (first, reply) = request_tunnel(relay, port).await;
            assert!(reply.starts_with("OK"));
            let owner = first.local_addr().unwrap();

            let (_second, reply) = request_tunnel(relay, port).await;
            assert_eq!(reply, format!("ERROR Port {port} already in use by {owner}"));
        }

        #[tokio::test]
        async fn reports_unbindable_port() {
            let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = occupied.local_addr().unwrap().port();
            let (server, relay) = start_default_relay(test_config(vec![])).await;

            let (_control, reply) = request_tunnel(relay, port).await;
            assert!(
                reply.starts_with(&format!("ERROR failed to listen on port {port}")),
                "unexpected reply: {reply}"
            );
            assert!(!server.registry().contains(port));
        }

        #[tokio::test]
        async fn whitelist_check_covers_out_of_range_ports() {
            let allowed = find_free_port().await;
            let (server, relay) = start_default_relay(test_config(vec![allowed])).await;

            for port in ["70000", "0", "-1"] {
                let (_control, reply) = send_request(relay, &format!("TUNNEL {port}")).await;
                assert_eq!(reply, format!("ERROR Port {port} not allowed"));
            }
            assert!(server.registry().is_empty());
        }

        #[tokio::test]
        async fn out_of_range_port_gets_error_reply() {
            let (server, relay) = start_default_relay(test_config(vec![])).await;

            for port in ["70000", "0"] {
                let (mut control, reply) = send_request(relay, &format!("TUNNEL {port}")).await;
                assert_eq!(
                    reply,
                    format!("ERROR failed to listen on port {port}: port out of range")
                );
                assert_eq!(read_reply(&mut control).await, "");
            }
            assert!(server.registry().is_empty());
        }

        #[tokio::test]
        async fn malformed_first_message_is_dropped_silently() {
            let (server, relay) = start_default_relay(test_config(vec![])).await;

            let mut stream = TcpStream::connect(relay).await.unwrap();
            stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
            assert_eq!(read_reply(&mut stream).await, "");
            assert!(server.registry().is_empty());
            wait_until(|| server.gate().active_connections(LOCALHOST) == 0).await;
        }
    }

    mod admission {
        use super::*;

        fn secured(security: SecurityConfig) -> ServerConfig {
            ServerConfig {
                security,
                ..test_config(vec![1])
            }
        }

        #[tokio::test]
        async fn rate_limit_rejects_silently_after_n_connections() {
            let config = secured(SecurityConfig {
                enabled: true,
                max_connections_per_ip: 5,
                rate_limit_per_ip: 2,
            });
            let (_server, relay) = start_default_relay(config).await;

            for _ in 0..2 {
                let (_control, reply) = request_tunnel(relay, 2).await;
                assert_eq!(reply, "ERROR Port 2 not allowed");
            }

            let (_control, reply) = request_tunnel(relay, 2).await;
            assert_eq!(reply, "");
        }

        #[tokio::test]
        async fn banned_address_gets_no_reply() {
            let config = ServerConfig {
                banned_ips: vec!["127.0.0.0/8".to_string()],
                ..secured(SecurityConfig {
                    enabled: true,
                    max_connections_per_ip: 5,
                    rate_limit_per_ip: 30,
                })
            };
            let (_server, relay) = start_default_relay(config).await;

            let (_control, reply) = request_tunnel(relay, 1).await;
            assert_eq!(reply, "");
        }

        #[tokio::test]
        async fn per_ip_cap_counts_live_tunnels() {
            let port = find_free_port().await;
            let config = ServerConfig {
                allowed_ports: vec![port],
                ..secured(SecurityConfig {
                    enabled: true,
                    max_connections_per_ip: 1,
                    rate_limit_per_ip: 30,
                })
            };
            let (server, relay) = start_default_relay(config).await;

            let (first, reply) = request_tunnel(relay, port).await;
            assert!(reply.starts_with("OK"));

            let (_second, reply) = request_tunnel(relay, port).await;
            assert_eq!(reply, "");

            drop(first);
            wait_until(|| server.gate().active_connections(LOCALHOST) == 0).await;
            let (_third, reply) = request_tunnel(relay, port).await;
            assert!(reply.starts_with("OK"));
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn disconnect_cleans_up_exactly_once() {
            let port = find_free_port().await;
            let (server, relay) = start_default_relay(test_config(vec![port])).await;

            let (control, reply) = request_tunnel(relay, port).await;
            assert!(reply.starts_with("OK"));
            assert_eq!(server.gate().active_connections(LOCALHOST), 1);

            drop(control);
            wait_until(|| !server.registry().contains(port)).await;
            wait_until(|| server.gate().active_connections(LOCALHOST) == 0).await;
            assert_eq!(server.gate().unique_ips(), 0);

            // The port is free again for a new client.
            let (_control, reply) = request_tunnel(relay, port).await;
            assert_eq!(reply, format!("OK Tunnel established on port {port}"));
        }

        #[tokio::test]
        async fn idle_timeout_ends_tunnel() {
            let port = find_free_port().await;
            let server = RelayServer::new(test_config(vec![port]), CancellationToken::new())
                .unwrap()
                .with_idle_timeout(Duration::from_millis(200));
            let (server, relay) = start_relay(server).await;

            let (mut control, reply) = request_tunnel(relay, port).await;
            assert!(reply.starts_with("OK"));

            assert_eq!(read_reply(&mut control).await, "");
            wait_until(|| server.registry().is_empty()).await;
            wait_until(|| server.gate().total_connections() == 0).await;
            assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
        }

        #[tokio::test]
        async fn shutdown_cancels_every_tunnel() {
            let first = find_free_port().await;
            let second = find_free_port().await;
            let shutdown = CancellationToken::new();
            let server =
                RelayServer::new(test_config(vec![first, second]), shutdown.clone()).unwrap();
            let (server, relay) = start_relay(server).await;

            let (mut a, reply) = request_tunnel(relay, first).await;
            assert!(reply.starts_with("OK"));
            let (mut b, reply) = request_tunnel(relay, second).await;
            assert!(reply.starts_with("OK"));

            shutdown.cancel();
            assert_eq!(read_reply(&mut a).await, "");
            assert_eq!(read_reply(&mut b).await, "");
            wait_until(|| server.registry().is_empty()).await;
            sleep(Duration::from_millis(100)).await;
            assert!(TcpStream::connect(relay).await.is_err());
        }

        #[tokio::test]
        async fn public_bytes_reach_control_connection() {
            let port = find_free_port().await;
            let (_server, relay) = start_default_relay(test_config(vec![port])).await;

            let (mut control, reply) = request_tunnel(relay, port).await;
            assert!(reply.starts_with("OK"));

            let mut public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            assert_eq!(read_reply(&mut control).await, format!("CONN {port}"));

            let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
            public.write_all(&payload).await.unwrap();
            let mut received = Vec::new();
            while received.len() < payload.len() {
                let mut buffer = [0u8; 8192];
                let n = timeout(TEST_TIMEOUT, control.read(&mut buffer))
                    .await
                    .unwrap()
                    .unwrap();
                assert!(n > 0);
                received.extend_from_slice(&buffer[..n]);
            }
            assert_eq!(received, payload);

            control.write_all(&payload).await.unwrap();
            let mut echoed = vec![0u8; payload.len()];
            timeout(TEST_TIMEOUT, public.read_exact(&mut echoed))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(echoed, payload);
        }
    }
}
