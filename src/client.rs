//! Tunnel client: dials the relay, claims a remote port and forwards every
//! signalled public connection to the local service.

use anyhow::Result;
use std::{fmt, io, sync::Arc, time::Duration};
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::ClientConfig,
    error::TunnelError,
    link::{self, Attachment, ControlLink},
    protocol::{self, Message, Reply},
};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Wait after a failed dial or handshake, and after a session when
/// reconnect is off.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Dialing,
    Handshaking,
    Active,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Dialing => "dialing",
            Self::Handshaking => "handshaking",
            Self::Active => "active",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub tunnel_name: String,
    pub local_host: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub reconnect: bool,
    pub reconnect_delay: Duration,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub local_dial_timeout: Duration,
    pub retry_delay: Duration,
}

impl ClientOptions {
    /// Builds options for the first configured tunnel (in name order). The
    /// others are listed but not started.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        config.validate()?;

        for (name, tunnel) in &config.tunnels {
            info!(
                tunnel = %name,
                local = %format!("{}:{}", tunnel.local_host, tunnel.local_port),
                remote_port = tunnel.remote_port,
                "Configured tunnel"
            );
        }

        let Some((name, tunnel)) = config.tunnels.iter().next() else {
            anyhow::bail!("no tunnels configured");
        };
        if config.tunnels.len() > 1 {
            warn!(
                started = %name,
                configured = config.tunnels.len(),
                "Only one tunnel per client is driven; the others are ignored"
            );
        }

        Ok(Self {
            server_addr: config.server.clone(),
            tunnel_name: name.clone(),
            local_host: tunnel.local_host.clone(),
            local_port: tunnel.local_port,
            remote_port: tunnel.remote_port,
            reconnect: config.reconnect,
            reconnect_delay: Duration::from_secs(config.reconnect_delay),
            dial_timeout: DIAL_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            local_dial_timeout: LOCAL_DIAL_TIMEOUT,
            retry_delay: RETRY_DELAY,
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    /// Wait before redialing once an active session has ended.
    #[must_use]
    pub fn reconnect_wait(&self) -> Duration {
        if self.reconnect && !self.reconnect_delay.is_zero() {
            self.reconnect_delay
        } else {
            self.retry_delay
        }
    }
}

#[derive(Debug)]
pub struct TunnelClient {
    opts: ClientOptions,
}

impl TunnelClient {
    #[must_use]
    pub fn new(opts: ClientOptions) -> Self {
        Self { opts }
    }

    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.opts
    }

    /// Drives the tunnel until `shutdown` fires or the relay rejects the
    /// request. Every other failure leads back to dialing.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), TunnelError> {
        let server = self.opts.server_addr.as_str();

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            self.enter(ClientState::Dialing);
            let mut stream = match connect(server, self.opts.dial_timeout).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(server = %server, error = %e, retry_in = ?self.opts.retry_delay, "Failed to connect to relay");
                    if !pause(self.opts.retry_delay, &shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            };
            info!(server = %server, "Connected to relay");

            self.enter(ClientState::Handshaking);
            match self.handshake(&mut stream).await {
                Ok(()) => {}
                Err(TunnelError::Rejected(reason)) => {
                    error!(server = %server, reason = %reason, "Relay rejected tunnel");
                    return Err(TunnelError::Rejected(reason));
                }
                Err(e) => {
                    warn!(server = %server, error = %e, retry_in = ?self.opts.retry_delay, "Handshake failed");
                    drop(stream);
                    if !pause(self.opts.retry_delay, &shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            }

            self.enter(ClientState::Active);
            if let Err(e) = self.run_active(stream, &shutdown).await {
                warn!(server = %server, error = %e, "Tunnel error");
            }

            self.enter(ClientState::Disconnected);
            info!(server = %server, "Disconnected from relay");
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let wait = self.opts.reconnect_wait();
            info!(delay = ?wait, "Reconnecting");
            if !pause(wait, &shutdown).await {
                return Ok(());
            }
        }
    }

    fn enter(&self, state: ClientState) {
        debug!(tunnel = %self.opts.tunnel_name, state = %state, "Client state changed");
    }

    async fn handshake(&self, stream: &mut TcpStream) -> Result<(), TunnelError> {
        protocol::write_message(stream, &Message::Tunnel(self.opts.remote_port)).await?;

        let raw = timeout(self.opts.handshake_timeout, protocol::read_message(stream))
            .await
            .map_err(|_| TunnelError::IdleTimeout(self.opts.handshake_timeout))??;

        match protocol::parse_reply(&raw) {
            Reply::Accepted(message) => {
                info!(
                    message = %message,
                    local = %self.opts.local_addr(),
                    remote_port = self.opts.remote_port,
                    "Tunnel active, waiting for connections"
                );
            }
            Reply::Rejected(reason) => return Err(TunnelError::Rejected(reason)),
            Reply::Unexpected(response) => {
                warn!(response = %response, "Unexpected response from relay");
            }
        }
        Ok(())
    }

    /// Reads signals until the control connection fails. Each signal starts a
    /// local session and ends the one before it, since the control connection
    /// carries a single stream at a time. Sessions are cancelled when this
    /// returns.
    async fn run_active(
        &self,
        stream: TcpStream,
        shutdown: &CancellationToken,
    ) -> Result<(), TunnelError> {
        let (mut reader, link) = link::split(stream)?;
        let sessions = shutdown.child_token();
        let mut current: Option<CancellationToken> = None;

        let result = loop {
            let chunk = tokio::select! {
                () = shutdown.cancelled() => break Ok(()),
                read = reader.read_chunk() => match read {
                    Ok(chunk) => chunk,
                    Err(e) => break Err(e),
                },
            };

            match signalled_port(&chunk) {
                Some(port) => {
                    info!(port, "Incoming connection");
                    if let Some(previous) = current.take() {
                        debug!(port, "Ending previous local session");
                        previous.cancel();
                    }
                    let cancel = sessions.child_token();
                    current = Some(cancel.clone());

                    // Attach before the next read so payload following the
                    // signal is kept.
                    let attachment = link.attach_fresh();
                    let link = Arc::clone(&link);
                    let local_addr = self.opts.local_addr();
                    let dial_timeout = self.opts.local_dial_timeout;
                    tokio::spawn(async move {
                        if let Err(e) =
                            local_session(&link, attachment, &local_addr, dial_timeout, &cancel).await
                        {
                            warn!(local_addr = %local_addr, error = %e, "Local session failed");
                        }
                    });
                }
                None => reader.dispatch(chunk),
            }
        };

        sessions.cancel();
        link.shutdown().await;
        result
    }
}

fn signalled_port(chunk: &[u8]) -> Option<u16> {
    if !chunk.starts_with(b"CONN ") || chunk.len() > protocol::MAX_MESSAGE_LEN {
        return None;
    }
    std::str::from_utf8(chunk).ok().and_then(protocol::parse_signal)
}

async fn local_session(
    link: &ControlLink,
    attachment: Attachment,
    local_addr: &str,
    dial_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), TunnelError> {
    let local = tokio::select! {
        () = cancel.cancelled() => return Ok(()),
        local = connect(local_addr, dial_timeout) => local?,
    };
    info!(local_addr = %local_addr, "Connected to local service");

    link::splice(link, &attachment, local, cancel).await
}

async fn connect(addr: &str, limit: Duration) -> Result<TcpStream, TunnelError> {
    match timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(TunnelError::dial(addr, e)),
        Err(_) => Err(TunnelError::dial(
            addr,
            io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
        )),
    }
}

/// Sleeps for `delay`. Returns false if shutdown fired first.
async fn pause(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => false,
        () = sleep(delay) => true,
    }
}
