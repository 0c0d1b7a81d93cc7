//! Relay engine: public accept loop, per-connection byte relay and the
//! control keepalive loop of one tunnel.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};

use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::TunnelError,
    link::{self, ControlLink, ControlReader},
    protocol::Message,
};

/// One live port forward.
#[derive(Debug)]
pub struct Tunnel {
    id: u64,
    port: u16,
    client_addr: SocketAddr,
    created_at: SystemTime,
    link: Arc<ControlLink>,
    cancel: CancellationToken,
    cleaned_up: AtomicBool,
}

impl Tunnel {
    /// `cancel` should be a child of the server's shutdown token.
    #[must_use]
    pub fn new(id: u64, port: u16, link: Arc<ControlLink>, cancel: CancellationToken) -> Self {
        Self {
            id,
            port,
            client_addr: link.peer_addr(),
            created_at: SystemTime::now(),
            link,
            cancel,
            cleaned_up: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    #[must_use]
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    #[must_use]
    pub fn link(&self) -> &Arc<ControlLink> {
        &self.link
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true exactly once, for whoever gets to run cleanup.
    pub fn begin_cleanup(&self) -> bool {
        !self.cleaned_up.swap(true, Ordering::AcqRel)
    }
}

/// Accepts public connections until the tunnel is cancelled. The listener is
/// dropped, releasing the port, when the task ends.
pub fn spawn_accept_loop(tunnel: Arc<Tunnel>, listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = tunnel.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((public, peer)) => {
                        info!(port = tunnel.port, public_addr = %peer, client_addr = %tunnel.client_addr, "Public connection accepted");
                        let tunnel = Arc::clone(&tunnel);
                        tokio::spawn(async move {
                            if let Err(e) = relay_public_connection(&tunnel, public).await {
                                debug!(port = tunnel.port, public_addr = %peer, error = %e, "Public connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(port = tunnel.port, error = %e, "Failed to accept connection on tunnel port");
                    }
                },
            }
        }
        debug!(port = tunnel.port, "Public accept loop stopped");
    })
}

/// Signals the client with `CONN <port>` and relays bytes between the public
/// connection and the control connection until either side ends.
pub async fn relay_public_connection(tunnel: &Tunnel, public: TcpStream) -> Result<(), TunnelError> {
    // Attach before signalling so payload following the signal is kept.
    let attachment = tunnel.link.attach();
    tunnel.link.send_message(&Message::Conn(tunnel.port)).await?;

    link::splice(&tunnel.link, &attachment, public, &tunnel.cancel).await
}

/// Reads the control connection until it fails, stays idle for `idle`, or
/// the tunnel is cancelled. Payload read here is handed to public relays.
pub async fn keepalive(tunnel: &Tunnel, reader: &mut ControlReader, idle: Duration) -> TunnelError {
    loop {
        tokio::select! {
            () = tunnel.cancel.cancelled() => {
                return TunnelError::ConnectionLost("relay shutting down".into());
            }
            read = reader.read_chunk_timeout(idle) => match read {
                Ok(chunk) => reader.dispatch(chunk),
                Err(e) => return e,
            },
        }
    }
}
