use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, PoisonError, RwLock},
};

use crate::{error::TunnelError, relay::Tunnel};

/// Live tunnels keyed by public port. At most one tunnel holds a port.
#[derive(Debug, Default)]
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<u16, Arc<Tunnel>>>,
}

/// Whether the requested `port` may be claimed under `whitelist`. An empty
/// whitelist allows every port. Takes the request as sent, before any range
/// check.
#[must_use]
pub fn is_port_allowed(port: i64, whitelist: &[u16]) -> bool {
    whitelist.is_empty() || whitelist.iter().any(|allowed| i64::from(*allowed) == port)
}

impl TunnelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the tunnel's port. Fails with the current holder's address if
    /// the port is taken.
    pub fn register(&self, tunnel: Arc<Tunnel>) -> Result<(), TunnelError> {
        let mut tunnels = self.tunnels.write().unwrap_or_else(PoisonError::into_inner);
        let port = tunnel.port();
        if let Some(existing) = tunnels.get(&port) {
            return Err(TunnelError::PortInUse {
                port,
                owner: existing.client_addr().to_string(),
            });
        }
        tunnels.insert(port, tunnel);
        Ok(())
    }

    /// Releases `port` if it is still held by the tunnel with `id`. Safe to
    /// call more than once, and after a failed [`register`](Self::register).
    pub fn unregister(&self, port: u16, id: u64) -> bool {
        let mut tunnels = self.tunnels.write().unwrap_or_else(PoisonError::into_inner);
        if tunnels.get(&port).is_some_and(|tunnel| tunnel.id() == id) {
            tunnels.remove(&port);
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn owner(&self, port: u16) -> Option<SocketAddr> {
        self.tunnels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&port)
            .map(|tunnel| tunnel.client_addr())
    }

    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        self.owner(port).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tunnels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every live tunnel, for shutdown.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Tunnel>> {
        self.tunnels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
