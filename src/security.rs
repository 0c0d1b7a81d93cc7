use anyhow::{Result, anyhow};
use ipnet::IpNet;
use std::{
    collections::HashMap,
    fmt,
    net::IpAddr,
    sync::{Arc, PoisonError, RwLock},
    time::Instant,
};

use crate::{config::ServerConfig, error::TunnelError, rate_limit::RateLimiter};

/// Parses the configured ban list. Entries may be single addresses or CIDR blocks.
pub fn parse_ban_list(entries: &[String]) -> Result<Vec<IpNet>> {
    entries
        .iter()
        .map(|entry| {
            let entry = entry.trim();
            // Try parsing as individual IP address first
            if let Ok(ip) = entry.parse::<IpAddr>() {
                Ok(IpNet::from(ip))
            }
            // Try parsing as CIDR subnet
            else if let Ok(net) = entry.parse::<IpNet>() {
                Ok(net)
            } else {
                Err(anyhow!("Invalid IP address or CIDR in banned_ips: {}", entry))
            }
        })
        .collect()
}

/// Checks if an address falls inside any banned entry
#[must_use]
pub fn is_ip_banned(ip: IpAddr, banned: &[IpNet]) -> bool {
    banned.iter().any(|net| net.contains(&ip))
}

/// Why the gate turned a control connection away. Only ever logged; the peer
/// just sees the connection close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Banned,
    TooManyConnections(usize),
    RateLimited,
    ServerFull(usize),
    GlobalRateLimited,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Banned => f.write_str("address is banned"),
            Self::TooManyConnections(n) => write!(f, "{n} active connections from address"),
            Self::RateLimited => f.write_str("per-address rate limit reached"),
            Self::ServerFull(n) => write!(f, "{n} active connections on server"),
            Self::GlobalRateLimited => f.write_str("server rate limit reached"),
        }
    }
}

impl From<Rejection> for TunnelError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::RateLimited | Rejection::GlobalRateLimited => Self::RateLimited,
            Rejection::ServerFull(_) => Self::CapacityExceeded,
            other => Self::SecurityRejected(other.to_string()),
        }
    }
}

/// Admission control for inbound control connections.
///
/// Per-address connection counts, per-address rate windows and the global
/// rate window each sit behind their own lock. No method holds more than one
/// of them at a time.
#[derive(Debug)]
pub struct SecurityGate {
    enabled: bool,
    banned: Vec<IpNet>,
    max_per_ip: usize,
    /// Server-wide connection cap; 0 leaves it off.
    max_total: usize,
    connections: RwLock<HashMap<IpAddr, usize>>,
    rate_windows: RwLock<RateLimiter<IpAddr>>,
    /// Server-wide rate window, absent when `rate_limit` is 0.
    global_rate: Option<RwLock<RateLimiter<()>>>,
}

impl SecurityGate {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        Ok(Self {
            enabled: config.security.enabled,
            banned: parse_ban_list(&config.banned_ips)?,
            max_per_ip: config.security.max_connections_per_ip,
            max_total: config.max_connections,
            connections: RwLock::new(HashMap::new()),
            rate_windows: RwLock::new(RateLimiter::new(config.security.rate_limit_per_ip)),
            global_rate: (config.rate_limit > 0)
                .then(|| RwLock::new(RateLimiter::new(config.rate_limit))),
        })
    }

    /// Runs every admission check for one new control connection from `ip`.
    ///
    /// With security disabled every connection is admitted. Otherwise the ban
    /// list, per-address cap and per-address rate are checked, then the
    /// server-wide cap and rate when those are configured.
    pub fn admit(&self, ip: IpAddr) -> Result<(), Rejection> {
        self.admit_at(ip, Instant::now())
    }

    pub fn admit_at(&self, ip: IpAddr, now: Instant) -> Result<(), Rejection> {
        let ip = ip.to_canonical();

        if !self.enabled {
            return Ok(());
        }

        if is_ip_banned(ip, &self.banned) {
            return Err(Rejection::Banned);
        }

        let active = self.active_connections(ip);
        if active >= self.max_per_ip {
            return Err(Rejection::TooManyConnections(active));
        }

        let admitted = self
            .rate_windows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .check_at(ip, now);
        if !admitted {
            return Err(Rejection::RateLimited);
        }

        let total = self.total_connections();
        if self.max_total > 0 && total >= self.max_total {
            return Err(Rejection::ServerFull(total));
        }

        if let Some(global_rate) = &self.global_rate {
            let admitted = global_rate
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .check_at((), now);
            if !admitted {
                return Err(Rejection::GlobalRateLimited);
            }
        }

        Ok(())
    }

    /// Counts a control connection against `ip` until the guard is dropped.
    pub fn track(self: &Arc<Self>, ip: IpAddr) -> ConnectionGuard {
        let ip = ip.to_canonical();
        let count = {
            let mut connections = self
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let entry = connections.entry(ip).or_insert(0);
            *entry += 1;
            *entry
        };

        ConnectionGuard {
            gate: Arc::clone(self),
            ip,
            count,
        }
    }

    fn release(&self, ip: IpAddr) {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = connections.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                connections.remove(&ip);
            }
        }
    }

    #[must_use]
    pub fn active_connections(&self, ip: IpAddr) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ip.to_canonical())
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn total_connections(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .sum()
    }

    #[must_use]
    pub fn unique_ips(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drops rate windows that closed long ago. Called by the periodic sweep.
    pub fn prune_rate_windows(&self) -> usize {
        self.prune_rate_windows_at(Instant::now())
    }

    pub fn prune_rate_windows_at(&self, now: Instant) -> usize {
        let pruned = self
            .rate_windows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .prune_at(now);
        if let Some(global_rate) = &self.global_rate {
            global_rate
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .prune_at(now);
        }
        pruned
    }

    #[must_use]
    pub fn tracked_rate_windows(&self) -> usize {
        self.rate_windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Holds one slot of an address's connection count.
#[derive(Debug)]
pub struct ConnectionGuard {
    gate: Arc<SecurityGate>,
    ip: IpAddr,
    count: usize,
}

impl ConnectionGuard {
    /// Connections from the same address at the time this one was counted.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.gate.release(self.ip);
    }
}
