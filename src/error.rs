use std::{io, time::Duration};

use thiserror::Error;

/// Errors produced by the relay and the tunnel client.
///
/// The `Display` text of the admission errors is sent verbatim after `ERROR `
/// on the control connection, so it must stay stable.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to connect to {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Port {0} not allowed")]
    PortNotAllowed(i64),

    #[error("Port {port} already in use by {owner}")]
    PortInUse { port: u16, owner: String },

    #[error("failed to listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen on port {0}: port out of range")]
    PortOutOfRange(i64),

    #[error("rate limited")]
    RateLimited,

    #[error("connection rejected: {0}")]
    SecurityRejected(String),

    #[error("server at capacity")]
    CapacityExceeded,

    #[error("no activity for {0:?}")]
    IdleTimeout(Duration),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("relay rejected tunnel: {0}")]
    Rejected(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TunnelError {
    pub(crate) fn dial(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Dial {
            addr: addr.into(),
            source,
        }
    }

    /// Whether the relay reports this error to the client as `ERROR <text>`.
    #[must_use]
    pub fn is_reported(&self) -> bool {
        matches!(
            self,
            Self::PortNotAllowed(_)
                | Self::PortInUse { .. }
                | Self::Bind { .. }
                | Self::PortOutOfRange(_)
        )
    }
}
