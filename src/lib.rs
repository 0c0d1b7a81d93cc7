//! ntunnel
//!
//! A minimal reverse TCP tunnel. A relay on a public host accepts control
//! connections from clients, binds the public port each client asks for and
//! relays every public connection back over that client's control connection
//! to a service on the client's network.

pub mod client;
pub mod config;
pub mod error;
pub mod link;
pub mod logging;
pub mod protocol;
pub mod rate_limit;
pub mod registry;
pub mod relay;
pub mod security;
pub mod server;

// Re-export commonly used types and functions
pub use client::{ClientOptions, ClientState, TunnelClient};
pub use config::{
    ClientConfig, SecurityConfig, ServerConfig, TunnelSpec, load_client_config,
    load_server_config,
};
pub use error::TunnelError;
pub use protocol::{Message, Reply};
pub use registry::TunnelRegistry;
pub use security::{ConnectionGuard, Rejection, SecurityGate};
pub use server::RelayServer;
