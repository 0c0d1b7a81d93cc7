use anyhow::{Context, Result, bail};
use serde::{Deserialize, de::DeserializeOwned};
use std::{collections::BTreeMap, fs, path::Path, time::Duration};

use crate::security::parse_ban_list;

pub const DEFAULT_SERVER_PORT: u16 = 7000;
pub const DEFAULT_TIMEOUT_MINUTES: u64 = 30;
pub const DEFAULT_LOCAL_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Interface for the control listener and every public listener.
    pub bind_ip: String,
    /// Concurrent control connections across all sources; 0 is unlimited.
    /// Only enforced when security is enabled.
    pub max_connections: usize,
    /// Control connections per minute across all sources; 0 is unlimited.
    /// Only enforced when security is enabled.
    pub rate_limit: u32,
    pub timeout_minutes: u64,
    /// Ports clients may claim. Empty allows every port.
    pub allowed_ports: Vec<u16>,
    pub banned_ips: Vec<String>,
    pub log_level: String,
    pub security: SecurityConfig,
}

/// Per-address admission limits. A cap of 0 rejects every connection and a
/// rate of 0 admits one attempt per window, so omitted keys take the values
/// below instead.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub enabled: bool,
    pub max_connections_per_ip: usize,
    pub rate_limit_per_ip: u32,
}

pub const DEFAULT_MAX_CONNECTIONS_PER_IP: usize = 5;
pub const DEFAULT_RATE_LIMIT_PER_IP: u32 = 30;

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_connections_per_ip: DEFAULT_MAX_CONNECTIONS_PER_IP,
            rate_limit_per_ip: DEFAULT_RATE_LIMIT_PER_IP,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SERVER_PORT,
            bind_ip: "0.0.0.0".to_string(),
            max_connections: 0,
            rate_limit: 0,
            timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            allowed_ports: Vec::new(),
            banned_ips: Vec::new(),
            log_level: "info".to_string(),
            security: SecurityConfig::default(),
        }
    }
}

impl ServerConfig {
    /// The configuration used when the relay is started from flags alone.
    #[must_use]
    pub fn preset(port: u16) -> Self {
        Self {
            port,
            max_connections: 100,
            rate_limit: 60,
            allowed_ports: vec![80, 8080, 3000, 3001, 8000, 8001, 9000],
            security: SecurityConfig {
                enabled: true,
                ..SecurityConfig::default()
            },
            ..Self::default()
        }
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        let minutes = if self.timeout_minutes == 0 {
            DEFAULT_TIMEOUT_MINUTES
        } else {
            self.timeout_minutes
        };
        Duration::from_secs(minutes * 60)
    }

    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_ip, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        parse_ban_list(&self.banned_ips)?;
        if self.bind_ip.trim().is_empty() {
            bail!("bind_ip must not be empty");
        }
        if self.allowed_ports.contains(&0) {
            bail!("allowed_ports must not contain port 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server: String,
    pub reconnect: bool,
    /// Seconds to wait before redialing after an active session ends.
    pub reconnect_delay: u64,
    pub log_level: String,
    pub tunnels: BTreeMap<String, TunnelSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSpec {
    pub local_port: u16,
    pub remote_port: u16,
    #[serde(default = "default_local_host")]
    pub local_host: String,
}

fn default_local_host() -> String {
    DEFAULT_LOCAL_HOST.to_string()
}

impl ClientConfig {
    /// A single-tunnel configuration built from command-line flags.
    #[must_use]
    pub fn single(server: String, local_port: u16, remote_port: u16) -> Self {
        let mut tunnels = BTreeMap::new();
        tunnels.insert(
            "default".to_string(),
            TunnelSpec {
                local_port,
                remote_port,
                local_host: default_local_host(),
            },
        );
        Self {
            server,
            log_level: "info".to_string(),
            tunnels,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.trim().is_empty() {
            bail!("server address must not be empty");
        }
        if self.tunnels.is_empty() {
            bail!("no tunnels configured");
        }
        for (name, tunnel) in &self.tunnels {
            if tunnel.local_port == 0 {
                bail!("tunnel {name}: local_port must not be 0");
            }
            if tunnel.remote_port == 0 {
                bail!("tunnel {name}: remote_port must not be 0");
            }
        }
        Ok(())
    }
}

pub fn load_server_config(path: &Path) -> Result<ServerConfig> {
    let config: ServerConfig = load_file(path)?;
    config
        .validate()
        .with_context(|| format!("Invalid server configuration in {}", path.display()))?;
    Ok(config)
}

pub fn load_client_config(path: &Path) -> Result<ClientConfig> {
    let config: ClientConfig = load_file(path)?;
    config
        .validate()
        .with_context(|| format!("Invalid client configuration in {}", path.display()))?;
    Ok(config)
}

fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} file", path.display()))?;
    parse_config(&content, is_toml(path))
        .with_context(|| format!("Failed to parse {}", path.display()))
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
}

fn parse_config<T: DeserializeOwned>(content: &str, toml: bool) -> Result<T> {
    if toml {
        toml::from_str(content).context("Failed to parse as valid TOML")
    } else {
        serde_yaml::from_str(content).context("Failed to parse as valid YAML")
    }
}
