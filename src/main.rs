use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, ValueEnum};
use std::{path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use ntunnel::{
    ClientConfig, ClientOptions, RelayServer, ServerConfig, TunnelClient,
    config::{DEFAULT_SERVER_PORT, load_client_config, load_server_config},
    logging,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Server,
    Client,
}

/// Expose a local TCP service through a public relay.
#[derive(Debug, Parser)]
#[command(name = "ntunnel", version, about)]
struct Cli {
    /// Run as the public relay or as the tunnel client
    #[arg(long, value_enum, ignore_case = true)]
    mode: Option<Mode>,

    /// YAML or TOML configuration file (TOML if the name ends in .toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Control port the relay listens on
    #[arg(long, default_value_t = DEFAULT_SERVER_PORT)]
    port: u16,

    /// Relay address as host:port
    #[arg(long)]
    server: Option<String>,

    /// Port of the local service to expose
    #[arg(long, default_value_t = 8080)]
    local_port: u16,

    /// Public port to claim on the relay
    #[arg(long)]
    remote_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let Some(mode) = cli.mode else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal.cancel();
        }
    });

    match mode {
        Mode::Server => run_server(&cli, shutdown).await,
        Mode::Client => run_client(&cli, shutdown).await,
    }
}

async fn run_server(cli: &Cli, shutdown: CancellationToken) -> Result<()> {
    let config = match &cli.config {
        Some(path) => load_server_config(path)?,
        None => ServerConfig::preset(cli.port),
    };
    logging::init(&config.log_level)?;
    info!(
        config_file = ?cli.config,
        port = config.port,
        bind_ip = %config.bind_ip,
        "Configuration loaded"
    );

    let server = Arc::new(RelayServer::new(config, shutdown)?);
    server.run().await
}

async fn run_client(cli: &Cli, shutdown: CancellationToken) -> Result<()> {
    let config = match &cli.config {
        Some(path) => load_client_config(path)?,
        None => client_config_from_flags(cli)?,
    };
    logging::init(&config.log_level)?;
    info!(config_file = ?cli.config, server = %config.server, "Configuration loaded");

    let client = TunnelClient::new(ClientOptions::from_config(&config)?);
    client.run(shutdown).await.inspect_err(|e| {
        error!(error = %e, "Tunnel client stopped");
    })?;
    Ok(())
}

fn client_config_from_flags(cli: &Cli) -> Result<ClientConfig> {
    let (Some(server), Some(remote_port)) = (cli.server.clone(), cli.remote_port) else {
        bail!("client mode requires --server and --remote-port, or --config");
    };
    let config = ClientConfig::single(server, cli.local_port, remote_port);
    config.validate().context("Invalid client flags")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("ntunnel").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_apply_without_flags() {
        let cli = parse(&[]).unwrap();
        assert_eq!(cli.mode, None);
        assert_eq!(cli.port, 7000);
        assert_eq!(cli.local_port, 8080);
        assert!(cli.remote_port.is_none());
    }

    #[test]
    fn mode_is_case_insensitive() {
        let cli = parse(&["--mode", "SERVER"]).unwrap();
        assert_eq!(cli.mode, Some(Mode::Server));
        let cli = parse(&["--mode", "Client"]).unwrap();
        assert_eq!(cli.mode, Some(Mode::Client));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let err = parse(&["--mode", "proxy"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }

    #[test]
    fn client_flags_build_single_tunnel() {
        let cli = parse(&[
            "--mode",
            "client",
            "--server",
            "relay.example.com:7000",
            "--local-port",
            "3000",
            "--remote-port",
            "80",
        ])
        .unwrap();
        assert_eq!(cli.mode, Some(Mode::Client));

        let config = client_config_from_flags(&cli).unwrap();
        assert_eq!(config.server, "relay.example.com:7000");
        let tunnel = &config.tunnels["default"];
        assert_eq!(tunnel.local_port, 3000);
        assert_eq!(tunnel.remote_port, 80);
    }

    #[test]
    fn client_flags_require_server_and_remote_port() {
        let cli = parse(&["--mode", "client", "--server", "relay:7000"]).unwrap();
        let err = client_config_from_flags(&cli).unwrap_err();
        assert!(err.to_string().contains("--remote-port"));
    }

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
