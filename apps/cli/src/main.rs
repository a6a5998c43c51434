//! SOH Tunnel CLI
//!
//! Runs either side of the TCP-over-HTTP tunnel.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use sohtunnel_client::{TunnelApi, TunnelDriver, TunnelListener};
use sohtunnel_core::ConnectionConfig;
use sohtunnel_logging::LogLevel;
use sohtunnel_server::{TunnelConfig, TunnelHandler, TunnelServer};
use sohtunnel_settings::{default_settings_path, ClientSettings, ServerSettings, Settings};

/// SOH Tunnel - TCP over plain HTTP
#[derive(Parser)]
#[command(name = "sohtunnel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging (same as `--log-level debug`)
    #[arg(short, long)]
    verbose: bool,

    /// Log level for the sohtunnel crates (error, warn, info, debug, trace)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel server
    Server {
        /// HTTP listen address
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Long-poll ceiling for reads in milliseconds
        #[arg(long)]
        read_timeout: Option<u64>,

        /// Timeout for connecting to targets in seconds
        #[arg(long)]
        connect_timeout: Option<u64>,
    },

    /// Run the tunnel client
    Client {
        /// Target reached by the server (format: HOST:PORT)
        #[arg(short, long)]
        target: Option<String>,

        /// Local listen address
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Tunnel server URL
        #[arg(long)]
        tunnel: Option<String>,

        /// HTTP proxy used to reach the tunnel server
        #[arg(long)]
        proxy: Option<String>,

        /// Chunk size for local reads
        #[arg(long)]
        buffer_size: Option<usize>,

        /// Send raw bytes instead of Base64 text
        #[arg(long)]
        no_base64: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level {
        Some(level) => level,
        None if cli.verbose => LogLevel::Debug,
        None => LogLevel::Info,
    };
    sohtunnel_logging::init(level);

    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load_or_default(),
    }
    .with_context(|| {
        let path = cli.config.clone().unwrap_or_else(default_settings_path);
        format!("Failed to load settings from {}", path.display())
    })?;

    match cli.command {
        Commands::Server {
            listen,
            read_timeout,
            connect_timeout,
        } => {
            let server = &mut settings.server;
            if let Some(listen) = listen {
                server.listen_addr = listen;
            }
            if let Some(ms) = read_timeout {
                server.read_timeout_ms = ms;
            }
            if let Some(secs) = connect_timeout {
                server.connect_timeout_secs = secs;
            }
            run_server(&settings.server).await?;
        }
        Commands::Client {
            target,
            listen,
            tunnel,
            proxy,
            buffer_size,
            no_base64,
        } => {
            let client = &mut settings.client;
            if let Some(target) = target {
                let (host, port) = parse_target(&target)?;
                client.target_host = host;
                client.target_port = port;
            }
            if let Some(listen) = listen {
                client.listen_addr = listen;
            }
            if let Some(tunnel) = tunnel {
                client.tunnel_url = tunnel;
            }
            if proxy.is_some() {
                client.proxy_url = proxy;
            }
            if let Some(size) = buffer_size {
                client.buffer_size = size;
            }
            if no_base64 {
                client.base64_encoding = false;
            }
            run_client(&settings.client).await?;
        }
    }

    Ok(())
}

/// Split `HOST:PORT`, keeping IPv6 brackets out of the host
fn parse_target(target: &str) -> Result<(String, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .with_context(|| format!("Invalid target {target:?}, expected HOST:PORT"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        bail!("Invalid target {target:?}, host is empty");
    }
    let port: u16 = port
        .parse()
        .with_context(|| format!("Invalid port in target {target:?}"))?;
    Ok((host.to_string(), port))
}

// ============================================================================
// Server
// ============================================================================

async fn run_server(settings: &ServerSettings) -> Result<()> {
    let handler = Arc::new(TunnelHandler::new(TunnelConfig {
        read_timeout: settings.read_timeout(),
        connect_timeout: settings.connect_timeout(),
    }));

    let mut server = TunnelServer::new(settings.listen_addr, handler);
    server
        .start()
        .await
        .with_context(|| format!("Failed to bind {}", settings.listen_addr))?;

    info!("Tunnel server running. Press Ctrl+C to stop.");

    // Wait for shutdown
    tokio::signal::ctrl_c().await?;
    server.shutdown().await;

    Ok(())
}

// ============================================================================
// Client
// ============================================================================

async fn run_client(settings: &ClientSettings) -> Result<()> {
    let config = ConnectionConfig::new(settings.target_host.clone(), settings.target_port)
        .with_buffer_size(settings.buffer_size)
        .with_base64_encoding(settings.base64_encoding);
    config
        .validate()
        .context("Client target is not configured (use --target HOST:PORT)")?;

    let api = TunnelApi::new(&settings.tunnel_url, settings.proxy_url.as_deref())?;
    let driver = TunnelDriver::new(api, config);

    let mut listener = TunnelListener::new(settings.listen_addr, driver);
    listener
        .start()
        .await
        .with_context(|| format!("Failed to bind {}", settings.listen_addr))?;

    info!(
        "Tunneling {} through {}. Press Ctrl+C to stop.",
        listener.listen_addr(),
        settings.tunnel_url
    );

    // Wait for shutdown
    tokio::signal::ctrl_c().await?;
    listener.stop();

    Ok(())
}
