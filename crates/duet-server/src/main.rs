//! duet-server: anonymous pairing and signaling relay.
//!
//! Accepts WebSocket connections, pairs waiting clients (same region first,
//! then the global pool), and relays WebRTC signaling between partners.

mod config;
mod geo;
mod hub;
mod journal;
mod matching;
mod moderation;
mod server;
mod transport;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::DuetServer;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info};

/// duet-server: anonymous pairing and signaling relay
#[derive(Parser, Debug)]
#[command(name = "duet-server", version, about = "Anonymous pairing and signaling relay")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Config file path
    #[arg(long, default_value = "~/.duet/config.toml")]
    config: String,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Idle timeout in seconds
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Reports within the window that disconnect a user
    #[arg(long)]
    report_threshold: Option<u32>,

    /// Report window in seconds
    #[arg(long)]
    report_window: Option<u64>,

    /// Geolocation URL template containing `{ip}`
    #[arg(long)]
    geo_endpoint: Option<String>,

    /// Lifecycle journal file (JSON lines)
    #[arg(long)]
    journal: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        protocol = duet_core::PROTOCOL_VERSION,
        "starting duet-server"
    );

    let overrides = CliOverrides {
        bind: cli.bind,
        port: cli.port,
        max_connections: cli.max_connections,
        idle_timeout: cli.idle_timeout,
        report_threshold: cli.report_threshold,
        report_window: cli.report_window,
        geo_endpoint: cli.geo_endpoint,
        journal: cli.journal,
    };

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let duet_server = DuetServer::new(server_config);

    if let Err(e) = duet_server.run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("duet-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
