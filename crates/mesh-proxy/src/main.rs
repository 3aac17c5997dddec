//! mesh-proxy: filemesh coordinating proxy.
//!
//! Accepts client TCP connections, tracks file nodes via UDP heartbeats
//! and routes list/download requests to the least-loaded online node.

mod config;
mod console;
mod ledger;
mod registry;
mod router;
mod server;
mod session;

use clap::Parser;
use config::ProxyConfig;
use ledger::UserLedger;
use registry::NodeRegistry;
use server::ProxyServer;
use session::SessionManager;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// mesh-proxy — filemesh coordinating proxy
#[derive(Parser, Debug)]
#[command(name = "mesh-proxy", version, about = "filemesh coordinating proxy")]
struct Cli {
    /// TCP port for client connections
    #[arg(long)]
    tcp_port: Option<u16>,

    /// UDP port for node heartbeats
    #[arg(long)]
    udp_port: Option<u16>,

    /// Credential store (TOML)
    #[arg(long)]
    users: Option<String>,

    /// Seconds without a heartbeat before a node counts as offline
    #[arg(long)]
    offline_timeout_secs: Option<u64>,

    /// Seconds between registry sweeps
    #[arg(long)]
    sweep_interval_secs: Option<u64>,

    /// Config file path
    #[arg(long, default_value = "mesh-proxy.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting mesh-proxy");

    // Load proxy config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let config = match ProxyConfig::load(
        Some(&config_path),
        cli.tcp_port,
        cli.udp_port,
        cli.users.as_deref(),
        cli.offline_timeout_secs,
        cli.sweep_interval_secs,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let accounts = match config::load_users(&config.users_file) {
        Ok(accounts) => accounts,
        Err(e) => {
            error!(error = %e, "failed to load user accounts");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(NodeRegistry::new(config.offline_timeout));
    let ledger = Arc::new(UserLedger::new(accounts));
    let sessions = Arc::new(SessionManager::new());
    let (shutdown_tx, _) = broadcast::channel(1);

    // Operator console on stdin
    tokio::spawn(console::run(
        registry.clone(),
        ledger.clone(),
        shutdown_tx.clone(),
    ));

    // Termination signals take the same shutdown path as console !exit
    let signal_shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        let _ = signal_shutdown.send(());
    });

    let server = ProxyServer::new(config, registry, ledger, sessions, shutdown_tx);
    if let Err(e) = server.run().await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("mesh-proxy stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
