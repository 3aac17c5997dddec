//! mesh-node: filemesh file-serving node.
//!
//! Serves one flat directory of files over the line protocol and announces
//! itself to the proxy with periodic UDP alive packets.

mod heartbeat;
mod serve;
mod store;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use store::FileStore;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;
use tracing::{error, info};

/// mesh-node — filemesh file server
#[derive(Parser, Debug)]
#[command(name = "mesh-node", version, about = "filemesh file-serving node")]
struct Cli {
    /// Directory of files to serve
    #[arg(long, default_value = "files")]
    dir: String,

    /// TCP listen port for proxy connections
    #[arg(long, default_value_t = 12300)]
    tcp_port: u16,

    /// Proxy host for alive packets
    #[arg(long, default_value = "127.0.0.1")]
    proxy_host: String,

    /// Proxy UDP port for alive packets
    #[arg(long, default_value_t = 12291)]
    proxy_udp_port: u16,

    /// Seconds between alive packets
    #[arg(long, default_value_t = 1)]
    heartbeat_secs: u64,

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

    info!(
        version = env!("CARGO_PKG_VERSION"),
        dir = %cli.dir,
        tcp_port = cli.tcp_port,
        "starting mesh-node"
    );

    let store = match FileStore::open(&cli.dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "failed to open served directory");
            std::process::exit(1);
        }
    };

    let proxy_addr = format!("{}:{}", cli.proxy_host, cli.proxy_udp_port);
    let proxy = match tokio::net::lookup_host(&proxy_addr).await {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => addr,
            None => {
                error!(addr = %proxy_addr, "proxy address resolved to nothing");
                std::process::exit(1);
            }
        },
        Err(e) => {
            error!(addr = %proxy_addr, error = %e, "failed to resolve proxy address");
            std::process::exit(1);
        }
    };

    let listener = match TcpListener::bind(("0.0.0.0", cli.tcp_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(port = cli.tcp_port, error = %e, "failed to bind TCP listener");
            std::process::exit(1);
        }
    };

    let udp = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            error!(error = %e, "failed to bind UDP socket");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, _) = broadcast::channel(1);

    tokio::spawn(heartbeat::run(
        udp,
        proxy,
        cli.tcp_port,
        Duration::from_secs(cli.heartbeat_secs.max(1)),
        shutdown_tx.subscribe(),
    ));

    tokio::spawn(console(shutdown_tx.clone()));

    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("received shutdown signal");
            let _ = shutdown_tx.send(());
        });
    }

    info!(tcp_port = cli.tcp_port, proxy = %proxy, "mesh-node ready");
    serve::run(listener, store, shutdown_tx.subscribe()).await;

    info!("mesh-node stopped");
}

/// Admin console on stdin; `!exit` shuts the node down.
async fn console(shutdown_tx: broadcast::Sender<()>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "!exit" {
            println!("Exit success!");
            let _ = shutdown_tx.send(());
            return;
        }
        println!("Unknown command: {line}");
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
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
