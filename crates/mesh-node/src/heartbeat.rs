use std::net::SocketAddr;
use std::time::Duration;

use mesh_core::encode_heartbeat;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Announces this node's TCP listen port to the proxy once per period
/// until shutdown is requested.
pub async fn run(
    socket: UdpSocket,
    proxy: SocketAddr,
    listen_port: u16,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let payload = match encode_heartbeat(listen_port) {
        Ok(payload) => payload,
        Err(e) => {
            error!("failed to encode heartbeat: {e}");
            return;
        }
    };
    let mut ticker = tokio::time::interval(period);
    info!(proxy = %proxy, port = listen_port, "started sending alive packets");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&payload, proxy).await {
                    warn!("failed to send alive packet: {e}");
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
    info!("stopped sending alive packets");
}
