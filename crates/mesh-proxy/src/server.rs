//! Core proxy server: accepts client connections, ingests node heartbeats
//! and dispatches client commands.
//!
//! Owns the node registry, the user ledger and the session set. A single
//! shutdown broadcast, fired by the console or a termination signal, stops
//! the listeners and force-logs-off every connected client.

use crate::config::ProxyConfig;
use crate::ledger::{LoginOutcome, UserLedger};
use crate::registry::NodeRegistry;
use crate::router;
use crate::session::{SessionId, SessionManager, SessionWriter};
use mesh_core::{
    decode_heartbeat, Message, MessageReader, MessageWriter, MeshResult, MAX_DATAGRAM,
};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// The proxy server instance.
pub struct ProxyServer {
    config: ProxyConfig,
    registry: Arc<NodeRegistry>,
    ledger: Arc<UserLedger>,
    sessions: Arc<SessionManager>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProxyServer {
    /// Create a new server instance around the shared state.
    pub fn new(
        config: ProxyConfig,
        registry: Arc<NodeRegistry>,
        ledger: Arc<UserLedger>,
        sessions: Arc<SessionManager>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            config,
            registry,
            ledger,
            sessions,
            shutdown_tx,
        }
    }

    /// Bind the TCP and UDP listeners and serve until shutdown.
    pub async fn run(self) -> MeshResult<()> {
        let server = Arc::new(self);

        let tcp = TcpListener::bind(("0.0.0.0", server.config.tcp_port)).await?;
        let udp = UdpSocket::bind(("0.0.0.0", server.config.udp_port)).await?;

        // Heartbeat ingest task
        let hb_registry = server.registry.clone();
        let mut hb_shutdown = server.shutdown_tx.subscribe();
        tokio::spawn(async move {
            // One byte of slack so oversized datagrams are detectable.
            let mut buf = [0u8; MAX_DATAGRAM + 1];
            loop {
                tokio::select! {
                    result = udp.recv_from(&mut buf) => {
                        match result {
                            Ok((len, peer)) => match decode_heartbeat(&buf[..len]) {
                                Ok(port) => hb_registry.record_heartbeat(peer.ip(), port),
                                Err(e) => warn!(%peer, error = %e, "dropping malformed heartbeat"),
                            },
                            Err(e) => {
                                warn!(error = %e, "heartbeat socket error");
                                break;
                            }
                        }
                    }
                    _ = hb_shutdown.recv() => break,
                }
            }
        });

        // Periodic sweep flipping stale nodes offline
        let sweep_registry = server.registry.clone();
        let sweep_interval = server.config.sweep_interval;
        let mut sweep_shutdown = server.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => sweep_registry.sweep(),
                    _ = sweep_shutdown.recv() => break,
                }
            }
        });

        info!(
            tcp_port = server.config.tcp_port,
            udp_port = server.config.udp_port,
            users = server.ledger.count(),
            "mesh-proxy ready"
        );

        let mut shutdown_rx = server.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = tcp.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let (read, write) = stream.into_split();
                            let id = server.sessions.allocate_id();
                            let writer: SessionWriter =
                                Arc::new(Mutex::new(MessageWriter::new(write)));
                            server.sessions.register(id, peer, writer.clone()).await;
                            let srv = server.clone();
                            tokio::spawn(async move {
                                srv.handle_client(id, read, writer).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        drop(tcp);
        for id in server.sessions.force_logoff_all().await {
            server.ledger.logout(id);
        }
        Ok(())
    }

    /// Serve one client session until it exits or the transport fails.
    async fn handle_client(&self, id: SessionId, read: OwnedReadHalf, writer: SessionWriter) {
        let mut reader = MessageReader::new(BufReader::new(read));
        loop {
            match reader.read().await {
                Ok(Message::Text(line)) => match self.dispatch_command(id, &line, &writer).await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => {
                        debug!(session = id, error = %e, "session write failed");
                        break;
                    }
                },
                Ok(other) => {
                    warn!(session = id, kind = other.kind(), "ignoring unexpected client message");
                }
                Err(e) => {
                    debug!(session = id, error = %e, "session closed");
                    break;
                }
            }
        }
        self.ledger.logout(id);
        self.sessions.remove(id).await;
    }

    /// Handle one text command; returns true when the session should end.
    async fn dispatch_command(
        &self,
        id: SessionId,
        line: &str,
        writer: &SessionWriter,
    ) -> MeshResult<bool> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = parts.first() else {
            return Ok(false);
        };

        match command {
            "!login" => {
                if parts.len() == 3 {
                    let reply = match self.ledger.login(parts[1], parts[2], id) {
                        LoginOutcome::Success => "Authentication succesful!",
                        LoginOutcome::UnknownUser => "Could not find user!",
                        LoginOutcome::WrongPassword => "Wrong password!",
                        LoginOutcome::AlreadyLoggedIn => "Already logged in!",
                    };
                    send(writer, reply).await?;
                } else {
                    send(
                        writer,
                        "Wrong parameters - Usage: !login <username> <password>",
                    )
                    .await?;
                }
            }
            "!credits" => {
                if parts.len() == 1 {
                    match self.ledger.find_by_session(id) {
                        Some(user) => {
                            send(writer, &format!("You have {} credits left.", user.credits))
                                .await?
                        }
                        None => send(writer, "User not authenticated!").await?,
                    }
                } else {
                    send(writer, "Wrong parameters - Usage: !credits").await?;
                }
            }
            "!buy" => {
                if parts.len() == 2 {
                    match parts[1].parse::<i64>() {
                        Ok(amount) if amount > 0 => match self.ledger.find_by_session(id) {
                            Some(user) => {
                                if let Some(total) = self.ledger.add_credits(&user.name, amount) {
                                    send(writer, &format!("You now have {} credits.", total))
                                        .await?;
                                }
                            }
                            None => send(writer, "User not authenticated!").await?,
                        },
                        Ok(_) => send(writer, "Supplied credit number is zero or less!").await?,
                        Err(_) => send(writer, "Supplied credit number has wrong format!").await?,
                    }
                } else {
                    send(writer, "Wrong parameters - Usage: !buy <credits>").await?;
                }
            }
            // List and download talk to a node; they run on their own task
            // so a slow node never stalls this session's read loop.
            "!list" => {
                if parts.len() == 1 {
                    if self.ledger.find_by_session(id).is_some() {
                        let registry = self.registry.clone();
                        let client = writer.clone();
                        tokio::spawn(async move {
                            if let Err(e) = router::list(&registry, &client).await {
                                debug!(session = id, error = %e, "list delivery failed");
                            }
                        });
                    } else {
                        send(writer, "User not authenticated!").await?;
                    }
                } else {
                    send(writer, "Wrong parameters - Usage: !list").await?;
                }
            }
            "!download" => {
                if parts.len() == 2 {
                    match self.ledger.find_by_session(id) {
                        Some(user) => {
                            let registry = self.registry.clone();
                            let ledger = self.ledger.clone();
                            let client = writer.clone();
                            let file_name = parts[1].to_string();
                            tokio::spawn(async move {
                                if let Err(e) = router::download(
                                    &registry,
                                    &ledger,
                                    &client,
                                    &user.name,
                                    &file_name,
                                )
                                .await
                                {
                                    debug!(session = id, error = %e, "download delivery failed");
                                }
                            });
                        }
                        None => send(writer, "User not authenticated!").await?,
                    }
                } else {
                    send(writer, "Wrong parameters - Usage: !download <filename>").await?;
                }
            }
            "!exit" => {
                if parts.len() == 1 {
                    writer.lock().await.send_force_logoff().await?;
                    return Ok(true);
                }
                send(writer, "Wrong parameters - Usage: !exit").await?;
            }
            _ => send(writer, &format!("Unknown command: {}", parts.join(" "))).await?,
        }
        Ok(false)
    }
}

async fn send(writer: &SessionWriter, line: &str) -> MeshResult<()> {
    writer.lock().await.send_text(line).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::MeshError;
    use tokio::net::tcp::OwnedWriteHalf;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    fn test_server() -> Arc<ProxyServer> {
        let config = ProxyConfig::load(None, None, None, None, None, None).unwrap();
        let registry = Arc::new(NodeRegistry::new(config.offline_timeout));
        let ledger = Arc::new(UserLedger::new(vec![
            ("alice".into(), "secret".into(), 200),
            ("bob".into(), "hunter2".into(), 100),
        ]));
        let sessions = Arc::new(SessionManager::new());
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(ProxyServer::new(
            config,
            registry,
            ledger,
            sessions,
            shutdown_tx,
        ))
    }

    /// Register a client session served by `handle_client` and return the
    /// client-side endpoints.
    async fn start_session(
        server: &Arc<ProxyServer>,
    ) -> (
        MessageWriter<OwnedWriteHalf>,
        MessageReader<BufReader<OwnedReadHalf>>,
        SessionId,
        JoinHandle<()>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (accepted, peer) = listener.accept().await.unwrap();
        let (read, write) = accepted.into_split();

        let id = server.sessions.allocate_id();
        let writer: SessionWriter = Arc::new(Mutex::new(MessageWriter::new(write)));
        server.sessions.register(id, peer, writer.clone()).await;
        let srv = server.clone();
        let handle = tokio::spawn(async move { srv.handle_client(id, read, writer).await });

        let (client_read, client_write) = client.into_split();
        (
            MessageWriter::new(client_write),
            MessageReader::new(BufReader::new(client_read)),
            id,
            handle,
        )
    }

    async fn assert_text(rx: &mut MessageReader<BufReader<OwnedReadHalf>>, expected: &str) {
        assert_eq!(rx.read().await.unwrap(), Message::Text(expected.into()));
    }

    #[tokio::test]
    async fn session_flow_login_credits_buy_exit() {
        let server = test_server();
        let (mut tx, mut rx, id, handle) = start_session(&server).await;

        tx.send_text("!credits").await.unwrap();
        assert_text(&mut rx, "User not authenticated!").await;

        tx.send_text("!login alice secret").await.unwrap();
        assert_text(&mut rx, "Authentication succesful!").await;

        tx.send_text("!credits").await.unwrap();
        assert_text(&mut rx, "You have 200 credits left.").await;

        tx.send_text("!buy 50").await.unwrap();
        assert_text(&mut rx, "You now have 250 credits.").await;

        tx.send_text("!exit").await.unwrap();
        assert_eq!(rx.read().await.unwrap(), Message::ForceLogoff);

        handle.await.unwrap();
        assert_eq!(server.sessions.count().await, 0);
        assert!(server.ledger.find_by_session(id).is_none());
        assert_eq!(
            server.ledger.login("alice", "secret", 999),
            LoginOutcome::Success
        );
        assert!(matches!(rx.read().await, Err(MeshError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn login_rejections() {
        let server = test_server();
        let (mut tx, mut rx, _, _) = start_session(&server).await;

        tx.send_text("!login alice").await.unwrap();
        assert_text(&mut rx, "Wrong parameters - Usage: !login <username> <password>").await;

        tx.send_text("!login mallory x").await.unwrap();
        assert_text(&mut rx, "Could not find user!").await;

        tx.send_text("!login alice wrong").await.unwrap();
        assert_text(&mut rx, "Wrong password!").await;
    }

    #[tokio::test]
    async fn account_stays_bound_to_first_session() {
        let server = test_server();
        let (mut tx1, mut rx1, _, _) = start_session(&server).await;
        let (mut tx2, mut rx2, _, _) = start_session(&server).await;

        tx1.send_text("!login alice secret").await.unwrap();
        assert_text(&mut rx1, "Authentication succesful!").await;

        tx2.send_text("!login alice secret").await.unwrap();
        assert_text(&mut rx2, "Already logged in!").await;

        tx1.send_text("!credits").await.unwrap();
        assert_text(&mut rx1, "You have 200 credits left.").await;
    }

    #[tokio::test]
    async fn session_stays_bound_to_first_account() {
        let server = test_server();
        let (mut tx, mut rx, _, handle) = start_session(&server).await;

        tx.send_text("!login alice secret").await.unwrap();
        assert_text(&mut rx, "Authentication succesful!").await;

        tx.send_text("!login bob hunter2").await.unwrap();
        assert_text(&mut rx, "Already logged in!").await;

        tx.send_text("!credits").await.unwrap();
        assert_text(&mut rx, "You have 200 credits left.").await;

        tx.send_text("!exit").await.unwrap();
        assert_eq!(rx.read().await.unwrap(), Message::ForceLogoff);
        handle.await.unwrap();

        assert_eq!(
            server.ledger.login("alice", "secret", 8),
            LoginOutcome::Success
        );
        assert_eq!(
            server.ledger.login("bob", "hunter2", 9),
            LoginOutcome::Success
        );
    }

    #[tokio::test]
    async fn buy_checks_amount_before_authentication() {
        let server = test_server();
        let (mut tx, mut rx, _, _) = start_session(&server).await;

        tx.send_text("!buy -5").await.unwrap();
        assert_text(&mut rx, "Supplied credit number is zero or less!").await;

        tx.send_text("!buy plenty").await.unwrap();
        assert_text(&mut rx, "Supplied credit number has wrong format!").await;

        tx.send_text("!buy 10").await.unwrap();
        assert_text(&mut rx, "User not authenticated!").await;

        tx.send_text("!buy").await.unwrap();
        assert_text(&mut rx, "Wrong parameters - Usage: !buy <credits>").await;
    }

    #[tokio::test]
    async fn list_and_download_require_authentication() {
        let server = test_server();
        let (mut tx, mut rx, _, _) = start_session(&server).await;

        tx.send_text("!list").await.unwrap();
        assert_text(&mut rx, "User not authenticated!").await;

        tx.send_text("!download report.txt").await.unwrap();
        assert_text(&mut rx, "User not authenticated!").await;
    }

    #[tokio::test]
    async fn download_without_nodes_is_refused() {
        let server = test_server();
        let (mut tx, mut rx, _, _) = start_session(&server).await;

        tx.send_text("!login alice secret").await.unwrap();
        assert_text(&mut rx, "Authentication succesful!").await;

        tx.send_text("!download report.txt").await.unwrap();
        assert_text(&mut rx, "No fileservers available!").await;

        tx.send_text("!list").await.unwrap();
        assert_text(&mut rx, "No fileservers available!").await;
    }

    #[tokio::test]
    async fn unknown_commands_are_echoed() {
        let server = test_server();
        let (mut tx, mut rx, _, _) = start_session(&server).await;

        tx.send_text("!frobnicate").await.unwrap();
        assert_text(&mut rx, "Unknown command: !frobnicate").await;

        tx.send_text("hello there").await.unwrap();
        assert_text(&mut rx, "Unknown command: hello there").await;
    }
}
