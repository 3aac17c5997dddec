//! Node-facing request routing.
//!
//! Serves the client `!list` and `!download` commands by opening a fresh
//! TCP connection to the least-loaded online node, running the request
//! against it and relaying the result back to the client session. Credits
//! and node load only change once a download has actually been delivered.

use crate::ledger::UserLedger;
use crate::registry::{NodeRecord, NodeRegistry};
use crate::session::SessionWriter;
use mesh_core::{Message, MessageReader, MessageWriter, MeshResult};
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::warn;

/// Ask the least-loaded node for its file names and forward them line by
/// line to the client.
pub async fn list(registry: &NodeRegistry, client: &SessionWriter) -> MeshResult<()> {
    let Some(node) = registry.least_loaded() else {
        return send_client(client, "No fileservers available!").await;
    };

    match query_names(&node).await {
        Ok(Message::FileList(names)) => {
            for name in &names {
                send_client(client, name).await?;
            }
            Ok(())
        }
        Ok(other) => {
            send_client(
                client,
                &format!(
                    "Received unexpected message from fileserver: {}",
                    other.kind()
                ),
            )
            .await
        }
        Err(e) => {
            warn!(node = %node.key(), error = %e, "list request failed");
            send_client(client, "Fileserver request failed!").await
        }
    }
}

/// Run a download end to end: size query, balance check, fetch, delivery.
pub async fn download(
    registry: &NodeRegistry,
    ledger: &UserLedger,
    client: &SessionWriter,
    user: &str,
    file_name: &str,
) -> MeshResult<()> {
    let Some(node) = registry.least_loaded() else {
        return send_client(client, "No fileservers available!").await;
    };

    match fetch(&node, ledger, user, file_name).await {
        Ok(Fetch::File {
            name,
            content,
            size,
        }) => {
            ledger.remove_credits(user, size);
            registry.add_load(&node.key(), size as u64);
            client.lock().await.send_file(&name, &content).await
        }
        Ok(Fetch::Refused(line)) => send_client(client, &line).await,
        Err(e) => {
            warn!(node = %node.key(), error = %e, "download request failed");
            send_client(client, "Fileserver request failed!").await
        }
    }
}

enum Fetch {
    File {
        name: String,
        content: String,
        size: i64,
    },
    Refused(String),
}

/// Talk to the node. `Refused` carries the text line explaining why the
/// download stopped; transport and protocol faults come back as errors.
async fn fetch(
    node: &NodeRecord,
    ledger: &UserLedger,
    user: &str,
    file_name: &str,
) -> MeshResult<Fetch> {
    let (mut reader, mut writer) = connect(node).await?;

    writer.send_size_request(file_name).await?;
    let size = match reader.read().await? {
        Message::Size(size) => size,
        other => {
            return Ok(Fetch::Refused(format!(
                "Received unexpected message from fileserver: {}",
                other.kind()
            )))
        }
    };
    if size <= -1 {
        return Ok(Fetch::Refused("File not found on server!".into()));
    }

    let credits = ledger.credits(user).unwrap_or(0);
    if credits <= size {
        return Ok(Fetch::Refused(format!(
            "Not enough credits (you have {}, filesize is {}",
            credits, size
        )));
    }

    writer.send_download_request().await?;
    match reader.read().await? {
        Message::File { name, content } => Ok(Fetch::File {
            name,
            content,
            size,
        }),
        other => Ok(Fetch::Refused(format!(
            "Received unexpected message type from fileserver: {}",
            other.kind()
        ))),
    }
}

async fn query_names(node: &NodeRecord) -> MeshResult<Message> {
    let (mut reader, mut writer) = connect(node).await?;
    writer.send_file_names_request().await?;
    reader.read().await
}

type NodeLink = (
    MessageReader<BufReader<OwnedReadHalf>>,
    MessageWriter<OwnedWriteHalf>,
);

async fn connect(node: &NodeRecord) -> MeshResult<NodeLink> {
    let stream = TcpStream::connect((node.address, node.listen_port)).await?;
    let (read, write) = stream.into_split();
    Ok((
        MessageReader::new(BufReader::new(read)),
        MessageWriter::new(write),
    ))
}

async fn send_client(client: &SessionWriter, line: &str) -> MeshResult<()> {
    client.lock().await.send_text(line).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::node_key;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    const ADDR: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    const FILE_NAME: &str = "report.txt";
    const FILE_CONTENT: &str = "0123456789012345678901234567890123456789";

    fn ledger() -> Arc<UserLedger> {
        Arc::new(UserLedger::new(vec![
            ("alice".into(), "secret".into(), 100),
            ("bob".into(), "hunter2".into(), 10),
        ]))
    }

    /// Registry holding exactly the node listening on `port`.
    fn registry_with(port: u16) -> Arc<NodeRegistry> {
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(3)));
        registry.record_heartbeat(ADDR, port);
        registry
    }

    /// Client session backed by a real socket pair; returns the proxy-side
    /// writer and the client-side reader.
    async fn client_pair() -> (SessionWriter, MessageReader<BufReader<OwnedReadHalf>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        let (_, write) = accepted.into_split();
        let (read, _) = client.into_split();
        (
            Arc::new(Mutex::new(MessageWriter::new(write))),
            MessageReader::new(BufReader::new(read)),
        )
    }

    /// Node that serves one file, answering names, size and download
    /// requests for a single connection.
    fn spawn_node(listener: TcpListener) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, write) = stream.into_split();
            let mut reader = MessageReader::new(BufReader::new(read));
            let mut writer = MessageWriter::new(write);
            let mut queried = None;
            while let Ok(message) = reader.read().await {
                match message {
                    Message::FileNamesRequest => {
                        writer
                            .send_file_list(&[FILE_NAME.to_string()])
                            .await
                            .unwrap();
                    }
                    Message::SizeRequest(name) => {
                        let size = if name == FILE_NAME {
                            FILE_CONTENT.len() as i64
                        } else {
                            -1
                        };
                        queried = Some(name);
                        writer.send_size(size).await.unwrap();
                    }
                    Message::DownloadRequest => {
                        assert_eq!(queried.as_deref(), Some(FILE_NAME));
                        writer.send_file(FILE_NAME, FILE_CONTENT).await.unwrap();
                    }
                    other => panic!("node got {}", other.kind()),
                }
            }
        })
    }

    #[tokio::test]
    async fn list_forwards_names() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = registry_with(listener.local_addr().unwrap().port());
        spawn_node(listener);
        let (client, mut client_rx) = client_pair().await;

        list(&registry, &client).await.unwrap();
        assert_eq!(
            client_rx.read().await.unwrap(),
            Message::Text(FILE_NAME.into())
        );
    }

    #[tokio::test]
    async fn list_without_nodes_is_refused() {
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(3)));
        let (client, mut client_rx) = client_pair().await;

        list(&registry, &client).await.unwrap();
        assert_eq!(
            client_rx.read().await.unwrap(),
            Message::Text("No fileservers available!".into())
        );
    }

    #[tokio::test]
    async fn download_debits_credits_and_load() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let registry = registry_with(port);
        let ledger = ledger();
        spawn_node(listener);
        let (client, mut client_rx) = client_pair().await;

        download(&registry, &ledger, &client, "alice", FILE_NAME)
            .await
            .unwrap();

        assert_eq!(
            client_rx.read().await.unwrap(),
            Message::File {
                name: FILE_NAME.into(),
                content: FILE_CONTENT.into()
            }
        );
        assert_eq!(ledger.credits("alice"), Some(60));
        assert_eq!(
            registry.least_loaded().unwrap().cumulative_load,
            FILE_CONTENT.len() as u64
        );
        assert_eq!(
            registry.least_loaded().unwrap().key(),
            node_key(ADDR, port)
        );
    }

    #[tokio::test]
    async fn download_needs_more_credits_than_the_size() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = registry_with(listener.local_addr().unwrap().port());
        let ledger = ledger();
        spawn_node(listener);
        let (client, mut client_rx) = client_pair().await;

        download(&registry, &ledger, &client, "bob", FILE_NAME)
            .await
            .unwrap();

        assert_eq!(
            client_rx.read().await.unwrap(),
            Message::Text("Not enough credits (you have 10, filesize is 40".into())
        );
        assert_eq!(ledger.credits("bob"), Some(10));
        assert_eq!(registry.least_loaded().unwrap().cumulative_load, 0);
    }

    #[tokio::test]
    async fn download_of_missing_file_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = registry_with(listener.local_addr().unwrap().port());
        let ledger = ledger();
        spawn_node(listener);
        let (client, mut client_rx) = client_pair().await;

        download(&registry, &ledger, &client, "alice", "missing.txt")
            .await
            .unwrap();

        assert_eq!(
            client_rx.read().await.unwrap(),
            Message::Text("File not found on server!".into())
        );
        assert_eq!(ledger.credits("alice"), Some(100));
    }

    #[tokio::test]
    async fn unexpected_node_reply_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = registry_with(listener.local_addr().unwrap().port());
        let ledger = ledger();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, write) = stream.into_split();
            let mut reader = MessageReader::new(BufReader::new(read));
            let mut writer = MessageWriter::new(write);
            reader.read().await.unwrap();
            writer.send_text("no idea").await.unwrap();
            let _ = reader.read().await;
        });
        let (client, mut client_rx) = client_pair().await;

        download(&registry, &ledger, &client, "alice", FILE_NAME)
            .await
            .unwrap();

        assert_eq!(
            client_rx.read().await.unwrap(),
            Message::Text("Received unexpected message from fileserver: Text".into())
        );
        assert_eq!(ledger.credits("alice"), Some(100));
    }

    #[tokio::test]
    async fn unreachable_node_fails_gracefully() {
        // Grab a free port and release it again so nothing is listening.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let registry = registry_with(port);
        let ledger = ledger();
        let (client, mut client_rx) = client_pair().await;

        download(&registry, &ledger, &client, "alice", FILE_NAME)
            .await
            .unwrap();

        assert_eq!(
            client_rx.read().await.unwrap(),
            Message::Text("Fileserver request failed!".into())
        );
        assert_eq!(ledger.credits("alice"), Some(100));
    }
}
