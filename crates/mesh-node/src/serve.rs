//! TCP request serving.
//!
//! The proxy opens a fresh connection per workflow and sends list, size and
//! download requests over it. A download delivers the file named by the
//! preceding size query on the same connection.

use crate::store::FileStore;
use mesh_core::{Message, MessageReader, MessageWriter, MeshError, MeshResult};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Accept proxy connections until shutdown.
pub async fn run(
    listener: TcpListener,
    store: Arc<FileStore>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let store = store.clone();
                        tokio::spawn(async move {
                            debug!(%peer, "proxy connected");
                            handle_connection(stream, &store).await;
                            debug!(%peer, "proxy disconnected");
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
}

async fn handle_connection(stream: TcpStream, store: &FileStore) {
    let (read, write) = stream.into_split();
    let mut reader = MessageReader::new(BufReader::new(read));
    let mut writer = MessageWriter::new(write);
    // File name from the last size query; a download request delivers it.
    let mut queried: Option<String> = None;

    loop {
        let message = match reader.read().await {
            Ok(message) => message,
            Err(MeshError::ConnectionClosed) => break,
            Err(e) => {
                debug!(error = %e, "connection error");
                break;
            }
        };
        let result = match message {
            Message::FileNamesRequest => send_names(&mut writer, store).await,
            Message::SizeRequest(name) => {
                let size = store.size(&name);
                queried = Some(name);
                writer.send_size(size).await
            }
            Message::DownloadRequest => {
                send_download(&mut writer, store, queried.as_deref()).await
            }
            other => {
                warn!(kind = other.kind(), "ignoring unexpected message");
                Ok(())
            }
        };
        if let Err(e) = result {
            debug!(error = %e, "reply failed");
            break;
        }
    }
}

async fn send_names(writer: &mut MessageWriter<OwnedWriteHalf>, store: &FileStore) -> MeshResult<()> {
    match store.list() {
        Ok(names) => writer.send_file_list(&names).await,
        Err(e) => {
            warn!(error = %e, "listing store failed");
            writer.send_file_list(&[]).await
        }
    }
}

async fn send_download(
    writer: &mut MessageWriter<OwnedWriteHalf>,
    store: &FileStore,
    queried: Option<&str>,
) -> MeshResult<()> {
    let Some(name) = queried else {
        return writer
            .send_text("No download was prepared on this connection!")
            .await;
    };
    match store.content(name) {
        Some(content) => writer.send_file(name, &content).await,
        None => {
            warn!(file = %name, "queried file disappeared before download");
            writer.send_text("File could not be read!").await
        }
    }
}
