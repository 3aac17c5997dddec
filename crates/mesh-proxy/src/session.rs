//! Client session tracking.
//!
//! Every accepted TCP client gets a numeric session id and a shared handle
//! to the writing half of its socket, so a console-triggered shutdown can
//! push a forced logoff to every client, idle or mid-command.

use mesh_core::MessageWriter;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Identifier of one client connection.
pub type SessionId = u64;

/// Shared handle to a session's writing half.
pub type SessionWriter = Arc<Mutex<MessageWriter<OwnedWriteHalf>>>;

struct SessionEntry {
    peer: SocketAddr,
    writer: SessionWriter,
}

/// Tracks all live client connections.
pub struct SessionManager {
    active: Mutex<HashMap<SessionId, SessionEntry>>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate the id for the next accepted connection.
    pub fn allocate_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a new connection under `id`.
    pub async fn register(&self, id: SessionId, peer: SocketAddr, writer: SessionWriter) {
        info!(session = id, %peer, "client connected");
        self.active
            .lock()
            .await
            .insert(id, SessionEntry { peer, writer });
    }

    /// Drop a connection from the set. Safe to call more than once.
    pub async fn remove(&self, id: SessionId) {
        if let Some(entry) = self.active.lock().await.remove(&id) {
            info!(session = id, peer = %entry.peer, "client disconnected");
        }
    }

    /// Writing half of a live session.
    pub async fn writer(&self, id: SessionId) -> Option<SessionWriter> {
        self.active.lock().await.get(&id).map(|e| e.writer.clone())
    }

    /// Number of live sessions.
    pub async fn count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Push a forced logoff to every live session and close it.
    ///
    /// Returns the drained ids so the caller can release their ledger
    /// bindings as well.
    pub async fn force_logoff_all(&self) -> Vec<SessionId> {
        let drained: Vec<(SessionId, SessionEntry)> = {
            let mut active = self.active.lock().await;
            active.drain().collect()
        };

        let mut ids = Vec::with_capacity(drained.len());
        for (id, entry) in drained {
            let mut writer = entry.writer.lock().await;
            if let Err(e) = writer.send_force_logoff().await {
                debug!(session = id, error = %e, "logoff notice failed");
            }
            if let Err(e) = writer.shutdown().await {
                debug!(session = id, error = %e, "session shutdown failed");
            }
            info!(session = id, peer = %entry.peer, "client force-logged off");
            ids.push(id);
        }
        ids
    }
}
