//! mesh-core: Shared protocol library for filemesh.
//!
//! Provides the line-oriented wire messages exchanged over TCP between
//! clients, the proxy and the file nodes, plus the UDP heartbeat codec
//! used by nodes to announce themselves.

pub mod error;
pub mod heartbeat;
pub mod wire;

// Re-export commonly used items at crate root.
pub use error::{MeshError, MeshResult};
pub use heartbeat::{decode_heartbeat, encode_heartbeat, MAX_DATAGRAM};
pub use wire::{Message, MessageReader, MessageWriter};
