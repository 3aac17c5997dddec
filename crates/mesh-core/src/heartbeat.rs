//! UDP heartbeat codec.
//!
//! A node announces itself by sending its escaped decimal TCP port as a
//! single datagram. The proxy takes the node's address from the datagram
//! source, so the port is the entire payload.

use crate::error::{MeshError, MeshResult};
use crate::wire::{escape, unescape};

/// Upper bound on the size of a heartbeat datagram in bytes.
pub const MAX_DATAGRAM: usize = 256;

/// Encode the announced TCP port into a heartbeat payload.
pub fn encode_heartbeat(port: u16) -> MeshResult<Vec<u8>> {
    let payload = escape(&port.to_string());
    if payload.len() > MAX_DATAGRAM {
        return Err(MeshError::Heartbeat(format!(
            "payload exceeds {} bytes",
            MAX_DATAGRAM
        )));
    }
    Ok(payload.into_bytes())
}

/// Decode a heartbeat payload back into the announced TCP port.
///
/// Tolerates trailing NUL padding from fixed-size receive buffers. Anything
/// else that fails to parse as a port is rejected.
pub fn decode_heartbeat(data: &[u8]) -> MeshResult<u16> {
    if data.len() > MAX_DATAGRAM {
        return Err(MeshError::Heartbeat(format!(
            "datagram exceeds {} bytes",
            MAX_DATAGRAM
        )));
    }
    let text = std::str::from_utf8(data)
        .map_err(|_| MeshError::Heartbeat("payload is not UTF-8".into()))?;
    let trimmed = text.trim_end_matches('\0').trim();
    unescape(trimmed)
        .parse::<u16>()
        .map_err(|_| MeshError::Heartbeat(format!("bad port payload: {:?}", trimmed)))
}
