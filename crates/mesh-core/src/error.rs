use thiserror::Error;

/// Errors produced by the filemesh protocol layer.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("heartbeat error: {0}")]
    Heartbeat(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type MeshResult<T> = Result<T, MeshError>;
