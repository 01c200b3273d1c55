//! Error types for the server client.

use thiserror::Error;

/// Errors returned by [`CirrusClient`](crate::CirrusClient) methods.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(serde_json::Error),

    #[error("server disconnected")]
    Disconnected,

    #[error("protocol error: {0}")]
    Protocol(String),

    /// `kind` is the server's error code, e.g. `NotFound`.
    #[error("server error: {kind}: {message}")]
    Server { kind: String, message: String },
}

impl ClientError {
    /// The server error code, if this is a server-side failure.
    pub fn server_kind(&self) -> Option<&str> {
        match self {
            ClientError::Server { kind, .. } => Some(kind),
            _ => None,
        }
    }
}
