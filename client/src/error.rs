//! Error types for the serving client.

use batchline_common::{ErrorKind, Payload, ProtocolError, ProtocolTag};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("No response from the server within {timeout_ms} ms (request {request_id})")]
    Timeout { request_id: u64, timeout_ms: u64 },

    #[error("Too many concurrent requests, max_concurrency = {0}")]
    ConcurrencyExceeded(usize),

    #[error("Partial result: {received} of {expected} partitions returned")]
    PartialResult {
        received: u32,
        expected: u32,
        payload: Payload,
    },

    #[error("Server error ({kind}): {message}")]
    Remote { kind: ErrorKind, message: String },

    #[error("Protocol mismatch: server uses '{server}' while this client uses '{client}'")]
    ProtocolMismatch {
        server: ProtocolTag,
        client: ProtocolTag,
    },

    #[error("Payload is '{actual}' but the connection protocol is '{expected}'")]
    WrongPayloadProtocol {
        expected: ProtocolTag,
        actual: ProtocolTag,
    },

    #[error("Version mismatch: server is {server}, client is {client}")]
    VersionMismatch { server: String, client: String },

    #[error("Connection closed")]
    Closed,
}

impl ClientError {
    /// Error category shared with the server taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(_) | Self::WrongPayloadProtocol { .. } => ErrorKind::Protocol,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ConcurrencyExceeded(_) => ErrorKind::ConcurrencyExceeded,
            Self::PartialResult { .. } => ErrorKind::PartialResult,
            Self::Remote { kind, .. } => *kind,
            Self::Transport(_)
            | Self::Handshake(_)
            | Self::ProtocolMismatch { .. }
            | Self::VersionMismatch { .. }
            | Self::Closed => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
