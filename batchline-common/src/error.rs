//! Error taxonomy shared by the server, the client and the HTTP gateway.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure to frame or decode a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("Unknown envelope kind {0}")]
    UnknownKind(u8),
    #[error("Unknown protocol tag {0}")]
    UnknownProtocol(u8),
    #[error("Unknown protocol name '{0}', must be 'obj' or 'numpy'")]
    UnknownProtocolName(String),
    #[error("Unknown dtype {0}")]
    UnknownDType(u8),
    #[error("Frame truncated: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("Frame has {0} trailing bytes")]
    TrailingBytes(usize),
    #[error("Invalid UTF-8 in origin id")]
    InvalidOrigin,
    #[error("Array header declares {expected} bytes but {actual} were supplied")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("Invalid array shape {0:?}: {1}")]
    InvalidShape(Vec<usize>, &'static str),
    #[error("Element type mismatch: array is {actual}, requested {requested}")]
    DTypeMismatch {
        actual: &'static str,
        requested: &'static str,
    },
    #[error("Cannot combine results: {0}")]
    Incompatible(String),
    #[error("Object payload is not valid JSON: {0}")]
    Json(String),
}

/// Stable error categories carried in error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed envelope or payload.
    Protocol,
    /// No reply within the deadline.
    Timeout,
    /// Every concurrency slot is taken.
    ConcurrencyExceeded,
    /// No live worker can take the request.
    WorkerUnavailable,
    /// The aggregate was force-completed before every partition arrived.
    PartialResult,
    /// Input rejected at the HTTP boundary.
    UnsupportedInputFile,
    /// Upload larger than the configured limit.
    PayloadTooLarge,
    /// Device bind or model load failed for a worker.
    StartupFailed,
    /// The predict hook failed.
    Inference,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Protocol => "protocol",
            Self::Timeout => "timeout",
            Self::ConcurrencyExceeded => "concurrency_exceeded",
            Self::WorkerUnavailable => "worker_unavailable",
            Self::PartialResult => "partial_result",
            Self::UnsupportedInputFile => "unsupported_input_file",
            Self::PayloadTooLarge => "payload_too_large",
            Self::StartupFailed => "startup_failed",
            Self::Inference => "inference",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Body of an `error` envelope, always encoded with the `obj` codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&ProtocolError> for ErrorBody {
    fn from(err: &ProtocolError) -> Self {
        Self::new(ErrorKind::Protocol, err.to_string())
    }
}
