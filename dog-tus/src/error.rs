use std::sync::Arc;

use thiserror::Error;

/// Result type for tus operations
pub type TusResult<T> = Result<T, TusError>;

/// Errors that can occur while creating, persisting or transferring uploads
#[derive(Error, Debug, Clone)]
pub enum TusError {
    #[error("Chunk source is closed")]
    ClosedSource,

    #[error("Invalid offset {offset} for source of length {length}")]
    InvalidOffset { offset: u64, length: u64 },

    #[error("Transport failure: {message}")]
    Transport { message: String, status: Option<u16> },

    #[error("Server offset {actual} does not match expected offset {expected}")]
    ProtocolMismatch { expected: u64, actual: u64 },

    #[error("Upload no longer exists on the server: {url}")]
    RemoteNotFound { url: String },

    #[error("Source for upload {id} is unavailable: {reason}")]
    SourceUnavailable { id: String, reason: String },

    #[error("Upload has been cancelled")]
    AlreadyCancelled,

    #[error("Upload is already complete")]
    AlreadyComplete,

    #[error("Upload has an outstanding request")]
    NotIdle,

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Upload not found: {0}")]
    NotFound(String),

    #[error("Server rejected request with status {status}")]
    Rejected { status: u16 },

    #[error("Malformed server response: {0}")]
    MalformedResponse(String),

    #[error("Server reports length {remote} but the source has {local} bytes")]
    LengthMismatch { local: u64, remote: u64 },

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl TusError {
    /// Create a transport error without an HTTP status
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
            status: None,
        }
    }

    /// Create a transport error carrying the HTTP status that caused it
    pub fn transport_status<S: Into<String>>(message: S, status: u16) -> Self {
        Self::Transport {
            message: message.into(),
            status: Some(status),
        }
    }

    /// Create a storage error from any error type
    pub fn storage<E: std::fmt::Display>(error: E) -> Self {
        Self::Storage(error.to_string())
    }

    pub fn source_unavailable<I: Into<String>, R: Into<String>>(id: I, reason: R) -> Self {
        Self::SourceUnavailable {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedResponse(message.into())
    }

    /// Whether the state machine retries this error on its own, up to the retry ceiling
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::ProtocolMismatch { .. })
    }

    /// HTTP status attached to the error, if the server answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } => *status,
            Self::Rejected { status } => Some(*status),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TusError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for TusError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for TusError {
    fn from(err: url::ParseError) -> Self {
        Self::Config(err.to_string())
    }
}
