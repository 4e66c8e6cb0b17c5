//! Common error types for FieldSync.

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for FieldSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Durable queue store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Network transport failed before a response was received.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote call did not finish within its window.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Remote endpoint answered with a non-success status.
    #[error("Remote rejected request ({status}): {message}")]
    Remote { status: u16, message: String },

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration rejected.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Illegal state transition or concurrent modification.
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl Error {
    /// Whether the error comes from talking to the remote side and may go
    /// away on its own.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout(_) | Error::Io(_) => true,
            Error::Remote { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
