//! Error types for the Tether engine.

use crate::RecordId;
use thiserror::Error;

/// All possible errors from the Tether engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Configuration errors
    #[error("remote path is required")]
    MissingPath,

    #[error("invalid remote path: {0}")]
    InvalidPath(String),

    #[error("invalid sync mode: {0}")]
    InvalidMode(String),

    // Model errors
    #[error("record has no identifier")]
    MissingIdentifier,

    #[error("identifier is immutable: '{current}' cannot become '{attempted}'")]
    IdentifierImmutable { current: String, attempted: String },

    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    // Remote errors
    #[error("write rejected at {path}: {reason}")]
    WriteRejected { path: String, reason: String },

    #[error("not connected to remote store")]
    NotConnected,
}

impl Error {
    /// Whether the error came back from the remote store.
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::WriteRejected { .. } | Error::NotConnected)
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
