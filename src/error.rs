//! Error types for till-sync

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Chain integrity check failed, corrupted entries: {entries:?}")]
    ChainIntegrity { entries: Vec<String> },

    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether this failure is connectivity-class.
    ///
    /// Connectivity failures are absorbed by the dispatcher (durable queue
    /// plus optimistic cache write); every other class propagates to the
    /// caller untouched.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Timeout(_))
    }
}
