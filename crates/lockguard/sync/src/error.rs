//! Error types for lockguard-sync crate.

use std::time::Duration;

use lockguard_state::StateError;
use lockguard_types::ProtocolError;
use thiserror::Error;

/// Sync errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network unreachable or connection failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// No response within the request timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Non-success HTTP status.
    #[error("server returned {status}: {body}")]
    Http { status: u16, body: String },

    /// Response could not be parsed or validated; it is discarded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Queue storage failed.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Device snapshot could not be captured.
    #[error("snapshot unavailable: {0}")]
    Snapshot(String),

    /// Invalid sync configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Transient I/O failures, retried with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Transport(_) | SyncError::Timeout(_) => true,
            SyncError::Http { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    /// The server refused the request itself; replaying it cannot succeed.
    pub fn is_rejection(&self) -> bool {
        matches!(self, SyncError::Http { status, .. } if (400..500).contains(status))
            && !self.is_transient()
    }

    /// The request never got an answer from the server.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, SyncError::Transport(_) | SyncError::Timeout(_))
    }
}


impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Transport(err.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
