//! Error types for lockguard-state crate.

use thiserror::Error;

/// Errors that can occur while reading or writing durable state.
#[derive(Debug, Error)]
pub enum StateError {
    /// Stored data cannot be decoded; the store must be treated as unreadable.
    #[error("corrupted state: {0}")]
    Corrupted(String),

    /// Backend failure (I/O, locking, connection).
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A baseline already exists; replacing it requires an explicit re-baseline.
    #[error("device baseline already established (revision {0})")]
    BaselineExists(u32),

    /// Re-baseline revision does not follow the stored one.
    #[error("baseline revision mismatch: expected {expected}, got {actual}")]
    BaselineRevisionMismatch { expected: u32, actual: u32 },

    /// No baseline to replace.
    #[error("no device baseline established")]
    BaselineMissing,

    /// Item not found.
    #[error("not found: {0}")]
    NotFound(String),
}

impl StateError {
    /// Whether the error means the lock history cannot be trusted.
    pub fn is_unreadable(&self) -> bool {
        matches!(self, StateError::Corrupted(_) | StateError::Storage(_))
    }
}

impl From<sqlx::Error> for StateError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StateError::Corrupted(e.to_string())
            }
            sqlx::Error::RowNotFound => StateError::NotFound(e.to_string()),
            other => StateError::Storage(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        StateError::Serialization(e.to_string())
    }
}

/// Result type for state operations.
pub type Result<T> = std::result::Result<T, StateError>;
