//! Error types for lockguard-engine crate.

use lockguard_state::StateError;
use thiserror::Error;

use crate::enforcement::EnforcementError;

/// Errors from the decision core.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Durable state could not be read or written.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// The enforcement collaborator rejected or failed a request.
    /// The lock record has already been committed when this is returned.
    #[error("enforcement error: {0}")]
    Enforcement(#[from] EnforcementError),

    /// The device is deactivated; no local transition is possible.
    #[error("device is deactivated")]
    Deactivated,

    /// The decision entry point is no longer accepting triggers.
    #[error("decision engine unavailable: {0}")]
    Unavailable(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
