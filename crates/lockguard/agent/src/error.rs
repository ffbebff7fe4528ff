//! Agent error types

use lockguard_engine::EngineError;
use lockguard_state::StateError;
use lockguard_sync::SyncError;
use thiserror::Error;

/// Errors raised while configuring, booting or driving the agent
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    State(#[from] StateError),

    #[error("Decision error: {0}")]
    Engine(#[from] EngineError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Tracing initialization failed: {0}")]
    Telemetry(String),

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, AgentError>;
