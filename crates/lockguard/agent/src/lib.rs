//! Embeddable Lockguard runtime.
//!
//! The host process supplies the platform pieces (an
//! [`EnforcementCollaborator`](lockguard_engine::EnforcementCollaborator) and
//! a [`SnapshotSource`](lockguard_sync::SnapshotSource)); the agent owns
//! storage, decisions, detection and synchronization.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # async fn run(
//! #     enforcement: Arc<dyn lockguard_engine::EnforcementCollaborator>,
//! #     snapshots: Arc<dyn lockguard_sync::SnapshotSource>,
//! # ) -> anyhow::Result<()> {
//! use lockguard_agent::{init_tracing, Agent};
//!
//! let agent = Agent::from_config_file("/etc/lockguard.toml", enforcement, snapshots).await?;
//! init_tracing(&agent.config().logging)?;
//! let handle = agent.start().await?;
//! // ...
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod agent;
pub mod config;
pub mod error;
pub mod probe;
pub mod telemetry;

pub use actor::{spawn_decision_actor, DecisionHandle};
pub use agent::{open_store, Agent, AgentHandle};
pub use config::{
    AgentConfig, DeviceConfig, LoggingConfig, ProbeConfig, StorageConfig, ValidatorConfig,
};
pub use error::{AgentError, Result};
pub use probe::{DetectionProbe, ProbeOutcome};
pub use telemetry::init_tracing;
