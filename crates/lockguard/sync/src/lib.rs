//! Heartbeat synchronization for Lockguard.
//!
//! Every heartbeat and tamper signal is written to the offline queue before
//! any network attempt. [`SyncCoordinator`] drains the queue oldest-first,
//! replays the recorded payloads through a [`HeartbeatTransport`], and
//! feeds validated server responses into the decision engine.

pub mod backoff;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod snapshot;
pub mod transport;

pub use backoff::{Backoff, BackoffConfig};
pub use config::SyncConfig;
pub use coordinator::{SyncCoordinator, SyncOutcome};
pub use error::{Result, SyncError};
pub use snapshot::{SnapshotSource, StaticSnapshotSource};
pub use transport::{HeartbeatTransport, HttpHeartbeatTransport, ScriptedReply, ScriptedTransport};
