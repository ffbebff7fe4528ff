//! Durable state for Lockguard.
//!
//! Owns the persisted layout of the enforcement core:
//! - the append-only lock record table
//! - the bounded offline event table and its discard tally
//! - the single-row payment schedule
//! - the single-row device baseline
//!
//! Two backends are provided: [`SqliteStore`] for devices and
//! [`InMemoryStore`] for development and tests.

pub mod error;
pub mod queue;
pub mod storage;

pub use error::{Result, StateError};
pub use queue::{AppendOutcome, FailureDisposition, OfflineEventQueue, QueueConfig, QueueStats};
pub use storage::{
    AgentStore, BaselineStore, EventStore, InMemoryStore, LockStateStore, ScheduleStore,
    SqliteStore,
};
