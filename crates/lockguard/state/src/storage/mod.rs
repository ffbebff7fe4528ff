//! Storage backends for durable Lockguard state.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{AgentStore, BaselineStore, EventStore, LockStateStore, ScheduleStore};
