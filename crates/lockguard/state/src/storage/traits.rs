//! Storage traits, one per persisted table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lockguard_types::{
    DeviceBaseline, DiscardCause, EventId, EventKind, LockRecord, OfflineEvent, PaymentSchedule,
};

use crate::error::Result;

/// Append-only lock history.
#[async_trait]
pub trait LockStateStore: Send + Sync {
    /// The current (unresolved) record, newest first if several exist.
    async fn current_record(&self) -> Result<Option<LockRecord>>;

    /// Every unresolved record, newest first. More than one is an invariant violation.
    async fn unresolved_records(&self) -> Result<Vec<LockRecord>>;

    /// Most recent records, newest first.
    async fn history(&self, limit: usize) -> Result<Vec<LockRecord>>;

    /// Atomically mark every unresolved record resolved at `resolved_at`
    /// and insert `record` as the new current record.
    async fn commit_transition(&self, record: &LockRecord, resolved_at: DateTime<Utc>)
        -> Result<()>;
}

/// Single-row payment schedule.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn load_schedule(&self) -> Result<Option<PaymentSchedule>>;

    /// Replace the stored schedule wholesale.
    async fn save_schedule(&self, schedule: &PaymentSchedule) -> Result<()>;

    async fn clear_schedule(&self) -> Result<()>;
}

/// Single-row device baseline.
#[async_trait]
pub trait BaselineStore: Send + Sync {
    async fn load_baseline(&self) -> Result<Option<DeviceBaseline>>;

    /// Store the registration baseline. Fails if one already exists.
    async fn establish_baseline(&self, baseline: &DeviceBaseline) -> Result<()>;

    /// Replace the baseline. `baseline.revision` must be the stored revision plus one.
    async fn replace_baseline(&self, baseline: &DeviceBaseline) -> Result<()>;
}

/// Offline event table.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append_event(&self, event: &OfflineEvent) -> Result<()>;

    /// Pending events of one kind, oldest first by `recorded_at` then `sequence`.
    async fn pending_events(&self, kind: EventKind) -> Result<Vec<OfflineEvent>>;

    async fn mark_synced(&self, id: &EventId, synced_at: DateTime<Utc>) -> Result<()>;

    /// Count a delivery the server did not accept. Returns the new count.
    async fn record_attempt(&self, id: &EventId) -> Result<u32>;

    /// Delete `events` and add them to the persistent discard tally for
    /// `cause`, in one transaction.
    async fn discard_events(
        &self,
        events: &[OfflineEvent],
        cause: DiscardCause,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Events discarded for `cause` since the store was created.
    async fn discarded_count(&self, cause: DiscardCause) -> Result<u64>;

    /// Delete synced events synced before `cutoff`, keeping the newest event
    /// so the sequence high-water mark survives. Returns the number deleted.
    async fn purge_synced_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Highest sequence number ever stored, discarded events included.
    async fn max_sequence(&self) -> Result<Option<u64>>;
}

/// Everything the agent persists.
pub trait AgentStore: LockStateStore + ScheduleStore + BaselineStore + EventStore {}

impl<T> AgentStore for T where T: LockStateStore + ScheduleStore + BaselineStore + EventStore {}
