//! In-memory storage for development and testing.
//!
//! Mirrors the semantics of the SQLite backend, including atomic
//! transitions and baseline revision checks. Not durable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lockguard_types::{
    DeviceBaseline, DiscardCause, EventId, EventKind, LockRecord, OfflineEvent, PaymentSchedule,
    SyncStatus,
};
use tokio::sync::RwLock;

use super::traits::{BaselineStore, EventStore, LockStateStore, ScheduleStore};
use crate::error::{Result, StateError};

#[derive(Default)]
struct Tables {
    /// Lock records in insertion order.
    records: Vec<LockRecord>,
    schedule: Option<PaymentSchedule>,
    baseline: Option<DeviceBaseline>,
    events: Vec<OfflineEvent>,
    discards: HashMap<(EventKind, DiscardCause), u64>,
    /// Highest sequence among discarded events.
    discarded_high: u64,
}

/// In-memory implementation of every storage trait.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    unreadable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every lock history read fail as if the store were corrupted.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn set_unreadable(&self, unreadable: bool) {
        self.unreadable.store(unreadable, Ordering::SeqCst);
    }

    /// Insert a record verbatim, bypassing transition semantics.
    ///
    /// Lets tests construct states that violate the store invariants.
    #[cfg(any(test, feature = "test-utils"))]
    pub async fn insert_raw_record(&self, record: LockRecord) {
        self.tables.write().await.records.push(record);
    }

    /// Total number of lock records, resolved or not.
    pub async fn record_count(&self) -> usize {
        self.tables.read().await.records.len()
    }

    fn check_readable(&self) -> Result<()> {
        if self.unreadable.load(Ordering::SeqCst) {
            return Err(StateError::Corrupted("lock history unreadable".into()));
        }
        Ok(())
    }
}

fn newest_first(records: impl Iterator<Item = LockRecord>) -> Vec<LockRecord> {
    let mut records: Vec<LockRecord> = records.collect();
    records.reverse();
    records
}

#[async_trait]
impl LockStateStore for InMemoryStore {
    async fn current_record(&self) -> Result<Option<LockRecord>> {
        Ok(self.unresolved_records().await?.into_iter().next())
    }

    async fn unresolved_records(&self) -> Result<Vec<LockRecord>> {
        self.check_readable()?;
        let tables = self.tables.read().await;
        Ok(newest_first(
            tables.records.iter().filter(|r| r.is_current()).cloned(),
        ))
    }

    async fn history(&self, limit: usize) -> Result<Vec<LockRecord>> {
        self.check_readable()?;
        let tables = self.tables.read().await;
        let mut records = newest_first(tables.records.iter().cloned());
        records.truncate(limit);
        Ok(records)
    }

    async fn commit_transition(
        &self,
        record: &LockRecord,
        resolved_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_readable()?;
        let mut tables = self.tables.write().await;
        for existing in tables.records.iter_mut().filter(|r| r.is_current()) {
            existing.resolved_at = Some(resolved_at);
        }
        tables.records.push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for InMemoryStore {
    async fn load_schedule(&self) -> Result<Option<PaymentSchedule>> {
        Ok(self.tables.read().await.schedule.clone())
    }

    async fn save_schedule(&self, schedule: &PaymentSchedule) -> Result<()> {
        self.tables.write().await.schedule = Some(schedule.clone());
        Ok(())
    }

    async fn clear_schedule(&self) -> Result<()> {
        self.tables.write().await.schedule = None;
        Ok(())
    }
}

#[async_trait]
impl BaselineStore for InMemoryStore {
    async fn load_baseline(&self) -> Result<Option<DeviceBaseline>> {
        Ok(self.tables.read().await.baseline.clone())
    }

    async fn establish_baseline(&self, baseline: &DeviceBaseline) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = &tables.baseline {
            return Err(StateError::BaselineExists(existing.revision));
        }
        tables.baseline = Some(baseline.clone());
        Ok(())
    }

    async fn replace_baseline(&self, baseline: &DeviceBaseline) -> Result<()> {
        let mut tables = self.tables.write().await;
        let existing = tables.baseline.as_ref().ok_or(StateError::BaselineMissing)?;
        if baseline.revision != existing.revision + 1 {
            return Err(StateError::BaselineRevisionMismatch {
                expected: existing.revision + 1,
                actual: baseline.revision,
            });
        }
        tables.baseline = Some(baseline.clone());
        Ok(())
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn append_event(&self, event: &OfflineEvent) -> Result<()> {
        self.tables.write().await.events.push(event.clone());
        Ok(())
    }

    async fn pending_events(&self, kind: EventKind) -> Result<Vec<OfflineEvent>> {
        let tables = self.tables.read().await;
        let mut events: Vec<OfflineEvent> = tables
            .events
            .iter()
            .filter(|e| e.kind == kind && e.is_pending())
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            a.recorded_at
                .cmp(&b.recorded_at)
                .then(a.sequence.cmp(&b.sequence))
        });
        Ok(events)
    }

    async fn mark_synced(&self, id: &EventId, synced_at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.write().await;
        let event = tables
            .events
            .iter_mut()
            .find(|e| e.id == *id)
            .ok_or_else(|| StateError::NotFound(id.to_string()))?;
        event.sync_status = SyncStatus::Synced;
        event.synced_at = Some(synced_at);
        Ok(())
    }

    async fn record_attempt(&self, id: &EventId) -> Result<u32> {
        let mut tables = self.tables.write().await;
        let event = tables
            .events
            .iter_mut()
            .find(|e| e.id == *id)
            .ok_or_else(|| StateError::NotFound(id.to_string()))?;
        event.attempts = event.attempts.saturating_add(1);
        Ok(event.attempts)
    }

    async fn discard_events(
        &self,
        events: &[OfflineEvent],
        cause: DiscardCause,
        _at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let ids: Vec<EventId> = events.iter().map(|e| e.id).collect();
        tables.events.retain(|e| !ids.contains(&e.id));
        for event in events {
            *tables.discards.entry((event.kind, cause)).or_default() += 1;
            tables.discarded_high = tables.discarded_high.max(event.sequence);
        }
        Ok(())
    }

    async fn discarded_count(&self, cause: DiscardCause) -> Result<u64> {
        let tables = self.tables.read().await;
        Ok(tables
            .discards
            .iter()
            .filter(|((_, c), _)| *c == cause)
            .map(|(_, count)| count)
            .sum())
    }

    async fn purge_synced_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut tables = self.tables.write().await;
        let before = tables.events.len();
        let newest = tables.events.iter().map(|e| e.sequence).max();
        tables.events.retain(|e| {
            Some(e.sequence) == newest
                || !(e.sync_status == SyncStatus::Synced && e.synced_at.is_some_and(|at| at < cutoff))
        });
        Ok(before - tables.events.len())
    }

    async fn max_sequence(&self) -> Result<Option<u64>> {
        let tables = self.tables.read().await;
        let stored = tables.events.iter().map(|e| e.sequence).max();
        let discarded = (tables.discarded_high > 0).then_some(tables.discarded_high);
        Ok(stored.max(discarded))
    }
}
