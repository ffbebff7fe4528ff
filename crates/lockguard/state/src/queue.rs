//! Bounded, durable queue of offline events.
//!
//! Every heartbeat or tamper signal is appended here as `PENDING` before any
//! network attempt. Each kind keeps at most `max_pending_per_kind` pending
//! entries; older ones are dropped and counted as overflow. An event leaves
//! the queue unsynced only through overflow, a server rejection or an
//! exhausted retry budget, and every such discard is tallied in the store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lockguard_types::{DiscardCause, EventId, EventKind, OfflineEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::storage::AgentStore;

/// Queue bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Pending entries retained per kind.
    pub max_pending_per_kind: usize,

    /// How long synced entries are kept before garbage collection (seconds).
    pub synced_retention_secs: u64,

    /// Unaccepted deliveries allowed per event before it is discarded.
    pub max_delivery_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending_per_kind: 5,
            synced_retention_secs: 24 * 60 * 60,
            max_delivery_attempts: 10,
        }
    }
}

impl QueueConfig {
    pub fn synced_retention(&self) -> Duration {
        Duration::from_secs(self.synced_retention_secs)
    }
}

/// Result of appending one event.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub event: OfflineEvent,
    /// Older pending events of the same kind dropped to respect the bound.
    pub dropped: Vec<EventId>,
}

/// What a failed delivery did to its event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Still pending; `attempts` unaccepted deliveries so far.
    Retained { attempts: u32 },
    /// Removed from the queue and tallied.
    Discarded(DiscardCause),
}

/// Queue counters. Discard counts are persisted and survive restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending_heartbeats: usize,
    pub pending_tamper_signals: usize,
    /// Events dropped by the bound.
    pub overflowed: u64,
    /// Events the server refused as invalid.
    pub rejected: u64,
    /// Events discarded after `max_delivery_attempts`.
    pub exhausted: u64,
}

/// Durable FIFO of offline events, bounded per kind.
pub struct OfflineEventQueue {
    store: Arc<dyn AgentStore>,
    config: QueueConfig,
    /// Next sequence number; `None` until loaded from the store.
    next_sequence: Mutex<Option<u64>>,
}

impl OfflineEventQueue {
    pub fn new(store: Arc<dyn AgentStore>, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            next_sequence: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Append a pending event whose payload embeds its sequence number.
    ///
    /// `build_payload` receives the allocated sequence and returns the exact
    /// body that will later be replayed. Sequence allocation and the append
    /// happen under one lock so sequence order matches append order.
    #[instrument(skip_all, fields(kind = %kind))]
    pub async fn record<F>(
        &self,
        kind: EventKind,
        recorded_at: DateTime<Utc>,
        build_payload: F,
    ) -> Result<AppendOutcome>
    where
        F: FnOnce(u64) -> Result<String> + Send,
    {
        let mut next = self.next_sequence.lock().await;
        let sequence = match *next {
            Some(seq) => seq,
            None => self.store.max_sequence().await?.map_or(1, |max| max + 1),
        };

        let payload = build_payload(sequence)?;
        let event = OfflineEvent::pending(kind, sequence, payload, recorded_at);
        self.store.append_event(&event).await?;
        *next = Some(sequence + 1);
        drop(next);

        debug!(event_id = %event.id, sequence, "Offline event recorded");

        let dropped = self.enforce_bound(kind, recorded_at).await?;
        Ok(AppendOutcome { event, dropped })
    }

    async fn enforce_bound(&self, kind: EventKind, at: DateTime<Utc>) -> Result<Vec<EventId>> {
        let pending = self.store.pending_events(kind).await?;
        let max = self.config.max_pending_per_kind;
        if pending.len() <= max {
            return Ok(Vec::new());
        }

        let excess = pending.len() - max;
        let overflow = &pending[..excess];
        self.store
            .discard_events(overflow, DiscardCause::Overflow, at)
            .await?;
        let dropped: Vec<EventId> = overflow.iter().map(|e| e.id).collect();

        warn!(
            kind = %kind,
            dropped = excess,
            oldest_dropped_sequence = pending[0].sequence,
            retained = max,
            "Offline queue overflow: oldest pending events dropped"
        );
        Ok(dropped)
    }

    /// Pending events of one kind, oldest first.
    pub async fn pending(&self, kind: EventKind) -> Result<Vec<OfflineEvent>> {
        self.store.pending_events(kind).await
    }

    /// Mark an event delivered after a confirmed server acknowledgement.
    pub async fn mark_synced(&self, id: &EventId, synced_at: DateTime<Utc>) -> Result<()> {
        self.store.mark_synced(id, synced_at).await
    }

    /// Count a delivery the server answered without accepting. The event
    /// is discarded once `max_delivery_attempts` is reached.
    pub async fn record_failed_attempt(
        &self,
        event: &OfflineEvent,
        at: DateTime<Utc>,
    ) -> Result<FailureDisposition> {
        let attempts = self.store.record_attempt(&event.id).await?;
        if attempts < self.config.max_delivery_attempts.max(1) {
            return Ok(FailureDisposition::Retained { attempts });
        }

        self.store
            .discard_events(
                std::slice::from_ref(event),
                DiscardCause::RetryBudgetExhausted,
                at,
            )
            .await?;
        warn!(
            event_id = %event.id,
            kind = %event.kind,
            sequence = event.sequence,
            attempts,
            "Retry budget exhausted: offline event discarded"
        );
        Ok(FailureDisposition::Discarded(DiscardCause::RetryBudgetExhausted))
    }

    /// Discard an event the server refused as invalid.
    pub async fn reject(&self, event: &OfflineEvent, at: DateTime<Utc>) -> Result<()> {
        self.store
            .discard_events(std::slice::from_ref(event), DiscardCause::Rejected, at)
            .await?;
        warn!(
            event_id = %event.id,
            kind = %event.kind,
            sequence = event.sequence,
            "Offline event rejected by server: discarded"
        );
        Ok(())
    }

    /// Delete synced events older than the retention window.
    pub async fn collect_garbage(&self, now: DateTime<Utc>) -> Result<usize> {
        let retention = chrono::Duration::from_std(self.config.synced_retention())
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let purged = self.store.purge_synced_before(now - retention).await?;
        if purged > 0 {
            info!(purged, "Synced offline events garbage-collected");
        }
        Ok(purged)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            pending_heartbeats: self.store.pending_events(EventKind::Heartbeat).await?.len(),
            pending_tamper_signals: self
                .store
                .pending_events(EventKind::TamperSignal)
                .await?
                .len(),
            overflowed: self.store.discarded_count(DiscardCause::Overflow).await?,
            rejected: self.store.discarded_count(DiscardCause::Rejected).await?,
            exhausted: self
                .store
                .discarded_count(DiscardCause::RetryBudgetExhausted)
                .await?,
        })
    }
}
