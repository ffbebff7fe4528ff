//! Offline queue draining.
//!
//! A sync pass replays pending events oldest-first per kind. A failed event
//! stays pending and stops its kind for the rest of the pass, so a later
//! event is never acknowledged before an earlier one. Server responses go
//! straight into the decision engine, which applies deactivation and lock
//! commands on receipt. An event is marked synced only after its response
//! was applied; if the engine could not apply it the event is replayed.
//!
//! Events leave the queue unsynced in two ways. A 4xx rejection discards the
//! event at once. Any other answer that is not an acceptable response
//! (5xx, malformed body) counts against the queue's retry budget. Requests
//! that never reach the server cost nothing.

use std::sync::Arc;

use lockguard_engine::{Clock, DecisionSink, EngineError, Trigger};
use lockguard_state::{FailureDisposition, OfflineEventQueue};
use lockguard_types::{
    DeviceId, EventKind, HeartbeatRequest, HeartbeatResponse, LockState, OfflineEvent,
    RemoteDirective, TamperSignalRequest, ViolationReport,
};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::Backoff;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::snapshot::SnapshotSource;
use crate::transport::HeartbeatTransport;

/// Tamper signals first; they carry the security-critical events.
const DRAIN_ORDER: [EventKind; 2] = [EventKind::TamperSignal, EventKind::Heartbeat];

/// Result of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Events acknowledged by the server.
    pub delivered: usize,
    /// Kinds whose drain stopped on a failure.
    pub stalled: Vec<EventKind>,
    /// Responses discarded as malformed.
    pub discarded_responses: usize,
    /// Events the server rejected; removed from the queue.
    pub rejected: usize,
    /// Events removed after exhausting their retry budget.
    pub exhausted: usize,
    /// A fresh heartbeat was issued because no queued heartbeat reached the
    /// server this pass.
    pub fresh_heartbeat: bool,
    /// Lock state after the last applied response.
    pub lock_state: Option<LockState>,
    /// Synced events garbage-collected.
    pub purged: usize,
}

impl SyncOutcome {
    pub fn is_complete(&self) -> bool {
        self.stalled.is_empty()
    }
}

/// Records heartbeats and tamper signals and drains them to the server.
pub struct SyncCoordinator {
    device_id: DeviceId,
    queue: Arc<OfflineEventQueue>,
    transport: Arc<dyn HeartbeatTransport>,
    decisions: Arc<dyn DecisionSink>,
    snapshots: Arc<dyn SnapshotSource>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    /// Held for the duration of a sync pass.
    pass: Mutex<()>,
}

impl SyncCoordinator {
    pub fn new(
        device_id: DeviceId,
        queue: Arc<OfflineEventQueue>,
        transport: Arc<dyn HeartbeatTransport>,
        decisions: Arc<dyn DecisionSink>,
        snapshots: Arc<dyn SnapshotSource>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            device_id,
            queue,
            transport,
            decisions,
            snapshots,
            clock,
            config,
            pass: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Capture a snapshot and queue a heartbeat for it.
    pub async fn record_heartbeat(&self) -> Result<OfflineEvent> {
        let now = self.clock.now();
        let snapshot = self.snapshots.capture(now).await?;
        let device_id = self.device_id.clone();

        let outcome = self
            .queue
            .record(EventKind::Heartbeat, now, move |sequence| {
                let request = HeartbeatRequest {
                    device_id,
                    sequence,
                    snapshot,
                    sent_at: now,
                };
                Ok(serde_json::to_string(&request)?)
            })
            .await?;
        Ok(outcome.event)
    }

    /// Queue a tamper signal for a detection result.
    pub async fn record_tamper_signal(&self, report: &ViolationReport) -> Result<OfflineEvent> {
        let now = self.clock.now();
        let device_id = self.device_id.clone();
        let violations = report.violations.clone();
        let lock_type_decision = report.lock_type_decision;
        let tamper_summary = report.tamper_summary();

        let outcome = self
            .queue
            .record(EventKind::TamperSignal, now, move |sequence| {
                let request = TamperSignalRequest {
                    device_id,
                    sequence,
                    violations,
                    lock_type_decision,
                    tamper_summary,
                    detected_at: now,
                };
                Ok(serde_json::to_string(&request)?)
            })
            .await?;
        info!(
            event_id = %outcome.event.id,
            sequence = outcome.event.sequence,
            "Tamper signal queued"
        );
        Ok(outcome.event)
    }

    /// Record a heartbeat, then drain everything pending.
    pub async fn heartbeat_now(&self) -> Result<SyncOutcome> {
        self.record_heartbeat().await?;
        self.sync_pass().await
    }

    /// Drain pending events oldest-first per kind.
    ///
    /// Unless a kind stalled or a queued heartbeat was delivered, a fresh
    /// heartbeat is recorded and sent so the live lock state is checked
    /// against the server every pass.
    #[instrument(skip(self))]
    pub async fn sync_pass(&self) -> Result<SyncOutcome> {
        let _pass = self.pass.lock().await;
        let mut outcome = SyncOutcome::default();
        let mut heartbeats_delivered = 0;

        for kind in DRAIN_ORDER {
            let pending = self.queue.pending(kind).await?;
            let delivered = self.drain(kind, pending, &mut outcome).await?;
            if kind == EventKind::Heartbeat {
                heartbeats_delivered = delivered;
            }
        }

        if outcome.is_complete() && heartbeats_delivered == 0 {
            debug!("No heartbeat delivered; issuing fresh heartbeat");
            let event = self.record_heartbeat().await?;
            outcome.fresh_heartbeat = true;
            self.drain(EventKind::Heartbeat, vec![event], &mut outcome).await?;
        }

        outcome.purged = self.queue.collect_garbage(self.clock.now()).await?;

        if outcome.is_complete() {
            debug!(
                delivered = outcome.delivered,
                rejected = outcome.rejected,
                exhausted = outcome.exhausted,
                "Sync pass complete"
            );
        } else {
            warn!(
                delivered = outcome.delivered,
                stalled = ?outcome.stalled,
                "Sync pass incomplete"
            );
        }
        Ok(outcome)
    }

    /// Drain one kind. Returns the number of events delivered.
    async fn drain(
        &self,
        kind: EventKind,
        events: Vec<OfflineEvent>,
        outcome: &mut SyncOutcome,
    ) -> Result<usize> {
        let mut delivered = 0;
        for event in events {
            let failure = match self.deliver(&event).await {
                Ok(directive) => {
                    if !self.apply(&event, directive, outcome).await {
                        outcome.stalled.push(kind);
                        break;
                    }
                    self.queue.mark_synced(&event.id, self.clock.now()).await?;
                    outcome.delivered += 1;
                    delivered += 1;
                    debug!(event_id = %event.id, sequence = event.sequence, "Event synced");
                    continue;
                }
                Err(e) => e,
            };

            if failure.is_rejection() {
                self.queue.reject(&event, self.clock.now()).await?;
                outcome.rejected += 1;
                continue;
            }
            if failure.is_unreachable() {
                warn!(
                    event_id = %event.id,
                    kind = %kind,
                    error = %failure,
                    "Event delivery failed; left pending"
                );
                outcome.stalled.push(kind);
                break;
            }

            if let SyncError::Protocol(e) = &failure {
                warn!(
                    event_id = %event.id,
                    error = %e,
                    "Discarding malformed server response; lock state unchanged"
                );
                outcome.discarded_responses += 1;
            } else {
                warn!(
                    event_id = %event.id,
                    kind = %kind,
                    error = %failure,
                    "Server did not accept event"
                );
            }
            match self.queue.record_failed_attempt(&event, self.clock.now()).await? {
                FailureDisposition::Retained { attempts } => {
                    debug!(event_id = %event.id, attempts, "Event left pending");
                    outcome.stalled.push(kind);
                    break;
                }
                FailureDisposition::Discarded(_) => outcome.exhausted += 1,
            }
        }
        Ok(delivered)
    }

    async fn deliver(&self, event: &OfflineEvent) -> Result<RemoteDirective> {
        let timeout = self.config.request_timeout();
        let body = tokio::time::timeout(timeout, self.transport.send(event.kind, &event.payload))
            .await
            .map_err(|_| SyncError::Timeout(timeout))??;
        Ok(HeartbeatResponse::parse(&body)?)
    }

    /// Apply a server response. Returns `false` if the response was not
    /// applied and the event must be replayed.
    async fn apply(
        &self,
        event: &OfflineEvent,
        directive: RemoteDirective,
        outcome: &mut SyncOutcome,
    ) -> bool {
        match self.decisions.submit(Trigger::Remote(directive)).await {
            Ok(decision) => {
                outcome.lock_state = Some(decision.state());
                true
            }
            Err(e @ (EngineError::State(_) | EngineError::Unavailable(_))) => {
                error!(
                    event_id = %event.id,
                    error = %e,
                    "Failed to apply server response; event left pending for replay"
                );
                false
            }
            // The decision was committed; only enforcement lagged behind.
            Err(e) => {
                error!(event_id = %event.id, error = %e, "Server response applied with errors");
                true
            }
        }
    }

    /// Sync on an interval and whenever connectivity is signalled, until
    /// shutdown. Failed passes retry with bounded exponential backoff.
    pub async fn run(self: Arc<Self>, connectivity: Arc<Notify>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.interval();
        let mut backoff = Backoff::new(self.config.backoff.clone());
        let mut delay = std::time::Duration::ZERO;
        info!(interval_secs = interval.as_secs(), "Sync loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = connectivity.notified() => {
                    debug!("Connectivity available; syncing now");
                    backoff.reset();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            delay = match self.sync_pass().await {
                Ok(outcome) if outcome.is_complete() => {
                    backoff.reset();
                    interval
                }
                Ok(_) => backoff.next_delay().min(interval),
                Err(e) => {
                    error!(error = %e, "Sync pass failed");
                    backoff.next_delay().min(interval)
                }
            };
        }

        info!("Sync loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::StaticSnapshotSource;
    use crate::transport::{ScriptedReply, ScriptedTransport};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use lockguard_engine::{
        LockDecisionEngine, ManualClock, PaymentScheduleEvaluator, RecordingEnforcement,
    };
    use lockguard_state::{AgentStore, InMemoryStore, QueueConfig, ScheduleStore};
    use lockguard_types::{
        DeviceClass, DeviceSnapshot, IdentityFields, ReasonCode, SecurityFlags, Severity,
        Telemetry, TrackedField, Violation,
    };

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).single().unwrap()
    }

    fn snapshot() -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: DeviceId::new("dev-42"),
            device_class: DeviceClass::Mobile,
            identity: IdentityFields {
                serial_number: Some("SN-42".into()),
                ..IdentityFields::default()
            },
            security: SecurityFlags::default(),
            telemetry: Telemetry::default(),
            captured_at: start(),
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        queue: Arc<OfflineEventQueue>,
        transport: Arc<ScriptedTransport>,
        engine: Arc<LockDecisionEngine>,
        clock: Arc<ManualClock>,
        coordinator: SyncCoordinator,
    }

    async fn harness(config: SyncConfig) -> Harness {
        harness_with_queue(config, QueueConfig::default()).await
    }

    async fn harness_with_queue(config: SyncConfig, queue_config: QueueConfig) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let agent_store: Arc<dyn AgentStore> = store.clone();
        let clock = Arc::new(ManualClock::new(start()));
        let engine = Arc::new(LockDecisionEngine::new(
            agent_store.clone(),
            Arc::new(RecordingEnforcement::new()),
            clock.clone(),
            PaymentScheduleEvaluator::default(),
        ));
        engine.recover_on_boot().await.unwrap();

        let queue = Arc::new(OfflineEventQueue::new(agent_store, queue_config));
        let transport = Arc::new(ScriptedTransport::new());
        let coordinator = SyncCoordinator::new(
            DeviceId::new("dev-42"),
            queue.clone(),
            transport.clone(),
            engine.clone(),
            Arc::new(StaticSnapshotSource::new(snapshot())),
            clock.clone(),
            config,
        );
        Harness {
            store,
            queue,
            transport,
            engine,
            clock,
            coordinator,
        }
    }

    fn sequences(sent: &[(EventKind, String)]) -> Vec<u64> {
        sent.iter()
            .map(|(_, payload)| {
                let value: serde_json::Value = serde_json::from_str(payload).unwrap();
                value["sequence"].as_u64().unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_heartbeat_recorded_before_send() {
        let h = harness(SyncConfig::default()).await;
        h.transport.set_fallback(ScriptedReply::Unreachable);

        let outcome = h.coordinator.heartbeat_now().await.unwrap();
        assert_eq!(outcome.delivered, 0);
        assert_eq!(outcome.stalled, vec![EventKind::Heartbeat]);

        let pending = h.queue.pending(EventKind::Heartbeat).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(h.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_replay_preserves_order_and_stops_on_failure() {
        let h = harness(SyncConfig::default()).await;
        for _ in 0..3 {
            h.coordinator.record_heartbeat().await.unwrap();
            h.clock.advance(Duration::minutes(5));
        }

        h.transport.push(ScriptedReply::Body(String::new()));
        h.transport.push(ScriptedReply::Unreachable);
        let outcome = h.coordinator.sync_pass().await.unwrap();
        assert_eq!(outcome.delivered, 1);
        assert!(!outcome.is_complete());
        assert!(!outcome.fresh_heartbeat);
        assert_eq!(sequences(&h.transport.sent()), vec![1, 2]);

        let outcome = h.coordinator.sync_pass().await.unwrap();
        assert_eq!(outcome.delivered, 2);
        assert_eq!(sequences(&h.transport.sent()), vec![1, 2, 2, 3]);
        assert!(h.queue.pending(EventKind::Heartbeat).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_queue_issues_fresh_heartbeat() {
        let h = harness(SyncConfig::default()).await;
        let outcome = h.coordinator.sync_pass().await.unwrap();
        assert!(outcome.fresh_heartbeat);
        assert_eq!(outcome.delivered, 1);
        assert_eq!(h.transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_response_applied_through_engine() {
        let h = harness(SyncConfig::default()).await;
        h.transport.push(ScriptedReply::Body(
            r#"{"isLocked":true,"lockReason":"Payment overdue","nextPaymentDateTime":"2026-05-30T10:00:00+03:00","unlockSecret":"880011"}"#
                .into(),
        ));

        let outcome = h.coordinator.heartbeat_now().await.unwrap();
        assert_eq!(outcome.lock_state, Some(LockState::HardLocked));
        let record = h.engine.current_record().await.unwrap();
        assert_eq!(record.reason, ReasonCode::PaymentOverdue);

        let schedule = h.store.load_schedule().await.unwrap().unwrap();
        assert_eq!(
            schedule.next_payment_at,
            Utc.with_ymd_and_hms(2026, 5, 30, 7, 0, 0).single().unwrap()
        );
        assert!(schedule.unlock_secret_hash.is_some());
    }

    #[tokio::test]
    async fn test_malformed_response_keeps_event_and_state() {
        let h = harness(SyncConfig::default()).await;
        h.transport.push(ScriptedReply::Body("{not json".into()));

        let outcome = h.coordinator.heartbeat_now().await.unwrap();
        assert_eq!(outcome.discarded_responses, 1);
        assert_eq!(h.queue.pending(EventKind::Heartbeat).await.unwrap().len(), 1);
        assert_eq!(h.engine.current_state().await, LockState::Unlocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_event_pending() {
        let config = SyncConfig {
            request_timeout_secs: 2,
            ..SyncConfig::default()
        };
        let h = harness(config).await;
        h.transport.push(ScriptedReply::Hang);

        let outcome = h.coordinator.heartbeat_now().await.unwrap();
        assert_eq!(outcome.delivered, 0);
        assert_eq!(outcome.stalled, vec![EventKind::Heartbeat]);
        assert_eq!(h.queue.pending(EventKind::Heartbeat).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tamper_signals_drain_first() {
        let h = harness(SyncConfig::default()).await;
        h.coordinator.record_heartbeat().await.unwrap();
        let report = ViolationReport::from_violations(
            vec![Violation {
                field: TrackedField::IsDeviceRooted,
                severity: Severity::High,
                reason: TrackedField::IsDeviceRooted.mismatch_reason().into(),
                detected_at: start(),
            }],
            Vec::new(),
        );
        h.coordinator.record_tamper_signal(&report).await.unwrap();

        h.coordinator.sync_pass().await.unwrap();
        let kinds: Vec<EventKind> = h.transport.sent().iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, vec![EventKind::TamperSignal, EventKind::Heartbeat]);

        let (_, payload) = &h.transport.sent()[0];
        let request: TamperSignalRequest = serde_json::from_str(payload).unwrap();
        assert_eq!(
            request.tamper_summary.as_deref(),
            Some("Device security compromised: is_device_rooted")
        );
    }

    #[tokio::test]
    async fn test_deactivation_applied_on_receipt() {
        let h = harness(SyncConfig::default()).await;
        h.transport.push(ScriptedReply::Body(
            r#"{"deactivationRequested":true,"deactivationReason":"loan_completed"}"#.into(),
        ));

        let outcome = h.coordinator.heartbeat_now().await.unwrap();
        assert_eq!(outcome.lock_state, Some(LockState::Deactivated));
        assert!(h.engine.current_record().await.unwrap().permanent);
    }

    #[tokio::test]
    async fn test_rejected_heartbeat_does_not_block_sync() {
        let h = harness(SyncConfig::default()).await;
        h.coordinator.record_heartbeat().await.unwrap();
        h.transport.push(ScriptedReply::Status(400));
        h.transport
            .set_fallback(ScriptedReply::Body(r#"{"isLocked":true}"#.into()));

        let outcome = h.coordinator.sync_pass().await.unwrap();
        assert_eq!(outcome.rejected, 1);
        assert!(outcome.is_complete());
        assert!(outcome.fresh_heartbeat);
        assert_eq!(sequences(&h.transport.sent()), vec![1, 2]);
        assert_eq!(h.engine.current_state().await, LockState::HardLocked);

        let stats = h.queue.stats().await.unwrap();
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.pending_heartbeats, 0);
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_retry_budget() {
        let queue_config = QueueConfig {
            max_delivery_attempts: 3,
            ..QueueConfig::default()
        };
        let h = harness_with_queue(SyncConfig::default(), queue_config).await;
        h.coordinator.record_heartbeat().await.unwrap();
        h.transport.push(ScriptedReply::Unreachable);
        h.transport.push(ScriptedReply::Unreachable);
        h.transport.set_fallback(ScriptedReply::Status(503));

        // Unreachable passes cost nothing; three 503s spend the budget.
        for _ in 0..4 {
            let outcome = h.coordinator.sync_pass().await.unwrap();
            assert_eq!(outcome.exhausted, 0);
            assert!(!outcome.is_complete());
        }
        let outcome = h.coordinator.sync_pass().await.unwrap();
        assert_eq!(outcome.exhausted, 1);
        assert!(outcome.fresh_heartbeat);

        assert_eq!(sequences(&h.transport.sent()), vec![1, 1, 1, 1, 1, 2]);
        let stats = h.queue.stats().await.unwrap();
        assert_eq!(stats.exhausted, 1);
        assert_eq!(stats.pending_heartbeats, 1);
    }

    #[tokio::test]
    async fn test_unapplied_response_is_replayed() {
        let h = harness(SyncConfig::default()).await;
        let lock = r#"{"isLocked":true,"lockReason":"Payment overdue"}"#;
        h.transport.push(ScriptedReply::Body(lock.into()));
        h.transport.push(ScriptedReply::Body(lock.into()));

        h.store.set_unreadable(true);
        let outcome = h.coordinator.heartbeat_now().await.unwrap();
        assert_eq!(outcome.delivered, 0);
        assert_eq!(outcome.stalled, vec![EventKind::Heartbeat]);
        assert_eq!(h.queue.pending(EventKind::Heartbeat).await.unwrap().len(), 1);

        h.store.set_unreadable(false);
        let outcome = h.coordinator.sync_pass().await.unwrap();
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.lock_state, Some(LockState::HardLocked));
        assert_eq!(sequences(&h.transport.sent()), vec![1, 1]);
        assert!(h.queue.pending(EventKind::Heartbeat).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_syncs_on_connectivity_and_stops() {
        let h = harness(SyncConfig {
            interval_secs: 3_600,
            ..SyncConfig::default()
        })
        .await;
        let coordinator = Arc::new(h.coordinator);
        let connectivity = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(coordinator.clone().run(connectivity.clone(), shutdown_rx));

        // First pass runs immediately.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(h.transport.sent().len(), 1);

        connectivity.notify_one();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(h.transport.sent().len(), 2);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
