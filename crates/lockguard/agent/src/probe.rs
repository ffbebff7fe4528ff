//! Periodic tamper detection.
//!
//! Each probe captures a snapshot, compares it with the registration
//! baseline and hands the report to the decision engine. A new set of
//! lock-worthy violations is queued as a tamper signal; a hard violation
//! also wakes the sync loop so the signal leaves the device right away.

use std::sync::Arc;

use lockguard_engine::{Clock, Decision, DecisionSink, DetectorConfig, Trigger, ViolationDetector};
use lockguard_state::AgentStore;
use lockguard_sync::{SnapshotSource, SyncCoordinator};
use lockguard_types::{DeviceSnapshot, LockTypeDecision, TrackedField, ViolationReport};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, instrument};

use crate::error::Result;

/// Result of one probe.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub report: ViolationReport,
    pub decision: Decision,
    /// A tamper signal was queued for this report.
    pub signalled: bool,
}

#[derive(Default)]
struct ProbeMemory {
    previous: Option<DeviceSnapshot>,
    signalled: Option<Vec<TrackedField>>,
}

pub struct DetectionProbe {
    detector: ViolationDetector,
    store: Arc<dyn AgentStore>,
    snapshots: Arc<dyn SnapshotSource>,
    decisions: Arc<dyn DecisionSink>,
    coordinator: Arc<SyncCoordinator>,
    connectivity: Arc<Notify>,
    clock: Arc<dyn Clock>,
    memory: Mutex<ProbeMemory>,
}

impl DetectionProbe {
    pub fn new(
        config: DetectorConfig,
        store: Arc<dyn AgentStore>,
        snapshots: Arc<dyn SnapshotSource>,
        decisions: Arc<dyn DecisionSink>,
        coordinator: Arc<SyncCoordinator>,
        connectivity: Arc<Notify>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            detector: ViolationDetector::new(config),
            store,
            snapshots,
            decisions,
            coordinator,
            connectivity,
            clock,
            memory: Mutex::new(ProbeMemory::default()),
        }
    }

    /// Run one detection cycle.
    #[instrument(skip_all)]
    pub async fn probe(&self) -> Result<ProbeOutcome> {
        let mut memory = self.memory.lock().await;
        let now = self.clock.now();
        let snapshot = self.snapshots.capture(now).await?;
        let baseline = self.store.load_baseline().await?;
        let report = self.detector.detect(baseline.as_ref(), &snapshot, now);

        if let Some(previous) = memory.previous.as_ref() {
            let drift = self.detector.detect_against_previous(previous, &snapshot, now);
            if !drift.is_clean() {
                let fields: Vec<&str> = drift.violations.iter().map(|v| v.field.as_str()).collect();
                info!(fields = ?fields, "Device state changed since last probe");
            }
        }
        memory.previous = Some(snapshot);

        let mut signalled = false;
        if report.lock_type_decision == LockTypeDecision::NoLock {
            memory.signalled = None;
        } else {
            let fields: Vec<TrackedField> = report.violations.iter().map(|v| v.field).collect();
            if memory.signalled.as_ref() != Some(&fields) {
                self.coordinator.record_tamper_signal(&report).await?;
                memory.signalled = Some(fields);
                signalled = true;
            } else {
                debug!("Violations unchanged since last signal");
            }
        }

        let decision = self
            .decisions
            .submit(Trigger::Violations(report.clone()))
            .await?;

        if signalled && report.lock_type_decision == LockTypeDecision::HardLock {
            self.connectivity.notify_one();
        }

        Ok(ProbeOutcome {
            report,
            decision,
            signalled,
        })
    }
}
