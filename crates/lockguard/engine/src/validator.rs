//! Lock history consistency checks and repairs.
//!
//! Runs at boot and periodically, independent of the decision path. Every
//! repair is committed through the decision engine as a new record, so the
//! history stays append-only, and no repair ever produces a weaker lock
//! than the one it replaces.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use lockguard_state::AgentStore;
use lockguard_types::{LockRecord, LockRecordId, LockState, ReasonCode};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::enforcement::EnforcementCollaborator;
use crate::engine::{LockDecisionEngine, Target};

/// An invariant violation found by the validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum ValidationIssue {
    StoreUnreadable { detail: String },
    NoLockHistory,
    MissingCurrentRecord,
    MultipleUnresolved { count: usize },
    DeactivatedNotPermanent,
    PermanentSoftLock,
    InconsistentReason { state: LockState, reason: ReasonCode },
    FutureTimestamp { created_at: DateTime<Utc> },
    EnforcementInactive { state: LockState },
    EnforcementWithoutLock,
    EnforcementUnknown { detail: String },
}

/// Repair applied for an issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RepairAction {
    FailClosed,
    Provision,
    CommitCorrected { target: Target },
    ReassertEnforcement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFinding {
    pub issue: ValidationIssue,
    pub repair: Option<RepairAction>,
    pub repaired: bool,
}

/// Structured result of one validation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub checked_at: DateTime<Utc>,
    /// Effective lock state after repairs.
    pub state: LockState,
    pub findings: Vec<ValidationFinding>,
}

impl ValidationReport {
    pub fn is_consistent(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn all_repaired(&self) -> bool {
        self.findings.iter().all(|f| f.repaired)
    }

    pub fn has_issue(&self, predicate: impl Fn(&ValidationIssue) -> bool) -> bool {
        self.findings.iter().any(|f| predicate(&f.issue))
    }
}

/// Checks lock history invariants and enforcement status.
pub struct StateValidator {
    engine: Arc<LockDecisionEngine>,
    store: Arc<dyn AgentStore>,
    enforcement: Arc<dyn EnforcementCollaborator>,
}

impl StateValidator {
    pub fn new(
        engine: Arc<LockDecisionEngine>,
        store: Arc<dyn AgentStore>,
        enforcement: Arc<dyn EnforcementCollaborator>,
    ) -> Self {
        Self {
            engine,
            store,
            enforcement,
        }
    }

    /// Check every invariant and apply narrowly scoped repairs.
    #[instrument(skip(self))]
    pub async fn validate_and_repair(&self) -> ValidationReport {
        let now = self.engine.clock().now();
        let mut findings = Vec::new();

        self.check_history(now, &mut findings).await;
        self.check_enforcement(&mut findings).await;

        let report = ValidationReport {
            checked_at: now,
            state: self.engine.current_state().await,
            findings,
        };
        if report.is_consistent() {
            info!(state = %report.state, "Lock state validated");
        } else {
            warn!(
                state = %report.state,
                issues = report.findings.len(),
                all_repaired = report.all_repaired(),
                "Lock state validation found issues"
            );
        }
        report
    }

    async fn check_history(&self, now: DateTime<Utc>, findings: &mut Vec<ValidationFinding>) {
        let unresolved = match self.store.unresolved_records().await {
            Ok(records) => records,
            Err(e) => return self.fail_closed(e.to_string(), findings).await,
        };

        if unresolved.is_empty() {
            return self.restore_current(findings).await;
        }

        let observed: Vec<LockRecordId> = unresolved.iter().map(|r| r.id).collect();
        let mut issues = Vec::new();

        let base = if unresolved.len() > 1 {
            issues.push(ValidationIssue::MultipleUnresolved {
                count: unresolved.len(),
            });
            strictest(&unresolved)
        } else {
            &unresolved[0]
        };

        let mut target = Target::from_record(base);
        if target.lock_state == LockState::Deactivated && !target.permanent {
            issues.push(ValidationIssue::DeactivatedNotPermanent);
            target.permanent = true;
        }
        if target.permanent && target.lock_state == LockState::SoftLocked {
            issues.push(ValidationIssue::PermanentSoftLock);
            target.lock_state = LockState::HardLocked;
            target.reason = ReasonCode::IntegrityRepair;
        }
        if !target.reason.is_consistent_with(target.lock_state) {
            issues.push(ValidationIssue::InconsistentReason {
                state: target.lock_state,
                reason: target.reason,
            });
            target.reason = ReasonCode::canonical_for(target.lock_state);
        }
        if base.created_at > now {
            issues.push(ValidationIssue::FutureTimestamp {
                created_at: base.created_at,
            });
        }

        if issues.is_empty() {
            return;
        }

        let repaired = match self.engine.commit_repair(&observed, target.clone()).await {
            Ok(committed) => committed,
            Err(e) => {
                warn!(error = %e, "Lock history repair failed");
                false
            }
        };
        for issue in issues {
            warn!(
                issue = ?issue,
                target_state = %target.lock_state,
                target_reason = %target.reason,
                repaired,
                "Lock history repair"
            );
            findings.push(ValidationFinding {
                issue,
                repair: Some(RepairAction::CommitCorrected {
                    target: target.clone(),
                }),
                repaired,
            });
        }
    }

    /// No current record: re-open the last state, or provision if the
    /// history is empty.
    async fn restore_current(&self, findings: &mut Vec<ValidationFinding>) {
        let last = match self.store.history(1).await {
            Ok(history) => history.into_iter().next(),
            Err(e) => return self.fail_closed(e.to_string(), findings).await,
        };

        let finding = match last {
            Some(record) => {
                let target = Target::from_record(&record);
                let repaired = self
                    .engine
                    .commit_repair(&[], target.clone())
                    .await
                    .unwrap_or(false);
                warn!(
                    state = %record.lock_state,
                    repaired,
                    "Lock history repair: re-opened last state"
                );
                ValidationFinding {
                    issue: ValidationIssue::MissingCurrentRecord,
                    repair: Some(RepairAction::CommitCorrected { target }),
                    repaired,
                }
            }
            None => {
                let repaired = self.engine.recover_on_boot().await.is_ok();
                warn!(repaired, "Lock history repair: provisioned empty history");
                ValidationFinding {
                    issue: ValidationIssue::NoLockHistory,
                    repair: Some(RepairAction::Provision),
                    repaired,
                }
            }
        };
        findings.push(finding);
    }

    async fn fail_closed(&self, detail: String, findings: &mut Vec<ValidationFinding>) {
        let repaired = self.engine.enter_fail_closed().await.is_ok();
        warn!(detail = %detail, repaired, "Lock history repair: failing closed");
        findings.push(ValidationFinding {
            issue: ValidationIssue::StoreUnreadable { detail },
            repair: Some(RepairAction::FailClosed),
            repaired,
        });
    }

    async fn check_enforcement(&self, findings: &mut Vec<ValidationFinding>) {
        let state = self.engine.current_state().await;

        let active = match self.enforcement.query_enforcement_active().await {
            Ok(active) => active,
            Err(e) => {
                warn!(error = %e, "Enforcement status unavailable");
                findings.push(ValidationFinding {
                    issue: ValidationIssue::EnforcementUnknown {
                        detail: e.to_string(),
                    },
                    repair: None,
                    repaired: false,
                });
                return;
            }
        };

        if state.requires_enforcement() && !active {
            let reasserted = self.engine.reassert_enforcement().await.is_ok();
            let repaired = reasserted
                && self
                    .enforcement
                    .query_enforcement_active()
                    .await
                    .unwrap_or(false);
            warn!(state = %state, repaired, "Enforcement repair: re-asserted");
            findings.push(ValidationFinding {
                issue: ValidationIssue::EnforcementInactive { state },
                repair: Some(RepairAction::ReassertEnforcement),
                repaired,
            });
        } else if !state.is_restrictive() && active {
            // Releasing enforcement is left to the next decision.
            warn!("Enforcement active while unlocked");
            findings.push(ValidationFinding {
                issue: ValidationIssue::EnforcementWithoutLock,
                repair: None,
                repaired: false,
            });
        }
    }
}

/// Strictest record; ties go to the newest. `records` is newest first.
fn strictest(records: &[LockRecord]) -> &LockRecord {
    let mut best = &records[0];
    for record in &records[1..] {
        if record.lock_state > best.lock_state {
            best = record;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::enforcement::RecordingEnforcement;
    use crate::schedule::PaymentScheduleEvaluator;
    use chrono::{Duration, TimeZone};
    use lockguard_state::{InMemoryStore, LockStateStore};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 2, 14, 30, 0).single().unwrap()
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        enforcement: Arc<RecordingEnforcement>,
        engine: Arc<LockDecisionEngine>,
        validator: StateValidator,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let enforcement = Arc::new(RecordingEnforcement::new());
        let clock = Arc::new(ManualClock::new(now()));
        let engine = Arc::new(LockDecisionEngine::new(
            store.clone(),
            enforcement.clone(),
            clock,
            PaymentScheduleEvaluator::default(),
        ));
        let validator = StateValidator::new(engine.clone(), store.clone(), enforcement.clone());
        Harness {
            store,
            enforcement,
            engine,
            validator,
        }
    }

    fn record(state: LockState, reason: ReasonCode, age_mins: i64) -> LockRecord {
        LockRecord::new(state, reason, now() - Duration::minutes(age_mins))
    }

    #[tokio::test]
    async fn test_consistent_state_reports_nothing() {
        let h = harness();
        h.engine.recover_on_boot().await.unwrap();

        let report = h.validator.validate_and_repair().await;
        assert!(report.is_consistent(), "{:?}", report.findings);
        assert_eq!(report.state, LockState::Unlocked);
    }

    #[tokio::test]
    async fn test_multiple_unresolved_keeps_strictest() {
        let h = harness();
        h.store
            .insert_raw_record(record(LockState::HardLocked, ReasonCode::Tamper, 20))
            .await;
        h.store
            .insert_raw_record(record(LockState::Unlocked, ReasonCode::Cleared, 10))
            .await;

        let report = h.validator.validate_and_repair().await;
        assert!(report.has_issue(|i| matches!(i, ValidationIssue::MultipleUnresolved { count: 2 })));
        assert!(report.all_repaired(), "{:?}", report.findings);

        let unresolved = h.store.unresolved_records().await.unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].lock_state, LockState::HardLocked);
        assert_eq!(unresolved[0].reason, ReasonCode::Tamper);
        assert_eq!(report.state, LockState::HardLocked);
    }

    #[tokio::test]
    async fn test_permanent_soft_lock_escalates() {
        let h = harness();
        h.store
            .insert_raw_record(
                record(LockState::SoftLocked, ReasonCode::PaymentReminder, 5).with_permanent(true),
            )
            .await;

        let report = h.validator.validate_and_repair().await;
        assert!(report.has_issue(|i| *i == ValidationIssue::PermanentSoftLock));

        let current = h.store.current_record().await.unwrap().unwrap();
        assert_eq!(current.lock_state, LockState::HardLocked);
        assert_eq!(current.reason, ReasonCode::IntegrityRepair);
        assert!(current.permanent);

        // The next decision keeps the repaired record as is.
        h.engine.reevaluate().await.unwrap();
        assert_eq!(h.store.current_record().await.unwrap().unwrap(), current);
    }

    #[tokio::test]
    async fn test_deactivated_record_made_permanent() {
        let h = harness();
        let mut deactivated = record(LockState::Deactivated, ReasonCode::Deactivated, 5);
        deactivated.permanent = false;
        h.store.insert_raw_record(deactivated).await;

        let report = h.validator.validate_and_repair().await;
        assert!(report.has_issue(|i| *i == ValidationIssue::DeactivatedNotPermanent));

        let current = h.store.current_record().await.unwrap().unwrap();
        assert_eq!(current.lock_state, LockState::Deactivated);
        assert!(current.permanent);
    }

    #[tokio::test]
    async fn test_inconsistent_reason_corrected_without_downgrade() {
        let h = harness();
        h.store
            .insert_raw_record(record(LockState::HardLocked, ReasonCode::Cleared, 5))
            .await;

        let report = h.validator.validate_and_repair().await;
        assert!(report.has_issue(|i| matches!(i, ValidationIssue::InconsistentReason { .. })));

        let current = h.store.current_record().await.unwrap().unwrap();
        assert_eq!(current.lock_state, LockState::HardLocked);
        assert_eq!(current.reason, ReasonCode::IntegrityRepair);

        // The repair holds on the next decision.
        h.engine.reevaluate().await.unwrap();
        assert_eq!(h.engine.current_state().await, LockState::HardLocked);
    }

    #[tokio::test]
    async fn test_future_timestamp_recommitted() {
        let h = harness();
        h.store
            .insert_raw_record(record(LockState::SoftLocked, ReasonCode::ConfigDrift, -90))
            .await;

        let report = h.validator.validate_and_repair().await;
        assert!(report.has_issue(|i| matches!(i, ValidationIssue::FutureTimestamp { .. })));

        let current = h.store.current_record().await.unwrap().unwrap();
        assert!(current.created_at <= now());
        assert_eq!(current.lock_state, LockState::SoftLocked);
    }

    #[tokio::test]
    async fn test_missing_current_record_reopened() {
        let h = harness();
        let mut resolved = record(LockState::HardLocked, ReasonCode::RemoteLock, 30);
        resolved.resolved_at = Some(now() - Duration::minutes(1));
        h.store.insert_raw_record(resolved).await;

        let report = h.validator.validate_and_repair().await;
        assert!(report.has_issue(|i| *i == ValidationIssue::MissingCurrentRecord));
        assert!(report.all_repaired());

        let current = h.store.current_record().await.unwrap().unwrap();
        assert_eq!(current.lock_state, LockState::HardLocked);
        assert_eq!(current.reason, ReasonCode::RemoteLock);
    }

    #[tokio::test]
    async fn test_empty_history_provisioned() {
        let h = harness();
        let report = h.validator.validate_and_repair().await;
        assert!(report.has_issue(|i| *i == ValidationIssue::NoLockHistory));
        assert_eq!(h.store.record_count().await, 1);
    }

    #[tokio::test]
    async fn test_inactive_enforcement_reasserted() {
        let h = harness();
        h.engine.recover_on_boot().await.unwrap();
        let mut lock = lockguard_types::RemoteDirective::empty();
        lock.lock = Some(lockguard_types::LockCommand::Lock {
            reason: ReasonCode::RemoteLock,
        });
        h.engine.apply_server_response(lock).await.unwrap();

        h.enforcement.set_active(false);
        let report = h.validator.validate_and_repair().await;
        assert!(report.has_issue(|i| matches!(
            i,
            ValidationIssue::EnforcementInactive {
                state: LockState::HardLocked
            }
        )));
        assert!(report.all_repaired());
        assert!(h.enforcement.query_enforcement_active().await.unwrap());
    }

    #[tokio::test]
    async fn test_enforcement_without_lock_is_not_released() {
        let h = harness();
        h.engine.recover_on_boot().await.unwrap();
        h.enforcement.set_active(true);

        let report = h.validator.validate_and_repair().await;
        assert!(report.has_issue(|i| *i == ValidationIssue::EnforcementWithoutLock));
        assert!(!report.all_repaired());
        assert!(h.enforcement.query_enforcement_active().await.unwrap());
    }

    #[tokio::test]
    async fn test_unreadable_store_fails_closed() {
        let h = harness();
        h.engine.recover_on_boot().await.unwrap();
        h.store.set_unreadable(true);

        let report = h.validator.validate_and_repair().await;
        assert!(report.has_issue(|i| matches!(i, ValidationIssue::StoreUnreadable { .. })));
        assert_eq!(report.state, LockState::HardLocked);
        assert!(h.enforcement.query_enforcement_active().await.unwrap());
    }
}
