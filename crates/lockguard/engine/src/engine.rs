//! Lock decision engine.
//!
//! Single writer to the lock history. Every trigger (detection pass, timer
//! tick, server response, password unlock, validator repair) takes the same
//! async mutex around "resolve previous + insert new + apply enforcement",
//! so concurrent triggers serialize into one consistent sequence of
//! transitions.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lockguard_state::AgentStore;
use lockguard_types::{
    LockCommand, LockRecord, LockRecordId, LockState, LockTypeDecision, PaymentSchedule,
    ReasonCode, RemoteDirective, ViolationReport,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::enforcement::{EnforcementAck, EnforcementCapabilities, EnforcementCollaborator};
use crate::error::{EngineError, Result};
use crate::schedule::{PaymentScheduleEvaluator, ScheduleEvaluation, ScheduleIntent};
use crate::secret::{hash_secret, verify_secret};

/// Server clock differences above this are logged.
const CLOCK_SKEW_WARN_SECS: i64 = 300;

/// Input to a decision.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Result of a detection pass. Replaces the previously latched result.
    Violations(ViolationReport),
    /// Local timer; re-evaluates the schedule against the clock.
    ScheduleTick,
    /// Validated server response.
    Remote(RemoteDirective),
}

/// Outcome of a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// A new lock record was committed and enforcement applied.
    Committed {
        previous: Option<LockState>,
        record: LockRecord,
    },
    /// The target matched the current record.
    Unchanged { state: LockState },
}

impl Decision {
    pub fn state(&self) -> LockState {
        match self {
            Decision::Committed { record, .. } => record.lock_state,
            Decision::Unchanged { state } => *state,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Decision::Committed { .. })
    }
}

/// Result of a password unlock attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockOutcome {
    Unlocked(LockRecord),
    /// Nothing to unlock; the device is not hard locked.
    NotLocked { state: LockState },
    /// No unlock secret has been issued for the current schedule.
    NoSecret,
    /// The password did not match.
    Rejected,
}

/// State reached by boot recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootOutcome {
    pub state: LockState,
    /// The lock history was unreadable and the device was locked in memory.
    pub fail_closed: bool,
    /// No lock history existed and an initial record was created.
    pub provisioned: bool,
}

/// The lock record a set of signals resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub lock_state: LockState,
    pub reason: ReasonCode,
    pub tamper_type: Option<String>,
    pub permanent: bool,
}

impl Target {
    fn new(lock_state: LockState, reason: ReasonCode) -> Self {
        Self {
            lock_state,
            reason,
            tamper_type: None,
            permanent: lock_state == LockState::Deactivated,
        }
    }

    fn storage_corruption() -> Self {
        Self::new(LockState::HardLocked, ReasonCode::StorageCorruption)
    }

    /// Target that reproduces an existing record.
    pub fn from_record(record: &LockRecord) -> Self {
        Self {
            lock_state: record.lock_state,
            reason: record.reason,
            tamper_type: record.tamper_type.clone(),
            permanent: record.permanent,
        }
    }

    fn to_record(&self, created_at: DateTime<Utc>) -> LockRecord {
        LockRecord::new(self.lock_state, self.reason, created_at)
            .with_tamper_type(self.tamper_type.clone())
            .with_permanent(self.permanent)
    }
}

/// Signals feeding one decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signals {
    pub deactivation: bool,
    pub violation: LockTypeDecision,
    pub tamper_summary: Option<String>,
    pub schedule: ScheduleIntent,
    pub remote: Option<LockCommand>,
    /// Permanent lock carried over from the lock history.
    pub held: Option<Target>,
}

impl Default for Signals {
    fn default() -> Self {
        Self {
            deactivation: false,
            violation: LockTypeDecision::NoLock,
            tamper_summary: None,
            schedule: ScheduleIntent::Unlocked,
            remote: None,
            held: None,
        }
    }
}

/// Resolve signals to a target by precedence, highest first:
///
/// 1. deactivation
/// 2. hard violation
/// 3. overdue payment
/// 4. remote lock (a remote unlock only picks the unlocked reason)
/// 5. medium violation or payment reminder
/// 6. unlocked
///
/// A held permanent lock replaces any non-deactivation target that is not
/// stricter than it, so its `permanent` flag survives later decisions.
pub fn resolve_target(signals: &Signals) -> Target {
    let target = resolve_unheld(signals);
    match &signals.held {
        Some(held)
            if target.lock_state != LockState::Deactivated
                && held.lock_state >= target.lock_state =>
        {
            held.clone()
        }
        _ => target,
    }
}

fn resolve_unheld(signals: &Signals) -> Target {
    if signals.deactivation {
        return Target::new(LockState::Deactivated, ReasonCode::Deactivated);
    }

    if signals.violation == LockTypeDecision::HardLock {
        let mut target = Target::new(LockState::HardLocked, ReasonCode::Tamper);
        target.tamper_type = signals.tamper_summary.clone();
        return target;
    }

    if signals.schedule == ScheduleIntent::HardLockPayment {
        return Target::new(LockState::HardLocked, ReasonCode::PaymentOverdue);
    }

    if let Some(LockCommand::Lock { reason }) = signals.remote {
        let reason = if reason.is_consistent_with(LockState::HardLocked) {
            reason
        } else {
            ReasonCode::RemoteLock
        };
        return Target::new(LockState::HardLocked, reason);
    }

    if signals.violation == LockTypeDecision::SoftLock {
        return Target::new(LockState::SoftLocked, ReasonCode::ConfigDrift);
    }
    if signals.schedule == ScheduleIntent::SoftLockReminder {
        return Target::new(LockState::SoftLocked, ReasonCode::PaymentReminder);
    }

    match signals.remote {
        Some(LockCommand::Unlock) => Target::new(LockState::Unlocked, ReasonCode::RemoteUnlock),
        _ => Target::new(LockState::Unlocked, ReasonCode::Cleared),
    }
}

/// Whether committing `target` would change anything observable.
///
/// Moving between unlocked reasons is not a change.
fn materially_differs(current: &LockRecord, target: &Target) -> bool {
    if current.lock_state == LockState::Unlocked && target.lock_state == LockState::Unlocked {
        return false;
    }
    current.differs_from(
        target.lock_state,
        target.reason,
        target.tamper_type.as_deref(),
        target.permanent,
    )
}

/// Signals that persist between decisions.
#[derive(Debug, Default)]
struct Latched {
    deactivation: bool,
    violation: Option<(LockTypeDecision, Option<String>)>,
    remote: Option<LockCommand>,
    /// Permanent non-deactivation lock. Released by a password unlock or a
    /// remote unlock.
    held: Option<Target>,
}

impl Latched {
    fn signals(&self, schedule: ScheduleIntent) -> Signals {
        let (violation, tamper_summary) = self
            .violation
            .clone()
            .unwrap_or((LockTypeDecision::NoLock, None));
        Signals {
            deactivation: self.deactivation,
            violation,
            tamper_summary,
            schedule,
            remote: self.remote,
            held: self.held.clone(),
        }
    }

    fn release(&mut self) {
        self.violation = None;
        self.remote = None;
        self.held = None;
    }

    /// Raise latches so that `record` is reproduced by the next decision.
    ///
    /// Used after boot recovery and repairs, where the signals that led to
    /// the record are no longer in memory.
    fn absorb(&mut self, record: &LockRecord) {
        if record.permanent && record.lock_state != LockState::Deactivated {
            self.held = Some(Target::from_record(record));
        }
        match record.reason {
            ReasonCode::Deactivated => self.deactivation = true,
            ReasonCode::Tamper => {
                self.violation = Some((LockTypeDecision::HardLock, record.tamper_type.clone()));
            }
            ReasonCode::ConfigDrift => {
                let strictest = match &self.violation {
                    Some((LockTypeDecision::HardLock, _)) => return,
                    _ => LockTypeDecision::SoftLock,
                };
                self.violation = Some((strictest, None));
            }
            reason if record.lock_state == LockState::HardLocked => {
                if !matches!(self.remote, Some(LockCommand::Lock { .. })) {
                    self.remote = Some(LockCommand::Lock { reason });
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Default)]
struct EngineState {
    current: Option<LockRecord>,
    /// The lock history could not be read; behave as hard locked until an
    /// authoritative server response or password unlock arrives.
    fail_closed: bool,
    latched: Latched,
}

impl EngineState {
    fn effective_state(&self) -> LockState {
        let recorded = self
            .current
            .as_ref()
            .map_or(LockState::Unlocked, |r| r.lock_state);
        if self.fail_closed {
            recorded.max(LockState::HardLocked)
        } else {
            recorded
        }
    }
}

/// Merges violation, schedule and remote signals into one lock state.
pub struct LockDecisionEngine {
    store: Arc<dyn AgentStore>,
    enforcement: Arc<dyn EnforcementCollaborator>,
    clock: Arc<dyn Clock>,
    evaluator: PaymentScheduleEvaluator,
    capabilities: EnforcementCapabilities,
    state: Mutex<EngineState>,
}

impl LockDecisionEngine {
    /// Create an engine. Enforcement capabilities are queried here, once.
    pub fn new(
        store: Arc<dyn AgentStore>,
        enforcement: Arc<dyn EnforcementCollaborator>,
        clock: Arc<dyn Clock>,
        evaluator: PaymentScheduleEvaluator,
    ) -> Self {
        let capabilities = enforcement.capabilities();
        info!(
            platform = %capabilities.platform,
            kiosk_mode = capabilities.kiosk_mode,
            soft_lock_notice = capabilities.soft_lock_notice,
            "Enforcement capabilities negotiated"
        );
        Self {
            store,
            enforcement,
            clock,
            evaluator,
            capabilities,
            state: Mutex::new(EngineState::default()),
        }
    }

    pub fn capabilities(&self) -> &EnforcementCapabilities {
        &self.capabilities
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Effective lock state. Hard locked while failing closed.
    pub async fn current_state(&self) -> LockState {
        self.state.lock().await.effective_state()
    }

    /// The engine's view of the current lock record.
    pub async fn current_record(&self) -> Option<LockRecord> {
        self.state.lock().await.current.clone()
    }

    pub async fn is_fail_closed(&self) -> bool {
        self.state.lock().await.fail_closed
    }

    /// Schedule evaluation at the current time, for countdown display.
    pub async fn schedule_status(&self) -> Result<ScheduleEvaluation> {
        let schedule = self.store.load_schedule().await?;
        Ok(self.evaluator.evaluate(schedule.as_ref(), self.clock.now()))
    }

    /// Restore the lock state after a process start.
    ///
    /// - Existing current record: adopted, its enforcement re-applied.
    /// - History without a current record: the last state is re-opened.
    /// - No history: an initial unlocked record is created.
    /// - Unreadable history: hard locked in memory, enforcement applied.
    ///
    /// The schedule is then re-evaluated against the clock.
    #[instrument(skip(self))]
    pub async fn recover_on_boot(&self) -> Result<BootOutcome> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let mut provisioned = false;

        match self.store.current_record().await {
            Ok(Some(record)) => {
                info!(
                    state = %record.lock_state,
                    reason = %record.reason,
                    record_id = %record.id,
                    "Recovered lock state"
                );
                state.latched.absorb(&record);
                state.current = Some(record.clone());
                if let Err(e) = self.enforce(record.lock_state, record.reason).await {
                    error!(error = %e, "Failed to re-apply enforcement at boot");
                }
            }
            Ok(None) => {
                let last = self.store.history(1).await?.into_iter().next();
                let target = match &last {
                    Some(record) => {
                        warn!(
                            state = %record.lock_state,
                            record_id = %record.id,
                            "Lock history has no current record; re-opening last state"
                        );
                        Target::from_record(record)
                    }
                    None => {
                        info!("No lock history; provisioning initial state");
                        provisioned = true;
                        Target::new(LockState::Unlocked, ReasonCode::Provisioned)
                    }
                };
                let record = self.commit(&mut state, target, now).await?;
                state.latched.absorb(&record);
            }
            Err(e) if e.is_unreadable() => {
                error!(error = %e, "Lock history unreadable; failing closed");
                state.fail_closed = true;
                if let Err(e) = self
                    .enforce(LockState::HardLocked, ReasonCode::StorageCorruption)
                    .await
                {
                    error!(error = %e, "Failed to apply fail-closed enforcement");
                }
                return Ok(BootOutcome {
                    state: state.effective_state(),
                    fail_closed: true,
                    provisioned: false,
                });
            }
            Err(e) => return Err(e.into()),
        }

        self.decide(&mut state, now, false).await?;
        Ok(BootOutcome {
            state: state.effective_state(),
            fail_closed: state.fail_closed,
            provisioned,
        })
    }

    /// Serialized decision entry point.
    pub async fn submit(&self, trigger: Trigger) -> Result<Decision> {
        match trigger {
            Trigger::Violations(report) => self.apply_violations(report).await,
            Trigger::ScheduleTick => self.reevaluate().await,
            Trigger::Remote(directive) => self.apply_server_response(directive).await,
        }
    }

    /// Latch a detection result and decide.
    #[instrument(skip_all, fields(decision = ?report.lock_type_decision))]
    pub async fn apply_violations(&self, report: ViolationReport) -> Result<Decision> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        for warning in &report.warnings {
            warn!(warning = %warning, "Detection warning");
        }
        if !report.is_clean() {
            let fields: Vec<&str> = report.violations.iter().map(|v| v.field.as_str()).collect();
            info!(
                count = report.violations.len(),
                fields = ?fields,
                "Violations detected"
            );
        }

        state.latched.violation = Some((report.lock_type_decision, report.tamper_summary()));
        self.decide(&mut state, now, false).await
    }

    /// Re-evaluate the schedule against the clock.
    pub async fn reevaluate(&self) -> Result<Decision> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        self.decide(&mut state, now, false).await
    }

    /// Apply an authoritative server response.
    ///
    /// Stores the schedule (hashing the unlock secret), latches remote
    /// commands and deactivation, clears fail-closed mode and decides.
    #[instrument(skip_all)]
    pub async fn apply_server_response(&self, directive: RemoteDirective) -> Result<Decision> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        if let Some(server_time) = directive.server_time {
            let skew = (server_time - now).num_seconds();
            if skew.abs() > CLOCK_SKEW_WARN_SECS {
                warn!(skew_secs = skew, "Device clock differs from server time");
            }
        }

        if directive.deactivation_requested {
            warn!(
                reason = directive.deactivation_reason.as_deref().unwrap_or("unspecified"),
                "Deactivation requested by server"
            );
            state.latched.deactivation = true;
        }
        if let Some(command) = directive.lock {
            debug!(command = ?command, "Remote lock command received");
            if command == LockCommand::Unlock && state.latched.held.take().is_some() {
                info!("Remote unlock released permanent lock");
            }
            state.latched.remote = Some(command);
        }
        if !directive.changed_fields.is_empty() {
            info!(fields = ?directive.changed_fields, "Server reported changed device fields");
        }

        self.store_schedule(&directive, now).await?;

        let was_fail_closed = std::mem::replace(&mut state.fail_closed, false);
        match self.decide(&mut state, now, true).await {
            Err(EngineError::State(e)) => {
                state.fail_closed = was_fail_closed;
                Err(EngineError::State(e))
            }
            result => {
                if was_fail_closed {
                    info!("Authoritative response received; left fail-closed mode");
                }
                result
            }
        }
    }

    /// Unlock a hard lock with the server-issued password.
    ///
    /// On success the secret is cleared, the current due time is marked
    /// settled, and latched tamper and remote locks are released.
    #[instrument(skip_all)]
    pub async fn unlock_with_password(&self, password: &str) -> Result<UnlockOutcome> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        let current = state.effective_state();
        if current == LockState::Deactivated {
            warn!("Password unlock attempted on deactivated device");
            return Err(EngineError::Deactivated);
        }
        if current != LockState::HardLocked {
            return Ok(UnlockOutcome::NotLocked { state: current });
        }

        let Some(mut schedule) = self.store.load_schedule().await? else {
            return Ok(UnlockOutcome::NoSecret);
        };
        let Some(stored_hash) = schedule.unlock_secret_hash.as_deref() else {
            return Ok(UnlockOutcome::NoSecret);
        };
        if !verify_secret(password, stored_hash) {
            warn!("Password unlock rejected");
            return Ok(UnlockOutcome::Rejected);
        }

        schedule.unlock_secret_hash = None;
        schedule.settled_due_at = Some(schedule.next_payment_at);
        self.store.save_schedule(&schedule).await?;

        state.latched.release();
        let was_fail_closed = std::mem::replace(&mut state.fail_closed, false);

        let record = match self
            .commit(
                &mut state,
                Target::new(LockState::Unlocked, ReasonCode::PasswordUnlock),
                now,
            )
            .await
        {
            Err(EngineError::State(e)) => {
                state.fail_closed = was_fail_closed;
                return Err(EngineError::State(e));
            }
            result => result?,
        };
        info!(record_id = %record.id, "Device unlocked by password");
        Ok(UnlockOutcome::Unlocked(record))
    }

    /// Commit a validator repair.
    ///
    /// Skipped (returns `false`) if the unresolved records changed since the
    /// validator read them. Refuses any repair weaker than what it replaces.
    pub(crate) async fn commit_repair(
        &self,
        observed: &[LockRecordId],
        target: Target,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        let unresolved = self.store.unresolved_records().await?;
        let ids: Vec<LockRecordId> = unresolved.iter().map(|r| r.id).collect();
        if ids != observed {
            debug!("Lock history changed during validation; repair skipped");
            return Ok(false);
        }

        let strictest = unresolved
            .iter()
            .map(|r| r.lock_state)
            .max()
            .unwrap_or(LockState::Unlocked);
        if target.lock_state < strictest {
            error!(
                target = %target.lock_state,
                current = %strictest,
                "Refusing repair that would weaken the lock"
            );
            return Ok(false);
        }

        let record = self.commit(&mut state, target, now).await?;
        state.latched.absorb(&record);
        Ok(true)
    }

    /// Re-apply enforcement for the effective state.
    pub(crate) async fn reassert_enforcement(&self) -> Result<EnforcementAck> {
        let state = self.state.lock().await;
        let lock_state = state.effective_state();
        let reason = match (&state.current, state.fail_closed) {
            (Some(record), false) => record.reason,
            (_, true) => ReasonCode::StorageCorruption,
            (None, false) => ReasonCode::canonical_for(lock_state),
        };
        warn!(state = %lock_state, reason = %reason, "Re-asserting enforcement");
        self.enforce(lock_state, reason).await
    }

    /// Enter fail-closed mode after the lock history became unreadable.
    pub(crate) async fn enter_fail_closed(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.fail_closed {
            error!("Lock history unreadable; failing closed");
        }
        state.fail_closed = true;
        let lock_state = state.effective_state();
        self.enforce(lock_state, ReasonCode::StorageCorruption).await?;
        Ok(())
    }

    async fn decide(
        &self,
        state: &mut EngineState,
        now: DateTime<Utc>,
        authoritative: bool,
    ) -> Result<Decision> {
        if state.effective_state() == LockState::Deactivated {
            return Ok(Decision::Unchanged {
                state: LockState::Deactivated,
            });
        }

        let schedule = self.store.load_schedule().await?;
        let evaluation = self.evaluator.evaluate(schedule.as_ref(), now);
        let signals = state.latched.signals(evaluation.intent);
        let mut target = resolve_target(&signals);

        if state.fail_closed && !authoritative && target.lock_state < LockState::HardLocked {
            target = Target::storage_corruption();
        }

        if let Some(current) = &state.current {
            if !materially_differs(current, &target) {
                return Ok(Decision::Unchanged {
                    state: state.effective_state(),
                });
            }
        }

        let previous = state.current.as_ref().map(|r| r.lock_state);
        let record = self.commit(state, target, now).await?;
        Ok(Decision::Committed { previous, record })
    }

    /// Resolve the previous record, insert the new one and apply enforcement.
    ///
    /// If enforcement fails the record stays committed and the error is
    /// returned; the validator re-asserts enforcement later.
    async fn commit(
        &self,
        state: &mut EngineState,
        target: Target,
        now: DateTime<Utc>,
    ) -> Result<LockRecord> {
        let mut record = target.to_record(now);
        record.kiosk_active = record.lock_state.requires_enforcement() && self.capabilities.kiosk_mode;

        self.store.commit_transition(&record, now).await?;
        info!(
            from = %state.current.as_ref().map_or(LockState::Unlocked, |r| r.lock_state),
            to = %record.lock_state,
            reason = %record.reason,
            permanent = record.permanent,
            record_id = %record.id,
            "Lock state committed"
        );
        state.current = Some(record.clone());

        self.enforce(record.lock_state, record.reason).await?;
        Ok(record)
    }

    async fn enforce(&self, lock_state: LockState, reason: ReasonCode) -> Result<EnforcementAck> {
        match self.enforcement.apply_enforcement(lock_state, reason).await {
            Ok(ack) => {
                if lock_state.requires_enforcement() && self.capabilities.kiosk_mode && !ack.kiosk_active {
                    warn!(state = %lock_state, "Enforcement acknowledged without kiosk pinning");
                }
                Ok(ack)
            }
            Err(e) => {
                error!(state = %lock_state, reason = %reason, error = %e, "Enforcement failed");
                Err(e.into())
            }
        }
    }

    /// Store the schedule carried by a server response.
    ///
    /// A response with a due time replaces the schedule. A settlement of
    /// the same due time survives unless the server explicitly locks.
    async fn store_schedule(&self, directive: &RemoteDirective, now: DateTime<Utc>) -> Result<()> {
        let secret_hash = directive.unlock_secret.as_deref().map(hash_secret);
        let existing = self.store.load_schedule().await?;

        match (directive.next_payment_at, existing) {
            (Some(due), existing) => {
                let mut schedule = PaymentSchedule::new(due, now).with_secret_hash(secret_hash);
                let explicit_lock = matches!(directive.lock, Some(LockCommand::Lock { .. }));
                if let Some(previous) = existing {
                    if previous.settled_due_at == Some(due) && !explicit_lock {
                        schedule.settled_due_at = previous.settled_due_at;
                    }
                }
                self.store.save_schedule(&schedule).await?;
                debug!(next_payment_at = %due, "Payment schedule updated");
            }
            (None, Some(mut schedule)) if secret_hash.is_some() => {
                schedule.unlock_secret_hash = secret_hash;
                self.store.save_schedule(&schedule).await?;
                debug!("Unlock secret updated");
            }
            _ => {}
        }
        Ok(())
    }
}

/// Serialized entry point that accepts decision triggers.
///
/// Implemented by the engine itself and by message-passing front ends.
#[async_trait]
pub trait DecisionSink: Send + Sync {
    async fn submit(&self, trigger: Trigger) -> Result<Decision>;
}

#[async_trait]
impl DecisionSink for LockDecisionEngine {
    async fn submit(&self, trigger: Trigger) -> Result<Decision> {
        LockDecisionEngine::submit(self, trigger).await
    }
}
