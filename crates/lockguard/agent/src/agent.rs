//! Agent runtime: boot sequence and periodic workers.
//!
//! Boot order:
//! 1. recover the lock state from storage (fail closed if unreadable)
//! 2. validate and repair the lock history
//! 3. evaluate the payment schedule against the clock
//!
//! Then four workers run until shutdown: the schedule poller, the detection
//! probe, the sync loop and the periodic validator. All decisions flow
//! through the single decision actor.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use lockguard_engine::{
    baseline, BootOutcome, Clock, DecisionSink, EnforcementCollaborator, LockDecisionEngine,
    PaymentScheduleEvaluator, ScheduleEvaluation, StateValidator, SystemClock, Trigger,
    UnlockOutcome, ValidationReport,
};
use lockguard_state::{AgentStore, InMemoryStore, OfflineEventQueue, QueueStats, SqliteStore};
use lockguard_sync::{
    HeartbeatTransport, HttpHeartbeatTransport, SnapshotSource, SyncCoordinator, SyncOutcome,
};
use lockguard_types::{DeviceBaseline, LockRecord, LockState};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::actor::{spawn_decision_actor, DecisionHandle};
use crate::config::{AgentConfig, StorageConfig};
use crate::error::Result;
use crate::probe::{DetectionProbe, ProbeOutcome};

/// Pending decision requests before senders wait.
const DECISION_QUEUE_CAPACITY: usize = 64;

/// Open the configured store.
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn AgentStore>> {
    if config.in_memory {
        warn!("Using in-memory storage; lock state will not survive a restart");
        return Ok(Arc::new(InMemoryStore::new()));
    }
    let store = SqliteStore::connect(&config.url).await?;
    info!(url = %config.url, "Opened lock state database");
    Ok(Arc::new(store))
}

/// Unstarted agent with its collaborators.
pub struct Agent {
    config: AgentConfig,
    store: Arc<dyn AgentStore>,
    enforcement: Arc<dyn EnforcementCollaborator>,
    transport: Arc<dyn HeartbeatTransport>,
    snapshots: Arc<dyn SnapshotSource>,
    clock: Arc<dyn Clock>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        store: Arc<dyn AgentStore>,
        enforcement: Arc<dyn EnforcementCollaborator>,
        transport: Arc<dyn HeartbeatTransport>,
        snapshots: Arc<dyn SnapshotSource>,
    ) -> Self {
        Self {
            config,
            store,
            enforcement,
            transport,
            snapshots,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build an agent from a config file, with SQLite storage and the HTTP
    /// heartbeat transport. The platform supplies enforcement and snapshots.
    pub async fn from_config_file(
        path: impl AsRef<Path>,
        enforcement: Arc<dyn EnforcementCollaborator>,
        snapshots: Arc<dyn SnapshotSource>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config = AgentConfig::load(path)
            .with_context(|| format!("loading agent config from {}", path.display()))?;
        let store = open_store(&config.storage)
            .await
            .context("opening lock state storage")?;
        let transport = HttpHeartbeatTransport::new(&config.sync).context("building heartbeat transport")?;
        Ok(Self::new(config, store, enforcement, Arc::new(transport), snapshots))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run the boot sequence and spawn the workers.
    pub async fn start(self) -> Result<AgentHandle> {
        let Agent {
            config,
            store,
            enforcement,
            transport,
            snapshots,
            clock,
        } = self;
        let device_id = config.device.device_id();
        info!(device_id = %device_id, "Starting lockguard agent");

        let engine = Arc::new(LockDecisionEngine::new(
            store.clone(),
            enforcement.clone(),
            clock.clone(),
            PaymentScheduleEvaluator::new(&config.schedule),
        ));

        let boot = match engine.recover_on_boot().await {
            Ok(boot) => boot,
            Err(e) => {
                error!(error = %e, "Boot recovery failed; continuing with the validator");
                BootOutcome {
                    state: engine.current_state().await,
                    fail_closed: engine.is_fail_closed().await,
                    provisioned: false,
                }
            }
        };
        if boot.fail_closed {
            error!(
                state = %boot.state,
                "Lock history unreadable; device stays locked until the server confirms its state"
            );
        }

        let validator = Arc::new(StateValidator::new(engine.clone(), store.clone(), enforcement));
        let boot_report = validator.validate_and_repair().await;
        log_report(&boot_report);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (decisions, actor) =
            spawn_decision_actor(engine.clone(), DECISION_QUEUE_CAPACITY, shutdown_rx.clone());

        match decisions.submit(Trigger::ScheduleTick).await {
            Ok(decision) => info!(state = %decision.state(), "Boot sequence complete"),
            Err(e) => error!(error = %e, "Boot schedule evaluation failed; keeping recovered state"),
        }

        let sink: Arc<dyn DecisionSink> = Arc::new(decisions.clone());
        let queue = Arc::new(OfflineEventQueue::new(store.clone(), config.queue.clone()));
        let coordinator = Arc::new(SyncCoordinator::new(
            device_id,
            queue.clone(),
            transport,
            sink.clone(),
            snapshots.clone(),
            clock.clone(),
            config.sync.clone(),
        ));
        let connectivity = Arc::new(Notify::new());
        let probe = Arc::new(DetectionProbe::new(
            config.detector.clone(),
            store.clone(),
            snapshots.clone(),
            sink,
            coordinator.clone(),
            connectivity.clone(),
            clock.clone(),
        ));

        let mut workers = Vec::with_capacity(4);

        let poller = decisions.clone();
        workers.push(spawn_periodic(
            "schedule-poller",
            config.schedule.poll_interval(),
            false,
            shutdown_rx.clone(),
            move || {
                let poller = poller.clone();
                async move {
                    if let Err(e) = poller.submit(Trigger::ScheduleTick).await {
                        error!(error = %e, "Schedule re-evaluation failed");
                    }
                }
            },
        ));

        let prober = probe.clone();
        workers.push(spawn_periodic(
            "detection-probe",
            config.probe.interval(),
            true,
            shutdown_rx.clone(),
            move || {
                let prober = prober.clone();
                async move {
                    if let Err(e) = prober.probe().await {
                        error!(error = %e, "Detection probe failed");
                    }
                }
            },
        ));

        workers.push(tokio::spawn(
            coordinator
                .clone()
                .run(connectivity.clone(), shutdown_rx.clone()),
        ));

        let checker = validator.clone();
        workers.push(spawn_periodic(
            "validator",
            config.validator.interval(),
            false,
            shutdown_rx,
            move || {
                let checker = checker.clone();
                async move {
                    log_report(&checker.validate_and_repair().await);
                }
            },
        ));

        Ok(AgentHandle {
            engine,
            decisions,
            coordinator,
            queue,
            validator,
            probe,
            store,
            snapshots,
            clock,
            connectivity,
            shutdown_tx,
            workers,
            actor,
            boot,
            boot_report,
        })
    }
}

fn log_report(report: &ValidationReport) {
    if report.is_consistent() {
        debug!(state = %report.state, "Lock state consistent");
        return;
    }
    for finding in &report.findings {
        warn!(
            issue = ?finding.issue,
            repair = ?finding.repair,
            repaired = finding.repaired,
            "Lock state inconsistency"
        );
    }
}

/// Run `tick` every `period` until shutdown. The first tick fires
/// immediately when `immediate` is set, otherwise after one period.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    immediate: bool,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if !immediate {
            interval.tick().await;
        }
        debug!(worker = name, period_secs = period.as_secs(), "Worker started");

        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(worker = name, "Worker stopped");
    })
}

/// Running agent.
pub struct AgentHandle {
    engine: Arc<LockDecisionEngine>,
    decisions: DecisionHandle,
    coordinator: Arc<SyncCoordinator>,
    queue: Arc<OfflineEventQueue>,
    validator: Arc<StateValidator>,
    probe: Arc<DetectionProbe>,
    store: Arc<dyn AgentStore>,
    snapshots: Arc<dyn SnapshotSource>,
    clock: Arc<dyn Clock>,
    connectivity: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    actor: JoinHandle<()>,
    boot: BootOutcome,
    boot_report: ValidationReport,
}

impl AgentHandle {
    pub fn boot(&self) -> &BootOutcome {
        &self.boot
    }

    /// Validation report produced during boot.
    pub fn boot_report(&self) -> &ValidationReport {
        &self.boot_report
    }

    /// Sender for decision triggers.
    pub fn decisions(&self) -> DecisionHandle {
        self.decisions.clone()
    }

    pub async fn state(&self) -> LockState {
        self.engine.current_state().await
    }

    pub async fn current_record(&self) -> Option<LockRecord> {
        self.engine.current_record().await
    }

    pub async fn schedule_status(&self) -> Result<ScheduleEvaluation> {
        Ok(self.engine.schedule_status().await?)
    }

    /// Signal that the network came back; the sync loop runs a pass now.
    pub fn notify_connectivity(&self) {
        self.connectivity.notify_one();
    }

    pub async fn unlock_with_password(&self, password: &str) -> Result<UnlockOutcome> {
        Ok(self.decisions.unlock_with_password(password).await?)
    }

    /// Record a heartbeat and drain the queue immediately.
    pub async fn sync_now(&self) -> Result<SyncOutcome> {
        Ok(self.coordinator.heartbeat_now().await?)
    }

    pub async fn probe_now(&self) -> Result<ProbeOutcome> {
        self.probe.probe().await
    }

    pub async fn validate_now(&self) -> ValidationReport {
        let report = self.validator.validate_and_repair().await;
        log_report(&report);
        report
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        Ok(self.queue.stats().await?)
    }

    /// Capture the registration baseline from the current device state.
    pub async fn establish_baseline(&self) -> Result<DeviceBaseline> {
        let snapshot = self.snapshots.capture(self.clock.now()).await?;
        Ok(baseline::establish(&self.store, &snapshot).await?)
    }

    /// Replace the baseline with the current device state, keeping `note`
    /// as the audit record.
    pub async fn rebaseline(&self, note: &str) -> Result<DeviceBaseline> {
        let snapshot = self.snapshots.capture(self.clock.now()).await?;
        Ok(baseline::rebaseline(&self.store, &snapshot, note).await?)
    }

    /// Stop every worker and the decision actor.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down lockguard agent");
        // Receivers may already be gone if a worker exited on its own.
        let _ = self.shutdown_tx.send(true);

        for worker in self.workers {
            worker.await?;
        }
        self.actor.await?;

        info!("Lockguard agent stopped");
        Ok(())
    }
}
