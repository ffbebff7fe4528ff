//! End-to-end agent scenarios: restart recovery, offline escalation and
//! resync, tamper signalling, deactivation and fail-closed boot.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use lockguard_agent::{Agent, AgentConfig, AgentError, AgentHandle};
use lockguard_engine::{EngineError, ManualClock, RecordingEnforcement, Trigger, UnlockOutcome};
use lockguard_state::{AgentStore, InMemoryStore, LockStateStore, SqliteStore};
use lockguard_sync::{ScriptedReply, ScriptedTransport, StaticSnapshotSource};
use lockguard_types::{
    DeviceClass, DeviceId, DeviceSnapshot, EventKind, IdentityFields, LockState, ReasonCode,
    SecurityFlags, Telemetry,
};

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).single().unwrap()
}

fn snapshot() -> DeviceSnapshot {
    DeviceSnapshot {
        device_id: DeviceId::new("dev-3001"),
        device_class: DeviceClass::Mobile,
        identity: IdentityFields {
            serial_number: Some("R58N12ABCDE".into()),
            device_imeis: vec!["356938035643809".into()],
            installed_ram: Some("8 GB".into()),
            total_storage: Some("128 GB".into()),
            build_fingerprint: Some("samsung/a54/a54:14".into()),
            security_patch_level: Some("2026-02-01".into()),
            os_version: Some("14".into()),
        },
        security: SecurityFlags {
            is_device_rooted: Some(false),
            is_usb_debugging_enabled: Some(false),
            is_developer_mode_enabled: Some(false),
            is_bootloader_unlocked: Some(false),
            is_custom_rom: Some(false),
        },
        telemetry: Telemetry::default(),
        captured_at: start(),
    }
}

/// Config whose periodic workers stay quiet for the length of a test.
fn config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.device.device_id = "dev-3001".into();
    config.storage.in_memory = true;
    config.schedule.poll_interval_secs = 3600;
    config.probe.interval_secs = 3600;
    config.validator.interval_secs = 3600;
    config.sync.interval_secs = 3600;
    config.sync.backoff.initial_delay_secs = 3600;
    config.sync.backoff.max_delay_secs = 3600;
    config
}

struct Rig {
    enforcement: Arc<RecordingEnforcement>,
    transport: Arc<ScriptedTransport>,
    snapshots: Arc<StaticSnapshotSource>,
    clock: Arc<ManualClock>,
}

impl Rig {
    fn new() -> Self {
        Self {
            enforcement: Arc::new(RecordingEnforcement::new()),
            transport: Arc::new(ScriptedTransport::new()),
            snapshots: Arc::new(StaticSnapshotSource::new(snapshot())),
            clock: Arc::new(ManualClock::new(start())),
        }
    }

    async fn start(&self, store: Arc<dyn AgentStore>) -> AgentHandle {
        Agent::new(
            config(),
            store,
            self.enforcement.clone(),
            self.transport.clone(),
            self.snapshots.clone(),
        )
        .with_clock(self.clock.clone())
        .start()
        .await
        .unwrap()
    }
}

#[tokio::test]
async fn test_restart_restores_lock_bit_for_bit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lockguard.db");
    let rig = Rig::new();

    let sqlite = Arc::new(SqliteStore::open(&path).await.unwrap());
    let handle = rig.start(sqlite.clone()).await;
    assert!(handle.boot().provisioned);
    assert_eq!(handle.state().await, LockState::Unlocked);

    handle.establish_baseline().await.unwrap();
    rig.snapshots
        .update(|s| s.security.is_device_rooted = Some(true))
        .await;
    let outcome = handle.probe_now().await.unwrap();
    assert_eq!(outcome.decision.state(), LockState::HardLocked);

    let locked = handle.current_record().await.unwrap();
    assert_eq!(locked.reason, ReasonCode::Tamper);
    handle.shutdown().await.unwrap();
    sqlite.close().await;

    // Second process on the same database, still rooted.
    let rig2 = Rig {
        enforcement: Arc::new(RecordingEnforcement::new()),
        ..rig
    };
    let sqlite = Arc::new(SqliteStore::open(&path).await.unwrap());
    let handle = rig2.start(sqlite.clone()).await;

    assert!(!handle.boot().provisioned);
    assert!(!handle.boot().fail_closed);
    assert_eq!(handle.boot().state, LockState::HardLocked);
    assert!(handle.boot_report().is_consistent());
    assert_eq!(handle.current_record().await.unwrap(), locked);
    assert_eq!(
        rig2.enforcement.applied().first().copied(),
        Some((LockState::HardLocked, ReasonCode::Tamper))
    );

    assert_eq!(handle.state().await, LockState::HardLocked);
    assert_eq!(sqlite.unresolved_records().await.unwrap().len(), 1);

    handle.shutdown().await.unwrap();
    sqlite.close().await;
}

#[tokio::test]
async fn test_offline_escalation_then_resync() {
    let rig = Rig::new();
    let due = start() + Duration::days(2);
    rig.transport.push(ScriptedReply::Body(format!(
        r#"{{"isLocked": false, "nextPaymentDateTime": "{}", "unlockSecret": "7Q4-PAY"}}"#,
        due.to_rfc3339()
    )));

    let store: Arc<dyn AgentStore> = Arc::new(InMemoryStore::new());
    let handle = rig.start(store).await;
    handle.sync_now().await.unwrap();
    let status = handle.schedule_status().await.unwrap();
    assert_eq!(status.due_at, Some(due));

    // Network gone; the due time passes on the local clock.
    rig.transport.set_fallback(ScriptedReply::Unreachable);
    rig.clock.set(due + Duration::hours(1));
    let decision = handle.decisions().submit(Trigger::ScheduleTick).await.unwrap();
    assert_eq!(decision.state(), LockState::HardLocked);
    assert_eq!(
        rig.enforcement.last_applied(),
        Some((LockState::HardLocked, ReasonCode::PaymentOverdue))
    );

    let outcome = handle.sync_now().await.unwrap();
    assert!(!outcome.is_complete());
    assert!(handle.queue_stats().await.unwrap().pending_heartbeats >= 1);
    assert_eq!(handle.state().await, LockState::HardLocked);

    assert_eq!(
        handle.unlock_with_password("wrong").await.unwrap(),
        UnlockOutcome::Rejected
    );

    // Payment made; the server moves the due date and unlocks.
    let next_due = due + Duration::days(30);
    rig.transport.set_fallback(ScriptedReply::Body(format!(
        r#"{{"isLocked": false, "nextPaymentDateTime": "{}"}}"#,
        next_due.to_rfc3339()
    )));
    let outcome = handle.sync_now().await.unwrap();
    assert!(outcome.is_complete());
    assert!(outcome.delivered >= 1);
    assert_eq!(outcome.lock_state, Some(LockState::Unlocked));
    assert_eq!(handle.state().await, LockState::Unlocked);
    assert_eq!(handle.queue_stats().await.unwrap().pending_heartbeats, 0);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_password_unlock_while_offline() {
    let rig = Rig::new();
    let due = start() + Duration::hours(6);
    rig.transport.push(ScriptedReply::Body(format!(
        r#"{{"nextPaymentDateTime": "{}", "unlockSecret": "7Q4-PAY"}}"#,
        due.to_rfc3339()
    )));

    let store: Arc<dyn AgentStore> = Arc::new(InMemoryStore::new());
    let handle = rig.start(store).await;
    handle.sync_now().await.unwrap();
    assert_eq!(handle.state().await, LockState::SoftLocked);

    rig.transport.set_fallback(ScriptedReply::Unreachable);
    rig.clock.set(due + Duration::minutes(5));
    handle.decisions().submit(Trigger::ScheduleTick).await.unwrap();
    assert_eq!(handle.state().await, LockState::HardLocked);

    let outcome = handle.unlock_with_password("7Q4-PAY").await.unwrap();
    assert!(matches!(outcome, UnlockOutcome::Unlocked(_)));
    assert_eq!(handle.state().await, LockState::Unlocked);

    // Still offline: the settled due time does not re-lock.
    handle.decisions().submit(Trigger::ScheduleTick).await.unwrap();
    assert_eq!(handle.state().await, LockState::Unlocked);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_tamper_signal_is_sent_before_heartbeats() {
    let rig = Rig::new();
    let store: Arc<dyn AgentStore> = Arc::new(InMemoryStore::new());
    let handle = rig.start(store).await;
    handle.establish_baseline().await.unwrap();

    rig.transport.set_fallback(ScriptedReply::Unreachable);
    handle.sync_now().await.unwrap();
    rig.snapshots
        .update(|s| s.identity.serial_number = Some("R58N99ZZZZZ".into()))
        .await;
    let outcome = handle.probe_now().await.unwrap();
    assert_eq!(outcome.decision.state(), LockState::HardLocked);
    assert_eq!(
        outcome.report.tamper_summary().as_deref(),
        Some("Device security compromised: serial_number")
    );

    let sent_before = rig.transport.sent().len();
    rig.transport.set_fallback(ScriptedReply::Body(String::new()));
    handle.sync_now().await.unwrap();

    // The tamper signal leaves ahead of the older pending heartbeat.
    let sent = rig.transport.sent();
    assert_eq!(sent[sent_before].0, EventKind::TamperSignal);
    let stats = handle.queue_stats().await.unwrap();
    assert_eq!(stats.pending_tamper_signals, 0);
    assert_eq!(stats.pending_heartbeats, 0);

    // Restoring the registered identity releases the tamper lock.
    rig.snapshots.set(snapshot()).await;
    let outcome = handle.probe_now().await.unwrap();
    assert_eq!(outcome.decision.state(), LockState::Unlocked);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_deactivation_is_terminal() {
    let rig = Rig::new();
    rig.transport.push(ScriptedReply::Body(
        r#"{"deactivationRequested": true, "deactivationReason": "loan_completed"}"#.into(),
    ));

    let store: Arc<dyn AgentStore> = Arc::new(InMemoryStore::new());
    let handle = rig.start(store).await;
    let outcome = handle.sync_now().await.unwrap();
    assert_eq!(outcome.lock_state, Some(LockState::Deactivated));

    let record = handle.current_record().await.unwrap();
    assert!(record.permanent);
    assert_eq!(record.reason, ReasonCode::Deactivated);

    rig.transport
        .set_fallback(ScriptedReply::Body(r#"{"isLocked": false}"#.into()));
    handle.sync_now().await.unwrap();
    assert_eq!(handle.state().await, LockState::Deactivated);

    let err = handle.unlock_with_password("anything").await.unwrap_err();
    assert!(matches!(err, AgentError::Engine(EngineError::Deactivated)));

    assert!(handle.validate_now().await.is_consistent());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unreadable_store_boots_fail_closed() {
    let rig = Rig::new();
    rig.transport.set_fallback(ScriptedReply::Unreachable);
    let memory = Arc::new(InMemoryStore::new());
    memory.set_unreadable(true);

    let handle = rig.start(memory.clone()).await;
    assert!(handle.boot().fail_closed);
    assert_eq!(handle.state().await, LockState::HardLocked);
    assert_eq!(
        rig.enforcement.last_applied(),
        Some((LockState::HardLocked, ReasonCode::StorageCorruption))
    );

    // Local re-evaluation cannot release it.
    memory.set_unreadable(false);
    handle.decisions().submit(Trigger::ScheduleTick).await.unwrap();
    assert_eq!(handle.state().await, LockState::HardLocked);

    // The server's answer can.
    rig.transport.set_fallback(ScriptedReply::Body(String::new()));
    handle.sync_now().await.unwrap();
    assert_eq!(handle.state().await, LockState::Unlocked);
    assert!(handle.validate_now().await.is_consistent());

    handle.shutdown().await.unwrap();
}
