//! Baseline lifecycle.
//!
//! The baseline is captured once at registration. Replacing it is an
//! explicit, audited operation; nothing in the detection path writes it.

use std::sync::Arc;

use lockguard_state::{AgentStore, StateError};
use lockguard_types::{DeviceBaseline, DeviceSnapshot};
use tracing::{info, warn};

use crate::error::Result;

/// Capture the registration baseline. Fails if one already exists.
pub async fn establish(store: &Arc<dyn AgentStore>, snapshot: &DeviceSnapshot) -> Result<DeviceBaseline> {
    let baseline = DeviceBaseline::from_snapshot(snapshot);
    store.establish_baseline(&baseline).await?;
    info!(
        device_id = %baseline.device_id,
        revision = baseline.revision,
        "Device baseline established"
    );
    Ok(baseline)
}

/// Replace the baseline with a new capture.
///
/// `note` is stored with the new revision and logged as the audit trail.
pub async fn rebaseline(
    store: &Arc<dyn AgentStore>,
    snapshot: &DeviceSnapshot,
    note: &str,
) -> Result<DeviceBaseline> {
    let current = store
        .load_baseline()
        .await?
        .ok_or(StateError::BaselineMissing)?;
    let next = current.rebaselined(snapshot, note);
    store.replace_baseline(&next).await?;
    warn!(
        device_id = %next.device_id,
        from_revision = current.revision,
        to_revision = next.revision,
        note = %note,
        "Device baseline replaced"
    );
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lockguard_state::InMemoryStore;
    use lockguard_types::{DeviceClass, DeviceId, IdentityFields, SecurityFlags, Telemetry};

    fn snapshot(serial: &str) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: DeviceId::new("dev-7"),
            device_class: DeviceClass::Mobile,
            identity: IdentityFields {
                serial_number: Some(serial.to_string()),
                ..IdentityFields::default()
            },
            security: SecurityFlags::default(),
            telemetry: Telemetry::default(),
            captured_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_establish_once_then_rebaseline() {
        let store: Arc<dyn AgentStore> = Arc::new(InMemoryStore::default());

        let first = establish(&store, &snapshot("A1")).await.unwrap();
        assert_eq!(first.revision, 1);

        let err = establish(&store, &snapshot("B2")).await.unwrap_err();
        assert!(matches!(
            err,
            crate::EngineError::State(StateError::BaselineExists(1))
        ));

        let second = rebaseline(&store, &snapshot("B2"), "mainboard replaced under warranty")
            .await
            .unwrap();
        assert_eq!(second.revision, 2);
        assert_eq!(second.identity.serial_number.as_deref(), Some("B2"));

        let stored = store.load_baseline().await.unwrap().unwrap();
        assert_eq!(stored, second);
    }

    #[tokio::test]
    async fn test_rebaseline_requires_existing_baseline() {
        let store: Arc<dyn AgentStore> = Arc::new(InMemoryStore::default());
        let err = rebaseline(&store, &snapshot("A1"), "repair").await.unwrap_err();
        assert!(matches!(err, crate::EngineError::State(StateError::BaselineMissing)));
    }
}
