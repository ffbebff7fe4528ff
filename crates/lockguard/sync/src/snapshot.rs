//! Device snapshot capture.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lockguard_types::DeviceSnapshot;
use tokio::sync::RwLock;

use crate::error::Result;

/// Produces the current device snapshot. Implemented by the platform layer.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn capture(&self, now: DateTime<Utc>) -> Result<DeviceSnapshot>;
}

/// Snapshot source that returns a settable snapshot.
pub struct StaticSnapshotSource {
    snapshot: RwLock<DeviceSnapshot>,
}

impl StaticSnapshotSource {
    pub fn new(snapshot: DeviceSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
        }
    }

    /// Replace the snapshot returned by later captures.
    pub async fn set(&self, snapshot: DeviceSnapshot) {
        *self.snapshot.write().await = snapshot;
    }

    /// Modify the snapshot in place.
    pub async fn update(&self, f: impl FnOnce(&mut DeviceSnapshot) + Send) {
        f(&mut *self.snapshot.write().await);
    }
}

#[async_trait]
impl SnapshotSource for StaticSnapshotSource {
    async fn capture(&self, now: DateTime<Utc>) -> Result<DeviceSnapshot> {
        let mut snapshot = self.snapshot.read().await.clone();
        snapshot.captured_at = now;
        Ok(snapshot)
    }
}
