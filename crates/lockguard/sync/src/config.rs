//! Sync configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffConfig;

/// Heartbeat service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the heartbeat service.
    pub endpoint: String,
    /// Device agent API key sent with every request.
    pub api_key: Option<String>,
    pub api_key_header: String,
    pub heartbeat_path: String,
    pub tamper_signal_path: String,
    /// Regular sync cadence.
    pub interval_secs: u64,
    /// Per-request timeout; a timed-out event stays pending.
    pub request_timeout_secs: u64,
    pub backoff: BackoffConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000".to_string(),
            api_key: None,
            api_key_header: "X-Device-Api-Key".to_string(),
            heartbeat_path: "/api/devices/heartbeat/".to_string(),
            tamper_signal_path: "/api/devices/tamper-signal/".to_string(),
            interval_secs: 300,
            request_timeout_secs: 30,
            backoff: BackoffConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}
