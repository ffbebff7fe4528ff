//! Agent configuration
//!
//! Loaded from a TOML file. Every section is optional and falls back to its
//! defaults, so an empty file (or no file at all) yields a working config.

use std::path::Path;
use std::time::Duration;

use lockguard_engine::{DetectorConfig, ScheduleConfig};
use lockguard_state::QueueConfig;
use lockguard_sync::SyncConfig;
use lockguard_types::{DeviceClass, DeviceId};
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// Device identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Identifier assigned at registration
    pub device_id: String,

    /// Hardware class, used by the detector
    pub device_class: DeviceClass,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: "unregistered".to_string(),
            device_class: DeviceClass::Mobile,
        }
    }
}

impl DeviceConfig {
    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(self.device_id.trim())
    }
}

/// Durable storage location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `sqlite:` URL of the database file
    pub url: String,

    /// Keep all state in memory. Nothing survives a restart.
    pub in_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://lockguard.db".to_string(),
            in_memory: false,
        }
    }
}

/// Detection probe cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub interval_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Periodic consistency check cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub interval_secs: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self { interval_secs: 15 * 60 }
    }
}

impl ValidatorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// Complete agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub device: DeviceConfig,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    pub queue: QueueConfig,
    pub detector: DetectorConfig,
    pub schedule: ScheduleConfig,
    pub probe: ProbeConfig,
    pub validator: ValidatorConfig,
    pub logging: LoggingConfig,
}

impl AgentConfig {
    /// Load configuration from file; a missing file yields the defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Self::from_toml(&contents)?
        } else {
            AgentConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| AgentError::Config(e.to_string()))
    }

    /// Reject values the agent cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.device.device_id.trim().is_empty() {
            return Err(AgentError::Config("device.device_id must not be empty".into()));
        }
        if self.queue.max_pending_per_kind == 0 {
            return Err(AgentError::Config(
                "queue.max_pending_per_kind must be at least 1".into(),
            ));
        }
        if self.queue.max_delivery_attempts == 0 {
            return Err(AgentError::Config(
                "queue.max_delivery_attempts must be at least 1".into(),
            ));
        }
        if !self.storage.in_memory && self.storage.url.trim().is_empty() {
            return Err(AgentError::Config("storage.url must not be empty".into()));
        }
        if self.sync.endpoint.trim().is_empty() {
            return Err(AgentError::Config("sync.endpoint must not be empty".into()));
        }
        let multiplier = self.sync.backoff.multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(AgentError::Config(
                "sync.backoff.multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }
}
