//! Seam to the platform layer that actually restricts the device.
//!
//! The engine only decides. Pinning the UI, kiosk mode and the soft-lock
//! notice belong to the platform; the engine drives them through
//! [`EnforcementCollaborator`] and the validator re-checks them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use lockguard_types::{LockState, ReasonCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// What the platform can enforce. Queried once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcementCapabilities {
    /// Full-screen pinning that cannot be dismissed (kiosk/lock-task mode).
    pub kiosk_mode: bool,
    /// Dismissible reminder surface for soft locks.
    pub soft_lock_notice: bool,
    pub platform: String,
}

impl Default for EnforcementCapabilities {
    fn default() -> Self {
        Self {
            kiosk_mode: true,
            soft_lock_notice: true,
            platform: "generic".to_string(),
        }
    }
}

/// Acknowledgement of an applied enforcement request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnforcementAck {
    pub applied_state: LockState,
    pub kiosk_active: bool,
}

/// Enforcement failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnforcementError {
    #[error("enforcement unavailable: {0}")]
    Unavailable(String),

    #[error("enforcement rejected {state}: {reason}")]
    Rejected { state: LockState, reason: String },
}

/// Platform enforcement layer.
#[async_trait]
pub trait EnforcementCollaborator: Send + Sync {
    fn capabilities(&self) -> EnforcementCapabilities;

    /// Bring the device's restriction in line with `state`.
    async fn apply_enforcement(
        &self,
        state: LockState,
        reason: ReasonCode,
    ) -> Result<EnforcementAck, EnforcementError>;

    /// Whether blocking enforcement is currently in effect.
    async fn query_enforcement_active(&self) -> Result<bool, EnforcementError>;
}

/// In-process enforcement that records every request.
///
/// Used by tests and by hosts without a platform layer.
#[derive(Debug, Default)]
pub struct RecordingEnforcement {
    capabilities: EnforcementCapabilities,
    applied: Mutex<Vec<(LockState, ReasonCode)>>,
    active: AtomicBool,
    failing: AtomicBool,
}

impl RecordingEnforcement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(capabilities: EnforcementCapabilities) -> Self {
        Self {
            capabilities,
            ..Self::default()
        }
    }

    /// Every request applied so far, in order.
    pub fn applied(&self) -> Vec<(LockState, ReasonCode)> {
        self.applied
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn last_applied(&self) -> Option<(LockState, ReasonCode)> {
        self.applied().last().copied()
    }

    /// Simulate enforcement being dropped (or raised) outside the engine.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Make subsequent requests fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl EnforcementCollaborator for RecordingEnforcement {
    fn capabilities(&self) -> EnforcementCapabilities {
        self.capabilities.clone()
    }

    async fn apply_enforcement(
        &self,
        state: LockState,
        reason: ReasonCode,
    ) -> Result<EnforcementAck, EnforcementError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EnforcementError::Unavailable(
                "simulated enforcement failure".to_string(),
            ));
        }

        debug!(state = %state, reason = %reason, "Recording enforcement request");
        self.applied
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((state, reason));

        let blocking = state.requires_enforcement();
        self.active.store(blocking, Ordering::SeqCst);
        Ok(EnforcementAck {
            applied_state: state,
            kiosk_active: blocking && self.capabilities.kiosk_mode,
        })
    }

    async fn query_enforcement_active(&self) -> Result<bool, EnforcementError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EnforcementError::Unavailable(
                "simulated enforcement failure".to_string(),
            ));
        }
        Ok(self.active.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_tracks_blocking_state() {
        let enforcement = RecordingEnforcement::new();
        assert!(!enforcement.query_enforcement_active().await.unwrap());

        let ack = enforcement
            .apply_enforcement(LockState::HardLocked, ReasonCode::Tamper)
            .await
            .unwrap();
        assert!(ack.kiosk_active);
        assert!(enforcement.query_enforcement_active().await.unwrap());

        enforcement
            .apply_enforcement(LockState::SoftLocked, ReasonCode::PaymentReminder)
            .await
            .unwrap();
        assert!(!enforcement.query_enforcement_active().await.unwrap());
        assert_eq!(enforcement.applied().len(), 2);
    }

    #[tokio::test]
    async fn test_failing_enforcement() {
        let enforcement = RecordingEnforcement::new();
        enforcement.set_failing(true);
        let err = enforcement
            .apply_enforcement(LockState::HardLocked, ReasonCode::RemoteLock)
            .await
            .unwrap_err();
        assert!(matches!(err, EnforcementError::Unavailable(_)));
        assert!(enforcement.applied().is_empty());
    }
}
