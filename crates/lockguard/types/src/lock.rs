//! Lock states and the append-only lock record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::LockRecordId;

/// Lock state of the device.
///
/// Variants are ordered by strictness: `Unlocked < SoftLocked < HardLocked < Deactivated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockState {
    /// Device fully usable.
    Unlocked,
    /// Dismissible warning; device remains usable.
    SoftLocked,
    /// Fully restrictive enforcement requiring explicit unlock.
    HardLocked,
    /// Terminal, backend-issued removal of enforcement authority.
    Deactivated,
}

impl LockState {
    /// Whether this state restricts the device in any way.
    pub fn is_restrictive(&self) -> bool {
        !matches!(self, LockState::Unlocked)
    }

    /// Whether this state requires enforcement to be actively applied.
    pub fn requires_enforcement(&self) -> bool {
        matches!(self, LockState::HardLocked | LockState::Deactivated)
    }

    /// Whether no local transition may leave this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LockState::Deactivated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Unlocked => "UNLOCKED",
            LockState::SoftLocked => "SOFT_LOCKED",
            LockState::HardLocked => "HARD_LOCKED",
            LockState::Deactivated => "DEACTIVATED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "UNLOCKED" => Some(LockState::Unlocked),
            "SOFT_LOCKED" => Some(LockState::SoftLocked),
            "HARD_LOCKED" => Some(LockState::HardLocked),
            "DEACTIVATED" => Some(LockState::Deactivated),
            _ => None,
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a lock record was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// First record written after provisioning.
    Provisioned,
    /// All lock conditions cleared.
    Cleared,
    /// Unlocked locally with the server-issued password.
    PasswordUnlock,
    /// Unlocked by an explicit remote command.
    RemoteUnlock,
    /// Payment due within the reminder window.
    PaymentReminder,
    /// Medium-severity configuration drift.
    ConfigDrift,
    /// Payment due time has passed.
    PaymentOverdue,
    /// High-severity tamper violation.
    Tamper,
    /// Locked by an explicit remote command.
    RemoteLock,
    /// Lock state store could not be read; failing closed.
    StorageCorruption,
    /// Record escalated by the consistency validator.
    IntegrityRepair,
    /// Backend-issued deactivation.
    Deactivated,
}

impl ReasonCode {
    /// Whether this reason may label a record in `state`.
    pub fn is_consistent_with(&self, state: LockState) -> bool {
        use ReasonCode::*;
        match state {
            LockState::Unlocked => {
                matches!(self, Provisioned | Cleared | PasswordUnlock | RemoteUnlock)
            }
            LockState::SoftLocked => matches!(self, PaymentReminder | ConfigDrift),
            LockState::HardLocked => matches!(
                self,
                PaymentOverdue | Tamper | RemoteLock | StorageCorruption | IntegrityRepair
            ),
            LockState::Deactivated => matches!(self, Deactivated),
        }
    }

    /// Reason used when a record's reason has to be rewritten for `state`.
    pub fn canonical_for(state: LockState) -> Self {
        match state {
            LockState::Unlocked => ReasonCode::Cleared,
            LockState::SoftLocked => ReasonCode::ConfigDrift,
            LockState::HardLocked => ReasonCode::IntegrityRepair,
            LockState::Deactivated => ReasonCode::Deactivated,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Provisioned => "provisioned",
            ReasonCode::Cleared => "cleared",
            ReasonCode::PasswordUnlock => "password_unlock",
            ReasonCode::RemoteUnlock => "remote_unlock",
            ReasonCode::PaymentReminder => "payment_reminder",
            ReasonCode::ConfigDrift => "config_drift",
            ReasonCode::PaymentOverdue => "payment_overdue",
            ReasonCode::Tamper => "tamper",
            ReasonCode::RemoteLock => "remote_lock",
            ReasonCode::StorageCorruption => "storage_corruption",
            ReasonCode::IntegrityRepair => "integrity_repair",
            ReasonCode::Deactivated => "deactivated",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the append-only lock history.
///
/// The record with `resolved_at == None` is the device's current lock state.
/// Records are never deleted; the only mutation after insertion is setting
/// `resolved_at` when a newer record supersedes this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub id: LockRecordId,
    pub lock_state: LockState,
    pub reason: ReasonCode,
    /// Tamper detail (violating fields) for tamper-driven locks.
    pub tamper_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Lock cannot be lifted by any local action.
    pub permanent: bool,
    /// Whether enforcement acknowledged kiosk/foreground pinning for this record.
    pub kiosk_active: bool,
}

impl LockRecord {
    /// Create a new unresolved record. Deactivation records are always permanent.
    pub fn new(lock_state: LockState, reason: ReasonCode, created_at: DateTime<Utc>) -> Self {
        Self {
            id: LockRecordId::generate(),
            lock_state,
            reason,
            tamper_type: None,
            created_at,
            resolved_at: None,
            permanent: lock_state == LockState::Deactivated,
            kiosk_active: false,
        }
    }

    pub fn with_tamper_type(mut self, tamper_type: Option<String>) -> Self {
        self.tamper_type = tamper_type;
        self
    }

    pub fn with_permanent(mut self, permanent: bool) -> Self {
        self.permanent = permanent || self.lock_state == LockState::Deactivated;
        self
    }

    /// Whether this is the current (unresolved) record.
    pub fn is_current(&self) -> bool {
        self.resolved_at.is_none()
    }

    /// Whether moving to the given target would change anything observable.
    pub fn differs_from(
        &self,
        lock_state: LockState,
        reason: ReasonCode,
        tamper_type: Option<&str>,
        permanent: bool,
    ) -> bool {
        self.lock_state != lock_state
            || self.reason != reason
            || self.tamper_type.as_deref() != tamper_type
            || self.permanent != permanent
    }
}
