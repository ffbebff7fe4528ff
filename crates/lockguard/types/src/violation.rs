//! Tamper violations and per-pass violation reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity tier of a violation. Ordered so that `High` is the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
        }
    }
}

/// Observable device fields compared against the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedField {
    // Identity, root and boot integrity
    SerialNumber,
    DeviceImeis,
    IsDeviceRooted,
    IsUsbDebuggingEnabled,
    IsDeveloperModeEnabled,
    IsBootloaderUnlocked,
    IsCustomRom,
    // Hardware and build configuration
    InstalledRam,
    TotalStorage,
    BuildFingerprint,
    SecurityPatchLevel,
    OsVersion,
    // Telemetry
    BatteryLevel,
    Location,
    AppInventory,
}

impl TrackedField {
    /// All tracked fields in comparison order.
    pub const ALL: [TrackedField; 15] = [
        TrackedField::SerialNumber,
        TrackedField::DeviceImeis,
        TrackedField::IsDeviceRooted,
        TrackedField::IsUsbDebuggingEnabled,
        TrackedField::IsDeveloperModeEnabled,
        TrackedField::IsBootloaderUnlocked,
        TrackedField::IsCustomRom,
        TrackedField::InstalledRam,
        TrackedField::TotalStorage,
        TrackedField::BuildFingerprint,
        TrackedField::SecurityPatchLevel,
        TrackedField::OsVersion,
        TrackedField::BatteryLevel,
        TrackedField::Location,
        TrackedField::AppInventory,
    ];

    /// Static severity classification of this field.
    pub fn severity(&self) -> Severity {
        use TrackedField::*;
        match self {
            SerialNumber | DeviceImeis | IsDeviceRooted | IsUsbDebuggingEnabled
            | IsDeveloperModeEnabled | IsBootloaderUnlocked | IsCustomRom => Severity::High,
            InstalledRam | TotalStorage | BuildFingerprint | SecurityPatchLevel | OsVersion => {
                Severity::Medium
            }
            BatteryLevel | Location | AppInventory => Severity::Low,
        }
    }

    /// Generic mismatch reason. Never includes the observed values.
    pub fn mismatch_reason(&self) -> &'static str {
        use TrackedField::*;
        match self {
            SerialNumber => "Device serial number mismatch detected",
            DeviceImeis => "Device IMEI mismatch detected",
            IsDeviceRooted => "Device rooting status changed",
            IsUsbDebuggingEnabled => "USB debugging status changed",
            IsDeveloperModeEnabled => "Developer mode status changed",
            IsBootloaderUnlocked => "Bootloader unlock status changed",
            IsCustomRom => "Custom ROM status changed",
            InstalledRam => "Device RAM configuration changed",
            TotalStorage => "Device storage configuration changed",
            BuildFingerprint => "Build fingerprint changed",
            SecurityPatchLevel => "Security patch level changed",
            OsVersion => "Operating system version changed",
            BatteryLevel => "Battery telemetry changed",
            Location => "Device location changed",
            AppInventory => "Installed application inventory changed",
        }
    }

    /// Fields that only exist on mobile devices.
    pub fn is_mobile_only(&self) -> bool {
        use TrackedField::*;
        matches!(
            self,
            DeviceImeis
                | IsDeviceRooted
                | IsUsbDebuggingEnabled
                | IsDeveloperModeEnabled
                | IsBootloaderUnlocked
        )
    }

    /// Fields not compared for desktop/laptop devices.
    pub fn is_desktop_skipped(&self) -> bool {
        use TrackedField::*;
        self.is_mobile_only() || matches!(self, SerialNumber | TotalStorage | IsCustomRom)
    }

    pub fn as_str(&self) -> &'static str {
        use TrackedField::*;
        match self {
            SerialNumber => "serial_number",
            DeviceImeis => "device_imeis",
            IsDeviceRooted => "is_device_rooted",
            IsUsbDebuggingEnabled => "is_usb_debugging_enabled",
            IsDeveloperModeEnabled => "is_developer_mode_enabled",
            IsBootloaderUnlocked => "is_bootloader_unlocked",
            IsCustomRom => "is_custom_rom",
            InstalledRam => "installed_ram",
            TotalStorage => "total_storage",
            BuildFingerprint => "build_fingerprint",
            SecurityPatchLevel => "security_patch_level",
            OsVersion => "os_version",
            BatteryLevel => "battery_level",
            Location => "location",
            AppInventory => "app_inventory",
        }
    }
}

impl fmt::Display for TrackedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single detected deviation from the baseline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub field: TrackedField,
    pub severity: Severity,
    pub reason: String,
    pub detected_at: DateTime<Utc>,
}

/// Lock outcome implied by a violation report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockTypeDecision {
    NoLock,
    SoftLock,
    HardLock,
}

impl LockTypeDecision {
    /// Strictest decision implied by a severity. Low severities never lock.
    pub fn for_severity(severity: Severity) -> Self {
        match severity {
            Severity::High => LockTypeDecision::HardLock,
            Severity::Medium => LockTypeDecision::SoftLock,
            Severity::Low => LockTypeDecision::NoLock,
        }
    }
}

/// Whether a usable baseline was available for the detection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineStatus {
    Established,
    NotEstablished,
    Empty,
}

/// Output of one detection pass. Ephemeral; never persisted directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationReport {
    pub violations: Vec<Violation>,
    pub lock_type_decision: LockTypeDecision,
    pub baseline_status: BaselineStatus,
    /// Non-violating findings worth surfacing (e.g. fewer IMEIs than baseline).
    pub warnings: Vec<String>,
}

impl ViolationReport {
    /// Build a report, deriving the decision from the strictest violation.
    pub fn from_violations(violations: Vec<Violation>, warnings: Vec<String>) -> Self {
        let lock_type_decision = violations
            .iter()
            .map(|v| LockTypeDecision::for_severity(v.severity))
            .max()
            .unwrap_or(LockTypeDecision::NoLock);

        Self {
            violations,
            lock_type_decision,
            baseline_status: BaselineStatus::Established,
            warnings,
        }
    }

    /// Report for a pass that could not compare anything.
    pub fn without_baseline(status: BaselineStatus) -> Self {
        Self {
            violations: Vec::new(),
            lock_type_decision: LockTypeDecision::NoLock,
            baseline_status: status,
            warnings: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        self.violations.iter().map(|v| v.severity).max()
    }

    /// Fields with the given severity, in detection order.
    pub fn fields_with(&self, severity: Severity) -> Vec<TrackedField> {
        self.violations
            .iter()
            .filter(|v| v.severity == severity)
            .map(|v| v.field)
            .collect()
    }

    /// Tamper description used as the lock record's tamper type.
    pub fn tamper_summary(&self) -> Option<String> {
        let fields = self.fields_with(Severity::High);
        if fields.is_empty() {
            return None;
        }
        let names: Vec<&str> = fields.iter().map(|f| f.as_str()).collect();
        Some(format!("Device security compromised: {}", names.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(field: TrackedField) -> Violation {
        Violation {
            field,
            severity: field.severity(),
            reason: field.mismatch_reason().to_string(),
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn test_strictest_decision_wins() {
        let report = ViolationReport::from_violations(
            vec![
                violation(TrackedField::BatteryLevel),
                violation(TrackedField::OsVersion),
                violation(TrackedField::IsDeviceRooted),
            ],
            vec![],
        );
        assert_eq!(report.lock_type_decision, LockTypeDecision::HardLock);
        assert_eq!(report.highest_severity(), Some(Severity::High));
    }

    #[test]
    fn test_low_only_never_locks() {
        let report = ViolationReport::from_violations(
            vec![violation(TrackedField::Location), violation(TrackedField::AppInventory)],
            vec![],
        );
        assert_eq!(report.lock_type_decision, LockTypeDecision::NoLock);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_tamper_summary_lists_high_fields() {
        let report = ViolationReport::from_violations(
            vec![
                violation(TrackedField::SerialNumber),
                violation(TrackedField::TotalStorage),
                violation(TrackedField::IsBootloaderUnlocked),
            ],
            vec![],
        );
        assert_eq!(
            report.tamper_summary().as_deref(),
            Some("Device security compromised: serial_number, is_bootloader_unlocked")
        );
    }
}
