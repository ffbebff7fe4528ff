//! Device snapshots and the registration baseline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::DeviceId;
use crate::violation::TrackedField;

/// Hardware class of the device. Desktops skip mobile-only comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    #[default]
    Mobile,
    Desktop,
}

/// Hardware and software identity fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityFields {
    pub serial_number: Option<String>,
    #[serde(default)]
    pub device_imeis: Vec<String>,
    pub installed_ram: Option<String>,
    pub total_storage: Option<String>,
    pub build_fingerprint: Option<String>,
    pub security_patch_level: Option<String>,
    pub os_version: Option<String>,
}

/// Security flags. `None` means the platform did not report the flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityFlags {
    pub is_device_rooted: Option<bool>,
    pub is_usb_debugging_enabled: Option<bool>,
    pub is_developer_mode_enabled: Option<bool>,
    pub is_bootloader_unlocked: Option<bool>,
    pub is_custom_rom: Option<bool>,
}

/// Low-severity telemetry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Telemetry {
    pub battery_level: Option<u8>,
    pub location: Option<String>,
    pub installed_app_count: Option<u32>,
}

/// Comparable value of one tracked field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(Option<String>),
    List(Vec<String>),
    Flag(Option<bool>),
    Count(Option<u64>),
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(v) => v.as_deref().map(str::trim).map_or(true, str::is_empty),
            FieldValue::List(v) => v.is_empty(),
            FieldValue::Flag(v) => v.is_none(),
            FieldValue::Count(v) => v.is_none(),
        }
    }
}

fn field_value(
    identity: &IdentityFields,
    security: &SecurityFlags,
    telemetry: &Telemetry,
    field: TrackedField,
) -> FieldValue {
    use TrackedField::*;
    match field {
        SerialNumber => FieldValue::Text(identity.serial_number.clone()),
        DeviceImeis => FieldValue::List(identity.device_imeis.clone()),
        IsDeviceRooted => FieldValue::Flag(security.is_device_rooted),
        IsUsbDebuggingEnabled => FieldValue::Flag(security.is_usb_debugging_enabled),
        IsDeveloperModeEnabled => FieldValue::Flag(security.is_developer_mode_enabled),
        IsBootloaderUnlocked => FieldValue::Flag(security.is_bootloader_unlocked),
        IsCustomRom => FieldValue::Flag(security.is_custom_rom),
        InstalledRam => FieldValue::Text(identity.installed_ram.clone()),
        TotalStorage => FieldValue::Text(identity.total_storage.clone()),
        BuildFingerprint => FieldValue::Text(identity.build_fingerprint.clone()),
        SecurityPatchLevel => FieldValue::Text(identity.security_patch_level.clone()),
        OsVersion => FieldValue::Text(identity.os_version.clone()),
        BatteryLevel => FieldValue::Count(telemetry.battery_level.map(u64::from)),
        Location => FieldValue::Text(telemetry.location.clone()),
        AppInventory => FieldValue::Count(telemetry.installed_app_count.map(u64::from)),
    }
}

/// Point-in-time observation of the device, sent with every heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device_id: DeviceId,
    #[serde(default)]
    pub device_class: DeviceClass,
    pub identity: IdentityFields,
    pub security: SecurityFlags,
    #[serde(default)]
    pub telemetry: Telemetry,
    pub captured_at: DateTime<Utc>,
}

impl DeviceSnapshot {
    pub fn field_value(&self, field: TrackedField) -> FieldValue {
        field_value(&self.identity, &self.security, &self.telemetry, field)
    }
}

/// Reference snapshot captured at registration.
///
/// Created once. Replacing it goes through an explicit re-baseline that
/// bumps `revision` and records a note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBaseline {
    pub device_id: DeviceId,
    pub device_class: DeviceClass,
    pub identity: IdentityFields,
    pub security: SecurityFlags,
    pub telemetry: Telemetry,
    pub captured_at: DateTime<Utc>,
    pub revision: u32,
    pub rebaseline_note: Option<String>,
}

impl DeviceBaseline {
    pub fn from_snapshot(snapshot: &DeviceSnapshot) -> Self {
        Self {
            device_id: snapshot.device_id.clone(),
            device_class: snapshot.device_class,
            identity: snapshot.identity.clone(),
            security: snapshot.security.clone(),
            telemetry: snapshot.telemetry.clone(),
            captured_at: snapshot.captured_at,
            revision: 1,
            rebaseline_note: None,
        }
    }

    /// Successor baseline for an audited re-baseline.
    pub fn rebaselined(&self, snapshot: &DeviceSnapshot, note: impl Into<String>) -> Self {
        Self {
            revision: self.revision + 1,
            rebaseline_note: Some(note.into()),
            ..Self::from_snapshot(snapshot)
        }
    }

    pub fn field_value(&self, field: TrackedField) -> FieldValue {
        field_value(&self.identity, &self.security, &self.telemetry, field)
    }

    /// Whether any tracked field carries a value.
    pub fn has_data(&self) -> bool {
        TrackedField::ALL
            .iter()
            .any(|field| !self.field_value(*field).is_empty())
    }
}
