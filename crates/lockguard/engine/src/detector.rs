//! Baseline comparison and severity classification.
//!
//! Detection is a pure function of a reference (the registration baseline,
//! or the previously echoed snapshot) and the incoming snapshot. Values are
//! normalized before comparison so that formatting noise never produces a
//! violation.

use chrono::{DateTime, Utc};
use lockguard_types::{
    BaselineStatus, DeviceBaseline, DeviceClass, DeviceSnapshot, FieldValue, Severity,
    TrackedField, Violation, ViolationReport,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Detector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Installed RAM may read this much lower than the baseline without a
    /// violation. Firmware reserves memory differently across boots.
    pub ram_tolerance_gb: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            ram_tolerance_gb: 1.0,
        }
    }
}

enum Comparison {
    Match,
    Mismatch,
    MatchWithWarning(String),
}

/// Compares device snapshots against a reference and classifies deviations.
#[derive(Debug, Clone, Default)]
pub struct ViolationDetector {
    config: DetectorConfig,
}

impl ViolationDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    /// Compare a snapshot against the registration baseline.
    ///
    /// A missing or empty baseline produces no violations, with the status
    /// recorded in the report.
    pub fn detect(
        &self,
        baseline: Option<&DeviceBaseline>,
        snapshot: &DeviceSnapshot,
        now: DateTime<Utc>,
    ) -> ViolationReport {
        let Some(baseline) = baseline else {
            debug!("No baseline established; skipping comparison");
            return ViolationReport::without_baseline(BaselineStatus::NotEstablished);
        };
        if !baseline.has_data() {
            debug!("Baseline carries no data; skipping comparison");
            return ViolationReport::without_baseline(BaselineStatus::Empty);
        }

        self.compare(
            |field| baseline.field_value(field),
            baseline.device_class,
            snapshot,
            now,
        )
    }

    /// Compare a snapshot against the previously reported one.
    ///
    /// Catches drift between heartbeats that the baseline comparison would
    /// attribute to registration-time differences.
    pub fn detect_against_previous(
        &self,
        previous: &DeviceSnapshot,
        snapshot: &DeviceSnapshot,
        now: DateTime<Utc>,
    ) -> ViolationReport {
        self.compare(
            |field| previous.field_value(field),
            previous.device_class,
            snapshot,
            now,
        )
    }

    fn compare<F>(
        &self,
        reference: F,
        class: DeviceClass,
        snapshot: &DeviceSnapshot,
        now: DateTime<Utc>,
    ) -> ViolationReport
    where
        F: Fn(TrackedField) -> FieldValue,
    {
        let mut violations = Vec::new();
        let mut warnings = Vec::new();

        for field in TrackedField::ALL {
            if class == DeviceClass::Desktop && field.is_desktop_skipped() {
                continue;
            }

            let incoming = snapshot.field_value(field);
            // Fields absent from the incoming snapshot are not compared.
            if incoming.is_empty() {
                continue;
            }
            let expected = reference(field);

            let (comparison, severity) = match field {
                TrackedField::DeviceImeis => (compare_imeis(&expected, &incoming), field.severity()),
                TrackedField::InstalledRam if class == DeviceClass::Desktop => (
                    self.compare_ram(&expected, &incoming),
                    Severity::High,
                ),
                _ => (compare_values(&expected, &incoming), field.severity()),
            };

            match comparison {
                Comparison::Match => {}
                Comparison::MatchWithWarning(warning) => warnings.push(warning),
                Comparison::Mismatch => violations.push(Violation {
                    field,
                    severity,
                    reason: field.mismatch_reason().to_string(),
                    detected_at: now,
                }),
            }
        }

        let report = ViolationReport::from_violations(violations, warnings);
        debug!(
            violations = report.violations.len(),
            decision = ?report.lock_type_decision,
            "Baseline comparison complete"
        );
        report
    }

    fn compare_ram(&self, expected: &FieldValue, incoming: &FieldValue) -> Comparison {
        let (FieldValue::Text(expected), FieldValue::Text(incoming)) = (expected, incoming) else {
            return compare_values(expected, incoming);
        };
        match (
            expected.as_deref().and_then(parse_gigabytes),
            incoming.as_deref().and_then(parse_gigabytes),
        ) {
            (Some(baseline_gb), Some(current_gb)) => {
                if current_gb < baseline_gb - self.config.ram_tolerance_gb {
                    Comparison::Mismatch
                } else {
                    Comparison::Match
                }
            }
            // Unparseable values fall back to plain comparison.
            _ => compare_values(
                &FieldValue::Text(expected.clone()),
                &FieldValue::Text(incoming.clone()),
            ),
        }
    }
}

/// Absent, blank, `false` and zero all count as "unset".
fn is_unset(value: &FieldValue) -> bool {
    match value {
        FieldValue::Flag(v) => !v.unwrap_or(false),
        FieldValue::Count(v) => v.unwrap_or(0) == 0,
        other => other.is_empty(),
    }
}

fn normalize_text(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    let has_unit = ["kb", "mb", "gb", "tb"]
        .iter()
        .any(|unit| lowered.ends_with(unit));
    if has_unit {
        lowered.chars().filter(|c| !c.is_whitespace()).collect()
    } else {
        lowered
    }
}

fn normalize_list(values: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = values
        .iter()
        .map(|v| normalize_text(v))
        .filter(|v| !v.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized
}

fn compare_values(expected: &FieldValue, incoming: &FieldValue) -> Comparison {
    if is_unset(expected) && is_unset(incoming) {
        return Comparison::Match;
    }

    let equal = match (expected, incoming) {
        (FieldValue::Text(a), FieldValue::Text(b)) => {
            a.as_deref().map(normalize_text) == b.as_deref().map(normalize_text)
        }
        (FieldValue::List(a), FieldValue::List(b)) => normalize_list(a) == normalize_list(b),
        (FieldValue::Flag(a), FieldValue::Flag(b)) => a.unwrap_or(false) == b.unwrap_or(false),
        (FieldValue::Count(a), FieldValue::Count(b)) => a == b,
        _ => false,
    };

    if equal {
        Comparison::Match
    } else {
        Comparison::Mismatch
    }
}

/// Incoming IMEIs must be a subset of the registered ones.
///
/// A new IMEI means a modem or board swap. Fewer IMEIs (a SIM slot not
/// reporting) only warns.
fn compare_imeis(expected: &FieldValue, incoming: &FieldValue) -> Comparison {
    let (FieldValue::List(expected), FieldValue::List(incoming)) = (expected, incoming) else {
        return compare_values(expected, incoming);
    };
    let registered = normalize_list(expected);
    let current = normalize_list(incoming);
    if registered.is_empty() || current.is_empty() {
        return Comparison::Match;
    }

    if current.iter().any(|imei| !registered.contains(imei)) {
        return Comparison::Mismatch;
    }
    if current.len() < registered.len() {
        return Comparison::MatchWithWarning(format!(
            "device_imeis: {} of {} registered IMEIs reported",
            current.len(),
            registered.len()
        ));
    }
    Comparison::Match
}

/// Parse values like "8 GB", "7.6gb" or "8192 MB" into gigabytes.
fn parse_gigabytes(value: &str) -> Option<f64> {
    let compact: String = value
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let (number, scale) = if let Some(n) = compact.strip_suffix("gb") {
        (n, 1.0)
    } else if let Some(n) = compact.strip_suffix("mb") {
        (n, 1.0 / 1024.0)
    } else if let Some(n) = compact.strip_suffix("tb") {
        (n, 1024.0)
    } else {
        (compact.as_str(), 1.0)
    };
    number.parse::<f64>().ok().map(|n| n * scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockguard_types::{DeviceId, IdentityFields, LockTypeDecision, SecurityFlags, Telemetry};

    fn snapshot(class: DeviceClass) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: DeviceId::new("dev-1"),
            device_class: class,
            identity: IdentityFields {
                serial_number: Some("R58N123ABC".to_string()),
                device_imeis: vec!["356938035643809".to_string(), "356938035643817".to_string()],
                installed_ram: Some("8 GB".to_string()),
                total_storage: Some("128 GB".to_string()),
                build_fingerprint: Some("samsung/a52/a52:13/TP1A/release-keys".to_string()),
                security_patch_level: Some("2026-01-01".to_string()),
                os_version: Some("13".to_string()),
            },
            security: SecurityFlags {
                is_device_rooted: Some(false),
                is_usb_debugging_enabled: Some(false),
                is_developer_mode_enabled: Some(false),
                is_bootloader_unlocked: Some(false),
                is_custom_rom: Some(false),
            },
            telemetry: Telemetry::default(),
            captured_at: Utc::now(),
        }
    }

    fn baseline(class: DeviceClass) -> DeviceBaseline {
        DeviceBaseline::from_snapshot(&snapshot(class))
    }

    #[test]
    fn test_identical_snapshot_is_clean() {
        let detector = ViolationDetector::default();
        let report = detector.detect(Some(&baseline(DeviceClass::Mobile)), &snapshot(DeviceClass::Mobile), Utc::now());
        assert!(report.is_clean());
        assert_eq!(report.lock_type_decision, LockTypeDecision::NoLock);
        assert_eq!(report.baseline_status, BaselineStatus::Established);
    }

    #[test]
    fn test_missing_or_empty_baseline_reports_status() {
        let detector = ViolationDetector::default();
        let current = snapshot(DeviceClass::Mobile);

        let report = detector.detect(None, &current, Utc::now());
        assert_eq!(report.baseline_status, BaselineStatus::NotEstablished);
        assert!(report.is_clean());

        let mut empty = baseline(DeviceClass::Mobile);
        empty.identity = IdentityFields::default();
        empty.security = SecurityFlags::default();
        let report = detector.detect(Some(&empty), &current, Utc::now());
        assert_eq!(report.baseline_status, BaselineStatus::Empty);
        assert!(report.is_clean());
    }

    #[test]
    fn test_formatting_noise_is_ignored() {
        let detector = ViolationDetector::default();
        let mut current = snapshot(DeviceClass::Mobile);
        current.identity.serial_number = Some("  r58n123abc ".to_string());
        current.identity.installed_ram = Some("8GB".to_string());
        current.identity.device_imeis.reverse();

        let report = detector.detect(Some(&baseline(DeviceClass::Mobile)), &current, Utc::now());
        assert!(report.is_clean(), "{:?}", report.violations);
    }

    #[test]
    fn test_root_is_high_and_hard_locks() {
        let detector = ViolationDetector::default();
        let mut current = snapshot(DeviceClass::Mobile);
        current.security.is_device_rooted = Some(true);

        let report = detector.detect(Some(&baseline(DeviceClass::Mobile)), &current, Utc::now());
        assert_eq!(report.lock_type_decision, LockTypeDecision::HardLock);
        assert_eq!(report.fields_with(Severity::High), vec![TrackedField::IsDeviceRooted]);
        assert_eq!(
            report.tamper_summary().as_deref(),
            Some("Device security compromised: is_device_rooted")
        );
    }

    #[test]
    fn test_unreported_flag_is_not_a_change() {
        let detector = ViolationDetector::default();
        let mut reference = baseline(DeviceClass::Mobile);
        reference.security.is_custom_rom = None;
        let current = snapshot(DeviceClass::Mobile);

        let report = detector.detect(Some(&reference), &current, Utc::now());
        assert!(report.is_clean());
    }

    #[test]
    fn test_medium_drift_soft_locks() {
        let detector = ViolationDetector::default();
        let mut current = snapshot(DeviceClass::Mobile);
        current.identity.security_patch_level = Some("2026-02-01".to_string());

        let report = detector.detect(Some(&baseline(DeviceClass::Mobile)), &current, Utc::now());
        assert_eq!(report.lock_type_decision, LockTypeDecision::SoftLock);
        assert_eq!(report.tamper_summary(), None);
    }

    #[test]
    fn test_low_drift_never_locks() {
        let detector = ViolationDetector::default();
        let mut current = snapshot(DeviceClass::Mobile);
        current.telemetry.battery_level = Some(41);
        current.telemetry.location = Some("-1.28,36.82".to_string());

        let report = detector.detect(Some(&baseline(DeviceClass::Mobile)), &current, Utc::now());
        assert_eq!(report.violations.len(), 2);
        assert_eq!(report.lock_type_decision, LockTypeDecision::NoLock);
    }

    #[test]
    fn test_imei_subset_rules() {
        let detector = ViolationDetector::default();
        let reference = baseline(DeviceClass::Mobile);

        let mut fewer = snapshot(DeviceClass::Mobile);
        fewer.identity.device_imeis = vec!["356938035643809".to_string()];
        let report = detector.detect(Some(&reference), &fewer, Utc::now());
        assert!(report.is_clean());
        assert_eq!(report.warnings.len(), 1);

        let mut swapped = snapshot(DeviceClass::Mobile);
        swapped.identity.device_imeis = vec!["356938035643809".to_string(), "490154203237518".to_string()];
        let report = detector.detect(Some(&reference), &swapped, Utc::now());
        assert_eq!(report.fields_with(Severity::High), vec![TrackedField::DeviceImeis]);
    }

    #[test]
    fn test_desktop_ram_tolerance() {
        let detector = ViolationDetector::default();
        let mut reference = baseline(DeviceClass::Desktop);
        reference.identity.installed_ram = Some("16 GB".to_string());

        let mut current = snapshot(DeviceClass::Desktop);
        current.identity.installed_ram = Some("15.4 GB".to_string());
        assert!(detector.detect(Some(&reference), &current, Utc::now()).is_clean());

        current.identity.installed_ram = Some("32 GB".to_string());
        assert!(detector.detect(Some(&reference), &current, Utc::now()).is_clean());

        current.identity.installed_ram = Some("8 GB".to_string());
        let report = detector.detect(Some(&reference), &current, Utc::now());
        assert_eq!(report.lock_type_decision, LockTypeDecision::HardLock);
        assert_eq!(report.fields_with(Severity::High), vec![TrackedField::InstalledRam]);
    }

    #[test]
    fn test_desktop_skips_mobile_only_fields() {
        let detector = ViolationDetector::default();
        let reference = baseline(DeviceClass::Desktop);
        let mut current = snapshot(DeviceClass::Desktop);
        current.security.is_usb_debugging_enabled = Some(true);
        current.identity.serial_number = Some("OTHER".to_string());
        current.identity.total_storage = Some("256 GB".to_string());

        assert!(detector.detect(Some(&reference), &current, Utc::now()).is_clean());
    }

    #[test]
    fn test_detect_against_previous_snapshot() {
        let detector = ViolationDetector::default();
        let previous = snapshot(DeviceClass::Mobile);
        let mut current = snapshot(DeviceClass::Mobile);
        current.security.is_bootloader_unlocked = Some(true);

        let report = detector.detect_against_previous(&previous, &current, Utc::now());
        assert_eq!(report.fields_with(Severity::High), vec![TrackedField::IsBootloaderUnlocked]);
    }

    #[test]
    fn test_parse_gigabytes() {
        assert_eq!(parse_gigabytes("8 GB"), Some(8.0));
        assert_eq!(parse_gigabytes("7.5gb"), Some(7.5));
        assert_eq!(parse_gigabytes("2048 MB"), Some(2.0));
        assert_eq!(parse_gigabytes("lots"), None);
    }
}
