//! Heartbeat wire contract.
//!
//! Requests are serialized once, stored verbatim in the offline queue and
//! replayed byte-for-byte. Responses are parsed into a validated
//! [`RemoteDirective`]; anything that does not parse is a [`ProtocolError`]
//! and must be discarded without touching the lock state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::device::DeviceSnapshot;
use crate::ids::DeviceId;
use crate::lock::ReasonCode;
use crate::violation::{LockTypeDecision, Violation};

/// Heartbeat request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub device_id: DeviceId,
    /// Monotonic heartbeat sequence number.
    pub sequence: u64,
    pub snapshot: DeviceSnapshot,
    pub sent_at: DateTime<Utc>,
}

/// Tamper signal request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TamperSignalRequest {
    pub device_id: DeviceId,
    pub sequence: u64,
    pub violations: Vec<Violation>,
    pub lock_type_decision: LockTypeDecision,
    pub tamper_summary: Option<String>,
    pub detected_at: DateTime<Utc>,
}

/// Heartbeat response body as sent by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub is_locked: Option<bool>,
    pub lock_reason: Option<String>,
    /// ISO-8601 date-time with offset.
    pub next_payment_date_time: Option<String>,
    pub unlock_secret: Option<String>,
    #[serde(default)]
    pub deactivation_requested: bool,
    pub deactivation_reason: Option<String>,
    #[serde(default)]
    pub changed_fields: Vec<String>,
    pub server_time: Option<String>,
}

/// Errors in a server response. The response is discarded; lock state is kept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed response body: {0}")]
    Malformed(String),

    #[error("invalid payment due time '{value}': {reason}")]
    InvalidDueTime { value: String, reason: String },

    #[error("invalid server time '{0}'")]
    InvalidServerTime(String),

    #[error("empty unlock secret")]
    EmptySecret,

    #[error("lock reason present on an unlock directive")]
    ReasonWithoutLock,
}

/// Explicit remote lock or unlock command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockCommand {
    Lock { reason: ReasonCode },
    Unlock,
}

/// Validated, authoritative content of a server response.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteDirective {
    pub lock: Option<LockCommand>,
    pub next_payment_at: Option<DateTime<Utc>>,
    /// Clear-text unlock password. Hashed by the engine before it is stored.
    pub unlock_secret: Option<String>,
    pub deactivation_requested: bool,
    pub deactivation_reason: Option<String>,
    pub changed_fields: Vec<String>,
    pub server_time: Option<DateTime<Utc>>,
}

impl fmt::Debug for RemoteDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteDirective")
            .field("lock", &self.lock)
            .field("next_payment_at", &self.next_payment_at)
            .field("unlock_secret", &self.unlock_secret.as_ref().map(|_| "<redacted>"))
            .field("deactivation_requested", &self.deactivation_requested)
            .field("deactivation_reason", &self.deactivation_reason)
            .field("changed_fields", &self.changed_fields)
            .field("server_time", &self.server_time)
            .finish()
    }
}

impl RemoteDirective {
    /// Directive that carries nothing (plain acknowledgement).
    pub fn empty() -> Self {
        Self {
            lock: None,
            next_payment_at: None,
            unlock_secret: None,
            deactivation_requested: false,
            deactivation_reason: None,
            changed_fields: Vec::new(),
            server_time: None,
        }
    }
}

/// Map a server lock reason to a reason code.
pub fn reason_from_server(reason: Option<&str>) -> ReasonCode {
    match reason.map(|r| r.trim().to_ascii_lowercase()) {
        Some(r) if r == "payment overdue" || r == "payment_overdue" => ReasonCode::PaymentOverdue,
        Some(r) if r == "security issue" || r == "tamper" => ReasonCode::Tamper,
        _ => ReasonCode::RemoteLock,
    }
}

fn parse_instant(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value.trim()).map(|dt| dt.with_timezone(&Utc))
}

impl HeartbeatResponse {
    /// Parse and validate a raw response body.
    pub fn parse(body: &str) -> Result<RemoteDirective, ProtocolError> {
        let response: HeartbeatResponse = if body.trim().is_empty() {
            HeartbeatResponse::default()
        } else {
            serde_json::from_str(body).map_err(|e| ProtocolError::Malformed(e.to_string()))?
        };
        response.validate()
    }

    /// Validate an already-decoded response.
    pub fn validate(self) -> Result<RemoteDirective, ProtocolError> {
        let lock = match self.is_locked {
            Some(true) => Some(LockCommand::Lock {
                reason: reason_from_server(self.lock_reason.as_deref()),
            }),
            Some(false) => {
                if self.lock_reason.as_deref().is_some_and(|r| !r.trim().is_empty()) {
                    return Err(ProtocolError::ReasonWithoutLock);
                }
                Some(LockCommand::Unlock)
            }
            None => None,
        };

        let next_payment_at = self
            .next_payment_date_time
            .as_deref()
            .map(|value| {
                parse_instant(value).map_err(|e| ProtocolError::InvalidDueTime {
                    value: value.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        if self.unlock_secret.as_deref().is_some_and(|s| s.is_empty()) {
            return Err(ProtocolError::EmptySecret);
        }

        let server_time = self
            .server_time
            .as_deref()
            .map(|value| {
                parse_instant(value).map_err(|_| ProtocolError::InvalidServerTime(value.to_string()))
            })
            .transpose()?;

        Ok(RemoteDirective {
            lock,
            next_payment_at,
            unlock_secret: self.unlock_secret,
            deactivation_requested: self.deactivation_requested,
            deactivation_reason: self.deactivation_reason,
            changed_fields: self.changed_fields,
            server_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_full_response() {
        let body = r#"{
            "isLocked": true,
            "lockReason": "Payment overdue",
            "nextPaymentDateTime": "2026-02-07T23:59:00+03:00",
            "unlockSecret": "ABC123",
            "deactivationRequested": false,
            "changedFields": ["installed_ram"]
        }"#;

        let directive = HeartbeatResponse::parse(body).unwrap();
        assert_eq!(
            directive.lock,
            Some(LockCommand::Lock { reason: ReasonCode::PaymentOverdue })
        );
        assert_eq!(
            directive.next_payment_at,
            Some(Utc.with_ymd_and_hms(2026, 2, 7, 20, 59, 0).unwrap())
        );
        assert_eq!(directive.unlock_secret.as_deref(), Some("ABC123"));
        assert_eq!(directive.changed_fields, vec!["installed_ram".to_string()]);
        assert!(!format!("{:?}", directive).contains("ABC123"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            HeartbeatResponse::parse("{not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            HeartbeatResponse::parse(r#"{"nextPaymentDateTime": "tomorrow"}"#),
            Err(ProtocolError::InvalidDueTime { .. })
        ));
        assert_eq!(
            HeartbeatResponse::parse(r#"{"unlockSecret": ""}"#),
            Err(ProtocolError::EmptySecret)
        );
    }

    #[test]
    fn test_empty_body_is_plain_ack() {
        let directive = HeartbeatResponse::parse("  ").unwrap();
        assert_eq!(directive, RemoteDirective::empty());
    }

    #[test]
    fn test_server_reason_mapping() {
        assert_eq!(reason_from_server(Some("Security issue")), ReasonCode::Tamper);
        assert_eq!(reason_from_server(Some("fraud review")), ReasonCode::RemoteLock);
        assert_eq!(reason_from_server(None), ReasonCode::RemoteLock);
    }
}
