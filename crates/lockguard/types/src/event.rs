//! Offline events awaiting delivery to the heartbeat service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::EventId;

/// Kind of queued event. The queue is bounded per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Heartbeat,
    TamperSignal,
}

impl EventKind {
    pub const ALL: [EventKind; 2] = [EventKind::Heartbeat, EventKind::TamperSignal];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Heartbeat => "HEARTBEAT",
            EventKind::TamperSignal => "TAMPER_SIGNAL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "HEARTBEAT" => Some(EventKind::Heartbeat),
            "TAMPER_SIGNAL" => Some(EventKind::TamperSignal),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery status of an offline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Pending,
    Synced,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "PENDING",
            SyncStatus::Synced => "SYNCED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(SyncStatus::Pending),
            "SYNCED" => Some(SyncStatus::Synced),
            _ => None,
        }
    }
}

/// Why a pending event left the queue without being synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscardCause {
    /// Pushed out by the per-kind bound.
    Overflow,
    /// Refused by the server as invalid; replaying it cannot succeed.
    Rejected,
    /// Delivery failed on every allowed attempt.
    RetryBudgetExhausted,
}

impl DiscardCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscardCause::Overflow => "OVERFLOW",
            DiscardCause::Rejected => "REJECTED",
            DiscardCause::RetryBudgetExhausted => "RETRY_BUDGET_EXHAUSTED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "OVERFLOW" => Some(DiscardCause::Overflow),
            "REJECTED" => Some(DiscardCause::Rejected),
            "RETRY_BUDGET_EXHAUSTED" => Some(DiscardCause::RetryBudgetExhausted),
            _ => None,
        }
    }
}

impl fmt::Display for DiscardCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A heartbeat or tamper payload recorded before any delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineEvent {
    pub id: EventId,
    pub kind: EventKind,
    /// Monotonic sequence number across all kinds.
    pub sequence: u64,
    /// Exact serialized request body; replayed verbatim.
    pub payload: String,
    pub recorded_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
    pub synced_at: Option<DateTime<Utc>>,
    /// Deliveries that reached the server without being accepted.
    #[serde(default)]
    pub attempts: u32,
}

impl OfflineEvent {
    pub fn pending(kind: EventKind, sequence: u64, payload: String, recorded_at: DateTime<Utc>) -> Self {
        Self {
            id: EventId::generate(),
            kind,
            sequence,
            payload,
            recorded_at,
            sync_status: SyncStatus::Pending,
            synced_at: None,
            attempts: 0,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.sync_status == SyncStatus::Pending
    }
}
