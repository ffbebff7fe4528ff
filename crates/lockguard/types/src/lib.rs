//! Core types for Lockguard.
//!
//! This crate holds the data model shared by every Lockguard crate:
//! lock records, violation reports, payment schedules, offline events,
//! device baselines and the heartbeat wire contract exchanged with the
//! remote service.

pub mod device;
pub mod event;
pub mod heartbeat;
pub mod ids;
pub mod lock;
pub mod schedule;
pub mod violation;

pub use device::{
    DeviceBaseline, DeviceClass, DeviceSnapshot, FieldValue, IdentityFields, SecurityFlags,
    Telemetry,
};
pub use event::{DiscardCause, EventKind, OfflineEvent, SyncStatus};
pub use heartbeat::{
    reason_from_server, HeartbeatRequest, HeartbeatResponse, LockCommand, ProtocolError,
    RemoteDirective, TamperSignalRequest,
};
pub use ids::{DeviceId, EventId, LockRecordId};
pub use lock::{LockRecord, LockState, ReasonCode};
pub use schedule::PaymentSchedule;
pub use violation::{
    BaselineStatus, LockTypeDecision, Severity, TrackedField, Violation, ViolationReport,
};
