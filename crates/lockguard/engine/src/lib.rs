//! Lock decision core for Lockguard.
//!
//! - [`ViolationDetector`] classifies deviations from the device baseline.
//! - [`PaymentScheduleEvaluator`] turns the payment schedule into a lock intent.
//! - [`LockDecisionEngine`] merges both with remote commands, commits
//!   transitions to the lock history and drives enforcement.
//! - [`StateValidator`] checks and repairs the lock history without ever
//!   weakening a lock.

pub mod baseline;
pub mod clock;
pub mod detector;
pub mod enforcement;
pub mod engine;
pub mod error;
pub mod schedule;
pub mod secret;
pub mod validator;

pub use clock::{Clock, ManualClock, SystemClock};
pub use detector::{DetectorConfig, ViolationDetector};
pub use enforcement::{
    EnforcementAck, EnforcementCapabilities, EnforcementCollaborator, EnforcementError,
    RecordingEnforcement,
};
pub use engine::{
    resolve_target, BootOutcome, Decision, DecisionSink, LockDecisionEngine, Signals, Target,
    Trigger, UnlockOutcome,
};
pub use error::{EngineError, Result};
pub use schedule::{
    Countdown, PaymentScheduleEvaluator, ScheduleConfig, ScheduleEvaluation, ScheduleIntent,
};
pub use validator::{
    RepairAction, StateValidator, ValidationFinding, ValidationIssue, ValidationReport,
};
