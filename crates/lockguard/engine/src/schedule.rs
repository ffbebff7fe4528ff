//! Payment schedule evaluation.
//!
//! Pure function of the stored schedule and the current wall-clock time.
//! The decision engine re-runs it on a local timer, so escalation from
//! reminder to hard lock happens by elapsed time even while offline.

use chrono::{DateTime, Duration, Utc};
use lockguard_types::PaymentSchedule;
use serde::{Deserialize, Serialize};

/// Lock intent derived from the payment schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleIntent {
    Unlocked,
    SoftLockReminder,
    HardLockPayment,
}

/// Remaining (or overdue) time until the next due time, for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Countdown {
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
    /// The due time has passed; the components count time since it.
    pub overdue: bool,
}

impl Countdown {
    fn between(now: DateTime<Utc>, due: DateTime<Utc>) -> Self {
        let delta = due - now;
        let overdue = delta < Duration::zero();
        let secs = delta.num_seconds().abs();
        Self {
            days: secs / 86_400,
            hours: (secs % 86_400) / 3_600,
            minutes: (secs % 3_600) / 60,
            overdue,
        }
    }
}

/// Result of evaluating the schedule at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEvaluation {
    pub intent: ScheduleIntent,
    pub due_at: Option<DateTime<Utc>>,
    pub countdown: Option<Countdown>,
    /// A password unlock is currently possible.
    pub unlock_available: bool,
    /// The current due time was settled by a password unlock.
    pub settled: bool,
}

impl ScheduleEvaluation {
    fn unscheduled() -> Self {
        Self {
            intent: ScheduleIntent::Unlocked,
            due_at: None,
            countdown: None,
            unlock_available: false,
            settled: false,
        }
    }
}

const MAX_REMINDER_WINDOW_SECS: u64 = 366 * 86_400;

/// Schedule evaluation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// How long before the due time the soft-lock reminder starts.
    pub reminder_window_secs: u64,
    /// Interval for the local re-evaluation timer.
    pub poll_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            reminder_window_secs: 86_400,
            poll_interval_secs: 60,
        }
    }
}

impl ScheduleConfig {
    pub fn reminder_window(&self) -> Duration {
        Duration::seconds(self.reminder_window_secs.min(MAX_REMINDER_WINDOW_SECS) as i64)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Maps a payment schedule and the current time to a lock intent.
#[derive(Debug, Clone)]
pub struct PaymentScheduleEvaluator {
    reminder_window: Duration,
}

impl Default for PaymentScheduleEvaluator {
    fn default() -> Self {
        Self::new(&ScheduleConfig::default())
    }
}

impl PaymentScheduleEvaluator {
    pub fn new(config: &ScheduleConfig) -> Self {
        Self {
            reminder_window: config.reminder_window(),
        }
    }

    /// Evaluate the schedule at `now`.
    ///
    /// - `now >= due` gives a hard lock.
    /// - `due - now <= reminder window` gives a soft-lock reminder.
    /// - Anything else, a missing schedule, or a settled due time is unlocked.
    pub fn evaluate(
        &self,
        schedule: Option<&PaymentSchedule>,
        now: DateTime<Utc>,
    ) -> ScheduleEvaluation {
        let Some(schedule) = schedule else {
            return ScheduleEvaluation::unscheduled();
        };

        let due = schedule.next_payment_at;
        let settled = schedule.is_settled();
        let intent = if settled {
            ScheduleIntent::Unlocked
        } else if now >= due {
            ScheduleIntent::HardLockPayment
        } else if due - now <= self.reminder_window {
            ScheduleIntent::SoftLockReminder
        } else {
            ScheduleIntent::Unlocked
        };

        ScheduleEvaluation {
            intent,
            due_at: Some(due),
            countdown: Some(Countdown::between(now, due)),
            unlock_available: schedule.unlock_secret_hash.is_some(),
            settled,
        }
    }
}
