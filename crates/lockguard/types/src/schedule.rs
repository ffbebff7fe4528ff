//! Payment schedule received from the heartbeat service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The device's current payment schedule. Single row; overwritten wholesale
/// by every successful heartbeat response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSchedule {
    /// Due time of the next installment, normalized to UTC.
    pub next_payment_at: DateTime<Utc>,

    /// Hex SHA-256 of the server-issued unlock password. Never the clear text.
    pub unlock_secret_hash: Option<String>,

    /// Due time already settled by a local password unlock.
    ///
    /// While it equals `next_payment_at` the overdue schedule no longer
    /// forces a hard lock; a schedule with a new due time clears it.
    pub settled_due_at: Option<DateTime<Utc>>,

    /// When this schedule was received.
    pub received_at: DateTime<Utc>,
}

impl PaymentSchedule {
    pub fn new(next_payment_at: DateTime<Utc>, received_at: DateTime<Utc>) -> Self {
        Self {
            next_payment_at,
            unlock_secret_hash: None,
            settled_due_at: None,
            received_at,
        }
    }

    pub fn with_secret_hash(mut self, hash: Option<String>) -> Self {
        self.unlock_secret_hash = hash;
        self
    }

    /// Whether the current due time was settled by a password unlock.
    pub fn is_settled(&self) -> bool {
        self.settled_due_at == Some(self.next_payment_at)
    }
}
