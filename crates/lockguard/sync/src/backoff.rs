//! Bounded exponential backoff for failed sync passes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_secs: u64,
    /// Cap on any single delay.
    pub max_delay_secs: u64,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 5,
            max_delay_secs: 300,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry `attempt` (1-based), capped at the maximum.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let max_delay = Duration::from_secs(self.max_delay_secs);
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.initial_delay_secs as f64 * self.multiplier.max(1.0).powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= max_delay.as_secs_f64() {
            return max_delay;
        }
        Duration::from_secs_f64(delay_secs).min(max_delay)
    }
}

/// Retry state across consecutive failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Record a failure and return the delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.config.delay_for_attempt(self.attempt)
    }

    /// Record a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consecutive failures so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
