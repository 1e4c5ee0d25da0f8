// Retry policy for transient action dispatch failures
//
// Attempts are counted on the enrollment itself, so a retry survives restarts:
// the executor parks the enrollment with `next_step_at = now + delay` and the
// scheduler picks it up again.

use chrono::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts per step (including the first one)
    pub max_attempts: u32,
    pub initial_interval_secs: i64,
    pub max_interval_secs: i64,
    pub backoff_coefficient: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// 3 attempts, 1 minute initial delay doubling up to 1 hour
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_interval_secs: 60,
            max_interval_secs: 3600,
            backoff_coefficient: 2.0,
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval_secs: 0,
            max_interval_secs: 0,
            backoff_coefficient: 1.0,
        }
    }

    /// Whether another attempt is allowed after `failures` failed attempts
    pub fn has_attempts_remaining(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }

    /// Delay before the retry that follows the `failures`-th failure (1-based)
    pub fn delay_after_failure(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1) as i32;
        let base = self.initial_interval_secs as f64 * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval_secs as f64).max(0.0);
        Duration::seconds(capped.round() as i64)
    }
}
