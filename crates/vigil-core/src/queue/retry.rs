//! Retry policy: decides backoff delays and whether a failure is final.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::domain::{Decision, Task, TaskError};

/// Retry policy for failed tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// `min(base_delay * 2^attempts, max_delay)`.
    ///
    /// `attempts` is the number of executions already started, so the first
    /// failure (attempts = 1) waits `2 * base_delay`:
    /// - attempts 1: 4s
    /// - attempts 2: 8s
    /// - attempts 3: 16s
    ///
    /// (base_delay = 2s)
    pub fn next_delay(&self, attempts: u32) -> Duration {
        2u32.checked_pow(attempts)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Pure decision for a failed attempt. Does not touch the task.
    pub fn decide(&self, task: &Task, error: &TaskError, now: DateTime<Utc>) -> Decision {
        if !error.is_retryable() {
            return Decision::MarkDead {
                reason: format!("{} is not retryable", error.kind),
            };
        }
        if task.attempts >= task.max_attempts {
            return Decision::MarkDead {
                reason: format!(
                    "max attempts reached: {}/{}",
                    task.attempts, task.max_attempts
                ),
            };
        }

        let delay = self.next_delay(task.attempts);
        let retry_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Decision::Retry { retry_at, delay }
    }
}
