//! Decision model: what happens to a task after a failed attempt.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// The next action for a failed task.
///
/// Produced by `TaskQueue::mark_failed`, which has already applied it to the
/// task record; the executor only acts on the timing.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The task is `failed_retryable` and may re-enter `pending` at `retry_at`.
    Retry {
        retry_at: DateTime<Utc>,
        delay: Duration,
    },

    /// The task is `dead`; its dedupe key has been released.
    MarkDead { reason: String },
}

impl Decision {
    pub fn is_retry(&self) -> bool {
        matches!(self, Decision::Retry { .. })
    }
}
