//! Derived per-queue counters.

use serde::Serialize;

use super::state::TaskState;
use super::task::{QueueName, Task};

/// Counts by state for one queue. Computed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue: QueueName,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub retrying: usize,
    pub dead: usize,
    /// `retrying + dead`.
    pub failed_count: usize,
}

impl QueueStats {
    pub fn from_tasks<'a>(queue: QueueName, tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut stats = Self {
            queue,
            pending: 0,
            running: 0,
            completed: 0,
            retrying: 0,
            dead: 0,
            failed_count: 0,
        };
        for task in tasks {
            match task.state {
                TaskState::Pending => stats.pending += 1,
                TaskState::Running => stats.running += 1,
                TaskState::Completed => stats.completed += 1,
                TaskState::FailedRetryable => stats.retrying += 1,
                TaskState::Dead => stats.dead += 1,
            }
        }
        stats.failed_count = stats.retrying + stats.dead;
        stats
    }

    /// Tasks that still own a dedupe key.
    pub fn active(&self) -> usize {
        self.pending + self.running + self.retrying
    }
}
