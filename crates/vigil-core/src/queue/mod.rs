//! Queue module: task ordering, dedupe gate, state transitions and retry policy.

mod memory;
mod retry;

pub use memory::TaskQueue;
pub use retry::RetryPolicy;

use crate::domain::TaskId;

/// Why a submission was refused without creating a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// A non-terminal task already owns the dedupe key.
    Duplicate { existing: TaskId },
    /// The queue holds `capacity` non-terminal tasks.
    Capacity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted(TaskId),
    Rejected(RejectReason),
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted(_))
    }

    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            SubmitOutcome::Accepted(id) => Some(*id),
            SubmitOutcome::Rejected(_) => None,
        }
    }
}

/// Size limits enforced at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Max non-terminal tasks.
    pub capacity: usize,
    /// Max entity ids per task payload.
    pub max_payload: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            capacity: 256,
            max_payload: 32,
        }
    }
}
