//! Task state machine.

use serde::{Deserialize, Serialize};

/// Task state.
///
/// State transitions:
/// - Pending -> Running -> Completed
/// - Pending -> Running -> FailedRetryable -> Pending (loop until max_attempts)
/// - Pending -> Running -> Dead (non-retryable kind, or attempts exhausted)
///
/// `FailedRetryable -> Pending` is the only backward edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting to be picked up by the queue's executor.
    Pending,

    /// Currently being executed.
    Running,

    /// Finished successfully.
    Completed,

    /// Failed with a retryable kind; waiting out its backoff.
    FailedRetryable,

    /// Failed permanently.
    Dead,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Dead)
    }

    /// Does a task in this state still own its dedupe key?
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, FailedRetryable)
                | (Running, Dead)
                | (FailedRetryable, Pending)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use TaskState::*;

    #[rstest]
    #[case::start(Pending, Running)]
    #[case::complete(Running, Completed)]
    #[case::retry(Running, FailedRetryable)]
    #[case::dead(Running, Dead)]
    #[case::requeue(FailedRetryable, Pending)]
    fn allowed_transitions(#[case] from: TaskState, #[case] to: TaskState) {
        assert!(from.can_transition_to(to));
    }

    #[rstest]
    #[case::skip_running(Pending, Completed)]
    #[case::resurrect_dead(Dead, Pending)]
    #[case::reopen_completed(Completed, Running)]
    #[case::back_to_pending(Running, Pending)]
    #[case::retry_without_pending(FailedRetryable, Running)]
    fn forbidden_transitions(#[case] from: TaskState, #[case] to: TaskState) {
        assert!(!from.can_transition_to(to));
    }

    #[test]
    fn only_completed_and_dead_are_terminal() {
        assert!(Completed.is_terminal());
        assert!(Dead.is_terminal());
        assert!(Pending.is_active());
        assert!(Running.is_active());
        assert!(FailedRetryable.is_active());
    }
}
