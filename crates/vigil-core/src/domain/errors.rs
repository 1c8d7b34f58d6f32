//! Errors - エラー型と分類
//!
//! - `ErrorKind` / `TaskError`: why a task attempt failed (drives retry policy)
//! - `VigilError`: why a library operation failed

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::TaskId;
use super::state::TaskState;

/// Operational classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Malformed payload. Never retried.
    Validation,
    /// Resource temporarily unavailable (rate limit, lock contention, ...).
    Transient,
    /// Exceeded the execution deadline.
    Timeout,
    /// Aborted by an operator or the watchdog, as reported by the handler.
    Cancelled,
    /// Handler defect. Never retried, kept for manual inspection.
    Fatal,
}

impl ErrorKind {
    /// Only TRANSIENT and TIMEOUT re-enter `pending`.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Transient => "TRANSIENT",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure of one task attempt.
///
/// Returned by handlers and stored as `Task::last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Library-level error.
#[derive(Debug, Error)]
pub enum VigilError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("invalid transition for {task_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("queue '{queue}' already has a running task ({running})")]
    QueueBusy { queue: String, running: TaskId },

    #[error("unknown queue '{0}'")]
    UnknownQueue(String),

    #[error("attempt for {0} is closed; checkpoint discarded")]
    AttemptClosed(TaskId),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl VigilError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }
}
