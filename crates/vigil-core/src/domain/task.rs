//! Task model: queue names, dedupe keys, typed payloads and the task record.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::EntityId;
use super::errors::{TaskError, VigilError};
use super::ids::TaskId;
use super::state::TaskState;

/// Name of a queue. Each queue has exactly one executor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for QueueName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identity of a unit of work for duplicate suppression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupeKey(String);

impl DedupeKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// `<kind-label>:<sorted ids>`, so batches with identical membership collide
    /// no matter how their payload is ordered.
    pub fn for_kind(kind: &TaskKind) -> Self {
        let mut ids: Vec<&str> = kind.entity_ids().iter().map(EntityId::as_str).collect();
        ids.sort_unstable();
        Self(format!("{}:{}", kind.label(), ids.join(",")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Closed set of task payloads.
///
/// Payload order is execution order; the handler receives ids in this order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Recompute the analysis for a batch of entities.
    AnalyzeBatch { entity_ids: Vec<EntityId> },

    /// Pull fresh upstream data for entities from a named source.
    RefreshData {
        entity_ids: Vec<EntityId>,
        source: String,
    },
}

impl TaskKind {
    pub fn analyze(entity_ids: Vec<EntityId>) -> Self {
        TaskKind::AnalyzeBatch { entity_ids }
    }

    pub fn refresh(entity_ids: Vec<EntityId>, source: impl Into<String>) -> Self {
        TaskKind::RefreshData {
            entity_ids,
            source: source.into(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::AnalyzeBatch { .. } => "analyze_batch",
            TaskKind::RefreshData { .. } => "refresh_data",
        }
    }

    pub fn entity_ids(&self) -> &[EntityId] {
        match self {
            TaskKind::AnalyzeBatch { entity_ids } | TaskKind::RefreshData { entity_ids, .. } => {
                entity_ids
            }
        }
    }

    /// Schema check run at submission time.
    pub fn validate(&self, max_payload: usize) -> Result<(), VigilError> {
        let ids = self.entity_ids();
        if ids.is_empty() {
            return Err(VigilError::Validation(format!(
                "{} payload has no entity ids",
                self.label()
            )));
        }
        if ids.len() > max_payload {
            return Err(VigilError::Validation(format!(
                "{} payload has {} entity ids (max {max_payload})",
                self.label(),
                ids.len()
            )));
        }
        let mut seen = HashSet::with_capacity(ids.len());
        if let Some(dup) = ids.iter().find(|id| !seen.insert(*id)) {
            return Err(VigilError::Validation(format!(
                "{} payload lists '{dup}' more than once",
                self.label()
            )));
        }
        if let TaskKind::RefreshData { source, .. } = self
            && source.trim().is_empty()
        {
            return Err(VigilError::Validation(
                "refresh_data payload has an empty source".into(),
            ));
        }
        Ok(())
    }
}

/// Default priority for scheduler-created tasks.
pub const DEFAULT_PRIORITY: i32 = 0;

/// A submission request. The queue assigns id, sequence and timestamps.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub kind: TaskKind,
    pub priority: i32,
    pub dedupe_key: DedupeKey,
}

impl NewTask {
    pub fn new(kind: TaskKind) -> Self {
        let dedupe_key = DedupeKey::for_kind(&kind);
        Self {
            kind,
            priority: DEFAULT_PRIORITY,
            dedupe_key,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dedupe_key(mut self, key: DedupeKey) -> Self {
        self.dedupe_key = key;
        self
    }
}

/// Task record: the single source of truth for a task's state.
///
/// All transitions go through the methods below, which refuse anything the
/// state machine does not allow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub queue_name: QueueName,
    pub dedupe_key: DedupeKey,
    pub kind: TaskKind,
    pub priority: i32,
    pub state: TaskState,

    /// Executions started so far (incremented on every `Pending -> Running`).
    pub attempts: u32,
    pub max_attempts: u32,

    /// Submission order within the queue; FIFO tie-break after `created_at`.
    pub sequence: u64,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    /// When a `FailedRetryable` task may re-enter `Pending`.
    pub retry_at: Option<DateTime<Utc>>,

    pub last_error: Option<TaskError>,
}

impl Task {
    pub fn new(
        task_id: TaskId,
        queue_name: QueueName,
        request: NewTask,
        max_attempts: u32,
        sequence: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            queue_name,
            dedupe_key: request.dedupe_key,
            kind: request.kind,
            priority: request.priority,
            state: TaskState::Pending,
            attempts: 0,
            max_attempts,
            sequence,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
            retry_at: None,
            last_error: None,
        }
    }

    /// Entity ids in execution order.
    pub fn payload(&self) -> &[EntityId] {
        self.kind.entity_ids()
    }

    fn transition(&mut self, next: TaskState, now: DateTime<Utc>) -> Result<(), VigilError> {
        if !self.state.can_transition_to(next) {
            return Err(VigilError::InvalidTransition {
                task_id: self.task_id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    /// Pending -> Running (counts an attempt).
    pub fn start_attempt(&mut self, now: DateTime<Utc>) -> Result<(), VigilError> {
        self.transition(TaskState::Running, now)?;
        self.attempts += 1;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> Result<(), VigilError> {
        self.transition(TaskState::Completed, now)?;
        self.finished_at = Some(now);
        self.retry_at = None;
        Ok(())
    }

    pub fn schedule_retry(
        &mut self,
        retry_at: DateTime<Utc>,
        error: TaskError,
        now: DateTime<Utc>,
    ) -> Result<(), VigilError> {
        self.transition(TaskState::FailedRetryable, now)?;
        self.retry_at = Some(retry_at);
        self.last_error = Some(error);
        Ok(())
    }

    pub fn mark_dead(&mut self, error: TaskError, now: DateTime<Utc>) -> Result<(), VigilError> {
        self.transition(TaskState::Dead, now)?;
        self.finished_at = Some(now);
        self.retry_at = None;
        self.last_error = Some(error);
        Ok(())
    }

    /// FailedRetryable -> Pending.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<(), VigilError> {
        self.transition(TaskState::Pending, now)?;
        self.retry_at = None;
        Ok(())
    }
}
