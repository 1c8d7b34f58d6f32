//! TaskQueue: in-memory indexes over a durable TaskStore.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use super::{QueueLimits, RejectReason, RetryPolicy, SubmitOutcome};
use crate::domain::{
    Decision, DedupeKey, EntityId, NewTask, QueueName, QueueStats, Task, TaskError, TaskId,
    TaskState, VigilError,
};
use crate::ports::{Clock, IdGenerator, TaskStore};

/// Ready-heap entry. The max-heap pops the highest priority first, then the
/// earliest `created_at`, then the lowest submission sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    priority: i32,
    created_at: DateTime<Utc>,
    sequence: u64,
    task_id: TaskId,
}

impl ReadyEntry {
    fn of(task: &Task) -> Self {
        Self {
            priority: task.priority,
            created_at: task.created_at,
            sequence: task.sequence,
            task_id: task.task_id,
        }
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

struct QueueInner {
    /// All task records of this queue.
    records: HashMap<TaskId, Task>,

    /// Pending tasks. Entries whose task is no longer pending are skipped lazily.
    ready: BinaryHeap<ReadyEntry>,

    /// Dedupe key -> owning non-terminal task.
    dedupe: HashMap<DedupeKey, TaskId>,

    running: Option<TaskId>,

    next_sequence: u64,
}

impl QueueInner {
    fn empty() -> Self {
        Self {
            records: HashMap::new(),
            ready: BinaryHeap::new(),
            dedupe: HashMap::new(),
            running: None,
            next_sequence: 1,
        }
    }

    fn head(&mut self) -> Option<&Task> {
        while let Some(entry) = self.ready.peek() {
            let pending = self
                .records
                .get(&entry.task_id)
                .is_some_and(|t| t.state == TaskState::Pending);
            if pending {
                break;
            }
            self.ready.pop();
        }
        let id = self.ready.peek()?.task_id;
        self.records.get(&id)
    }

    fn record(&self, task_id: TaskId) -> Result<&Task, VigilError> {
        self.records
            .get(&task_id)
            .ok_or(VigilError::TaskNotFound(task_id))
    }

    fn release_key(&mut self, task: &Task) {
        if self.dedupe.get(&task.dedupe_key) == Some(&task.task_id) {
            self.dedupe.remove(&task.dedupe_key);
        }
    }
}

/// Ordered, deduplicated task collection for one queue.
///
/// Every mutation is applied to a copy of the record, written to the
/// `TaskStore`, and only then committed to the in-memory indexes. A storage
/// failure therefore leaves the queue exactly as it was.
///
/// The inner lock is held across the store write, so `submit` is atomic with
/// its duplicate check.
pub struct TaskQueue {
    name: QueueName,
    inner: Mutex<QueueInner>,
    notify: Notify,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    limits: QueueLimits,
    retry: RetryPolicy,
}

impl TaskQueue {
    /// Open a queue, rebuilding its indexes from everything `store` holds for it.
    pub async fn open(
        name: QueueName,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        limits: QueueLimits,
        retry: RetryPolicy,
    ) -> Result<Self, VigilError> {
        let mut tasks = store.load_queue(&name).await?;
        tasks.sort_by_key(|t| t.sequence);

        let mut inner = QueueInner::empty();
        let mut interrupted = Vec::new();
        for task in tasks {
            inner.next_sequence = inner.next_sequence.max(task.sequence + 1);
            if task.state.is_active() {
                inner.dedupe.insert(task.dedupe_key.clone(), task.task_id);
            }
            match task.state {
                TaskState::Pending => inner.ready.push(ReadyEntry::of(&task)),
                TaskState::Running if inner.running.is_none() => {
                    inner.running = Some(task.task_id);
                }
                TaskState::Running => interrupted.push(task.task_id),
                _ => {}
            }
            inner.records.insert(task.task_id, task);
        }

        // Only one running task can be resumed; any others go back through retry.
        let now = clock.now();
        for task_id in interrupted {
            warn!(queue = %name, %task_id, "TaskQueue::open: extra running task, scheduling retry");
            let mut task = inner.record(task_id)?.clone();
            task.schedule_retry(now, TaskError::transient("interrupted by restart"), now)?;
            store.save(&task).await?;
            inner.records.insert(task_id, task);
        }

        info!(
            queue = %name,
            tasks = inner.records.len(),
            active = inner.dedupe.len(),
            resumable = ?inner.running,
            "TaskQueue::open: loaded"
        );

        Ok(Self {
            name,
            inner: Mutex::new(inner),
            notify: Notify::new(),
            store,
            clock,
            ids,
            limits,
            retry,
        })
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Resolves after a submission or requeue. A notification sent while
    /// nobody waits is kept for the next waiter.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Validate, dedupe-check and insert a new task.
    ///
    /// Malformed payloads are an `Err(VigilError::Validation)`; duplicates and
    /// capacity are an `Ok(Rejected(..))`.
    pub async fn submit(&self, request: NewTask) -> Result<SubmitOutcome, VigilError> {
        request.kind.validate(self.limits.max_payload)?;

        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.dedupe.get(&request.dedupe_key) {
            debug!(queue = %self.name, key = %request.dedupe_key, %existing, "TaskQueue::submit: duplicate");
            return Ok(SubmitOutcome::Rejected(RejectReason::Duplicate {
                existing: *existing,
            }));
        }
        if inner.dedupe.len() >= self.limits.capacity {
            debug!(queue = %self.name, capacity = self.limits.capacity, "TaskQueue::submit: at capacity");
            return Ok(SubmitOutcome::Rejected(RejectReason::Capacity));
        }

        let task = Task::new(
            self.ids.generate_task_id(),
            self.name.clone(),
            request,
            self.retry.max_attempts,
            inner.next_sequence,
            self.clock.now(),
        );
        self.store.save(&task).await?;

        let task_id = task.task_id;
        inner.next_sequence += 1;
        inner.dedupe.insert(task.dedupe_key.clone(), task_id);
        inner.ready.push(ReadyEntry::of(&task));
        inner.records.insert(task_id, task);
        drop(inner);

        debug!(queue = %self.name, %task_id, "TaskQueue::submit: accepted");
        self.notify.notify_one();
        Ok(SubmitOutcome::Accepted(task_id))
    }

    /// The task that would run next, without removing it.
    pub async fn next_pending(&self) -> Option<Task> {
        self.inner.lock().await.head().cloned()
    }

    /// `pending -> running` (increments `attempts`), persisted before returning.
    pub async fn mark_running(&self, task_id: TaskId) -> Result<Task, VigilError> {
        let mut inner = self.inner.lock().await;
        if let Some(running) = inner.running {
            return Err(VigilError::QueueBusy {
                queue: self.name.to_string(),
                running,
            });
        }

        let mut task = inner.record(task_id)?.clone();
        task.start_attempt(self.clock.now())?;
        self.store.save(&task).await?;

        inner.running = Some(task_id);
        inner.records.insert(task_id, task.clone());
        debug!(queue = %self.name, %task_id, attempts = task.attempts, "TaskQueue::mark_running");
        Ok(task)
    }

    /// `running -> completed`; releases the dedupe key and the running slot.
    pub async fn mark_completed(&self, task_id: TaskId) -> Result<Task, VigilError> {
        let mut inner = self.inner.lock().await;
        let mut task = inner.record(task_id)?.clone();
        task.mark_completed(self.clock.now())?;
        self.store.save(&task).await?;

        inner.release_key(&task);
        if inner.running == Some(task_id) {
            inner.running = None;
        }
        inner.records.insert(task_id, task.clone());
        debug!(queue = %self.name, %task_id, "TaskQueue::mark_completed");
        Ok(task)
    }

    /// Apply the retry policy to a failed running task.
    ///
    /// On `Retry` the task is `failed_retryable` and keeps its dedupe key; on
    /// `MarkDead` it is `dead` and the key is released. Either way the running
    /// slot is freed.
    pub async fn mark_failed(
        &self,
        task_id: TaskId,
        error: TaskError,
    ) -> Result<Decision, VigilError> {
        let mut inner = self.inner.lock().await;
        let mut task = inner.record(task_id)?.clone();
        let now = self.clock.now();

        let decision = self.retry.decide(&task, &error, now);
        match &decision {
            Decision::Retry { retry_at, .. } => task.schedule_retry(*retry_at, error, now)?,
            Decision::MarkDead { .. } => task.mark_dead(error, now)?,
        }
        self.store.save(&task).await?;

        if task.state == TaskState::Dead {
            inner.release_key(&task);
        }
        if inner.running == Some(task_id) {
            inner.running = None;
        }
        inner.records.insert(task_id, task);
        debug!(queue = %self.name, %task_id, ?decision, "TaskQueue::mark_failed");
        Ok(decision)
    }

    /// `failed_retryable -> pending`.
    pub async fn requeue(&self, task_id: TaskId) -> Result<Task, VigilError> {
        let mut inner = self.inner.lock().await;
        let mut task = inner.record(task_id)?.clone();
        task.requeue(self.clock.now())?;
        self.store.save(&task).await?;

        inner.ready.push(ReadyEntry::of(&task));
        inner.records.insert(task_id, task.clone());
        drop(inner);

        debug!(queue = %self.name, %task_id, "TaskQueue::requeue");
        self.notify.notify_one();
        Ok(task)
    }

    /// Requeue every retrying task whose `retry_at` is at or before `now`.
    pub async fn promote_due(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>, VigilError> {
        let due: Vec<TaskId> = {
            let inner = self.inner.lock().await;
            let mut due: Vec<&Task> = inner
                .records
                .values()
                .filter(|t| t.state == TaskState::FailedRetryable)
                .filter(|t| t.retry_at.is_none_or(|at| at <= now))
                .collect();
            due.sort_by_key(|t| t.sequence);
            due.into_iter().map(|t| t.task_id).collect()
        };
        for task_id in &due {
            self.requeue(*task_id).await?;
        }
        Ok(due)
    }

    /// Earliest `retry_at` among retrying tasks.
    pub async fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().await;
        inner
            .records
            .values()
            .filter(|t| t.state == TaskState::FailedRetryable)
            .filter_map(|t| t.retry_at)
            .min()
    }

    pub async fn get(&self, task_id: TaskId) -> Option<Task> {
        self.inner.lock().await.records.get(&task_id).cloned()
    }

    pub async fn running_task(&self) -> Option<Task> {
        let inner = self.inner.lock().await;
        inner.running.and_then(|id| inner.records.get(&id).cloned())
    }

    /// Tasks currently in backoff, by `retry_at`.
    pub async fn retrying_tasks(&self) -> Vec<Task> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner
            .records
            .values()
            .filter(|t| t.state == TaskState::FailedRetryable)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.retry_at, t.sequence));
        tasks
    }

    /// Dead tasks, most recently finished first.
    pub async fn dead_tasks(&self) -> Vec<Task> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner
            .records
            .values()
            .filter(|t| t.state == TaskState::Dead)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        tasks
    }

    /// All tasks in submission order.
    pub async fn tasks(&self) -> Vec<Task> {
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner.records.values().cloned().collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    /// Entities named in the payload of any non-terminal task.
    pub async fn active_entities(&self) -> HashSet<EntityId> {
        let inner = self.inner.lock().await;
        inner
            .records
            .values()
            .filter(|t| t.state.is_active())
            .flat_map(|t| t.payload().iter().cloned())
            .collect()
    }

    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().await;
        QueueStats::from_tasks(self.name.clone(), inner.records.values())
    }

    /// Number of task records, terminal ones included.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Delete every `pending` task and release its key.
    ///
    /// Running and retrying tasks are left untouched; cancel the running one
    /// through the executor if it must go.
    pub async fn clear_pending(&self) -> Result<usize, VigilError> {
        let mut inner = self.inner.lock().await;
        let pending: Vec<TaskId> = inner
            .records
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .map(|t| t.task_id)
            .collect();

        for task_id in &pending {
            self.store.delete(*task_id).await?;
            if let Some(task) = inner.records.remove(task_id) {
                inner.release_key(&task);
            }
        }
        inner.ready.clear();
        info!(queue = %self.name, cleared = pending.len(), "TaskQueue::clear_pending");
        Ok(pending.len())
    }

    /// Delete completed and dead tasks that finished before `older_than`.
    pub async fn prune_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, VigilError> {
        let mut inner = self.inner.lock().await;
        let expired: Vec<TaskId> = inner
            .records
            .values()
            .filter(|t| t.state.is_terminal())
            .filter(|t| t.finished_at.is_some_and(|at| at < older_than))
            .map(|t| t.task_id)
            .collect();

        for task_id in &expired {
            self.store.delete(*task_id).await?;
            inner.records.remove(task_id);
        }
        debug!(queue = %self.name, pruned = expired.len(), "TaskQueue::prune_terminal");
        Ok(expired.len())
    }
}
