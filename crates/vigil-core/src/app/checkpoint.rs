//! CheckpointManager - 進捗スナップショットの管理
//!
//! - `save` が task ごとの sequence_no を採番して追記
//! - `latest` は再開時に一度だけ読む
//! - 古いものは `retain_per_task` 件を超えた分から捨てる

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{Checkpoint, EntityId, TaskId, VigilError};
use crate::ports::{CheckpointStore, Clock};

pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    clock: Arc<dyn Clock>,
    retain_per_task: usize,
    /// Last assigned sequence per task. Seeded from the store on first use.
    sequences: Mutex<HashMap<TaskId, u64>>,
}

impl CheckpointManager {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        clock: Arc<dyn Clock>,
        retain_per_task: usize,
    ) -> Self {
        Self {
            store,
            clock,
            retain_per_task: retain_per_task.max(1),
            sequences: Mutex::new(HashMap::new()),
        }
    }

    /// Persist a checkpoint with the next `sequence_no` for `task_id`.
    pub async fn save(
        &self,
        task_id: TaskId,
        completed_items: BTreeSet<EntityId>,
        pending_items: BTreeSet<EntityId>,
        snapshot: serde_json::Value,
    ) -> Result<Checkpoint, VigilError> {
        let mut sequences = self.sequences.lock().await;
        let last = match sequences.get(&task_id) {
            Some(seq) => *seq,
            None => self
                .store
                .list(task_id)
                .await?
                .last()
                .map_or(0, |cp| cp.sequence_no),
        };

        let checkpoint = Checkpoint {
            task_id,
            sequence_no: last + 1,
            completed_items,
            pending_items,
            snapshot,
            created_at: self.clock.now(),
        };
        self.store.append(&checkpoint).await?;
        sequences.insert(task_id, checkpoint.sequence_no);
        drop(sequences);

        self.store.retain_latest(task_id, self.retain_per_task).await?;
        debug!(
            %task_id,
            seq = checkpoint.sequence_no,
            completed = checkpoint.completed_items.len(),
            pending = checkpoint.pending_items.len(),
            "CheckpointManager::save"
        );
        Ok(checkpoint)
    }

    pub async fn latest(&self, task_id: TaskId) -> Result<Option<Checkpoint>, VigilError> {
        Ok(self.store.list(task_id).await?.pop())
    }

    /// Delete every checkpoint of `task_id`.
    pub async fn purge(&self, task_id: TaskId) -> Result<(), VigilError> {
        self.store.delete_all(task_id).await?;
        self.sequences.lock().await.remove(&task_id);
        debug!(%task_id, "CheckpointManager::purge");
        Ok(())
    }

    /// Keep only the newest checkpoint of `task_id`.
    pub async fn keep_latest_only(&self, task_id: TaskId) -> Result<(), VigilError> {
        self.store.retain_latest(task_id, 1).await?;
        self.sequences.lock().await.remove(&task_id);
        Ok(())
    }

    /// Callback handed to the handler for one attempt.
    pub fn handle(
        self: &Arc<Self>,
        task_id: TaskId,
        payload: Vec<EntityId>,
        resumed: Option<&Checkpoint>,
    ) -> CheckpointHandle {
        let completed = resumed
            .map(|cp| cp.completed_items.clone())
            .unwrap_or_default();
        CheckpointHandle {
            inner: Arc::new(HandleInner {
                manager: Arc::clone(self),
                task_id,
                payload,
                completed: Mutex::new(completed),
                open: AtomicBool::new(true),
            }),
        }
    }
}

struct HandleInner {
    manager: Arc<CheckpointManager>,
    task_id: TaskId,
    payload: Vec<EntityId>,
    /// Cumulative across resumptions. Held during a save, so `close` waits
    /// for an in-flight one.
    completed: Mutex<BTreeSet<EntityId>>,
    open: AtomicBool,
}

/// Attempt-scoped checkpoint callback.
///
/// Cloneable; all clones share one progress set. Once the attempt is over the
/// handle is closed and further saves fail with `AttemptClosed`.
#[derive(Clone)]
pub struct CheckpointHandle {
    inner: Arc<HandleInner>,
}

impl CheckpointHandle {
    pub fn task_id(&self) -> TaskId {
        self.inner.task_id
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Items completed so far, including those from the resumed checkpoint.
    pub async fn completed(&self) -> BTreeSet<EntityId> {
        self.inner.completed.lock().await.clone()
    }

    /// Record that `newly_completed` are done, along with handler state.
    ///
    /// Ids outside the task's payload are a validation error.
    pub async fn save(
        &self,
        newly_completed: impl IntoIterator<Item = EntityId>,
        snapshot: serde_json::Value,
    ) -> Result<Checkpoint, VigilError> {
        let mut completed = self.inner.completed.lock().await;
        if !self.is_open() {
            return Err(VigilError::AttemptClosed(self.inner.task_id));
        }

        let mut next = completed.clone();
        for id in newly_completed {
            if !self.inner.payload.contains(&id) {
                return Err(VigilError::Validation(format!(
                    "checkpoint for {} names '{id}' which is not in its payload",
                    self.inner.task_id
                )));
            }
            next.insert(id);
        }
        let pending: BTreeSet<EntityId> = self
            .inner
            .payload
            .iter()
            .filter(|id| !next.contains(*id))
            .cloned()
            .collect();

        let checkpoint = self
            .inner
            .manager
            .save(self.inner.task_id, next.clone(), pending, snapshot)
            .await?;
        *completed = next;
        Ok(checkpoint)
    }

    /// End the attempt. Waits for a save already in progress.
    pub(crate) async fn close(&self) {
        self.inner.open.store(false, Ordering::Release);
        let _wait = self.inner.completed.lock().await;
    }
}
