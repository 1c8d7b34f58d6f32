//! In-memory stores (development / tests).

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    Checkpoint, EntityId, EntityState, EntityStatus, QueueName, Task, TaskId, VigilError,
};
use crate::ports::{CheckpointStore, StateStore, TaskStore};

/// Entity table behind a `RwLock`: concurrent readers, one writer.
///
/// Besides the trait methods it exposes the upstream-facing writes
/// (`upsert`, `record_event`, `set_status`) that a data-ingest collaborator
/// would perform.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    entities: RwLock<BTreeMap<EntityId, EntityState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(ids: impl IntoIterator<Item = EntityId>) -> Self {
        let store = Self::new();
        for id in ids {
            store.upsert(EntityState::new(id));
        }
        store
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<EntityId, EntityState>> {
        self.entities.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<EntityId, EntityState>> {
        self.entities.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn upsert(&self, state: EntityState) {
        self.write().insert(state.entity_id.clone(), state);
    }

    /// Note a relevant upstream event for an entity, tracking it if new.
    pub fn record_event(&self, id: &EntityId, ts: DateTime<Utc>) {
        let mut entities = self.write();
        let entry = entities
            .entry(id.clone())
            .or_insert_with(|| EntityState::new(id.clone()));
        if entry.last_event_ts.is_none_or(|prev| prev < ts) {
            entry.last_event_ts = Some(ts);
        }
    }

    pub fn set_status(&self, id: &EntityId, status: EntityStatus) -> Result<(), VigilError> {
        let mut entities = self.write();
        let entry = entities
            .get_mut(id)
            .ok_or_else(|| VigilError::Validation(format!("unknown entity '{id}'")))?;
        entry.status = status;
        Ok(())
    }

    pub fn get(&self, id: &EntityId) -> Option<EntityState> {
        self.read().get(id).cloned()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn tracked_entities(&self) -> Result<Vec<EntityState>, VigilError> {
        Ok(self.read().values().cloned().collect())
    }

    async fn get_stale(
        &self,
        candidate_ids: &[EntityId],
        threshold: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<EntityId>, VigilError> {
        let entities = self.read();
        Ok(candidate_ids
            .iter()
            .filter(|id| {
                entities
                    .get(*id)
                    .is_some_and(|state| state.is_stale(threshold, now))
            })
            .cloned()
            .collect())
    }

    async fn get_last_analysis_ts(
        &self,
        id: &EntityId,
    ) -> Result<Option<DateTime<Utc>>, VigilError> {
        Ok(self.read().get(id).and_then(|s| s.last_analysis_ts))
    }

    async fn get_last_event_ts(
        &self,
        id: &EntityId,
    ) -> Result<Option<DateTime<Utc>>, VigilError> {
        Ok(self.read().get(id).and_then(|s| s.last_event_ts))
    }

    async fn mark_analyzed(&self, id: &EntityId, ts: DateTime<Utc>) -> Result<(), VigilError> {
        stamp(&mut self.write(), id, ts);
        Ok(())
    }

    async fn mark_analyzed_all(
        &self,
        ids: &[EntityId],
        ts: DateTime<Utc>,
    ) -> Result<(), VigilError> {
        // one write guard for the whole batch; readers never see half of it
        let mut entities = self.write();
        for id in ids {
            stamp(&mut entities, id, ts);
        }
        Ok(())
    }
}

fn stamp(entities: &mut BTreeMap<EntityId, EntityState>, id: &EntityId, ts: DateTime<Utc>) {
    let entry = entities
        .entry(id.clone())
        .or_insert_with(|| EntityState::new(id.clone()));
    if entry.last_analysis_ts.is_none_or(|prev| prev < ts) {
        entry.last_analysis_ts = Some(ts);
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<TaskId, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save(&self, task: &Task) -> Result<(), VigilError> {
        self.tasks.lock().await.insert(task.task_id, task.clone());
        Ok(())
    }

    async fn delete(&self, task_id: TaskId) -> Result<(), VigilError> {
        self.tasks.lock().await.remove(&task_id);
        Ok(())
    }

    async fn load_queue(&self, queue: &QueueName) -> Result<Vec<Task>, VigilError> {
        let tasks = self.tasks.lock().await;
        Ok(tasks
            .values()
            .filter(|t| &t.queue_name == queue)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Mutex<HashMap<TaskId, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn append(&self, checkpoint: &Checkpoint) -> Result<(), VigilError> {
        self.checkpoints
            .lock()
            .await
            .entry(checkpoint.task_id)
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn list(&self, task_id: TaskId) -> Result<Vec<Checkpoint>, VigilError> {
        let mut list = self
            .checkpoints
            .lock()
            .await
            .get(&task_id)
            .cloned()
            .unwrap_or_default();
        list.sort_by_key(|c| c.sequence_no);
        Ok(list)
    }

    async fn retain_latest(&self, task_id: TaskId, keep: usize) -> Result<(), VigilError> {
        let mut checkpoints = self.checkpoints.lock().await;
        if let Some(list) = checkpoints.get_mut(&task_id) {
            list.sort_by_key(|c| c.sequence_no);
            let excess = list.len().saturating_sub(keep);
            list.drain(..excess);
        }
        Ok(())
    }

    async fn delete_all(&self, task_id: TaskId) -> Result<(), VigilError> {
        self.checkpoints.lock().await.remove(&task_id);
        Ok(())
    }
}
