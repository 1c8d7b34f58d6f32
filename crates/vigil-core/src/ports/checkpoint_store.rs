//! CheckpointStore port - append-only progress log per task.

use async_trait::async_trait;

use crate::domain::{Checkpoint, TaskId, VigilError};

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn append(&self, checkpoint: &Checkpoint) -> Result<(), VigilError>;

    /// Checkpoints of `task_id`, ascending by `sequence_no`.
    async fn list(&self, task_id: TaskId) -> Result<Vec<Checkpoint>, VigilError>;

    /// Drop all but the newest `keep` checkpoints of `task_id`.
    async fn retain_latest(&self, task_id: TaskId, keep: usize) -> Result<(), VigilError>;

    async fn delete_all(&self, task_id: TaskId) -> Result<(), VigilError>;
}
