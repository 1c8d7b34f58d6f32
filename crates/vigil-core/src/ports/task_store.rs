//! TaskStore port - タスクの正本（source of truth）
//!
//! TaskQueue はメモリ上に順序・dedupe インデックスを持つが、
//! すべての変更はここに書き込んでから確定する。
//! プロセスが落ちても `load_queue` から完全に再構築できること。

use async_trait::async_trait;

use crate::domain::{QueueName, Task, TaskId, VigilError};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or overwrite the record. Must be durable when it returns.
    async fn save(&self, task: &Task) -> Result<(), VigilError>;

    /// Remove a record. Deleting a missing record is not an error.
    async fn delete(&self, task_id: TaskId) -> Result<(), VigilError>;

    /// Every record belonging to `queue`, in any order.
    async fn load_queue(&self, queue: &QueueName) -> Result<Vec<Task>, VigilError>;
}
