//! AnalysisHandler port - the opaque unit of work behind a queue.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::app::checkpoint::CheckpointHandle;
use crate::domain::{AnalysisOutput, EntityId, TaskError, TaskId, TaskKind};

/// Input for one attempt.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub task_id: TaskId,
    pub kind: TaskKind,

    /// Payload items not yet checkpointed as completed, in payload order.
    pub entity_ids: Vec<EntityId>,

    /// Blob from the checkpoint this attempt resumes from, if any.
    pub resume_snapshot: Option<serde_json::Value>,
}

/// Performs the expensive work for a task.
///
/// Contract:
/// - call `progress.save(..)` after each entity it completes
/// - check `cancel` at least once per entity boundary and return
///   `TaskError::cancelled` (or stop early) when it fires
#[async_trait]
pub trait AnalysisHandler: Send + Sync {
    async fn execute(
        &self,
        request: AnalysisRequest,
        progress: CheckpointHandle,
        cancel: CancellationToken,
    ) -> Result<AnalysisOutput, TaskError>;
}
