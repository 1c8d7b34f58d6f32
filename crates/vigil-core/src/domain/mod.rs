//! Domain model (IDs, entities, tasks, checkpoints, hook events, ...).
//!
//! ここは純粋なデータ型のみ。I/O や非同期処理は ports / app 側に置く。

pub mod checkpoint;
pub mod decision;
pub mod entity;
pub mod errors;
pub mod hook;
pub mod ids;
pub mod outcome;
pub mod state;
pub mod stats;
pub mod task;

pub use checkpoint::{Checkpoint, DeadCheckpointPolicy};
pub use decision::Decision;
pub use entity::{EntityId, EntityState, EntityStatus};
pub use errors::{ErrorKind, TaskError, VigilError};
pub use hook::{HookEvent, HookPhase};
pub use ids::{EventId, TaskId};
pub use outcome::{AnalysisOutput, Artifact, EntityOutcome};
pub use state::TaskState;
pub use stats::QueueStats;
pub use task::{DEFAULT_PRIORITY, DedupeKey, NewTask, QueueName, Task, TaskKind};
