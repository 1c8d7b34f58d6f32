//! Checkpoint: durable progress of an in-flight task.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::EntityId;
use super::ids::TaskId;

/// Progress snapshot written by a handler between atomic units of work.
///
/// `sequence_no` is strictly increasing per task; the highest one wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: TaskId,
    pub sequence_no: u64,
    pub completed_items: BTreeSet<EntityId>,
    pub pending_items: BTreeSet<EntityId>,

    /// Handler-defined state, handed back verbatim on resume.
    #[serde(default)]
    pub snapshot: serde_json::Value,

    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Payload items not yet covered by this checkpoint, in payload order.
    pub fn remaining<'a>(&self, payload: &'a [EntityId]) -> Vec<&'a EntityId> {
        payload
            .iter()
            .filter(|id| !self.completed_items.contains(*id))
            .collect()
    }
}

/// What to do with the checkpoints of a task that ended up `dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeadCheckpointPolicy {
    /// Keep only the newest checkpoint, for inspection.
    #[default]
    RetainLatest,
    /// Delete everything.
    Purge,
}
