//! Outcome model: what a successful handler run hands back.
//!
//! The core does not interpret analysis content. It only needs a per-entity
//! summary (for the post hook digest) and opaque artifacts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::entity::EntityId;

/// Per-entity result of one handler run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum EntityOutcome {
    /// Analysis produced; `summary` is handler-defined.
    Analyzed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },

    /// The handler looked at the entity and found nothing to recompute.
    Unchanged,
}

impl EntityOutcome {
    pub fn analyzed(summary: impl Into<String>) -> Self {
        EntityOutcome::Analyzed {
            summary: Some(summary.into()),
        }
    }
}

/// A reference to something produced during execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum Artifact {
    /// Free-form report text.
    Report(String),

    /// Path to a file produced or used.
    FilePath(String),

    /// URL reference (e.g., a stored analysis document).
    Url(String),

    /// Arbitrary JSON payload.
    Json(serde_json::Value),
}

/// Result of a successful `AnalysisHandler::execute`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AnalysisOutput {
    #[serde(default)]
    pub per_entity: BTreeMap<EntityId, EntityOutcome>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl AnalysisOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, id: EntityId, outcome: EntityOutcome) -> Self {
        self.per_entity.insert(id, outcome);
        self
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }
}
