//! StateStore port - per-entity analysis bookkeeping.
//!
//! Single writer (the executor, on task completion), many readers (scheduler,
//! observability). Implementations must give read-after-write consistency:
//! a `mark_analyzed_all` is visible to the next `get_stale`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{EntityId, EntityState, VigilError};

#[async_trait]
pub trait StateStore: Send + Sync {
    /// All entities the store knows about, in id order.
    async fn tracked_entities(&self) -> Result<Vec<EntityState>, VigilError>;

    /// Subset of `candidate_ids` that were never analyzed or analyzed strictly
    /// longer than `threshold` before `now`. Unknown ids are ignored.
    async fn get_stale(
        &self,
        candidate_ids: &[EntityId],
        threshold: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<EntityId>, VigilError>;

    async fn get_last_analysis_ts(
        &self,
        id: &EntityId,
    ) -> Result<Option<DateTime<Utc>>, VigilError>;

    async fn get_last_event_ts(&self, id: &EntityId)
    -> Result<Option<DateTime<Utc>>, VigilError>;

    /// Advance `last_analysis_ts`. A timestamp older than the stored one is
    /// ignored, so the value only moves forward.
    async fn mark_analyzed(&self, id: &EntityId, ts: DateTime<Utc>) -> Result<(), VigilError>;

    /// `mark_analyzed` for a whole batch, all or nothing: on `Err` no entity of
    /// `ids` has been touched.
    async fn mark_analyzed_all(
        &self,
        ids: &[EntityId],
        ts: DateTime<Utc>,
    ) -> Result<(), VigilError>;
}
