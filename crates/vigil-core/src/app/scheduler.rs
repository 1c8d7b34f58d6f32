//! AnalysisScheduler - 定期的に stale な entity を拾ってバッチ化し投入する
//!
//! tick ごとに:
//! 1. Active な entity のうち stale なものを StateStore から取得
//! 2. 未完了 task の payload に含まれるものを除外（本当の dedupe は submit 側）
//! 3. last_event_ts 降順 → entity id 昇順で並べる
//! 4. batch_size ごとに区切って AnalyzeBatch として submit

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::domain::{DEFAULT_PRIORITY, EntityId, EntityStatus, NewTask, TaskId, TaskKind, VigilError};
use crate::ports::{Clock, StateStore};
use crate::queue::{RejectReason, SubmitOutcome, TaskQueue};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub staleness_threshold: chrono::Duration,
    pub batch_size: usize,
    pub default_priority: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            staleness_threshold: chrono::Duration::hours(24),
            batch_size: 3,
            default_priority: DEFAULT_PRIORITY,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub paused: bool,
    /// Stale candidates found in the StateStore.
    pub stale: usize,
    /// Stale candidates skipped because a non-terminal task covers them.
    pub skipped_active: usize,
    pub created: Vec<TaskId>,
    /// Batches the queue rejected as duplicates.
    pub duplicates: usize,
    /// Batches dropped because the queue was at capacity.
    pub dropped_capacity: usize,
}

pub struct AnalysisScheduler {
    state: Arc<dyn StateStore>,
    queue: Arc<TaskQueue>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    paused: AtomicBool,
}

impl AnalysisScheduler {
    pub fn new(
        state: Arc<dyn StateStore>,
        queue: Arc<TaskQueue>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            state,
            queue,
            clock,
            config,
            paused: AtomicBool::new(false),
        }
    }

    pub fn pause(&self) {
        info!(queue = %self.queue.name(), "AnalysisScheduler::pause");
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        info!(queue = %self.queue.name(), "AnalysisScheduler::resume");
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub async fn tick(&self) -> Result<TickReport, VigilError> {
        if self.is_paused() {
            debug!("AnalysisScheduler::tick: paused");
            return Ok(TickReport {
                paused: true,
                ..TickReport::default()
            });
        }

        let now = self.clock.now();
        let candidates: Vec<EntityId> = self
            .state
            .tracked_entities()
            .await?
            .into_iter()
            .filter(|e| e.status == EntityStatus::Active)
            .map(|e| e.entity_id)
            .collect();
        let stale = self
            .state
            .get_stale(&candidates, self.config.staleness_threshold, now)
            .await?;

        let active = self.queue.active_entities().await;
        let mut report = TickReport {
            stale: stale.len(),
            ..TickReport::default()
        };

        let mut selected = Vec::with_capacity(stale.len());
        for id in stale {
            if active.contains(&id) {
                report.skipped_active += 1;
                continue;
            }
            let last_event = self.state.get_last_event_ts(&id).await?;
            selected.push((last_event, id));
        }
        // newest event first (None sorts last), then id ascending
        selected.sort_by(|(a_ts, a_id), (b_ts, b_id)| b_ts.cmp(a_ts).then_with(|| a_id.cmp(b_id)));
        let ordered: Vec<EntityId> = selected.into_iter().map(|(_, id)| id).collect();

        for batch in ordered.chunks(self.config.batch_size.max(1)) {
            let request = NewTask::new(TaskKind::analyze(batch.to_vec()))
                .with_priority(self.config.default_priority);
            match self.queue.submit(request).await? {
                SubmitOutcome::Accepted(task_id) => report.created.push(task_id),
                SubmitOutcome::Rejected(RejectReason::Duplicate { .. }) => report.duplicates += 1,
                SubmitOutcome::Rejected(RejectReason::Capacity) => report.dropped_capacity += 1,
            }
        }

        if report.created.is_empty() {
            debug!(?report, "AnalysisScheduler::tick: nothing new");
        } else {
            info!(
                queue = %self.queue.name(),
                stale = report.stale,
                created = report.created.len(),
                dropped = report.dropped_capacity,
                "AnalysisScheduler::tick"
            );
        }
        Ok(report)
    }

    /// Tick on a fixed interval until `shutdown` fires. The first tick is immediate.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.config.interval, "AnalysisScheduler::run: started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "AnalysisScheduler::run: tick failed");
                    }
                }
            }
        }
        info!("AnalysisScheduler::run: stopped");
    }
}
