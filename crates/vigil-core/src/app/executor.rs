//! SequentialExecutor - キューごとに 1 つだけ動く実行ループ
//!
//! next_pending → mark_running → handler → complete / retry / dead
//!
//! - handler は別タスクで動かし、watchdog が max_execution を超えたら
//!   cancel → grace 待ち → abort → TIMEOUT として扱う
//! - 起動時に running のまま残った task があれば最初にそれを再開する

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::checkpoint::{CheckpointHandle, CheckpointManager};
use super::hooks::HookEventRecorder;
use crate::domain::hook::digest;
use crate::domain::{
    AnalysisOutput, DeadCheckpointPolicy, Decision, EntityId, HookPhase, Task, TaskError, TaskId,
    VigilError,
};
use crate::ports::{AnalysisHandler, AnalysisRequest, Clock, StateStore};
use crate::queue::TaskQueue;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on idle waits between queue checks.
    pub poll_interval: Duration,
    pub max_execution: Duration,
    /// How long a cancelled handler gets to stop before it is abandoned.
    pub grace_period: Duration,
    pub dead_policy: DeadCheckpointPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_execution: Duration::from_secs(900),
            grace_period: Duration::from_secs(30),
            dead_policy: DeadCheckpointPolicy::RetainLatest,
        }
    }
}

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Completed,
    Retrying { retry_at: DateTime<Utc> },
    Dead,
    /// Shutdown arrived mid-attempt. The task is left `running` and resumes
    /// from its checkpoint on the next start.
    Interrupted,
}

enum HandlerResult {
    Finished(Result<AnalysisOutput, TaskError>),
    Interrupted,
}

struct CurrentAttempt {
    task_id: TaskId,
    cancel: CancellationToken,
}

pub struct SequentialExecutor {
    queue: Arc<TaskQueue>,
    handler: Arc<dyn AnalysisHandler>,
    state: Arc<dyn StateStore>,
    checkpoints: Arc<CheckpointManager>,
    hooks: HookEventRecorder,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
    current: Mutex<Option<CurrentAttempt>>,
}

impl SequentialExecutor {
    pub fn new(
        queue: Arc<TaskQueue>,
        handler: Arc<dyn AnalysisHandler>,
        state: Arc<dyn StateStore>,
        checkpoints: Arc<CheckpointManager>,
        hooks: HookEventRecorder,
        clock: Arc<dyn Clock>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            queue,
            handler,
            state,
            checkpoints,
            hooks,
            clock,
            config,
            current: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Signal cancellation to the running attempt, if any.
    pub fn cancel_current(&self) -> Option<TaskId> {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        current.as_ref().map(|attempt| {
            info!(queue = %self.queue.name(), task_id = %attempt.task_id, "SequentialExecutor::cancel_current");
            attempt.cancel.cancel();
            attempt.task_id
        })
    }

    fn set_current(&self, attempt: Option<CurrentAttempt>) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = attempt;
    }

    /// Loop until `shutdown` fires. Errors are logged and retried after the
    /// poll interval.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(queue = %self.queue.name(), "SequentialExecutor::run: started");
        while !shutdown.is_cancelled() {
            match self.step(&shutdown).await {
                Ok(Some(_)) => {}
                Ok(None) => self.idle(&shutdown).await,
                Err(e) => {
                    error!(queue = %self.queue.name(), error = %e, "SequentialExecutor::run: step failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
        info!(queue = %self.queue.name(), "SequentialExecutor::run: stopped");
    }

    /// Run at most one attempt: an orphaned running task first, otherwise the
    /// head of the queue after promoting due retries.
    pub async fn run_once(&self) -> Result<Option<(TaskId, AttemptOutcome)>, VigilError> {
        self.step(&CancellationToken::new()).await
    }

    async fn step(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Option<(TaskId, AttemptOutcome)>, VigilError> {
        if let Some(task) = self.queue.running_task().await {
            info!(queue = %self.queue.name(), task_id = %task.task_id, attempts = task.attempts, "SequentialExecutor: resuming running task");
            let outcome = self.run_attempt(task.clone(), shutdown).await?;
            return Ok(Some((task.task_id, outcome)));
        }

        self.queue.promote_due(self.clock.now()).await?;
        let Some(next) = self.queue.next_pending().await else {
            return Ok(None);
        };
        let task = self.queue.mark_running(next.task_id).await?;
        let outcome = self.run_attempt(task.clone(), shutdown).await?;
        Ok(Some((task.task_id, outcome)))
    }

    async fn idle(&self, shutdown: &CancellationToken) {
        let mut wait = self.config.poll_interval;
        if let Some(retry_at) = self.queue.next_retry_at().await {
            let until = (retry_at - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
            wait = wait.min(until);
        }
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = self.queue.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    async fn run_attempt(
        &self,
        task: Task,
        shutdown: &CancellationToken,
    ) -> Result<AttemptOutcome, VigilError> {
        let task_id = task.task_id;
        let latest = self.checkpoints.latest(task_id).await?;
        let remaining: Vec<EntityId> = match &latest {
            Some(cp) => cp.remaining(task.payload()).into_iter().cloned().collect(),
            None => task.payload().to_vec(),
        };
        let progress = self
            .checkpoints
            .handle(task_id, task.payload().to_vec(), latest.as_ref());

        if remaining.is_empty() {
            info!(%task_id, "SequentialExecutor: every item already checkpointed, completing");
            progress.close().await;
            return self.finish_success(&task).await;
        }

        if latest.is_some() {
            info!(%task_id, remaining = remaining.len(), "SequentialExecutor: resuming from checkpoint");
        }
        self.hooks.record(
            task_id,
            HookPhase::Pre,
            "execute",
            digest(&remaining),
            None,
            None,
        );

        let request = AnalysisRequest {
            task_id,
            kind: task.kind.clone(),
            entity_ids: remaining,
            resume_snapshot: latest.map(|cp| cp.snapshot),
        };
        let result = self.invoke(request, progress.clone(), shutdown).await;
        progress.close().await;
        self.set_current(None);

        match result {
            HandlerResult::Interrupted => {
                warn!(%task_id, "SequentialExecutor: shutdown during attempt, task left running");
                self.hooks
                    .record(task_id, HookPhase::Post, "interrupted", None, None, None);
                Ok(AttemptOutcome::Interrupted)
            }
            HandlerResult::Finished(Ok(output)) => {
                self.hooks.record(
                    task_id,
                    HookPhase::Post,
                    "execute",
                    None,
                    digest(&output),
                    None,
                );
                self.finish_success(&task).await
            }
            HandlerResult::Finished(Err(error)) => {
                self.hooks.record(
                    task_id,
                    HookPhase::Post,
                    "execute",
                    None,
                    None,
                    Some(error.clone()),
                );
                self.finish_failure(&task, error).await
            }
        }
    }

    /// Spawn the handler and supervise it: deadline, admin cancel, shutdown.
    async fn invoke(
        &self,
        request: AnalysisRequest,
        progress: CheckpointHandle,
        shutdown: &CancellationToken,
    ) -> HandlerResult {
        let task_id = request.task_id;
        let cancel = CancellationToken::new();
        self.set_current(Some(CurrentAttempt {
            task_id,
            cancel: cancel.clone(),
        }));

        let handler = Arc::clone(&self.handler);
        let mut join = tokio::spawn({
            let cancel = cancel.clone();
            async move { handler.execute(request, progress, cancel).await }
        });
        let grace = self.config.grace_period;

        tokio::select! {
            joined = &mut join => HandlerResult::Finished(classify_join(joined)),

            _ = tokio::time::sleep(self.config.max_execution) => {
                warn!(%task_id, deadline = ?self.config.max_execution, "SequentialExecutor: deadline exceeded, cancelling");
                cancel.cancel();
                let message = match tokio::time::timeout(grace, &mut join).await {
                    Ok(_) => format!("exceeded max execution of {:?}", self.config.max_execution),
                    Err(_) => {
                        join.abort();
                        format!(
                            "exceeded max execution of {:?}; handler ignored cancellation for {grace:?}",
                            self.config.max_execution
                        )
                    }
                };
                HandlerResult::Finished(Err(TaskError::timeout(message)))
            }

            _ = cancel.cancelled() => {
                match tokio::time::timeout(grace, &mut join).await {
                    Ok(joined) => HandlerResult::Finished(classify_join(joined)),
                    Err(_) => {
                        join.abort();
                        HandlerResult::Finished(Err(TaskError::cancelled(format!(
                            "cancelled; handler did not stop within {grace:?}"
                        ))))
                    }
                }
            }

            _ = shutdown.cancelled() => {
                join.abort();
                HandlerResult::Interrupted
            }
        }
    }

    async fn finish_success(&self, task: &Task) -> Result<AttemptOutcome, VigilError> {
        let task_id = task.task_id;
        let now = self.clock.now();
        if let Err(e) = self.state.mark_analyzed_all(task.payload(), now).await {
            warn!(%task_id, error = %e, "SequentialExecutor: state store write failed");
            let error = TaskError::transient(format!("state store write failed: {e}"));
            return self.finish_failure(task, error).await;
        }

        self.queue.mark_completed(task_id).await?;
        if let Err(e) = self.checkpoints.purge(task_id).await {
            warn!(%task_id, error = %e, "SequentialExecutor: checkpoint purge failed");
        }
        self.hooks
            .record(task_id, HookPhase::Stop, "completed", None, None, None);
        info!(%task_id, entities = task.payload().len(), "SequentialExecutor: task completed");
        Ok(AttemptOutcome::Completed)
    }

    async fn finish_failure(
        &self,
        task: &Task,
        error: TaskError,
    ) -> Result<AttemptOutcome, VigilError> {
        let task_id = task.task_id;
        let decision = self.queue.mark_failed(task_id, error.clone()).await?;

        match decision {
            Decision::Retry { retry_at, delay } => {
                self.hooks.record(
                    task_id,
                    HookPhase::Stop,
                    "retry_scheduled",
                    None,
                    None,
                    Some(error.clone()),
                );
                warn!(%task_id, kind = %error.kind, ?delay, "SequentialExecutor: attempt failed, retry scheduled");
                Ok(AttemptOutcome::Retrying { retry_at })
            }
            Decision::MarkDead { reason } => {
                let cleanup = match self.config.dead_policy {
                    DeadCheckpointPolicy::RetainLatest => {
                        self.checkpoints.keep_latest_only(task_id).await
                    }
                    DeadCheckpointPolicy::Purge => self.checkpoints.purge(task_id).await,
                };
                if let Err(e) = cleanup {
                    warn!(%task_id, error = %e, "SequentialExecutor: checkpoint cleanup failed");
                }
                self.hooks.record(
                    task_id,
                    HookPhase::Stop,
                    "dead",
                    None,
                    None,
                    Some(error.clone()),
                );
                error!(%task_id, kind = %error.kind, message = %error.message, %reason, "SequentialExecutor: task dead");
                Ok(AttemptOutcome::Dead)
            }
        }
    }
}

fn classify_join(
    joined: Result<Result<AnalysisOutput, TaskError>, JoinError>,
) -> Result<AnalysisOutput, TaskError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(TaskError::fatal(format!("handler panicked: {e}"))),
        Err(e) => {
            debug!(error = %e, "SequentialExecutor: handler task cancelled");
            Err(TaskError::fatal(format!("handler task aborted: {e}")))
        }
    }
}
