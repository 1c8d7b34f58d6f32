//! PipelineBuilder - パイプラインの構築とワイヤリング
//!
//! - 起動時検証（Fail-fast）: キュー名の重複、scheduler の対象キュー未登録、不正な設定
//! - `Pipeline::start` でキューを store から復元し、recorder / executor / scheduler を起動
//! - `PipelineHandle::shutdown_and_join` で全タスクを止めて待つ

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::checkpoint::CheckpointManager;
use super::executor::SequentialExecutor;
use super::hooks::HookEventRecorder;
use super::scheduler::{AnalysisScheduler, TickReport};
use crate::config::VigilConfig;
use crate::domain::{NewTask, QueueName, QueueStats, Task, TaskId, VigilError};
use crate::impls::{InMemoryCheckpointStore, InMemoryStateStore, InMemoryTaskStore, MemoryHookSink};
use crate::ports::{
    AnalysisHandler, CheckpointStore, Clock, HookSink, IdGenerator, StateStore, SystemClock,
    TaskStore, UlidGenerator,
};
use crate::queue::{SubmitOutcome, TaskQueue};

/// BuildError はパイプライン構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("queue '{0}' is registered more than once")]
    DuplicateQueue(QueueName),

    #[error("scheduler targets queue '{0}', which has no handler registered")]
    UnknownSchedulerQueue(QueueName),

    #[error(transparent)]
    InvalidConfig(#[from] crate::config::ConfigError),
}

/// PipelineBuilder はパイプラインを構築
///
/// # 使用例
/// ```ignore
/// let pipeline = PipelineBuilder::new(config)
///     .queue("analysis", Arc::new(MyHandler))
///     .state_store(state)
///     .build()?;
/// let handle = pipeline.start().await?;
/// ```
///
/// 指定しなかった store / sink / clock は InMemory 実装と SystemClock になる。
pub struct PipelineBuilder {
    config: VigilConfig,
    queues: Vec<(QueueName, Arc<dyn AnalysisHandler>)>,
    state_store: Option<Arc<dyn StateStore>>,
    task_store: Option<Arc<dyn TaskStore>>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    hook_sink: Option<Arc<dyn HookSink>>,
    clock: Option<Arc<dyn Clock>>,
}

impl PipelineBuilder {
    pub fn new(config: VigilConfig) -> Self {
        Self {
            config,
            queues: Vec::new(),
            state_store: None,
            task_store: None,
            checkpoint_store: None,
            hook_sink: None,
            clock: None,
        }
    }

    /// Register a queue and the handler its executor runs.
    pub fn queue(mut self, name: impl Into<QueueName>, handler: Arc<dyn AnalysisHandler>) -> Self {
        self.queues.push((name.into(), handler));
        self
    }

    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn task_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.task_store = Some(store);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn hook_sink(mut self, sink: Arc<dyn HookSink>) -> Self {
        self.hook_sink = Some(sink);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Pipeline, BuildError> {
        self.config.validate()?;

        let mut queues = BTreeMap::new();
        for (name, handler) in self.queues {
            if queues.insert(name.clone(), handler).is_some() {
                return Err(BuildError::DuplicateQueue(name));
            }
        }
        let scheduler_queue = self.config.scheduler.queue_name();
        if !queues.contains_key(&scheduler_queue) {
            return Err(BuildError::UnknownSchedulerQueue(scheduler_queue));
        }

        let max_retained = self.config.hooks.max_retained;
        Ok(Pipeline {
            queues,
            scheduler_queue,
            state_store: self
                .state_store
                .unwrap_or_else(|| Arc::new(InMemoryStateStore::new())),
            task_store: self
                .task_store
                .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new())),
            checkpoint_store: self
                .checkpoint_store
                .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new())),
            hook_sink: self
                .hook_sink
                .unwrap_or_else(|| Arc::new(MemoryHookSink::new(max_retained))),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            config: self.config,
        })
    }
}

/// Validated wiring, not yet running.
pub struct Pipeline {
    config: VigilConfig,
    queues: BTreeMap<QueueName, Arc<dyn AnalysisHandler>>,
    scheduler_queue: QueueName,
    state_store: Arc<dyn StateStore>,
    task_store: Arc<dyn TaskStore>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    hook_sink: Arc<dyn HookSink>,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    /// Open every queue from the task store and spawn the recorder, one
    /// executor per queue, and the scheduler.
    pub async fn start(self) -> Result<PipelineHandle, VigilError> {
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&self.clock)));
        let recorder = HookEventRecorder::spawn(
            self.hook_sink,
            Arc::clone(&ids),
            Arc::clone(&self.clock),
            self.config.hook_recorder_config(),
        );
        let checkpoints = Arc::new(CheckpointManager::new(
            self.checkpoint_store,
            Arc::clone(&self.clock),
            self.config.checkpoints.retain_per_task,
        ));
        let shutdown = CancellationToken::new();
        let mut joins = Vec::new();
        let mut executors = BTreeMap::new();

        for (name, handler) in self.queues {
            let queue = Arc::new(
                TaskQueue::open(
                    name.clone(),
                    Arc::clone(&self.task_store),
                    Arc::clone(&self.clock),
                    Arc::clone(&ids),
                    self.config.queue_limits(),
                    self.config.retry_policy(),
                )
                .await?,
            );
            let executor = Arc::new(SequentialExecutor::new(
                queue,
                handler,
                Arc::clone(&self.state_store),
                Arc::clone(&checkpoints),
                recorder.clone(),
                Arc::clone(&self.clock),
                self.config.executor_config(),
            ));
            joins.push(tokio::spawn({
                let executor = Arc::clone(&executor);
                let shutdown = shutdown.child_token();
                async move { executor.run(shutdown).await }
            }));
            executors.insert(name, executor);
        }

        let scheduler_queue = executors
            .get(&self.scheduler_queue)
            .map(|e| Arc::clone(e.queue()))
            .ok_or_else(|| VigilError::UnknownQueue(self.scheduler_queue.to_string()))?;
        let scheduler = Arc::new(AnalysisScheduler::new(
            Arc::clone(&self.state_store),
            scheduler_queue,
            Arc::clone(&self.clock),
            self.config.scheduler_config(),
        ));
        if self.config.scheduler.paused {
            scheduler.pause();
        }
        joins.push(tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            let shutdown = shutdown.child_token();
            async move { scheduler.run(shutdown).await }
        }));

        info!(queues = executors.len(), scheduler_queue = %self.scheduler_queue, "Pipeline::start: running");
        Ok(PipelineHandle {
            executors,
            scheduler,
            recorder,
            state_store: self.state_store,
            shutdown,
            joins,
        })
    }
}

/// Running pipeline. Administrative operations go through here.
pub struct PipelineHandle {
    executors: BTreeMap<QueueName, Arc<SequentialExecutor>>,
    scheduler: Arc<AnalysisScheduler>,
    recorder: HookEventRecorder,
    state_store: Arc<dyn StateStore>,
    shutdown: CancellationToken,
    joins: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    fn executor(&self, queue: &QueueName) -> Result<&Arc<SequentialExecutor>, VigilError> {
        self.executors
            .get(queue)
            .ok_or_else(|| VigilError::UnknownQueue(queue.to_string()))
    }

    pub fn queue(&self, queue: &QueueName) -> Result<&Arc<TaskQueue>, VigilError> {
        Ok(self.executor(queue)?.queue())
    }

    pub fn recorder(&self) -> &HookEventRecorder {
        &self.recorder
    }

    pub fn state_store(&self) -> &Arc<dyn StateStore> {
        &self.state_store
    }

    /// Manual submission; may override priority and dedupe key.
    pub async fn submit(
        &self,
        queue: &QueueName,
        request: NewTask,
    ) -> Result<SubmitOutcome, VigilError> {
        self.queue(queue)?.submit(request).await
    }

    /// Stats for every queue, in name order.
    pub async fn stats(&self) -> Vec<QueueStats> {
        let mut stats = Vec::with_capacity(self.executors.len());
        for executor in self.executors.values() {
            stats.push(executor.queue().stats().await);
        }
        stats
    }

    pub async fn dead_tasks(&self, queue: &QueueName) -> Result<Vec<Task>, VigilError> {
        Ok(self.queue(queue)?.dead_tasks().await)
    }

    /// Tasks waiting out a retry backoff, by `retry_at`.
    pub async fn retrying_tasks(&self, queue: &QueueName) -> Result<Vec<Task>, VigilError> {
        Ok(self.queue(queue)?.retrying_tasks().await)
    }

    /// Remove pending tasks only. Running and retrying tasks stay.
    pub async fn clear_queue(&self, queue: &QueueName) -> Result<usize, VigilError> {
        self.queue(queue)?.clear_pending().await
    }

    /// Cancel the queue's running attempt. The handler reporting the
    /// cancellation ends the task as `dead`.
    pub fn cancel_running(&self, queue: &QueueName) -> Result<Option<TaskId>, VigilError> {
        Ok(self.executor(queue)?.cancel_current())
    }

    pub fn pause_scheduler(&self) {
        self.scheduler.pause();
    }

    pub fn resume_scheduler(&self) {
        self.scheduler.resume();
    }

    pub fn scheduler_paused(&self) -> bool {
        self.scheduler.is_paused()
    }

    /// Run one scheduler tick now, outside the timer.
    pub async fn tick_now(&self) -> Result<TickReport, VigilError> {
        self.scheduler.tick().await
    }

    /// Stop the scheduler and executors, wait for them, then drain the recorder.
    ///
    /// An attempt in flight is abandoned and stays `running`, to be resumed
    /// from its checkpoint on the next start.
    pub async fn shutdown_and_join(self) {
        self.shutdown.cancel();
        for join in self.joins {
            if let Err(e) = join.await {
                warn!(error = %e, "PipelineHandle::shutdown_and_join: task failed");
            }
        }
        self.recorder.shutdown().await;
        info!("PipelineHandle::shutdown_and_join: stopped");
    }
}
