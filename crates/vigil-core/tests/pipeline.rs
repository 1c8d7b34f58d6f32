//! End-to-end tests for the vigil pipeline
//!
//! Scheduler, queue, executor, checkpoints and hooks wired together the way
//! `PipelineBuilder` wires them, driven step by step with a `ManualClock`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use vigil_core::app::{
    AnalysisScheduler, AttemptOutcome, CheckpointHandle, CheckpointManager, ExecutorConfig,
    HookEventRecorder, HookRecorderConfig, SchedulerConfig, SequentialExecutor,
};
use vigil_core::domain::{
    AnalysisOutput, DeadCheckpointPolicy, EntityId, EntityOutcome, ErrorKind, HookPhase, NewTask,
    QueueName, TaskError, TaskKind, TaskState,
};
use vigil_core::impls::{
    FileStore, InMemoryCheckpointStore, InMemoryStateStore, InMemoryTaskStore, MemoryHookSink,
};
use vigil_core::ports::{
    AnalysisHandler, AnalysisRequest, CheckpointStore, Clock, ManualClock, StateStore, TaskStore,
    UlidGenerator,
};
use vigil_core::queue::{QueueLimits, RetryPolicy, SubmitOutcome, TaskQueue};
use vigil_core::{PipelineBuilder, VigilConfig};

fn id(s: &str) -> EntityId {
    EntityId::parse(s).expect("valid entity id")
}

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

// =============================================================================
// Test handlers
// =============================================================================

/// Checkpoints after every entity and records what it was asked to do.
#[derive(Default)]
struct RecordingHandler {
    requests: Mutex<Vec<Vec<EntityId>>>,
}

#[async_trait]
impl AnalysisHandler for RecordingHandler {
    async fn execute(
        &self,
        request: AnalysisRequest,
        progress: CheckpointHandle,
        cancel: CancellationToken,
    ) -> Result<AnalysisOutput, TaskError> {
        self.requests.lock().await.push(request.entity_ids.clone());
        let mut output = AnalysisOutput::new();
        for entity in request.entity_ids {
            if cancel.is_cancelled() {
                return Err(TaskError::cancelled("stopped between entities"));
            }
            progress
                .save([entity.clone()], json!({ "last": entity.as_str() }))
                .await
                .map_err(|e| TaskError::transient(e.to_string()))?;
            output = output.with_entity(entity, EntityOutcome::analyzed("ok"));
        }
        Ok(output)
    }
}

/// Never finishes and never looks at its cancellation token.
struct StuckHandler;

#[async_trait]
impl AnalysisHandler for StuckHandler {
    async fn execute(
        &self,
        _request: AnalysisRequest,
        _progress: CheckpointHandle,
        _cancel: CancellationToken,
    ) -> Result<AnalysisOutput, TaskError> {
        std::future::pending::<()>().await;
        Ok(AnalysisOutput::new())
    }
}

/// Fails with the given kind every time.
struct FailingHandler {
    kind: ErrorKind,
    calls: AtomicUsize,
}

#[async_trait]
impl AnalysisHandler for FailingHandler {
    async fn execute(
        &self,
        _request: AnalysisRequest,
        _progress: CheckpointHandle,
        _cancel: CancellationToken,
    ) -> Result<AnalysisOutput, TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TaskError::new(self.kind, "upstream unavailable"))
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    state: Arc<InMemoryStateStore>,
    queue: Arc<TaskQueue>,
    scheduler: AnalysisScheduler,
    executor: SequentialExecutor,
    checkpoints: Arc<CheckpointManager>,
    sink: Arc<MemoryHookSink>,
    hooks: HookEventRecorder,
}

struct HarnessOptions {
    task_store: Arc<dyn TaskStore>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    executor: ExecutorConfig,
    retry: RetryPolicy,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            task_store: Arc::new(InMemoryTaskStore::new()),
            checkpoint_store: Arc::new(InMemoryCheckpointStore::new()),
            executor: ExecutorConfig {
                poll_interval: Duration::from_millis(10),
                max_execution: Duration::from_secs(5),
                grace_period: Duration::from_millis(100),
                dead_policy: DeadCheckpointPolicy::RetainLatest,
            },
            retry: RetryPolicy::default(),
        }
    }
}

impl Harness {
    async fn new(
        clock: ManualClock,
        state: Arc<InMemoryStateStore>,
        handler: Arc<dyn AnalysisHandler>,
        options: HarnessOptions,
    ) -> Self {
        let dyn_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let ids = Arc::new(UlidGenerator::new(clock.clone()));
        let queue = Arc::new(
            TaskQueue::open(
                QueueName::new("analysis"),
                options.task_store,
                Arc::clone(&dyn_clock),
                ids.clone(),
                QueueLimits::default(),
                options.retry,
            )
            .await
            .expect("open queue"),
        );
        let scheduler = AnalysisScheduler::new(
            state.clone(),
            Arc::clone(&queue),
            Arc::clone(&dyn_clock),
            SchedulerConfig {
                interval: Duration::from_secs(300),
                staleness_threshold: chrono::Duration::hours(24),
                batch_size: 3,
                default_priority: 0,
            },
        );
        let sink = Arc::new(MemoryHookSink::new(1000));
        let hooks = HookEventRecorder::spawn(
            sink.clone(),
            ids,
            Arc::clone(&dyn_clock),
            HookRecorderConfig::default(),
        );
        let checkpoints = Arc::new(CheckpointManager::new(
            options.checkpoint_store,
            Arc::clone(&dyn_clock),
            3,
        ));
        let executor = SequentialExecutor::new(
            Arc::clone(&queue),
            handler,
            state.clone(),
            checkpoints.clone(),
            hooks.clone(),
            dyn_clock,
            options.executor,
        );
        Self {
            state,
            queue,
            scheduler,
            executor,
            checkpoints,
            sink,
            hooks,
        }
    }
}

// =============================================================================
// Staleness scheduling
// =============================================================================

#[tokio::test]
async fn test_stale_entity_is_scheduled_once_until_analyzed() {
    let clock = ManualClock::new(t0());
    let state = Arc::new(InMemoryStateStore::with_entities([id("X")]));
    let h = Harness::new(
        clock.clone(),
        state,
        Arc::new(RecordingHandler::default()),
        HarnessOptions::default(),
    )
    .await;

    // T: never analyzed, so stale
    let report = h.scheduler.tick().await.expect("tick");
    assert_eq!(report.created.len(), 1);
    let task_id = report.created[0];
    assert_eq!(h.queue.get(task_id).await.unwrap().payload(), &[id("X")]);

    // T+1s: still in flight, no second task
    clock.advance(chrono::Duration::seconds(1));
    let report = h.scheduler.tick().await.expect("tick");
    assert!(report.created.is_empty());
    assert_eq!(report.skipped_active, 1);

    // T+2s: completes and stamps last_analysis_ts
    clock.advance(chrono::Duration::seconds(1));
    let (ran, outcome) = h.executor.run_once().await.unwrap().expect("one attempt");
    assert_eq!(ran, task_id);
    assert_eq!(outcome, AttemptOutcome::Completed);
    let analyzed_at = t0() + chrono::Duration::seconds(2);
    assert_eq!(
        h.state.get_last_analysis_ts(&id("X")).await.unwrap(),
        Some(analyzed_at)
    );

    // T+10h: fresh
    clock.set(t0() + chrono::Duration::hours(10));
    assert!(h.scheduler.tick().await.unwrap().created.is_empty());

    // T+25h: stale again
    clock.set(t0() + chrono::Duration::hours(25));
    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.created.len(), 1);
    assert_ne!(report.created[0], task_id);
}

#[tokio::test]
async fn test_repeated_ticks_create_no_duplicates() {
    let clock = ManualClock::new(t0());
    let entities = ["AAPL", "MSFT", "NVDA", "TSLA", "AMZN"].map(id);
    let state = Arc::new(InMemoryStateStore::with_entities(entities.clone()));
    let h = Harness::new(
        clock.clone(),
        state,
        Arc::new(RecordingHandler::default()),
        HarnessOptions::default(),
    )
    .await;

    let first = h.scheduler.tick().await.unwrap();
    // batch size 3: [3, 2]
    assert_eq!(first.created.len(), 2);

    for _ in 0..5 {
        clock.advance(chrono::Duration::minutes(5));
        let report = h.scheduler.tick().await.unwrap();
        assert!(report.created.is_empty());
        assert_eq!(report.skipped_active, entities.len());
    }
    assert_eq!(h.queue.len().await, 2);
}

#[tokio::test]
async fn test_inactive_entities_are_not_scheduled() {
    let clock = ManualClock::new(t0());
    let state = Arc::new(InMemoryStateStore::with_entities([id("A"), id("B")]));
    state
        .set_status(&id("B"), vigil_core::domain::EntityStatus::Suspended)
        .unwrap();
    let h = Harness::new(
        clock,
        state,
        Arc::new(RecordingHandler::default()),
        HarnessOptions::default(),
    )
    .await;

    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.created.len(), 1);
    let task = h.queue.get(report.created[0]).await.unwrap();
    assert_eq!(task.payload(), &[id("A")]);
}

// =============================================================================
// Ordering
// =============================================================================

#[tokio::test]
async fn test_dequeue_order_is_priority_then_fifo() {
    let clock = ManualClock::new(t0());
    let handler = Arc::new(RecordingHandler::default());
    let h = Harness::new(
        clock.clone(),
        Arc::new(InMemoryStateStore::new()),
        handler.clone(),
        HarnessOptions::default(),
    )
    .await;

    let priorities = [1, 3, 2, 3, 1];
    for (i, priority) in priorities.into_iter().enumerate() {
        let kind = TaskKind::analyze(vec![id(&format!("E{i}"))]);
        let outcome = h
            .queue
            .submit(NewTask::new(kind).with_priority(priority))
            .await
            .unwrap();
        assert!(outcome.is_accepted());
    }

    for _ in 0..priorities.len() {
        h.executor.run_once().await.unwrap().expect("attempt");
    }
    let order: Vec<Vec<EntityId>> = handler.requests.lock().await.clone();
    assert_eq!(
        order,
        vec![
            vec![id("E1")],
            vec![id("E3")],
            vec![id("E2")],
            vec![id("E0")],
            vec![id("E4")],
        ]
    );
}

// =============================================================================
// Watchdog
// =============================================================================

#[tokio::test]
async fn test_deadline_marks_task_retryable_timeout() {
    let clock = ManualClock::new(t0());
    let options = HarnessOptions {
        executor: ExecutorConfig {
            poll_interval: Duration::from_millis(10),
            max_execution: Duration::from_millis(50),
            grace_period: Duration::from_millis(20),
            dead_policy: DeadCheckpointPolicy::RetainLatest,
        },
        ..HarnessOptions::default()
    };
    let h = Harness::new(
        clock.clone(),
        Arc::new(InMemoryStateStore::new()),
        Arc::new(StuckHandler),
        options,
    )
    .await;
    let task_id = h
        .queue
        .submit(NewTask::new(TaskKind::analyze(vec![id("X")])))
        .await
        .unwrap()
        .task_id()
        .unwrap();

    let (_, outcome) = tokio::time::timeout(Duration::from_secs(2), h.executor.run_once())
        .await
        .expect("watchdog fired")
        .unwrap()
        .unwrap();
    let AttemptOutcome::Retrying { retry_at } = outcome else {
        panic!("expected retry, got {outcome:?}");
    };

    let task = h.queue.get(task_id).await.unwrap();
    assert_eq!(task.state, TaskState::FailedRetryable);
    assert_eq!(task.last_error.map(|e| e.kind), Some(ErrorKind::Timeout));
    assert_eq!(h.queue.stats().await.running, 0);

    clock.set(retry_at);
    assert_eq!(h.queue.promote_due(clock.now()).await.unwrap(), vec![task_id]);
    assert_eq!(h.queue.get(task_id).await.unwrap().state, TaskState::Pending);
}

// =============================================================================
// Retry and dead
// =============================================================================

#[tokio::test]
async fn test_transient_failures_back_off_then_die() {
    let clock = ManualClock::new(t0());
    let handler = Arc::new(FailingHandler {
        kind: ErrorKind::Transient,
        calls: AtomicUsize::new(0),
    });
    let options = HarnessOptions {
        retry: RetryPolicy {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            max_attempts: 3,
        },
        ..HarnessOptions::default()
    };
    let h = Harness::new(
        clock.clone(),
        Arc::new(InMemoryStateStore::new()),
        handler.clone(),
        options,
    )
    .await;
    let task_id = h
        .queue
        .submit(NewTask::new(TaskKind::analyze(vec![id("X")])))
        .await
        .unwrap()
        .task_id()
        .unwrap();

    // attempt 1 waits 4s, attempt 2 waits 8s
    let mut delays = Vec::new();
    for _ in 0..2 {
        let before = clock.now();
        let (_, outcome) = h.executor.run_once().await.unwrap().unwrap();
        let AttemptOutcome::Retrying { retry_at } = outcome else {
            panic!("expected retry, got {outcome:?}");
        };
        delays.push((retry_at - before).num_seconds());

        // not due yet
        assert!(h.executor.run_once().await.unwrap().is_none());
        clock.set(retry_at);
    }
    assert_eq!(delays, vec![4, 8]);

    let (_, outcome) = h.executor.run_once().await.unwrap().unwrap();
    assert_eq!(outcome, AttemptOutcome::Dead);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

    let dead = h.queue.dead_tasks().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].task_id, task_id);
    assert_eq!(dead[0].attempts, 3);

    h.hooks.flush().await;
    let stops: Vec<String> = h
        .sink
        .events_for(task_id)
        .await
        .into_iter()
        .filter(|e| e.phase == HookPhase::Stop)
        .map(|e| e.label)
        .collect();
    assert_eq!(stops, vec!["retry_scheduled", "retry_scheduled", "dead"]);
}

#[tokio::test]
async fn test_validation_failure_is_dead_on_first_attempt() {
    let clock = ManualClock::new(t0());
    let handler = Arc::new(FailingHandler {
        kind: ErrorKind::Validation,
        calls: AtomicUsize::new(0),
    });
    let h = Harness::new(
        clock,
        Arc::new(InMemoryStateStore::new()),
        handler.clone(),
        HarnessOptions::default(),
    )
    .await;
    h.queue
        .submit(NewTask::new(TaskKind::analyze(vec![id("X")])))
        .await
        .unwrap();

    let (_, outcome) = h.executor.run_once().await.unwrap().unwrap();
    assert_eq!(outcome, AttemptOutcome::Dead);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert!(h.executor.run_once().await.unwrap().is_none());
}

#[tokio::test]
async fn test_malformed_submission_creates_no_task() {
    let clock = ManualClock::new(t0());
    let h = Harness::new(
        clock,
        Arc::new(InMemoryStateStore::new()),
        Arc::new(RecordingHandler::default()),
        HarnessOptions::default(),
    )
    .await;

    let err = h
        .queue
        .submit(NewTask::new(TaskKind::refresh(vec![id("X")], "")))
        .await
        .unwrap_err();
    assert!(matches!(err, vigil_core::VigilError::Validation(_)));
    assert!(h.queue.is_empty().await);

    let err = h
        .queue
        .submit(NewTask::new(TaskKind::analyze(vec![id("X"), id("X")])))
        .await
        .unwrap_err();
    assert!(matches!(err, vigil_core::VigilError::Validation(_)));
    assert!(h.queue.is_empty().await);
}

// =============================================================================
// Resumability
// =============================================================================

#[tokio::test]
async fn test_crashed_task_resumes_from_checkpoint() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let clock = ManualClock::new(t0());
    let store = Arc::new(FileStore::open(temp_dir.path()).await.unwrap());

    // first process: the task gets through A and B, then the process dies
    let task_id = {
        let options = HarnessOptions {
            task_store: store.clone(),
            checkpoint_store: store.clone(),
            ..HarnessOptions::default()
        };
        let h = Harness::new(
            clock.clone(),
            Arc::new(InMemoryStateStore::new()),
            Arc::new(RecordingHandler::default()),
            options,
        )
        .await;
        let task_id = h
            .queue
            .submit(NewTask::new(TaskKind::analyze(vec![id("A"), id("B"), id("C")])))
            .await
            .unwrap()
            .task_id()
            .unwrap();
        h.queue.mark_running(task_id).await.unwrap();
        h.checkpoints
            .save(
                task_id,
                [id("A"), id("B")].into_iter().collect(),
                [id("C")].into_iter().collect(),
                json!({ "last": "B" }),
            )
            .await
            .unwrap();
        task_id
    };

    // second process over the same directory
    let store = Arc::new(FileStore::open(temp_dir.path()).await.unwrap());
    let handler = Arc::new(RecordingHandler::default());
    let options = HarnessOptions {
        task_store: store.clone(),
        checkpoint_store: store.clone(),
        ..HarnessOptions::default()
    };
    let h = Harness::new(
        clock,
        Arc::new(InMemoryStateStore::new()),
        handler.clone(),
        options,
    )
    .await;

    let resumed = h.queue.running_task().await.expect("task still running");
    assert_eq!(resumed.task_id, task_id);

    let (ran, outcome) = h.executor.run_once().await.unwrap().unwrap();
    assert_eq!(ran, task_id);
    assert_eq!(outcome, AttemptOutcome::Completed);
    assert_eq!(*handler.requests.lock().await, vec![vec![id("C")]]);

    // every payload entity is stamped, including the ones done before the crash
    for entity in ["A", "B", "C"] {
        assert!(h.state.get_last_analysis_ts(&id(entity)).await.unwrap().is_some());
    }
    assert!(h.checkpoints.latest(task_id).await.unwrap().is_none());

    let reopened = TaskQueue::open(
        QueueName::new("analysis"),
        store,
        Arc::new(ManualClock::new(t0())),
        Arc::new(UlidGenerator::new(ManualClock::new(t0()))),
        QueueLimits::default(),
        RetryPolicy::default(),
    )
    .await
    .unwrap();
    assert_eq!(reopened.get(task_id).await.unwrap().state, TaskState::Completed);
}

// =============================================================================
// Full pipeline
// =============================================================================

#[tokio::test]
async fn test_pipeline_processes_stale_entities_and_shuts_down() {
    let yaml = r#"
scheduler:
  interval-secs: 3600
  batch-size: 2
executor:
  poll-interval-ms: 10
hooks:
  flush-interval-ms: 10
"#;
    let config = VigilConfig::from_yaml(yaml).expect("config");
    let state = Arc::new(InMemoryStateStore::with_entities(["A", "B", "C"].map(id)));
    let sink = Arc::new(MemoryHookSink::new(100));

    let handle = PipelineBuilder::new(config)
        .queue("analysis", Arc::new(RecordingHandler::default()))
        .state_store(state.clone())
        .hook_sink(sink.clone())
        .build()
        .expect("build")
        .start()
        .await
        .expect("start");

    // first tick is immediate; wait for both batches to finish
    let queue = QueueName::new("analysis");
    let done = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let stats = handle.stats().await;
            if stats[0].completed == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(done.is_ok(), "both batches should complete");

    for entity in ["A", "B", "C"] {
        assert!(state.get_last_analysis_ts(&id(entity)).await.unwrap().is_some());
    }
    assert!(handle.tick_now().await.unwrap().created.is_empty());
    assert!(handle.dead_tasks(&queue).await.unwrap().is_empty());

    handle.shutdown_and_join().await;
    let stops = sink
        .events()
        .await
        .into_iter()
        .filter(|e| e.phase == HookPhase::Stop && e.label == "completed")
        .count();
    assert_eq!(stops, 2);
}

#[tokio::test]
async fn test_pipeline_pause_and_clear() {
    let yaml = r#"
scheduler:
  interval-secs: 3600
  paused: true
"#;
    let config = VigilConfig::from_yaml(yaml).expect("config");
    let handle = PipelineBuilder::new(config)
        .queue("analysis", Arc::new(StuckHandler))
        .state_store(Arc::new(InMemoryStateStore::with_entities([id("A")])))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    assert!(handle.scheduler_paused());
    assert!(handle.tick_now().await.unwrap().paused);

    let queue = QueueName::new("analysis");
    let outcome = handle
        .submit(&queue, NewTask::new(TaskKind::analyze(vec![id("Z")])).with_priority(5))
        .await
        .unwrap();
    assert!(matches!(outcome, SubmitOutcome::Accepted(_)));

    handle.resume_scheduler();
    assert!(!handle.scheduler_paused());

    handle.shutdown_and_join().await;
}
