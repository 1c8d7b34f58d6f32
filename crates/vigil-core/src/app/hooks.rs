//! HookEventRecorder - 監査イベントの非同期記録
//!
//! `record` は同期・ノンブロッキング。イベントは有界バッファに積まれ、
//! バックグラウンドのフラッシャーが HookSink へ書き出す。
//! バッファが満杯なら最も古い未フラッシュのイベントを捨て、カウンタを増やす。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{HookEvent, HookPhase, TaskError, TaskId};
use crate::ports::{Clock, HookSink, IdGenerator};

#[derive(Debug, Clone)]
pub struct HookRecorderConfig {
    pub buffer_capacity: usize,
    pub flush_interval: Duration,
    /// Upper bound on the final drain in `shutdown`.
    pub shutdown_timeout: Duration,
}

impl Default for HookRecorderConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1024,
            flush_interval: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

struct Shared {
    buffer: Mutex<VecDeque<HookEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    sink_failures: AtomicU64,
    wake: tokio::sync::Notify,
    /// One drain at a time, so batches reach the sink in order.
    drain_lock: tokio::sync::Mutex<()>,
    sink: Arc<dyn HookSink>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl Shared {
    fn buffer(&self) -> std::sync::MutexGuard<'_, VecDeque<HookEvent>> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn drain(&self) {
        let _drain = self.drain_lock.lock().await;
        let batch: Vec<HookEvent> = self.buffer().drain(..).collect();
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.sink.write_batch(&batch).await {
            self.sink_failures.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, lost = batch.len(), "HookEventRecorder: sink write failed");
        }
    }
}

/// Cloneable handle to the recorder. All clones share one buffer and flusher.
#[derive(Clone)]
pub struct HookEventRecorder {
    shared: Arc<Shared>,
    stop: CancellationToken,
    flusher: Arc<Mutex<Option<JoinHandle<()>>>>,
    shutdown_timeout: Duration,
}

impl HookEventRecorder {
    /// Start the background flusher.
    pub fn spawn(
        sink: Arc<dyn HookSink>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        config: HookRecorderConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            buffer: Mutex::new(VecDeque::with_capacity(config.buffer_capacity)),
            capacity: config.buffer_capacity.max(1),
            dropped: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
            wake: tokio::sync::Notify::new(),
            drain_lock: tokio::sync::Mutex::new(()),
            sink,
            ids,
            clock,
        });
        let stop = CancellationToken::new();

        let flusher = tokio::spawn({
            let shared = Arc::clone(&shared);
            let stop = stop.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = shared.wake.notified() => {}
                        _ = tokio::time::sleep(config.flush_interval) => {}
                    }
                    shared.drain().await;
                }
                shared.drain().await;
                debug!("HookEventRecorder: flusher stopped");
            }
        });

        Self {
            shared,
            stop,
            flusher: Arc::new(Mutex::new(Some(flusher))),
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Buffer one event. Never blocks on I/O and never fails.
    pub fn record(
        &self,
        task_id: TaskId,
        phase: HookPhase,
        label: impl Into<String>,
        input_digest: Option<String>,
        output_digest: Option<String>,
        error: Option<TaskError>,
    ) {
        let event = HookEvent {
            event_id: self.shared.ids.generate_event_id(),
            task_id,
            phase,
            label: label.into(),
            input_digest,
            output_digest,
            error,
            timestamp: self.shared.clock.now(),
        };

        let len = {
            let mut buffer = self.shared.buffer();
            if buffer.len() >= self.shared.capacity {
                buffer.pop_front();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buffer.push_back(event);
            buffer.len()
        };
        if len * 2 >= self.shared.capacity {
            self.shared.wake.notify_one();
        }
    }

    /// Events dropped because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Batches the sink failed to write.
    pub fn sink_failures(&self) -> u64 {
        self.shared.sink_failures.load(Ordering::Relaxed)
    }

    /// Events waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.shared.buffer().len()
    }

    /// Write everything buffered so far.
    pub async fn flush(&self) {
        self.shared.drain().await;
    }

    /// Drain and stop the flusher. Later `record`s are buffered but never written.
    ///
    /// A sink still writing after `shutdown_timeout` is abandoned: the batch in
    /// flight counts as a sink failure and whatever is still buffered as dropped.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let flusher = self
            .flusher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut flusher) = flusher else {
            return;
        };

        match tokio::time::timeout(self.shutdown_timeout, &mut flusher).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "HookEventRecorder: flusher task failed"),
            Err(_) => {
                flusher.abort();
                let unwritten = {
                    let mut buffer = self.shared.buffer();
                    let n = buffer.len();
                    buffer.clear();
                    n
                };
                self.shared.sink_failures.fetch_add(1, Ordering::Relaxed);
                self.shared
                    .dropped
                    .fetch_add(unwritten as u64, Ordering::Relaxed);
                warn!(
                    timeout = ?self.shutdown_timeout,
                    unwritten,
                    "HookEventRecorder: sink did not finish, final drain abandoned"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VigilError;
    use crate::impls::MemoryHookSink;
    use crate::ports::{SystemClock, UlidGenerator};
    use async_trait::async_trait;
    use ulid::Ulid;

    fn recorder(sink: Arc<dyn HookSink>, capacity: usize) -> HookEventRecorder {
        HookEventRecorder::spawn(
            sink,
            Arc::new(UlidGenerator::new(SystemClock)),
            Arc::new(SystemClock),
            HookRecorderConfig {
                buffer_capacity: capacity,
                flush_interval: Duration::from_secs(3600),
                shutdown_timeout: Duration::from_millis(50),
            },
        )
    }

    fn record_n(rec: &HookEventRecorder, task: TaskId, n: usize) {
        for i in 0..n {
            rec.record(task, HookPhase::Pre, format!("e{i}"), None, None, None);
        }
    }

    #[tokio::test]
    async fn flush_writes_events_in_order() {
        let sink = Arc::new(MemoryHookSink::new(100));
        let rec = recorder(sink.clone(), 100);
        let task = TaskId::from_ulid(Ulid::new());

        record_n(&rec, task, 3);
        rec.flush().await;

        let labels: Vec<String> = sink.events().await.into_iter().map(|e| e.label).collect();
        assert_eq!(labels, vec!["e0", "e1", "e2"]);
        assert_eq!(rec.buffered(), 0);
    }

    /// Sink that never finishes a write, so the buffer cannot drain.
    struct StuckSink;

    #[async_trait]
    impl HookSink for StuckSink {
        async fn write_batch(&self, _events: &[HookEvent]) -> Result<(), VigilError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn full_buffer_drops_oldest_and_counts() {
        let sink = Arc::new(MemoryHookSink::new(100));
        let rec = recorder(sink.clone(), 4);
        let task = TaskId::from_ulid(Ulid::new());

        // single-threaded runtime: the flusher cannot run between these records
        record_n(&rec, task, 6);
        assert_eq!(rec.dropped(), 2);
        assert_eq!(rec.buffered(), 4);

        rec.flush().await;
        let labels: Vec<String> = sink.events().await.into_iter().map(|e| e.label).collect();
        assert_eq!(labels, vec!["e2", "e3", "e4", "e5"]);
    }

    #[tokio::test]
    async fn record_does_not_wait_for_a_stuck_sink() {
        let rec = recorder(Arc::new(StuckSink), 2);
        let task = TaskId::from_ulid(Ulid::new());

        record_n(&rec, task, 2);
        // let the flusher pick up the batch and hang in the sink
        tokio::task::yield_now().await;
        record_n(&rec, task, 10);
        assert!(rec.dropped() >= 8);
    }

    struct FailingSink;

    #[async_trait]
    impl HookSink for FailingSink {
        async fn write_batch(&self, _events: &[HookEvent]) -> Result<(), VigilError> {
            Err(VigilError::storage("disk full"))
        }
    }

    #[tokio::test]
    async fn sink_errors_are_counted_not_propagated() {
        let rec = recorder(Arc::new(FailingSink), 10);
        record_n(&rec, TaskId::from_ulid(Ulid::new()), 1);
        rec.flush().await;
        assert_eq!(rec.sink_failures(), 1);
    }

    #[tokio::test]
    async fn shutdown_drains_remaining_events() {
        let sink = Arc::new(MemoryHookSink::new(100));
        let rec = recorder(sink.clone(), 100);
        record_n(&rec, TaskId::from_ulid(Ulid::new()), 2);

        rec.shutdown().await;
        assert_eq!(sink.events().await.len(), 2);
    }

    #[tokio::test]
    async fn shutdown_gives_up_on_a_stuck_sink() {
        let rec = recorder(Arc::new(StuckSink), 100);
        let task = TaskId::from_ulid(Ulid::new());

        record_n(&rec, task, 3);
        let flushing = tokio::spawn({
            let rec = rec.clone();
            async move { rec.flush().await }
        });
        tokio::task::yield_now().await;
        record_n(&rec, task, 2);

        let stopped = tokio::time::timeout(Duration::from_secs(2), rec.shutdown()).await;
        assert!(stopped.is_ok(), "shutdown must not wait on the sink forever");
        assert_eq!(rec.sink_failures(), 1);
        assert_eq!(rec.dropped(), 2);
        assert_eq!(rec.buffered(), 0);
        flushing.abort();
    }
}
