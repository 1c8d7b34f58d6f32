//! HookSink implementations.

use std::collections::VecDeque;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::{HookEvent, TaskId, VigilError};
use crate::ports::HookSink;

/// Keeps the newest `max_retained` events in memory.
pub struct MemoryHookSink {
    events: Mutex<VecDeque<HookEvent>>,
    max_retained: usize,
}

impl MemoryHookSink {
    pub fn new(max_retained: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            max_retained,
        }
    }

    pub async fn events(&self) -> Vec<HookEvent> {
        self.events.lock().await.iter().cloned().collect()
    }

    pub async fn events_for(&self, task_id: TaskId) -> Vec<HookEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl HookSink for MemoryHookSink {
    async fn write_batch(&self, batch: &[HookEvent]) -> Result<(), VigilError> {
        let mut events = self.events.lock().await;
        events.extend(batch.iter().cloned());
        let excess = events.len().saturating_sub(self.max_retained);
        events.drain(..excess);
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonlHookSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlHookSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Vec<HookEvent>, VigilError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(path = ?self.path, error = %e, "JsonlHookSink::load: skipping bad line"),
            }
        }
        Ok(events)
    }

    pub async fn read_all(&self) -> Result<Vec<HookEvent>, VigilError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    /// Retention: drop events older than `cutoff`, rewriting the file.
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, VigilError> {
        let _guard = self.lock.lock().await;
        let events = self.load().await?;
        let (kept, pruned): (Vec<_>, Vec<_>) =
            events.into_iter().partition(|e| e.timestamp >= cutoff);
        if pruned.is_empty() {
            return Ok(0);
        }

        let mut content = String::new();
        for event in &kept {
            content.push_str(&serde_json::to_string(event)?);
            content.push('\n');
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.path).await?;
        debug!(path = ?self.path, pruned = pruned.len(), "JsonlHookSink::prune_older_than");
        Ok(pruned.len())
    }
}

#[async_trait]
impl HookSink for JsonlHookSink {
    async fn write_batch(&self, batch: &[HookEvent]) -> Result<(), VigilError> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        let mut buf = String::new();
        for event in batch {
            buf.push_str(&serde_json::to_string(event)?);
            buf.push('\n');
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventId, HookPhase};
    use tempfile::TempDir;
    use ulid::Ulid;

    fn event(task_id: TaskId, ts: DateTime<Utc>) -> HookEvent {
        HookEvent {
            event_id: EventId::from_ulid(Ulid::new()),
            task_id,
            phase: HookPhase::Pre,
            label: "execute".into(),
            input_digest: None,
            output_digest: None,
            error: None,
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn memory_sink_keeps_newest() {
        let sink = MemoryHookSink::new(2);
        let task = TaskId::from_ulid(Ulid::new());
        let now = Utc::now();
        let batch: Vec<_> = (0..3).map(|i| event(task, now + chrono::Duration::seconds(i))).collect();

        sink.write_batch(&batch).await.unwrap();
        let kept = sink.events().await;
        assert_eq!(kept, batch[1..].to_vec());
    }

    #[tokio::test]
    async fn jsonl_sink_appends_and_prunes() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlHookSink::new(dir.path().join("hooks").join("events.jsonl"));
        let task = TaskId::from_ulid(Ulid::new());
        let now = Utc::now();
        let old = event(task, now - chrono::Duration::days(30));
        let fresh = event(task, now);

        sink.write_batch(std::slice::from_ref(&old)).await.unwrap();
        sink.write_batch(std::slice::from_ref(&fresh)).await.unwrap();
        assert_eq!(sink.read_all().await.unwrap().len(), 2);

        let pruned = sink
            .prune_older_than(now - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(sink.read_all().await.unwrap(), vec![fresh]);
    }
}
