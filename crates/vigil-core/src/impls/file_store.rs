//! File-backed TaskStore + CheckpointStore.
//!
//! Layout under the root directory:
//! - `tasks/<ulid>.json`: one task record, replaced atomically (tmp + rename)
//! - `checkpoints/<ulid>.jsonl`: append-only checkpoint log for one task

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::{Checkpoint, QueueName, Task, TaskId, VigilError};
use crate::ports::{CheckpointStore, TaskStore};

pub struct FileStore {
    root: PathBuf,
    /// Serializes checkpoint log rewrites against appends.
    checkpoint_lock: Mutex<()>,
}

impl FileStore {
    /// Create the directory layout if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, VigilError> {
        let root = root.into();
        debug!(?root, "FileStore::open: called");
        fs::create_dir_all(root.join("tasks")).await?;
        fs::create_dir_all(root.join("checkpoints")).await?;
        Ok(Self {
            root,
            checkpoint_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn task_path(&self, task_id: TaskId) -> PathBuf {
        self.root
            .join("tasks")
            .join(format!("{}.json", task_id.as_ulid()))
    }

    fn checkpoint_path(&self, task_id: TaskId) -> PathBuf {
        self.root
            .join("checkpoints")
            .join(format!("{}.jsonl", task_id.as_ulid()))
    }

    async fn read_checkpoints(&self, task_id: TaskId) -> Result<Vec<Checkpoint>, VigilError> {
        let path = self.checkpoint_path(task_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut list = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<Checkpoint>(line) {
                Ok(cp) => list.push(cp),
                // a crash mid-append leaves a torn final line
                Err(e) => warn!(?path, error = %e, "FileStore::read_checkpoints: skipping bad line"),
            }
        }
        list.sort_by_key(|c| c.sequence_no);
        Ok(list)
    }
}

/// Write `bytes` to `path` via a sibling temp file and rename.
///
/// The parent directory is synced after the rename, so the new entry is
/// durable and not only the file contents.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), VigilError> {
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    sync_parent(path).await
}

#[cfg(unix)]
async fn sync_parent(path: &Path) -> Result<(), VigilError> {
    if let Some(parent) = path.parent() {
        fs::File::open(parent).await?.sync_all().await?;
    }
    Ok(())
}

// directories cannot be opened as files here
#[cfg(not(unix))]
async fn sync_parent(_path: &Path) -> Result<(), VigilError> {
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), VigilError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl TaskStore for FileStore {
    async fn save(&self, task: &Task) -> Result<(), VigilError> {
        let bytes = serde_json::to_vec_pretty(task)?;
        write_atomic(&self.task_path(task.task_id), &bytes).await
    }

    async fn delete(&self, task_id: TaskId) -> Result<(), VigilError> {
        remove_if_exists(&self.task_path(task_id)).await
    }

    async fn load_queue(&self, queue: &QueueName) -> Result<Vec<Task>, VigilError> {
        let mut tasks = Vec::new();
        let mut dir = fs::read_dir(self.root.join("tasks")).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await?;
            let task: Task = serde_json::from_slice(&bytes).map_err(|e| {
                VigilError::storage(format!("corrupt task file {}: {e}", path.display()))
            })?;
            if &task.queue_name == queue {
                tasks.push(task);
            }
        }
        debug!(%queue, count = tasks.len(), "FileStore::load_queue: loaded");
        Ok(tasks)
    }
}

#[async_trait]
impl CheckpointStore for FileStore {
    async fn append(&self, checkpoint: &Checkpoint) -> Result<(), VigilError> {
        let _guard = self.checkpoint_lock.lock().await;
        let line = serde_json::to_string(checkpoint)? + "\n";
        let path = self.checkpoint_path(checkpoint.task_id);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        // first line of a new log: the directory entry must be durable too
        if file.metadata().await?.len() == line.len() as u64 {
            sync_parent(&path).await?;
        }
        Ok(())
    }

    async fn list(&self, task_id: TaskId) -> Result<Vec<Checkpoint>, VigilError> {
        let _guard = self.checkpoint_lock.lock().await;
        self.read_checkpoints(task_id).await
    }

    async fn retain_latest(&self, task_id: TaskId, keep: usize) -> Result<(), VigilError> {
        let _guard = self.checkpoint_lock.lock().await;
        let list = self.read_checkpoints(task_id).await?;
        if list.len() <= keep {
            return Ok(());
        }
        let path = self.checkpoint_path(task_id);
        if keep == 0 {
            return remove_if_exists(&path).await;
        }

        let mut content = String::new();
        for cp in &list[list.len() - keep..] {
            content.push_str(&serde_json::to_string(cp)?);
            content.push('\n');
        }
        write_atomic(&path, content.as_bytes()).await
    }

    async fn delete_all(&self, task_id: TaskId) -> Result<(), VigilError> {
        let _guard = self.checkpoint_lock.lock().await;
        remove_if_exists(&self.checkpoint_path(task_id)).await
    }
}
