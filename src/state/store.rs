//! File-backed persistence for the queue and run checkpoints.
//!
//! The queue lives in one JSON document; the checkpoint sits next to it as
//! `<name>.checkpoint.json`. Every write goes to a temp file first and is
//! renamed into place, so readers never see a half-written document.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::core::queue::{QueueDocument, TaskQueue};
use crate::core::task::TaskId;
use crate::error::{Error, Result};

/// Unique identifier for one runner invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the runner was doing when the checkpoint was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointState {
    Running,
    Idle,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub run_id: RunId,
    pub iteration: u32,
    pub max_iterations: u32,
    pub running_task_ids: Vec<TaskId>,
    pub state: CheckpointState,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        run_id: RunId,
        iteration: u32,
        max_iterations: u32,
        running_task_ids: Vec<TaskId>,
        state: CheckpointState,
    ) -> Self {
        Self {
            run_id,
            iteration,
            max_iterations,
            running_task_ids,
            state,
            updated_at: Utc::now(),
        }
    }
}

/// Reads and writes the queue document and its checkpoint.
#[derive(Debug, Clone)]
pub struct QueueStore {
    queue_path: PathBuf,
    checkpoint_path: PathBuf,
}

impl QueueStore {
    pub fn new(queue_path: impl Into<PathBuf>) -> Self {
        let queue_path = queue_path.into();
        let checkpoint_path = queue_path.with_extension("checkpoint.json");
        Self {
            queue_path,
            checkpoint_path,
        }
    }

    pub fn queue_path(&self) -> &Path {
        &self.queue_path
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint_path
    }

    /// Load the queue. A missing file is an empty queue.
    ///
    /// # Errors
    /// Returns `QueueCorrupted` when the document cannot be parsed or fails
    /// the structural checks in [`TaskQueue::from_document`].
    pub async fn load_queue(&self) -> Result<TaskQueue> {
        debug!(path = %self.queue_path.display(), "QueueStore::load_queue");
        let contents = match tokio::fs::read_to_string(&self.queue_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(TaskQueue::new()),
            Err(e) => return Err(e.into()),
        };
        let doc: QueueDocument = serde_json::from_str(&contents).map_err(|e| {
            Error::QueueCorrupted(format!("{}: {}", self.queue_path.display(), e))
        })?;
        TaskQueue::from_document(doc)
    }

    pub async fn save_queue(&self, queue: &TaskQueue) -> Result<()> {
        let contents = serde_json::to_string_pretty(&queue.to_document())?;
        write_atomic(&self.queue_path, &contents).await?;
        debug!(path = %self.queue_path.display(), entries = queue.len(), "queue saved");
        Ok(())
    }

    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let contents = serde_json::to_string_pretty(checkpoint)?;
        write_atomic(&self.checkpoint_path, &contents).await?;
        debug!(
            iteration = checkpoint.iteration,
            state = ?checkpoint.state,
            "checkpoint saved"
        );
        Ok(())
    }

    /// The last checkpoint, or `None` when no run has written one.
    pub async fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        match tokio::fs::read_to_string(&self.checkpoint_path).await {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write `contents` to a temp file beside `path`, then rename it over `path`.
async fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    tokio::fs::write(&tmp_path, contents).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}
