use thiserror::Error;

use crate::core::queue::EntryStatus;
use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: EntryStatus,
        to: EntryStatus,
    },

    #[error("Task {task_id} depends on unknown task {dependency}")]
    UnresolvableDependency { task_id: TaskId, dependency: TaskId },

    #[error("Dependency cycle detected at task: {0}")]
    DependencyCycle(String),

    #[error("Execution backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Queue corrupted: {0}")]
    QueueCorrupted(String),
}

pub type Result<T> = std::result::Result<T, Error>;
