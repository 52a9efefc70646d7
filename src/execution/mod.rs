//! Execution backend boundary.
//!
//! The runner hands one task at a time to an [`Executor`]. Executors stream
//! backend output through the normalizer, report every event through the
//! callback as it arrives, and fold the events into an [`ExecutionResult`]
//! with a [`CompletionTracker`].

pub mod command;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::task::Task;
use crate::stream::NormalizedEvent;
use crate::Result;

pub use command::{CommandConfig, CommandExecutor};

/// Callback invoked synchronously for every normalized event.
pub type EventCallback = dyn Fn(&NormalizedEvent) + Send + Sync;

/// How a backend process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitInfo {
    /// The process exited on its own. `code` is `None` when killed by a signal.
    Exited { code: Option<i32> },
    /// No output for `after`; the process was killed.
    IdleTimeout { after: Duration },
    /// The run's cancellation token fired; the process was killed.
    Cancelled,
}

impl ExitInfo {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitInfo::Exited { code: Some(0) })
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitInfo::Exited { code: Some(code) } => write!(f, "exited with code {}", code),
            ExitInfo::Exited { code: None } => write!(f, "killed by signal"),
            ExitInfo::IdleTimeout { after } => write!(f, "idle for {:?}", after),
            ExitInfo::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of one task execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// The backend finished the task cleanly.
    pub success: bool,
    /// The backend declared that all work, not just this task, is done.
    pub is_complete: bool,
    pub duration_ms: u64,
    pub exit: ExitInfo,
}

impl ExecutionResult {
    pub fn was_cancelled(&self) -> bool {
        self.exit == ExitInfo::Cancelled
    }
}

/// Runs one task against an execution backend.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Fail with `BackendUnavailable` when the backend cannot be started.
    fn check_available(&self) -> Result<()>;

    /// Execute `task` in `work_dir`.
    ///
    /// `on_event` is called for each normalized event before `run` returns.
    /// When `cancel` fires the backend is stopped and the result carries
    /// [`ExitInfo::Cancelled`].
    async fn run(
        &self,
        task: &Task,
        work_dir: &Path,
        on_event: &EventCallback,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult>;
}

/// Folds a task's event stream into `success` and `is_complete`.
///
/// `success` needs a `complete` event with a non-error reason and a clean
/// exit. `is_complete` needs a `complete` event and the completion marker in
/// some text event; an exit code of 0 alone never means complete.
#[derive(Debug, Clone)]
pub struct CompletionTracker {
    marker: String,
    complete_reason: Option<Option<String>>,
    marker_seen: bool,
}

impl CompletionTracker {
    pub fn new(marker: &str) -> Self {
        Self {
            marker: marker.to_string(),
            complete_reason: None,
            marker_seen: false,
        }
    }

    pub fn observe(&mut self, event: &NormalizedEvent) {
        match event {
            NormalizedEvent::Complete { reason } => {
                self.complete_reason = Some(reason.clone());
            }
            NormalizedEvent::Text { content } if !self.marker.is_empty() => {
                if content.contains(&self.marker) {
                    self.marker_seen = true;
                }
            }
            _ => {}
        }
    }

    pub fn saw_complete(&self) -> bool {
        self.complete_reason.is_some()
    }

    pub fn marker_seen(&self) -> bool {
        self.marker_seen
    }

    pub fn finish(&self, exit: ExitInfo, duration: Duration) -> ExecutionResult {
        let clean_completion = matches!(
            &self.complete_reason,
            Some(reason) if !reason.as_deref().is_some_and(is_error_reason)
        );
        ExecutionResult {
            success: clean_completion && exit.is_success(),
            is_complete: self.saw_complete() && self.marker_seen,
            duration_ms: duration.as_millis() as u64,
            exit,
        }
    }
}

fn is_error_reason(reason: &str) -> bool {
    let reason = reason.to_ascii_lowercase();
    reason.starts_with("error") || reason.contains("fail") || reason == "cancelled"
}
