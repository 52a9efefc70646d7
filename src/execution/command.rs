//! Generic subprocess backend.
//!
//! Spawns the configured command in the task's work directory, writes the
//! task as JSON to its stdin and streams stdout through the normalizer.
//! Output is decoded lossily, so bytes that are not UTF-8 never end a run.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CompletionTracker, EventCallback, ExecutionResult, ExitInfo, Executor};
use crate::config::{DEFAULT_COMMAND, DEFAULT_COMPLETION_MARKER};
use crate::core::task::Task;
use crate::error::{Error, Result};
use crate::stream::{NormalizedEvent, StreamNormalizer};

/// Default time without output before the backend is considered stuck.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

/// How long to wait for stderr after the process has gone.
const STDERR_GRACE: Duration = Duration::from_secs(2);

/// Characters of stderr kept in the failure log line.
const STDERR_TAIL_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct CommandConfig {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub idle_timeout: Duration,
    pub completion_marker: String,
    /// When set, raw stdout is copied to `<dir>/<task-id>.jsonl`.
    pub raw_log_dir: Option<PathBuf>,
    /// The backend writes plain text rather than structured records.
    /// Unstructured lines become `text` events, and a clean exit without a
    /// completion record counts as one.
    pub plain_text: bool,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_COMMAND.split_whitespace().map(String::from).collect(),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            completion_marker: DEFAULT_COMPLETION_MARKER.to_string(),
            raw_log_dir: None,
            plain_text: false,
        }
    }
}

/// Executes tasks by running a local command.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    config: CommandConfig,
}

impl CommandExecutor {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CommandConfig {
        &self.config
    }

    fn program(&self) -> Result<(&String, &[String])> {
        self.config
            .command
            .split_first()
            .ok_or_else(|| Error::Validation("command must not be empty".to_string()))
    }

    async fn open_raw_log(&self, task: &Task) -> Result<Option<File>> {
        let Some(dir) = &self.config.raw_log_dir else {
            return Ok(None);
        };
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.jsonl", file_safe(task.id.as_str())));
        debug!(path = %path.display(), "raw output log");
        Ok(Some(File::create(path).await?))
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    fn name(&self) -> &str {
        self.config
            .command
            .first()
            .map(String::as_str)
            .unwrap_or("command")
    }

    fn check_available(&self) -> Result<()> {
        let (program, _) = self.program()?;
        which::which(program)
            .map(|path| debug!(path = %path.display(), "backend found"))
            .map_err(|_| Error::BackendUnavailable(format!("{}: not found on PATH", program)))
    }

    async fn run(
        &self,
        task: &Task,
        work_dir: &Path,
        on_event: &EventCallback,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let (program, args) = self.program()?;
        info!(task_id = %task.id, program = %program, work_dir = %work_dir.display(), "starting backend");

        let mut child = Command::new(program)
            .args(args)
            .current_dir(work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    Error::BackendUnavailable(format!("{}: {}", program, e))
                }
                _ => Error::Io(e),
            })?;

        let payload = serde_json::to_vec(task)?;
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                // A backend that never reads stdin closes the pipe early.
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(error = %e, "backend did not read task payload");
                }
                let _ = stdin.shutdown().await;
            });
        }

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Validation("backend stdout not captured".to_string()))?;
        let mut reader = BufReader::new(stdout);
        let mut raw_line = Vec::new();
        let mut raw_log = self.open_raw_log(task).await?;
        let mut normalizer = StreamNormalizer::new().with_plain_text(self.config.plain_text);
        let mut tracker = CompletionTracker::new(&self.config.completion_marker);
        let idle_timeout = self.config.idle_timeout;

        let exit = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(task_id = %task.id, "cancelled, killing backend");
                    let _ = child.kill().await;
                    break ExitInfo::Cancelled;
                }
                next = tokio::time::timeout(idle_timeout, reader.read_until(b'\n', &mut raw_line)) => match next {
                    Err(_) => {
                        warn!(task_id = %task.id, ?idle_timeout, "backend idle, killing");
                        let _ = child.kill().await;
                        break ExitInfo::IdleTimeout { after: idle_timeout };
                    }
                    Ok(Ok(0)) => {
                        let status = child.wait().await?;
                        break ExitInfo::Exited { code: status.code() };
                    }
                    Ok(Ok(_)) => {
                        if let Some(file) = raw_log.as_mut() {
                            file.write_all(&raw_line).await?;
                            if !raw_line.ends_with(b"\n") {
                                file.write_all(b"\n").await?;
                            }
                        }
                        let events = {
                            let decoded = String::from_utf8_lossy(&raw_line);
                            normalizer.push_line(decoded.trim_end_matches(['\r', '\n']))
                        };
                        raw_line.clear();
                        for event in events {
                            tracker.observe(&event);
                            on_event(&event);
                        }
                    }
                    Ok(Err(e)) => {
                        let _ = child.kill().await;
                        return Err(e.into());
                    }
                }
            }
        };

        if let Some(file) = raw_log.as_mut() {
            file.flush().await?;
        }

        if self.config.plain_text && exit.is_success() && !tracker.saw_complete() {
            let event = NormalizedEvent::complete(Some("exit".to_string()));
            tracker.observe(&event);
            on_event(&event);
        }

        let result = tracker.finish(exit, started.elapsed());
        let stderr = match stderr_task {
            Some(handle) => tokio::time::timeout(STDERR_GRACE, handle)
                .await
                .ok()
                .and_then(|joined| joined.ok())
                .unwrap_or_default(),
            None => String::new(),
        };

        if result.success {
            info!(
                task_id = %task.id,
                duration_ms = result.duration_ms,
                is_complete = result.is_complete,
                "backend finished"
            );
        } else {
            warn!(
                task_id = %task.id,
                exit = %result.exit,
                duration_ms = result.duration_ms,
                stderr = %stderr_tail(&stderr),
                "backend run failed"
            );
        }
        Ok(result)
    }
}

fn file_safe(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn stderr_tail(stderr: &str) -> &str {
    let trimmed = stderr.trim_end();
    match trimmed.char_indices().rev().nth(STDERR_TAIL_CHARS) {
        Some((cut, _)) => &trimmed[cut..],
        None => trimmed,
    }
}
