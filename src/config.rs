use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::execution::CommandConfig;
use crate::orchestration::RunnerConfig;
use crate::{Error, Result};

/// Upper bound for concurrent executions in one iteration.
pub const MAX_PARALLEL_LIMIT: usize = 8;

pub const DEFAULT_COMMAND: &str = "claude -p --output-format stream-json --verbose";
pub const DEFAULT_COMPLETION_MARKER: &str = "<promise>COMPLETE</promise>";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub command: Option<String>,
    pub parallel: bool,
    pub max_parallel: usize,
    /// Fixed iteration budget. When unset the budget follows the incomplete task count.
    pub max_iterations: Option<u32>,
    /// Attempts per task before it is marked failed. Zero means unlimited.
    pub max_attempts: u32,
    pub idle_timeout_secs: u64,
    pub status_interval_secs: u64,
    pub completion_marker: String,
    pub trust_backend_completion: bool,
    pub raw_log_dir: Option<String>,
    /// The backend prints plain text instead of stream-json.
    pub plain_text: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command: None,
            parallel: false,
            max_parallel: 3,
            max_iterations: None,
            max_attempts: 3,
            idle_timeout_secs: 600,
            status_interval_secs: 30,
            completion_marker: DEFAULT_COMPLETION_MARKER.to_string(),
            trust_backend_completion: true,
            raw_log_dir: None,
            plain_text: false,
        }
    }
}

impl Config {
    pub fn app_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".taskloop"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::app_dir()?.join("config.toml"))
    }

    pub fn log_path() -> Result<PathBuf> {
        Ok(Self::app_dir()?.join("taskloop.log"))
    }

    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or(DEFAULT_COMMAND)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            parallel = config.parallel,
            max_parallel = config.max_parallel,
            max_attempts = config.max_attempts,
            command = ?config.command,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let app_dir = Self::app_dir()?;
        if !app_dir.exists() {
            debug!(dir = %app_dir.display(), "Creating app directory");
            fs::create_dir_all(&app_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 || self.max_parallel > MAX_PARALLEL_LIMIT {
            return Err(Error::Validation(format!(
                "max_parallel must be between 1 and {}, got {}",
                MAX_PARALLEL_LIMIT, self.max_parallel
            )));
        }
        if self.idle_timeout_secs == 0 {
            return Err(Error::Validation(
                "idle_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.effective_command().split_whitespace().next().is_none() {
            return Err(Error::Validation("command must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn runner_config(&self, work_dir: PathBuf) -> RunnerConfig {
        RunnerConfig {
            parallel: self.parallel,
            max_parallel: self.max_parallel,
            max_attempts: self.max_attempts,
            status_interval: Duration::from_secs(self.status_interval_secs.max(1)),
            trust_backend_completion: self.trust_backend_completion,
            work_dir,
        }
    }

    pub fn command_config(&self) -> CommandConfig {
        CommandConfig {
            command: self
                .effective_command()
                .split_whitespace()
                .map(String::from)
                .collect(),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            completion_marker: self.completion_marker.clone(),
            raw_log_dir: self.raw_log_dir.as_deref().map(expand_tilde),
            plain_text: self.plain_text,
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
