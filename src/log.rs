//! Structured logging for debugging taskloop.
//!
//! Log levels:
//! - ERROR: Critical failures that prevent a run from continuing
//! - WARN: Unexpected conditions that are recoverable (failed executions, blocked queues)
//! - INFO: High-level run notifications (iterations, task completion, stop reasons)
//! - DEBUG: Queue transitions and persistence traces
//! - TRACE: Every normalized stream event
//!
//! Debug mode can be enabled with `--debug` flag or `TASKLOOP_DEBUG=1` env var.
//! `RUST_LOG` takes precedence over both when set.

use std::fs::File;
use std::sync::Mutex;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::Result;

/// Initialize logging to ~/.taskloop/taskloop.log.
pub fn init_with_debug(debug: bool) -> Result<()> {
    let debug_enabled = debug || debug_from_env(std::env::var("TASKLOOP_DEBUG").ok().as_deref());

    let default_level = if debug_enabled { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let dir = Config::app_dir()?;
    std::fs::create_dir_all(&dir)?;
    // Truncate file on startup
    let file = File::create(Config::log_path()?)?;

    // A second init (tests, embedding callers) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(false),
        )
        .try_init();

    Ok(())
}

fn debug_from_env(value: Option<&str>) -> bool {
    value
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
