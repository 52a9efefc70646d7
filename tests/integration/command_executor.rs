//! Subprocess backend driven by small `sh` scripts.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use taskloop::core::Task;
use taskloop::execution::{CommandConfig, CommandExecutor, ExitInfo, Executor};
use taskloop::orchestration::LoopRunner;
use taskloop::stream::NormalizedEvent;

use crate::fixtures::{queue_of, sequential_config, sh_executor, sh_executor_with, EventLog};

const ASSISTANT_LINE: &str = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"Implementing"},{"type":"tool_use","id":"toolu_1","name":"Bash","input":{"command":"cargo test"}}]}}"#;
const RESULT_LINE: &str = r#"{"type":"result","subtype":"success"}"#;

fn echo_lines(lines: &[&str]) -> String {
    lines
        .iter()
        .map(|line| format!("printf '%s\\n' '{}'", line))
        .collect::<Vec<_>>()
        .join("; ")
}

#[tokio::test]
async fn test_successful_run_streams_events() {
    let dir = TempDir::new().unwrap();
    let executor = sh_executor(&echo_lines(&[ASSISTANT_LINE, "plain noise", RESULT_LINE]));
    let log = EventLog::default();
    let callback = log.callback();

    let result = executor
        .run(
            &Task::new("US-001", "t"),
            dir.path(),
            &callback,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert!(!result.is_complete);
    assert_eq!(result.exit, ExitInfo::Exited { code: Some(0) });

    let events = log.events();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0], NormalizedEvent::text("Implementing"));
    match &events[1] {
        NormalizedEvent::ToolCall { name, detail, .. } => {
            assert_eq!(name, "Bash");
            assert_eq!(detail, "cargo test");
        }
        other => panic!("Expected ToolCall, got {:?}", other),
    }
    assert!(events[2].is_complete());
}

#[tokio::test]
async fn test_completion_marker_sets_is_complete() {
    let dir = TempDir::new().unwrap();
    let marker_line = r#"{"type":"text","content":"done <promise>COMPLETE</promise>"}"#;
    let executor = sh_executor(&echo_lines(&[marker_line, RESULT_LINE]));
    let log = EventLog::default();

    let result = executor
        .run(
            &Task::new("US-001", "t"),
            dir.path(),
            &log.callback(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert!(result.is_complete);
}

#[tokio::test]
async fn test_exit_zero_without_complete_event_is_not_success() {
    let dir = TempDir::new().unwrap();
    let executor = sh_executor(&echo_lines(&[r#"{"type":"text","content":"hi"}"#]));
    let log = EventLog::default();

    let result = executor
        .run(
            &Task::new("US-001", "t"),
            dir.path(),
            &log.callback(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!result.success);
    assert!(!result.is_complete);
    assert!(result.exit.is_success());
}

#[tokio::test]
async fn test_nonzero_exit_is_failure() {
    let dir = TempDir::new().unwrap();
    let script = format!("{}; echo oops >&2; exit 3", echo_lines(&[RESULT_LINE]));
    let executor = sh_executor(&script);
    let log = EventLog::default();

    let result = executor
        .run(
            &Task::new("US-001", "t"),
            dir.path(),
            &log.callback(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.exit, ExitInfo::Exited { code: Some(3) });
}

#[tokio::test]
async fn test_invalid_utf8_output_is_not_fatal() {
    let dir = TempDir::new().unwrap();
    let raw_dir = dir.path().join("raw");
    let raw = raw_dir.clone();
    let script = format!(
        "{}; printf 'garbage \\377\\376 bytes\\n'; {}",
        echo_lines(&[ASSISTANT_LINE]),
        echo_lines(&[RESULT_LINE])
    );
    let executor = sh_executor_with(&script, move |config: &mut CommandConfig| {
        config.raw_log_dir = Some(raw);
    });
    let log = EventLog::default();

    let result = executor
        .run(
            &Task::new("US-001", "t"),
            dir.path(),
            &log.callback(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(result.success);
    let events = log.events();
    assert_eq!(events.len(), 3);
    assert!(events[2].is_complete());

    // The raw log keeps the original bytes.
    let raw = std::fs::read(raw_dir.join("US-001.jsonl")).unwrap();
    assert!(raw.windows(2).any(|pair| pair == [0xFF, 0xFE]));
}

#[tokio::test]
async fn test_invalid_utf8_is_replaced_in_plain_text_mode() {
    let dir = TempDir::new().unwrap();
    let executor = sh_executor_with(
        "printf 'caf\\351 ok\\n'",
        |config: &mut CommandConfig| config.plain_text = true,
    );
    let log = EventLog::default();

    executor
        .run(
            &Task::new("US-001", "t"),
            dir.path(),
            &log.callback(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(log.events()[0], NormalizedEvent::text("caf\u{FFFD} ok"));
}

#[tokio::test]
async fn test_plain_text_backend_completes_on_clean_exit() {
    let dir = TempDir::new().unwrap();
    let executor = sh_executor_with(
        "echo 'working on it'; echo 'all done <promise>COMPLETE</promise>'",
        |config: &mut CommandConfig| config.plain_text = true,
    );
    let log = EventLog::default();

    let result = executor
        .run(
            &Task::new("US-001", "t"),
            dir.path(),
            &log.callback(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert!(result.is_complete);
    assert_eq!(
        log.events(),
        vec![
            NormalizedEvent::text("working on it"),
            NormalizedEvent::text("all done <promise>COMPLETE</promise>"),
            NormalizedEvent::complete(Some("exit".to_string())),
        ]
    );
}

#[tokio::test]
async fn test_plain_text_backend_failing_exit_is_failure() {
    let dir = TempDir::new().unwrap();
    let executor = sh_executor_with("echo 'half done'; exit 2", |config: &mut CommandConfig| {
        config.plain_text = true
    });
    let log = EventLog::default();

    let result = executor
        .run(
            &Task::new("US-001", "t"),
            dir.path(),
            &log.callback(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(log.events(), vec![NormalizedEvent::text("half done")]);
}

#[tokio::test]
async fn test_task_json_is_written_to_stdin() {
    let dir = TempDir::new().unwrap();
    let script = format!("cat > task.json; {}", echo_lines(&[RESULT_LINE]));
    let executor = sh_executor(&script);
    let log = EventLog::default();
    let task = Task::new("US-042", "Write docs").with_dependencies(["US-001"]);

    let result = executor
        .run(&task, dir.path(), &log.callback(), CancellationToken::new())
        .await
        .unwrap();
    assert!(result.success);

    let written = std::fs::read_to_string(dir.path().join("task.json")).unwrap();
    let parsed: Task = serde_json::from_str(&written).unwrap();
    assert_eq!(parsed, task);
}

#[tokio::test]
async fn test_idle_backend_is_killed() {
    let dir = TempDir::new().unwrap();
    let executor = sh_executor_with("sleep 5", |config: &mut CommandConfig| {
        config.idle_timeout = Duration::from_millis(200);
    });
    let log = EventLog::default();

    let result = tokio::time::timeout(
        Duration::from_secs(4),
        executor.run(
            &Task::new("US-001", "t"),
            dir.path(),
            &log.callback(),
            CancellationToken::new(),
        ),
    )
    .await
    .expect("idle timeout fires")
    .unwrap();

    assert!(!result.success);
    assert_eq!(
        result.exit,
        ExitInfo::IdleTimeout {
            after: Duration::from_millis(200)
        }
    );
}

#[tokio::test]
async fn test_cancellation_kills_backend() {
    let dir = TempDir::new().unwrap();
    let executor = sh_executor("sleep 5");
    let log = EventLog::default();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let result = tokio::time::timeout(
        Duration::from_secs(4),
        executor.run(&Task::new("US-001", "t"), dir.path(), &log.callback(), cancel),
    )
    .await
    .expect("cancel stops the backend")
    .unwrap();

    assert!(result.was_cancelled());
    assert!(!result.success);
}

#[tokio::test]
async fn test_raw_output_is_teed_to_log_dir() {
    let dir = TempDir::new().unwrap();
    let raw_dir = dir.path().join("raw");
    let raw = raw_dir.clone();
    let executor = sh_executor_with(
        &echo_lines(&[ASSISTANT_LINE, RESULT_LINE]),
        move |config: &mut CommandConfig| {
            config.raw_log_dir = Some(raw);
        },
    );
    let log = EventLog::default();

    executor
        .run(
            &Task::new("US-001", "t"),
            dir.path(),
            &log.callback(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let raw = std::fs::read_to_string(raw_dir.join("US-001.jsonl")).unwrap();
    assert_eq!(raw.lines().collect::<Vec<_>>(), vec![ASSISTANT_LINE, RESULT_LINE]);
}

#[tokio::test]
async fn test_missing_program_is_backend_unavailable() {
    let dir = TempDir::new().unwrap();
    let executor = CommandExecutor::new(CommandConfig {
        command: vec!["taskloop-definitely-missing-backend".to_string()],
        ..CommandConfig::default()
    });
    let log = EventLog::default();

    assert!(matches!(
        executor.check_available(),
        Err(taskloop::Error::BackendUnavailable(_))
    ));
    let err = executor
        .run(
            &Task::new("US-001", "t"),
            dir.path(),
            &log.callback(),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, taskloop::Error::BackendUnavailable(_)));
}

#[tokio::test]
async fn test_runner_drives_command_backend_to_completion() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(sh_executor(&echo_lines(&[
        r#"{"type":"text","content":"working"}"#,
        RESULT_LINE,
    ])));
    let config = taskloop::orchestration::RunnerConfig {
        work_dir: dir.path().to_path_buf(),
        ..sequential_config()
    };
    let mut runner = LoopRunner::new(queue_of(&[("A", &[]), ("B", &["A"])]), executor, config);

    let result = runner.run().await.unwrap();

    assert!(result.all_complete);
    assert_eq!(result.iterations_run, 2);
    assert_eq!(result.tasks_completed, 2);
}
