//! Loop runner behaviour against a scripted backend.

use std::sync::Arc;
use std::time::Duration;

use taskloop::core::{EntryStatus, QueueDocument, QueueEntry, Task, TaskId, TaskQueue};
use taskloop::orchestration::{LoopRunner, RunnerEvent, StopReason};

use crate::fixtures::{
    drain, parallel_config, queue_of, runner_with_events, sequential_config, Outcome,
    ScriptedExecutor,
};

fn status_of(queue: &TaskQueue, id: &str) -> EntryStatus {
    queue.entry(&TaskId::from(id)).expect("entry exists").status
}

#[tokio::test]
async fn test_empty_queue_is_complete_with_zero_iterations() {
    let executor = Arc::new(ScriptedExecutor::new());
    let mut runner = LoopRunner::new(TaskQueue::new(), executor.clone(), sequential_config());

    let result = runner.run().await.unwrap();

    assert!(result.all_complete);
    assert_eq!(result.iterations_run, 0);
    assert!(executor.dispatched().is_empty());
}

#[tokio::test]
async fn test_dependency_runs_after_its_prerequisite() {
    let executor = Arc::new(ScriptedExecutor::new());
    let queue = queue_of(&[("B", &["A"]), ("A", &[])]);
    let mut runner = LoopRunner::new(queue, executor.clone(), parallel_config(4));

    let result = runner.run().await.unwrap();

    assert!(result.all_complete);
    assert_eq!(executor.dispatched(), vec!["A", "B"]);
    assert_eq!(result.iterations_run, 2);
    assert!(runner.queue().get(&TaskId::from("B")).unwrap().passes);
}

#[tokio::test]
async fn test_parallel_batch_is_capped_at_max_parallel() {
    let executor = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(30)));
    let queue = queue_of(&[("A", &[]), ("B", &[]), ("C", &[])]);
    let (mut runner, mut rx) = runner_with_events(queue, executor.clone(), parallel_config(2));

    let result = runner.run().await.unwrap();

    assert!(result.all_complete);
    assert_eq!(result.iterations_run, 2);
    assert_eq!(executor.max_in_flight(), 2);

    let batches: Vec<Vec<TaskId>> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            RunnerEvent::IterationStart {
                current_task_ids, ..
            } => Some(current_task_ids),
            _ => None,
        })
        .collect();
    assert_eq!(
        batches,
        vec![
            vec![TaskId::from("A"), TaskId::from("B")],
            vec![TaskId::from("C")]
        ]
    );
}

#[tokio::test]
async fn test_sequential_mode_runs_one_task_per_iteration() {
    let executor = Arc::new(ScriptedExecutor::new());
    let queue = queue_of(&[("A", &[]), ("B", &[]), ("C", &[])]);
    let mut runner = LoopRunner::new(queue, executor.clone(), sequential_config());

    let result = runner.run().await.unwrap();

    assert_eq!(result.iterations_run, 3);
    assert_eq!(executor.max_in_flight(), 1);
}

#[tokio::test]
async fn test_dependency_cycle_stops_blocked_without_dispatch() {
    let mut doc = QueueDocument::default();
    doc.tasks = vec![
        Task::new("A", "a").with_dependencies(["B"]),
        Task::new("B", "b").with_dependencies(["A"]),
    ];
    doc.queue = doc
        .tasks
        .iter()
        .enumerate()
        .map(|(i, task)| QueueEntry {
            task_id: task.id.clone(),
            spec_id: "spec-1".to_string(),
            status: EntryStatus::Queued,
            position: i as u64,
            started_at: None,
            completed_at: None,
            attempts: 0,
        })
        .collect();
    doc.counters.next_position = 2;
    let queue = TaskQueue::from_document(doc).unwrap();
    let executor = Arc::new(ScriptedExecutor::new());
    let mut runner = LoopRunner::new(queue, executor.clone(), parallel_config(2));

    let result = runner.run().await.unwrap();

    assert!(!result.all_complete);
    assert!(result.iterations_run <= 1);
    assert_eq!(
        result.stop,
        StopReason::Blocked {
            task_id: TaskId::from("A"),
            unmet: vec![TaskId::from("B")],
        }
    );
    assert!(executor.dispatched().is_empty());
}

#[tokio::test]
async fn test_budget_exhausted() {
    let executor = Arc::new(ScriptedExecutor::new());
    let queue = queue_of(&[("A", &[]), ("B", &[]), ("C", &[])]);
    let mut runner =
        LoopRunner::new(queue, executor.clone(), sequential_config()).with_max_iterations(2);

    let result = runner.run().await.unwrap();

    assert_eq!(result.stop, StopReason::BudgetExhausted);
    assert!(!result.all_complete);
    assert_eq!(result.iterations_run, 2);
    assert_eq!(result.tasks_completed, 2);
    assert_eq!(status_of(runner.queue(), "C"), EntryStatus::Queued);
}

#[tokio::test]
async fn test_raised_budget_extends_run() {
    let executor = Arc::new(ScriptedExecutor::new());
    let queue = queue_of(&[("A", &[]), ("B", &[]), ("C", &[])]);
    let runner = LoopRunner::new(queue, executor.clone(), sequential_config()).with_max_iterations(1);
    let handle = runner.handle();

    // 3 incomplete tasks -> ceil(3 * 1.2) = 4
    assert_eq!(handle.on_tasks_changed(3), 4);
    let mut runner = runner;
    let result = runner.run().await.unwrap();

    assert!(result.all_complete);
    assert_eq!(result.iterations_run, 3);
}

#[tokio::test]
async fn test_failed_task_is_retried_then_succeeds() {
    let executor = Arc::new(ScriptedExecutor::new().script("A", &[Outcome::Fail, Outcome::Succeed]));
    let queue = queue_of(&[("A", &[]), ("B", &["A"])]);
    let mut runner = LoopRunner::new(queue, executor.clone(), sequential_config());

    let result = runner.run().await.unwrap();

    assert!(result.all_complete);
    assert_eq!(executor.dispatched(), vec!["A", "A", "B"]);
    assert_eq!(
        runner.queue().entry(&TaskId::from("A")).unwrap().attempts,
        2
    );
}

#[tokio::test]
async fn test_task_failing_every_attempt_ends_failed() {
    let executor = Arc::new(ScriptedExecutor::new().with_default(Outcome::Fail));
    let queue = queue_of(&[("A", &[])]);
    let config = taskloop::orchestration::RunnerConfig {
        max_attempts: 2,
        ..sequential_config()
    };
    let mut runner = LoopRunner::new(queue, executor.clone(), config).with_max_iterations(10);

    let result = runner.run().await.unwrap();

    assert_eq!(
        result.stop,
        StopReason::Failed {
            task_ids: vec![TaskId::from("A")]
        }
    );
    assert!(!result.all_complete);
    assert_eq!(executor.dispatched().len(), 2);
    assert_eq!(status_of(runner.queue(), "A"), EntryStatus::Failed);
}

#[tokio::test]
async fn test_failed_prerequisite_blocks_dependent() {
    let executor = Arc::new(ScriptedExecutor::new().script("A", &[Outcome::Fail]));
    let queue = queue_of(&[("A", &[]), ("B", &["A"])]);
    let config = taskloop::orchestration::RunnerConfig {
        max_attempts: 1,
        ..sequential_config()
    };
    let mut runner = LoopRunner::new(queue, executor.clone(), config);

    let result = runner.run().await.unwrap();

    assert_eq!(
        result.stop,
        StopReason::Blocked {
            task_id: TaskId::from("B"),
            unmet: vec![TaskId::from("A")],
        }
    );
    assert_eq!(result.iterations_run, 1);
}

#[tokio::test]
async fn test_backend_completion_stops_loop_when_trusted() {
    let executor = Arc::new(ScriptedExecutor::new().script("A", &[Outcome::CompleteAll]));
    let queue = queue_of(&[("A", &[]), ("B", &[])]);
    let mut runner = LoopRunner::new(queue, executor.clone(), sequential_config());

    let result = runner.run().await.unwrap();

    assert!(result.all_complete);
    assert_eq!(result.stop, StopReason::Complete);
    assert_eq!(result.iterations_run, 1);
    // B never ran, so the queue disagrees.
    assert!(!result.queue_complete);
    assert_eq!(status_of(runner.queue(), "A"), EntryStatus::Completed);
    assert_eq!(status_of(runner.queue(), "B"), EntryStatus::Queued);
}

#[tokio::test]
async fn test_backend_completion_ignored_when_untrusted() {
    let executor = Arc::new(ScriptedExecutor::new().script("A", &[Outcome::CompleteAll]));
    let queue = queue_of(&[("A", &[]), ("B", &[])]);
    let config = taskloop::orchestration::RunnerConfig {
        trust_backend_completion: false,
        ..sequential_config()
    };
    let mut runner = LoopRunner::new(queue, executor.clone(), config);

    let result = runner.run().await.unwrap();

    assert!(result.all_complete);
    assert!(result.queue_complete);
    assert_eq!(result.iterations_run, 2);
    assert_eq!(executor.dispatched(), vec!["A", "B"]);
}

#[tokio::test]
async fn test_cancellation_interrupts_and_refunds_attempt() {
    let executor = Arc::new(ScriptedExecutor::new().with_default(Outcome::Hang));
    let queue = queue_of(&[("A", &[])]);
    let mut runner = LoopRunner::new(queue, executor.clone(), sequential_config());
    let handle = runner.handle();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    });
    let result = tokio::time::timeout(Duration::from_secs(5), runner.run())
        .await
        .expect("run stops after cancel")
        .unwrap();

    assert_eq!(result.stop, StopReason::Interrupted);
    let entry = runner.queue().entry(&TaskId::from("A")).unwrap();
    assert_eq!(entry.status, EntryStatus::Queued);
    assert_eq!(entry.attempts, 0);
}

#[tokio::test]
async fn test_unavailable_backend_is_fatal() {
    let executor = Arc::new(ScriptedExecutor::new().unavailable());
    let mut runner = LoopRunner::new(queue_of(&[("A", &[])]), executor.clone(), sequential_config());

    let err = runner.run().await.unwrap_err();

    assert!(matches!(err, taskloop::Error::BackendUnavailable(_)));
    assert!(executor.dispatched().is_empty());
}

#[tokio::test]
async fn test_status_events_emitted_while_batch_runs() {
    let executor = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(120)));
    let config = taskloop::orchestration::RunnerConfig {
        status_interval: Duration::from_millis(20),
        ..sequential_config()
    };
    let (mut runner, mut rx) = runner_with_events(queue_of(&[("A", &[])]), executor, config);

    runner.run().await.unwrap();

    let statuses: Vec<RunnerEvent> = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, RunnerEvent::Status { .. }))
        .collect();
    assert!(!statuses.is_empty());
    match &statuses[0] {
        RunnerEvent::Status {
            iteration,
            running_task_ids,
            ..
        } => {
            assert_eq!(*iteration, 1);
            assert_eq!(running_task_ids, &vec![TaskId::from("A")]);
        }
        other => panic!("Expected Status, got {:?}", other),
    }
}

#[tokio::test]
async fn test_zero_status_interval_disables_heartbeat() {
    let executor = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(30)));
    let config = taskloop::orchestration::RunnerConfig {
        status_interval: Duration::ZERO,
        ..parallel_config(2)
    };
    let (mut runner, mut rx) =
        runner_with_events(queue_of(&[("A", &[]), ("B", &[])]), executor, config);

    let result = runner.run().await.unwrap();

    assert!(result.all_complete);
    assert_eq!(result.iterations_run, 1);
    assert!(!drain(&mut rx)
        .iter()
        .any(|e| matches!(e, RunnerEvent::Status { .. })));
}

#[tokio::test]
async fn test_iteration_end_reports_completed_ids() {
    let executor = Arc::new(ScriptedExecutor::new().script("B", &[Outcome::Fail]));
    let queue = queue_of(&[("A", &[]), ("B", &[])]);
    let (mut runner, mut rx) = runner_with_events(queue, executor, parallel_config(2));

    runner.run().await.unwrap();

    let ends: Vec<(bool, Vec<TaskId>)> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            RunnerEvent::IterationEnd {
                all_complete,
                task_completed_ids,
                ..
            } => Some((all_complete, task_completed_ids)),
            _ => None,
        })
        .collect();
    assert_eq!(ends[0], (false, vec![TaskId::from("A")]));
    assert_eq!(ends.last().unwrap(), &(true, vec![TaskId::from("B")]));
}

#[tokio::test]
async fn test_completed_ids_never_shrink_during_run() {
    let executor = Arc::new(
        ScriptedExecutor::new()
            .script("B", &[Outcome::Fail, Outcome::Succeed])
            .script("D", &[Outcome::Fail, Outcome::Fail, Outcome::Succeed]),
    );
    let queue = queue_of(&[
        ("A", &[]),
        ("B", &["A"]),
        ("C", &["A"]),
        ("D", &["B", "C"]),
        ("E", &[]),
    ]);
    let (mut runner, mut rx) = runner_with_events(queue, executor, parallel_config(3));

    let result = runner.run().await.unwrap();
    assert!(result.all_complete);

    let mut seen: Vec<TaskId> = Vec::new();
    for event in drain(&mut rx) {
        if let RunnerEvent::IterationEnd {
            task_completed_ids, ..
        } = event
        {
            for id in task_completed_ids {
                assert!(!seen.contains(&id), "{} completed twice", id);
                seen.push(id);
            }
        }
    }
    assert_eq!(seen.len(), 5);
}
