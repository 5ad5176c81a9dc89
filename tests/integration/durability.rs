//! Event log durability: crash simulation, replay, and resume.

use std::sync::Arc;

use maestro::core::{TaskId, TaskStatus};
use maestro::driver::{Driver, RunOutcome};
use maestro::events::{EventStore, EventType};

use crate::fixtures::{graph, task, MockWorker, TestWorkspace};

#[tokio::test]
async fn replay_returns_exact_events_in_write_order_after_crash() {
    let ws = TestWorkspace::new();
    {
        let mut store = ws.event_store("crash");
        // Five explicit events on top of SessionStarted.
        for id in ["a", "b", "c"] {
            store
                .emit(
                    EventType::TaskCompleted,
                    serde_json::Value::Null,
                    Some(TaskId::from(id)),
                    None,
                )
                .unwrap();
        }
        store.checkpoint("midpoint").unwrap();
        store
            .emit(
                EventType::TaskFailed,
                serde_json::json!({"reason": "boom"}),
                Some(TaskId::from("d")),
                None,
            )
            .unwrap();
        // Dropping the store without a SessionCompleted simulates a crash.
    }

    let events = EventStore::replay(&ws.sessions_dir(), "crash").unwrap();
    assert_eq!(events.len(), 6);
    assert_eq!(events[0].event_type, EventType::SessionStarted);
    assert_eq!(events[4].event_type, EventType::Checkpoint);
    assert_eq!(events[4].data["completed_tasks"], 3);
    assert_eq!(events[5].event_type, EventType::TaskFailed);

    // Timestamps never go backwards across the log.
    for pair in events.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

#[tokio::test]
async fn resume_skips_completed_tasks_and_finishes_the_rest() {
    let ws = TestWorkspace::new();

    // First run: crash after "a" completes by only letting "a" through.
    {
        let mut store = ws.event_store("resumed");
        store
            .emit(
                EventType::TaskCompleted,
                serde_json::Value::Null,
                Some(TaskId::from("a")),
                None,
            )
            .unwrap();
    }

    let (events, completed) = EventStore::resume(&ws.sessions_dir(), "resumed").unwrap();
    assert_eq!(completed.len(), 1);

    let mut g = graph(vec![task("a", 1, &[]), task("b", 1, &["a"])]);
    assert_eq!(Driver::skip_completed(&mut g, &completed), 1);
    assert_eq!(g.task(&TaskId::from("a")).unwrap().status, TaskStatus::Done);

    let worker = Arc::new(MockWorker::new());
    let mut driver = Driver::new(
        ws.config(),
        worker.clone(),
        events,
        ws.prd_path(),
        ws.outputs_dir(),
    )
    .unwrap();

    let outcome = driver.run(&mut g).await.unwrap();
    assert_eq!(outcome, RunOutcome::AllDone);

    // Only "b" actually ran in the second session.
    let started: Vec<TaskId> = EventStore::replay(&ws.sessions_dir(), "resumed")
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == EventType::TaskStarted)
        .filter_map(|e| e.task_id)
        .collect();
    assert_eq!(started, vec![TaskId::from("b")]);

    // The log carries the resume marker between the two lives.
    let events = EventStore::replay(&ws.sessions_dir(), "resumed").unwrap();
    assert!(events.iter().any(|e| e.event_type == EventType::SessionResumed));
}

#[tokio::test]
async fn snapshot_is_never_more_authoritative_than_the_log() {
    let ws = TestWorkspace::new();
    {
        let mut store = ws.event_store("fold");
        store
            .emit(
                EventType::TaskCompleted,
                serde_json::Value::Null,
                Some(TaskId::from("a")),
                None,
            )
            .unwrap();
    }

    // Corrupt the snapshot; resume must fall back to folding the log and
    // still report "a" as completed.
    std::fs::write(ws.sessions_dir().join("fold.state.json"), "garbage").unwrap();
    let (_store, completed) = EventStore::resume(&ws.sessions_dir(), "fold").unwrap();
    assert!(completed.contains(&TaskId::from("a")));
}

#[tokio::test]
async fn full_run_records_lifecycle_events_for_every_task() {
    let ws = TestWorkspace::new();
    let worker = Arc::new(MockWorker::new());
    let mut driver = ws.driver(ws.config(), worker, "lifecycle-log");
    let mut g = graph(vec![task("a", 1, &[]), task("b", 2, &["a"])]);

    driver.run(&mut g).await.unwrap();

    let events = EventStore::replay(&ws.sessions_dir(), "lifecycle-log").unwrap();
    for id in ["a", "b"] {
        let task_id = TaskId::from(id);
        for wanted in [
            EventType::TaskStarted,
            EventType::LlmCallStarted,
            EventType::LlmCallCompleted,
            EventType::GatePassed,
            EventType::OutputWritten,
            EventType::TaskCompleted,
        ] {
            assert!(
                events
                    .iter()
                    .any(|e| e.event_type == wanted && e.task_id.as_ref() == Some(&task_id)),
                "missing {:?} for task {}",
                wanted,
                id
            );
        }
    }
    assert_eq!(
        events.last().unwrap().event_type,
        EventType::SessionCompleted
    );
}
