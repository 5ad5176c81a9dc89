//! End-to-end runs through the driver: ordering, artifacts, parallel
//! batches, and termination on pathological graphs.

use std::sync::Arc;

use maestro::core::{TaskId, TaskStatus};
use maestro::driver::RunOutcome;
use maestro::events::{EventStore, EventType};

use crate::fixtures::{graph, task, MockWorker, TestWorkspace};

#[tokio::test]
async fn sequential_run_follows_phase_then_dependency_order() {
    let ws = TestWorkspace::new();
    let worker = Arc::new(MockWorker::new());
    let mut driver = ws.driver(ws.config(), worker, "e2e-order");

    // A (phase 1, no deps), B (phase 1, deps=[A]), C (phase 2, no deps).
    // B unblocks after A and beats C on phase.
    let mut g = graph(vec![
        task("c", 2, &[]),
        task("b", 1, &["a"]),
        task("a", 1, &[]),
    ]);

    let outcome = driver.run(&mut g).await.unwrap();
    assert_eq!(outcome, RunOutcome::AllDone);

    let started: Vec<TaskId> = EventStore::replay(&ws.sessions_dir(), "e2e-order")
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == EventType::TaskStarted)
        .filter_map(|e| e.task_id)
        .collect();
    assert_eq!(
        started,
        vec![TaskId::from("a"), TaskId::from("b"), TaskId::from("c")]
    );
}

#[tokio::test]
async fn run_persists_graph_and_artifacts() {
    let ws = TestWorkspace::new();
    let worker = Arc::new(MockWorker::new());
    let mut driver = ws.driver(ws.config(), worker, "e2e-artifacts");
    let mut g = graph(vec![task("a", 1, &[]), task("b", 1, &["a"])]);

    driver.run(&mut g).await.unwrap();

    // Artifacts exist and the dependency's content is real worker output.
    let a_out = g.task(&TaskId::from("a")).unwrap().output.clone().unwrap();
    assert_eq!(
        std::fs::read_to_string(&a_out).unwrap(),
        "completed work for architect"
    );

    // The persisted document round-trips with terminal statuses.
    let persisted = maestro::TaskGraph::load(&ws.prd_path()).unwrap();
    assert!(persisted.all_done());
    assert_eq!(persisted.task(&TaskId::from("b")).unwrap().attempts, 1);
}

#[tokio::test]
async fn parallel_run_batches_independent_tasks() {
    let ws = TestWorkspace::new();
    let mut config = ws.config();
    config.parallel = true;
    config.max_workers = 4;
    let worker = Arc::new(MockWorker::new());
    let mut driver = ws.driver(config, worker, "e2e-parallel");

    let mut g = graph(vec![
        task("a", 1, &[]),
        task("b", 1, &[]),
        task("c", 1, &[]),
        task("d", 2, &["a", "b", "c"]),
    ]);

    let outcome = driver.run(&mut g).await.unwrap();
    assert_eq!(outcome, RunOutcome::AllDone);

    // a, b, c all started before d: the first batch dispatched them
    // together, and d only became ready afterwards.
    let started: Vec<TaskId> = EventStore::replay(&ws.sessions_dir(), "e2e-parallel")
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == EventType::TaskStarted)
        .filter_map(|e| e.task_id)
        .collect();
    assert_eq!(started.len(), 4);
    assert_eq!(started[3], TaskId::from("d"));
}

#[tokio::test]
async fn cyclic_graph_terminates_as_blocked() {
    let ws = TestWorkspace::new();
    let worker = Arc::new(MockWorker::new());
    let mut driver = ws.driver(ws.config(), worker.clone(), "e2e-cycle");

    let mut g = graph(vec![
        task("a", 1, &["c"]),
        task("b", 1, &["a"]),
        task("c", 1, &["b"]),
    ]);

    // Terminates (does not hang) and explains the block with the cycle.
    let outcome = driver.run(&mut g).await.unwrap();
    match outcome {
        RunOutcome::Blocked { remaining, cycles } => {
            assert_eq!(remaining.len(), 3);
            assert_eq!(cycles.len(), 1);
            assert_eq!(cycles[0].len(), 3);
        }
        other => panic!("expected Blocked, got {:?}", other),
    }
    // No task ever became ready, so no worker call was made.
    assert_eq!(worker.total_calls(), 0);
}

#[tokio::test]
async fn failed_task_halts_run_leaving_runnable_tasks_untouched() {
    use crate::fixtures::ScriptedWorker;

    let ws = TestWorkspace::new();
    // The first architect call fails at the worker level, which fails the
    // task without consuming the gate retry.
    let worker = Arc::new(
        ScriptedWorker::new().script(
            "architect",
            vec![Err(maestro::Error::WorkerCall("down".to_string()))],
        ),
    );
    let mut driver = ws.driver(ws.config(), worker, "e2e-halt");

    let mut g = graph(vec![task("a", 1, &[]), task("z", 1, &[])]);
    let outcome = driver.run(&mut g).await.unwrap();

    match outcome {
        RunOutcome::TasksFailed { failed } => assert_eq!(failed, vec![TaskId::from("a")]),
        other => panic!("expected TasksFailed, got {:?}", other),
    }
    // "z" was runnable but the halt-on-failure rule stopped the run first.
    assert_eq!(g.task(&TaskId::from("z")).unwrap().status, TaskStatus::Ready);
}
