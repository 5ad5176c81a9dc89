//! Gate pipeline and council behavior through full driver runs.

use std::sync::Arc;

use maestro::core::{TaskId, TaskStatus};
use maestro::driver::RunOutcome;
use maestro::events::{EventStore, EventType};
use maestro::gates::hard_limits::{HardLimitRule, Severity};

use crate::fixtures::{graph, task, MockWorker, ScriptedWorker, TestWorkspace};

fn severe_rule(pattern: &str) -> HardLimitRule {
    HardLimitRule {
        name: "no-secrets".to_string(),
        pattern: Some(pattern.to_string()),
        check: None,
        params: Default::default(),
        severity: Severity::Severe,
        message: "secret material in output".to_string(),
    }
}

#[tokio::test]
async fn severe_hard_limit_skips_validator_and_fails_task() {
    let ws = TestWorkspace::new();
    let mut config = ws.config();
    config.hard_limits = vec![severe_rule("API_KEY")];

    // Both attempts trip the severe rule; the validator must never run.
    let worker = Arc::new(
        ScriptedWorker::new().script(
            "architect",
            vec![Ok("here is the API_KEY=123"), Ok("again API_KEY=456")],
        ),
    );
    let mut driver = ws.driver(config, worker, "severe");
    let mut g = graph(vec![task("a", 1, &[])]);

    let outcome = driver.run(&mut g).await.unwrap();
    assert!(matches!(outcome, RunOutcome::TasksFailed { .. }));

    let events = EventStore::replay(&ws.sessions_dir(), "severe").unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::HardLimitViolation));
    // Fail-fast past the severe match: no configurable gate produced an
    // event, passing or failing.
    assert!(!events.iter().any(|e| e.event_type == EventType::GateFailed));
    assert!(!events.iter().any(|e| e.event_type == EventType::GatePassed));
}

#[tokio::test]
async fn gate_failure_gets_exactly_one_retry() {
    let ws = TestWorkspace::new();

    // First output is empty (fails output-nonempty), the retry is real.
    let worker = Arc::new(
        ScriptedWorker::new().script("architect", vec![Ok("   "), Ok("actual design document")]),
    );
    let mut driver = ws.driver(ws.config(), worker, "retry");
    let mut g = graph(vec![task("a", 1, &[])]);

    let outcome = driver.run(&mut g).await.unwrap();
    assert_eq!(outcome, RunOutcome::AllDone);

    let events = EventStore::replay(&ws.sessions_dir(), "retry").unwrap();
    let retries = events
        .iter()
        .filter(|e| e.event_type == EventType::TaskRetry)
        .count();
    assert_eq!(retries, 1);

    // The retry's output is what got persisted.
    let artifact = g.task(&TaskId::from("a")).unwrap().output.clone().unwrap();
    assert_eq!(
        std::fs::read_to_string(&artifact).unwrap(),
        "actual design document"
    );
}

#[tokio::test]
async fn validator_rejecting_both_attempts_fails_the_task() {
    let ws = TestWorkspace::new();
    let worker = Arc::new(ScriptedWorker::new().script(
        "mercury-validator",
        vec![
            Ok("REJECT\nIncomplete.\nConfidence: 0.8"),
            Ok("REJECT\nStill incomplete.\nConfidence: 0.8"),
        ],
    ));
    let mut driver = ws.driver(ws.config(), worker, "reject-twice");
    let mut g = graph(vec![task("a", 1, &[])]);

    let outcome = driver.run(&mut g).await.unwrap();
    match outcome {
        RunOutcome::TasksFailed { failed } => assert_eq!(failed, vec![TaskId::from("a")]),
        other => panic!("expected TasksFailed, got {:?}", other),
    }
    match &g.task(&TaskId::from("a")).unwrap().status {
        TaskStatus::Failed { error } => assert!(error.contains("mercury-validator")),
        other => panic!("expected Failed, got {}", other),
    }
}

#[tokio::test]
async fn disabled_gates_accept_any_output() {
    let ws = TestWorkspace::new();
    let mut config = ws.config();
    config.gates_enabled = false;

    // Output that the validator would reject sails through.
    let worker = Arc::new(ScriptedWorker::new().script("architect", vec![Ok("TODO: later")]));
    let mut driver = ws.driver(config, worker, "gates-off");
    let mut g = graph(vec![task("a", 1, &[])]);

    assert_eq!(driver.run(&mut g).await.unwrap(), RunOutcome::AllDone);
}

#[tokio::test]
async fn council_majority_rejection_fails_early_phase_task() {
    let ws = TestWorkspace::new();
    let mut config = ws.config();
    config.council_enabled = true;

    let worker = Arc::new(
        ScriptedWorker::new()
            .script(
                "architecture-reviewer",
                vec![Ok("REJECT\nWrong shape.\nConfidence: 0.9")],
            )
            .script(
                "quality-reviewer",
                vec![Ok("REJECT\nUntested.\nConfidence: 0.8")],
            )
            .script(
                "implementation-reviewer",
                vec![Ok("APPROVE\nWorks though.\nConfidence: 0.6")],
            ),
    );
    let mut driver = ws.driver(config, worker, "council-reject");
    let mut g = graph(vec![task("a", 1, &[])]);

    let outcome = driver.run(&mut g).await.unwrap();
    assert!(matches!(outcome, RunOutcome::TasksFailed { .. }));

    let events = EventStore::replay(&ws.sessions_dir(), "council-reject").unwrap();
    let verdict = events
        .iter()
        .find(|e| e.event_type == EventType::CouncilVerdict)
        .expect("council verdict event");
    assert_eq!(verdict.data["verdict"], "rejected");
    assert_eq!(verdict.data["consensus"], "majority");
    assert_eq!(verdict.data["votes"], 3);
}

#[tokio::test]
async fn gate_retried_task_faces_council_review() {
    let ws = TestWorkspace::new();
    let mut config = ws.config();
    config.council_enabled = true;
    // Threshold below every phase: only the retry can trigger a review.
    config.council_phase_threshold = 0;

    // The architect burns its gate retry (empty first output), then the
    // retried task goes before a unanimous rejecting panel.
    let worker = Arc::new(
        ScriptedWorker::new()
            .script("architect", vec![Ok("   "), Ok("actual design document")])
            .script(
                "architecture-reviewer",
                vec![Ok("REJECT\nWrong shape.\nConfidence: 0.9")],
            )
            .script(
                "quality-reviewer",
                vec![Ok("REJECT\nUntested.\nConfidence: 0.8")],
            )
            .script(
                "implementation-reviewer",
                vec![Ok("REJECT\nOff target.\nConfidence: 0.8")],
            ),
    );
    let mut driver = ws.driver(config, worker, "council-after-retry");
    let mut g = graph(vec![task("a", 1, &[])]);

    let outcome = driver.run(&mut g).await.unwrap();
    assert!(matches!(outcome, RunOutcome::TasksFailed { .. }));

    // The retry counted as a second attempt and that is what put the task
    // before the council.
    assert_eq!(g.task(&TaskId::from("a")).unwrap().attempts, 2);

    let events = EventStore::replay(&ws.sessions_dir(), "council-after-retry").unwrap();
    assert!(events.iter().any(|e| e.event_type == EventType::TaskRetry));
    let verdict = events
        .iter()
        .find(|e| e.event_type == EventType::CouncilVerdict)
        .expect("council verdict event");
    assert_eq!(verdict.data["verdict"], "rejected");
}

#[tokio::test]
async fn council_skipped_for_late_phase_tasks() {
    let ws = TestWorkspace::new();
    let mut config = ws.config();
    config.council_enabled = true;
    config.council_phase_threshold = 1;

    let worker = Arc::new(MockWorker::new());
    let mut driver = ws.driver(config, worker.clone(), "council-skip");
    // Phase 2 on a first attempt: no review.
    let mut g = graph(vec![task("a", 2, &[])]);

    assert_eq!(driver.run(&mut g).await.unwrap(), RunOutcome::AllDone);
    assert_eq!(worker.calls_for("architecture-reviewer"), 0);
    assert_eq!(worker.calls_for("quality-reviewer"), 0);
    assert_eq!(worker.calls_for("implementation-reviewer"), 0);
}

#[tokio::test]
async fn council_deadlock_from_failed_members_does_not_fail_task() {
    let ws = TestWorkspace::new();
    let mut config = ws.config();
    config.council_enabled = true;

    // All three member calls fail: three abstains, deadlock, verdict
    // pending. Pending is not a rejection, so the task completes.
    let worker = Arc::new(
        ScriptedWorker::new()
            .script(
                "architecture-reviewer",
                vec![Err(maestro::Error::WorkerCall("down".to_string()))],
            )
            .script(
                "quality-reviewer",
                vec![Err(maestro::Error::WorkerCall("down".to_string()))],
            )
            .script(
                "implementation-reviewer",
                vec![Err(maestro::Error::WorkerCall("down".to_string()))],
            ),
    );
    let mut driver = ws.driver(config, worker, "council-deadlock");
    let mut g = graph(vec![task("a", 1, &[])]);

    assert_eq!(driver.run(&mut g).await.unwrap(), RunOutcome::AllDone);

    let events = EventStore::replay(&ws.sessions_dir(), "council-deadlock").unwrap();
    let verdict = events
        .iter()
        .find(|e| e.event_type == EventType::CouncilVerdict)
        .expect("council verdict event");
    assert_eq!(verdict.data["verdict"], "pending");
    assert_eq!(verdict.data["consensus"], "deadlock");
}
