//! The orchestration driver.
//!
//! A bounded state machine over the whole task graph. Parallelism is
//! confined to the work phase: a batch of mutually independent ready
//! tasks executes concurrently, then all graph mutation, event appends
//! and hook dispatch happen serially on the coordinating task. The graph
//! and the event log therefore never have more than one writer.

use futures::future::join_all;
use serde_json::json;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ITERATION_FACTOR};
use crate::core::{Task, TaskGraph, TaskId};
use crate::council::Council;
use crate::error::Result;
use crate::events::{EventStore, EventType, PendingEvent};
use crate::fixloop::FixLoop;
use crate::gates::GateRunner;
use crate::hooks::{self, BuildPhase, HookContext, HookRegistry};
use crate::picker;
use crate::prompt::{Prompt, PromptBuilder};
use crate::worker::{ConfigTemplateLoader, Worker};
use crate::{mlog, mlog_debug, mlog_trace, mlog_warn};

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every task reached Done.
    AllDone,
    /// At least one task failed terminally; the run halts rather than
    /// continuing around the failure.
    TasksFailed { failed: Vec<TaskId> },
    /// No task is runnable and unfinished tasks remain. `cycles` explains
    /// the block when the cause is a dependency cycle.
    Blocked {
        remaining: Vec<TaskId>,
        cycles: Vec<Vec<TaskId>>,
    },
    /// The iteration bound tripped before any other terminal condition.
    IterationLimit,
    /// The cancellation token fired.
    Cancelled,
}

/// What one task's work phase produced. Built concurrently, applied
/// serially.
struct TaskRun {
    task_id: TaskId,
    agent: String,
    /// Attempt count after the work phase, including any in-run gate
    /// retry. Written back to the graph task by the coordinator.
    attempts: u32,
    /// Final output text, or the failure reason.
    result: std::result::Result<String, String>,
    /// Events recorded during the work phase, appended in order by the
    /// coordinator.
    events: Vec<PendingEvent>,
}

pub struct Driver {
    config: Config,
    worker: Arc<dyn Worker>,
    prompts: PromptBuilder,
    gates: GateRunner,
    fixloop: FixLoop,
    council: Council,
    hooks: HookRegistry,
    events: EventStore,
    graph_path: PathBuf,
    outputs_dir: PathBuf,
    cancel: CancellationToken,
    /// Agent of the most recently finished task, for handoff detection.
    last_agent: Option<String>,
}

impl Driver {
    pub fn new(
        config: Config,
        worker: Arc<dyn Worker>,
        events: EventStore,
        graph_path: PathBuf,
        outputs_dir: PathBuf,
    ) -> Result<Self> {
        let prompts = PromptBuilder::new(Arc::new(ConfigTemplateLoader::from_config(&config)?));
        let gates = GateRunner::from_config(&config, Arc::clone(&worker))?;
        let project_dir = graph_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let fixloop = FixLoop::new(project_dir, config.max_fix_retries);
        let council = Council::from_config(&config);

        let mut hooks = HookRegistry::new();
        let wired = hooks::wire_features(&mut hooks, &config.features);
        mlog_debug!("Wired {} feature(s) into the hook registry", wired);

        Ok(Self {
            config,
            worker,
            prompts,
            gates,
            fixloop,
            council,
            hooks,
            events,
            graph_path,
            outputs_dir,
            cancel: CancellationToken::new(),
            last_agent: None,
        })
    }

    /// Token that cancels the run at the next iteration boundary and any
    /// in-flight subprocess check.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    /// Mark already-completed tasks Done before a resumed run.
    pub fn skip_completed(graph: &mut TaskGraph, completed: &BTreeSet<TaskId>) -> usize {
        let mut skipped = 0;
        for id in completed {
            if let Some(task) = graph.task_mut(id) {
                if !task.is_finished() {
                    task.complete();
                    skipped += 1;
                }
            }
        }
        skipped
    }

    /// Run the graph to a terminal outcome.
    pub async fn run(&mut self, graph: &mut TaskGraph) -> Result<RunOutcome> {
        graph.validate()?;

        let total = graph.task_count();
        let max_iterations = (ITERATION_FACTOR * total).max(1);
        self.hooks.execute_phase(
            BuildPhase::BeforeBuild,
            &HookContext::for_session(self.events.session_id(), total),
        );

        picker::promote_pending(graph);
        graph.save(&self.graph_path)?;

        let mut outcome = RunOutcome::IterationLimit;
        for iteration in 0..max_iterations {
            if self.cancel.is_cancelled() {
                outcome = RunOutcome::Cancelled;
                break;
            }

            let failed = graph.failed_ids();
            if !failed.is_empty() {
                // Any terminal failure halts the whole run, including
                // branches that could still complete.
                outcome = RunOutcome::TasksFailed { failed };
                break;
            }
            if graph.all_done() {
                outcome = RunOutcome::AllDone;
                break;
            }

            let batch = if self.config.parallel {
                picker::pick_batch(graph, self.config.max_workers)
            } else {
                picker::pick_next(graph).into_iter().collect()
            };
            if batch.is_empty() {
                outcome = RunOutcome::Blocked {
                    remaining: graph.unfinished_ids(),
                    cycles: graph.find_cycles(),
                };
                break;
            }

            mlog_debug!("Iteration {}: dispatching {} task(s)", iteration, batch.len());
            self.run_batch(graph, &batch).await?;

            picker::promote_pending(graph);
            graph.save(&self.graph_path)?;
            self.events.checkpoint(&format!(
                "iteration {} done ({} task(s) ran)",
                iteration,
                batch.len()
            ))?;
        }

        self.finish(graph, &outcome)?;
        Ok(outcome)
    }

    fn finish(&mut self, graph: &TaskGraph, outcome: &RunOutcome) -> Result<()> {
        self.events.emit(
            EventType::SessionCompleted,
            json!({
                "outcome": format!("{:?}", outcome),
                "done": graph.done_ids().len(),
                "failed": graph.failed_ids().len(),
            }),
            None,
            None,
        )?;

        let mut ctx = HookContext::for_session(self.events.session_id(), graph.task_count());
        ctx.completed_tasks = graph.done_ids().len();
        self.hooks.execute_phase(BuildPhase::AfterBuild, &ctx);
        mlog!("Run finished: {:?}", outcome);
        Ok(())
    }

    /// Execute one batch: serial pre-phase, concurrent work phase, serial
    /// apply phase.
    async fn run_batch(&mut self, graph: &mut TaskGraph, batch: &[TaskId]) -> Result<()> {
        // Pre-phase: transition to Running, persist, announce.
        let mut staged: Vec<(Task, Result<Prompt>)> = Vec::with_capacity(batch.len());
        for id in batch {
            let snapshot = {
                let task = graph
                    .task_mut(id)
                    .ok_or_else(|| crate::Error::TaskNotFound(id.to_string()))?;
                task.start();
                task.clone()
            };
            graph.save(&self.graph_path)?;
            self.events.emit(
                EventType::TaskStarted,
                json!({"title": snapshot.title, "attempt": snapshot.attempts}),
                Some(snapshot.id.clone()),
                Some(snapshot.agent.clone()),
            )?;
            self.hooks.execute_phase(
                BuildPhase::BeforeTask,
                &HookContext::for_session(self.events.session_id(), graph.task_count())
                    .with_task(&snapshot),
            );

            let prompt = self.prompts.build(&snapshot, graph);
            staged.push((snapshot, prompt));
        }

        // Work phase: no graph or log access in here.
        let this: &Self = &*self;
        let mut futures = Vec::with_capacity(staged.len());
        for (task, prompt) in staged {
            futures.push(this.execute_task(task, prompt));
        }
        let runs = join_all(futures).await;

        // Apply phase: single writer for graph, events and hooks.
        for run in runs {
            for pending in run.events {
                self.events.emit_pending(pending)?;
            }

            if let Some(prev) = self.last_agent.take() {
                if prev != run.agent {
                    let snapshot = graph.task(&run.task_id).cloned();
                    let mut ctx =
                        HookContext::for_session(self.events.session_id(), graph.task_count());
                    ctx.previous_agent = Some(prev);
                    if let Some(task) = snapshot {
                        ctx = ctx.with_task(&task);
                    }
                    self.hooks.execute_phase(BuildPhase::OnHandoff, &ctx);
                }
            }
            self.last_agent = Some(run.agent.clone());

            if let Some(task) = graph.task_mut(&run.task_id) {
                task.attempts = run.attempts;
            }

            match run.result {
                Ok(output) => self.apply_success(graph, &run.task_id, output)?,
                Err(reason) if self.cancel.is_cancelled() => {
                    // Interrupted, not failed: back to Ready so a resumed
                    // run picks the task up again.
                    if let Some(task) = graph.task_mut(&run.task_id) {
                        task.mark_ready();
                    }
                    graph.save(&self.graph_path)?;
                    mlog!("Task {} interrupted by cancellation: {}", run.task_id, reason);
                }
                Err(reason) => self.apply_failure(graph, &run.task_id, &reason)?,
            }
        }
        Ok(())
    }

    fn apply_success(&mut self, graph: &mut TaskGraph, id: &TaskId, output: String) -> Result<()> {
        let artifact = self.write_artifact(id, &output)?;
        self.events.emit(
            EventType::OutputWritten,
            json!({"path": artifact.display().to_string(), "chars": output.len()}),
            Some(id.clone()),
            None,
        )?;

        let snapshot = {
            let task = graph
                .task_mut(id)
                .ok_or_else(|| crate::Error::TaskNotFound(id.to_string()))?;
            task.set_output(artifact);
            task.complete();
            task.clone()
        };
        graph.save(&self.graph_path)?;
        self.events.emit(
            EventType::TaskCompleted,
            json!({"attempts": snapshot.attempts}),
            Some(id.clone()),
            Some(snapshot.agent.clone()),
        )?;

        let mut ctx = HookContext::for_session(self.events.session_id(), graph.task_count())
            .with_task(&snapshot);
        ctx.completed_tasks = graph.done_ids().len();
        self.hooks.execute_phase(BuildPhase::AfterTask, &ctx);
        mlog!("Task {} done ({} attempt(s))", id, snapshot.attempts);
        Ok(())
    }

    fn apply_failure(&mut self, graph: &mut TaskGraph, id: &TaskId, reason: &str) -> Result<()> {
        let snapshot = {
            let task = graph
                .task_mut(id)
                .ok_or_else(|| crate::Error::TaskNotFound(id.to_string()))?;
            task.fail(reason);
            task.clone()
        };
        graph.save(&self.graph_path)?;
        self.events.emit(
            EventType::TaskFailed,
            json!({"reason": reason}),
            Some(id.clone()),
            Some(snapshot.agent.clone()),
        )?;

        let ctx = HookContext::for_session(self.events.session_id(), graph.task_count())
            .with_task(&snapshot)
            .with_error(reason);
        self.hooks.execute_phase(BuildPhase::OnTaskError, &ctx);
        mlog_warn!("Task {} failed: {}", id, reason);
        Ok(())
    }

    fn write_artifact(&self, id: &TaskId, output: &str) -> Result<PathBuf> {
        let dir = self.outputs_dir.join(self.events.session_id());
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.md", id));
        std::fs::write(&path, output)?;
        Ok(path)
    }

    /// The per-task pipeline: plan preview, worker call, gates with one
    /// bounded retry, fix loop, council. Pure with respect to the graph
    /// and the event log; everything it records comes back as pending
    /// events.
    async fn execute_task(&self, mut task: Task, prompt: Result<Prompt>) -> TaskRun {
        let task_id = task.id.clone();
        let agent = task.agent.clone();
        let mut events = Vec::new();

        let prompt = match prompt {
            Ok(p) => p,
            Err(e) => {
                return TaskRun {
                    task_id,
                    agent,
                    attempts: task.attempts,
                    result: Err(format!("prompt build failed: {}", e)),
                    events,
                };
            }
        };

        if self.config.plan_preview {
            self.preview_plan(&task, &prompt).await;
        }

        // First attempt.
        let output = match self.call_worker(&task, &prompt.system, &prompt.user, &mut events).await
        {
            Ok(output) => output,
            Err(reason) => {
                return TaskRun {
                    task_id,
                    agent,
                    attempts: task.attempts,
                    result: Err(reason),
                    events,
                };
            }
        };

        let output = match self.gate_with_retry(&mut task, &prompt, output, &mut events).await {
            Ok(output) => output,
            Err(reason) => {
                return TaskRun {
                    task_id,
                    agent,
                    attempts: task.attempts,
                    result: Err(reason),
                    events,
                };
            }
        };

        let output = if self.config.fix_loop_enabled {
            self.fixloop
                .run(self.worker.as_ref(), &prompt.system, &task, &output, &self.cancel)
                .await
        } else {
            output
        };

        if self.council.required_for(&task) {
            let decision = tokio::select! {
                decision = self.council.review(self.worker.as_ref(), &task, &output) => decision,
                _ = self.cancel.cancelled() => {
                    return TaskRun {
                        task_id,
                        agent,
                        attempts: task.attempts,
                        result: Err("council review cancelled".to_string()),
                        events,
                    };
                }
            };
            events.push(
                PendingEvent::new(
                    EventType::CouncilVerdict,
                    Some(task.id.clone()),
                    json!({
                        "consensus": decision.consensus,
                        "verdict": decision.verdict,
                        "votes": decision.votes.len(),
                    }),
                )
                .with_agent(&task.agent),
            );
            if decision.rejected() {
                let reasons: Vec<&str> = decision
                    .votes
                    .iter()
                    .map(|v| v.verdict.reasoning.as_str())
                    .collect();
                return TaskRun {
                    task_id,
                    agent,
                    attempts: task.attempts,
                    result: Err(format!("council rejected: {}", reasons.join(" | "))),
                    events,
                };
            }
        }

        TaskRun {
            task_id,
            agent,
            attempts: task.attempts,
            result: Ok(output),
            events,
        }
    }

    /// Ask the worker for a short plan before execution. Purely advisory;
    /// a failed call degrades to skipping the preview.
    async fn preview_plan(&self, task: &Task, prompt: &Prompt) {
        let plan_prompt = format!(
            "Before doing any work, outline a short numbered plan for this task.\n\n{}",
            prompt.user
        );
        tokio::select! {
            result = self.worker.call(&prompt.system, &plan_prompt, &task.agent) => match result {
                Ok(reply) => mlog_trace!("Plan for {}:\n{}", task.id, reply.content),
                Err(e) => {
                    mlog_warn!("Plan preview for {} failed ({}); continuing without", task.id, e)
                }
            },
            _ = self.cancel.cancelled() => {
                mlog_debug!("Plan preview for {} cancelled", task.id)
            }
        }
    }

    async fn call_worker(
        &self,
        task: &Task,
        system: &str,
        user: &str,
        events: &mut Vec<PendingEvent>,
    ) -> std::result::Result<String, String> {
        events.push(
            PendingEvent::new(
                EventType::LlmCallStarted,
                Some(task.id.clone()),
                json!({"prompt_chars": user.len()}),
            )
            .with_agent(&task.agent),
        );
        let result = tokio::select! {
            result = self.worker.call(system, user, &task.agent) => result,
            _ = self.cancel.cancelled() => {
                // Dropping the call future kills a CommandWorker child via
                // kill_on_drop.
                events.push(
                    PendingEvent::new(
                        EventType::LlmCallFailed,
                        Some(task.id.clone()),
                        json!({"error": "cancelled"}),
                    )
                    .with_agent(&task.agent),
                );
                return Err("worker call cancelled".to_string());
            }
        };
        match result {
            Ok(reply) => {
                events.push(
                    PendingEvent::new(
                        EventType::LlmCallCompleted,
                        Some(task.id.clone()),
                        json!({"reply_chars": reply.content.len()}),
                    )
                    .with_agent(&task.agent),
                );
                Ok(reply.content)
            }
            Err(e) => {
                events.push(
                    PendingEvent::new(
                        EventType::LlmCallFailed,
                        Some(task.id.clone()),
                        json!({"error": e.to_string()}),
                    )
                    .with_agent(&task.agent),
                );
                Err(format!("worker call failed: {}", e))
            }
        }
    }

    /// Run the gate pipeline; on failure, retry the task exactly once with
    /// a failure-aware prompt before giving up. The retry counts as a new
    /// attempt, which re-qualifies the task for council review.
    async fn gate_with_retry(
        &self,
        task: &mut Task,
        prompt: &Prompt,
        output: String,
        events: &mut Vec<PendingEvent>,
    ) -> std::result::Result<String, String> {
        let report = tokio::select! {
            report = self.gates.run(task, &output) => report,
            _ = self.cancel.cancelled() => return Err("validation cancelled".to_string()),
        };
        self.record_gate_events(task, &report, events);
        if report.passed() {
            return Ok(output);
        }

        let summary = report.failure_summary();
        task.attempts += 1;
        events.push(PendingEvent::new(
            EventType::TaskRetry,
            Some(task.id.clone()),
            json!({"reason": summary, "attempt": task.attempts}),
        ));
        mlog!("Gate failure on {}; retrying once: {}", task.id, summary);

        let retry_user = self.prompts.build_retry(task, &summary, &output);
        let retried = self
            .call_worker(task, &prompt.system, &retry_user, events)
            .await?;

        let report = tokio::select! {
            report = self.gates.run(task, &retried) => report,
            _ = self.cancel.cancelled() => return Err("validation cancelled".to_string()),
        };
        self.record_gate_events(task, &report, events);
        if report.passed() {
            Ok(retried)
        } else {
            Err(format!("gates failed after retry: {}", report.failure_summary()))
        }
    }

    fn record_gate_events(
        &self,
        task: &Task,
        report: &crate::gates::GateReport,
        events: &mut Vec<PendingEvent>,
    ) {
        for result in &report.results {
            if result.passed {
                continue;
            }
            let event_type = if result.gate.starts_with("hard-limit:") {
                EventType::HardLimitViolation
            } else {
                EventType::GateFailed
            };
            events.push(PendingEvent::new(
                event_type,
                Some(task.id.clone()),
                json!({"gate": result.gate, "message": result.message}),
            ));
        }
        if report.passed() {
            events.push(PendingEvent::new(
                EventType::GatePassed,
                Some(task.id.clone()),
                json!({"gates": report.results.len()}),
            ));
        }
    }
}
