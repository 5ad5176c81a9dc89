//! Test fixtures for integration tests.
//!
//! Provides scripted workers, graph builders, and a temp-dir workspace
//! that stands in for `~/.maestro`.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use maestro::config::Config;
use maestro::core::{Task, TaskGraph, TaskId};
use maestro::driver::Driver;
use maestro::error::{Error, Result};
use maestro::events::EventStore;
use maestro::worker::{Worker, WorkerReply};

/// A temp-dir workspace holding the graph document, sessions and outputs.
pub struct TestWorkspace {
    pub temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    pub fn prd_path(&self) -> PathBuf {
        self.temp_dir.path().join("prd.json")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.temp_dir.path().join("sessions")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.temp_dir.path().join("outputs")
    }

    /// Config pointed at this workspace with the council off; tests that
    /// want the council enable it explicitly.
    pub fn config(&self) -> Config {
        Config {
            council_enabled: false,
            templates_dir: Some(self.temp_dir.path().join("agents").display().to_string()),
            ..Default::default()
        }
    }

    pub fn event_store(&self, session_id: &str) -> EventStore {
        EventStore::create(&self.sessions_dir(), session_id, "prd.json")
            .expect("Failed to create event store")
    }

    pub fn driver(&self, config: Config, worker: Arc<dyn Worker>, session_id: &str) -> Driver {
        Driver::new(
            config,
            worker,
            self.event_store(session_id),
            self.prd_path(),
            self.outputs_dir(),
        )
        .expect("Failed to build driver")
    }
}

/// Build a task with the given phase and dependencies.
pub fn task(id: &str, phase: u32, deps: &[&str]) -> Task {
    Task::new(id, &format!("{} title", id), &format!("{} work", id), "architect")
        .with_phase(phase)
        .with_dependencies(deps.iter().map(|d| TaskId::from(*d)).collect())
}

/// Same, delegated to a code-producing agent.
pub fn code_task(id: &str, phase: u32, deps: &[&str]) -> Task {
    let mut t = task(id, phase, deps);
    t.agent = "backend-developer".to_string();
    t
}

pub fn graph(tasks: Vec<Task>) -> TaskGraph {
    TaskGraph::from_tasks(tasks)
}

/// Worker that approves all review-style calls and produces canned output
/// for task agents. Counts calls per agent name.
pub struct MockWorker {
    calls: std::sync::Mutex<BTreeMap<String, usize>>,
    total: AtomicUsize,
}

impl MockWorker {
    pub fn new() -> Self {
        Self {
            calls: std::sync::Mutex::new(BTreeMap::new()),
            total: AtomicUsize::new(0),
        }
    }

    pub fn calls_for(&self, agent: &str) -> usize {
        *self.calls.lock().unwrap().get(agent).unwrap_or(&0)
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for MockWorker {
    async fn call(&self, _system: &str, _user: &str, agent: &str) -> Result<WorkerReply> {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self.calls.lock().unwrap().entry(agent.to_string()).or_insert(0) += 1;

        if agent.contains("reviewer") || agent == "mercury-validator" {
            Ok(WorkerReply::text("APPROVE\nLooks good.\nConfidence: 0.9"))
        } else {
            Ok(WorkerReply::text(format!("completed work for {}", agent)))
        }
    }
}

/// Worker driven by an explicit per-agent script. Agents without a script
/// entry get a default approval/output like `MockWorker`.
pub struct ScriptedWorker {
    scripts: std::sync::Mutex<BTreeMap<String, Vec<Result<String>>>>,
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self {
            scripts: std::sync::Mutex::new(BTreeMap::new()),
        }
    }

    /// Queue replies for an agent, consumed in order.
    pub fn script(self, agent: &str, replies: Vec<Result<&str>>) -> Self {
        self.scripts.lock().unwrap().insert(
            agent.to_string(),
            replies
                .into_iter()
                .map(|r| r.map(str::to_string))
                .collect(),
        );
        self
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn call(&self, _system: &str, _user: &str, agent: &str) -> Result<WorkerReply> {
        let mut scripts = self.scripts.lock().unwrap();
        if let Some(replies) = scripts.get_mut(agent) {
            if !replies.is_empty() {
                return match replies.remove(0) {
                    Ok(text) => Ok(WorkerReply::text(text)),
                    Err(_) => Err(Error::WorkerCall("scripted failure".to_string())),
                };
            }
        }
        if agent.contains("reviewer") || agent == "mercury-validator" {
            Ok(WorkerReply::text("APPROVE\nLooks good.\nConfidence: 0.9"))
        } else {
            Ok(WorkerReply::text(format!("completed work for {}", agent)))
        }
    }
}
