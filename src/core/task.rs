//! Task data model for the build graph.
//!
//! Tasks are the atomic units of work delegated to agents. Each task
//! tracks its status, phase, dependency edges (by ID, never by pointer),
//! attempt count, and the path of its output artifact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Unique identifier for a task within a graph.
///
/// PRD documents author task IDs by hand ("task-001"), so this is a string
/// newtype rather than a UUID. `new()` generates a UUID-backed ID for tasks
/// created at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a fresh unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Return a short form for human-readable output.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Task status in its lifecycle.
///
/// Transitions are monotonic: Pending -> Ready -> Running -> Done/Failed.
/// A Running task that fails its gate retry goes back through Running on
/// the bounded retry, but never leaves a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task created but dependencies not yet satisfied.
    Pending,
    /// All dependencies done, eligible for scheduling.
    Ready,
    /// Task is currently being executed by a worker.
    Running,
    /// Task completed successfully.
    Done,
    /// Task failed terminally.
    Failed {
        /// Reason recorded for the failure.
        error: String,
    },
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// A single task in the build graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Human-readable title.
    pub title: String,
    /// Detailed description of what the task should accomplish.
    pub description: String,
    /// Name of the agent this task is delegated to.
    pub agent: String,
    /// Build phase; lower phases are scheduled first.
    #[serde(default)]
    pub phase: u32,
    /// IDs of tasks that must be Done before this one can run.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Current lifecycle status.
    #[serde(default)]
    pub status: TaskStatus,
    /// Number of execution attempts so far.
    #[serde(default)]
    pub attempts: u32,
    /// Path to the output artifact, once one has been written.
    #[serde(default)]
    pub output: Option<PathBuf>,
    /// Free-form key/value context attached by the graph author or hooks.
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// When the task was created.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// When the task last started execution.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task assigned to an agent.
    pub fn new(id: impl Into<String>, title: &str, description: &str, agent: &str) -> Self {
        Self {
            id: TaskId(id.into()),
            title: title.to_string(),
            description: description.to_string(),
            agent: agent.to_string(),
            phase: 1,
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            attempts: 0,
            output: None,
            context: BTreeMap::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Builder-style phase setter.
    pub fn with_phase(mut self, phase: u32) -> Self {
        self.phase = phase;
        self
    }

    /// Builder-style dependency setter.
    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Start an execution attempt.
    ///
    /// Transitions status to Running, bumps the attempt counter, and
    /// records the start time.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.attempts += 1;
        self.started_at = Some(Utc::now());
    }

    /// Mark the task as successfully completed.
    pub fn complete(&mut self) {
        self.status = TaskStatus::Done;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task as terminally failed with a reason.
    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed {
            error: error.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    /// Promote the task from Pending to Ready.
    pub fn mark_ready(&mut self) {
        self.status = TaskStatus::Ready;
    }

    /// Record the path of the persisted output artifact.
    pub fn set_output(&mut self, path: PathBuf) {
        self.output = Some(path);
    }

    /// Check if the task is in a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(self.status, TaskStatus::Done | TaskStatus::Failed { .. })
    }
}
