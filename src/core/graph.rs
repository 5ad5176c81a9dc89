//! The task graph (PRD) that a run executes.
//!
//! The graph owns its tasks as an arena of structs; dependency edges are
//! task IDs, never owning references, which sidesteps cycle-safety concerns
//! in the data model itself. Cycle detection is a diagnostic over the ID
//! edges, used by the driver to explain a blocked run.

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::mlog_debug;
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

/// Document-level metadata carried alongside the task list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
}

/// The full set of tasks and their dependency edges for one run.
///
/// Persisted to disk after every task transition; the write is
/// at-least-once with last-write-wins semantics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskGraph {
    #[serde(default)]
    pub metadata: GraphMetadata,
    pub tasks: Vec<Task>,
}

impl TaskGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a list of tasks.
    pub fn from_tasks(tasks: Vec<Task>) -> Self {
        Self {
            metadata: GraphMetadata::default(),
            tasks,
        }
    }

    /// Load a graph from a JSON document.
    pub fn load(path: &Path) -> Result<Self> {
        mlog_debug!("TaskGraph::load path={}", path.display());
        let contents = fs::read_to_string(path)?;
        let graph: Self = serde_json::from_str(&contents)?;
        Ok(graph)
    }

    /// Persist the graph to a JSON document.
    ///
    /// Writes to a temp file then renames so a crash mid-write never
    /// leaves a truncated document behind.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &contents)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Look up a task by ID.
    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    /// Look up a task mutably by ID.
    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| &t.id == id)
    }

    /// Number of tasks in the graph.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Check whether every dependency of a task has status Done.
    pub fn deps_met(&self, task: &Task) -> bool {
        task.dependencies
            .iter()
            .all(|dep| matches!(self.task(dep).map(|t| &t.status), Some(TaskStatus::Done)))
    }

    /// IDs of tasks in the Done state.
    pub fn done_ids(&self) -> HashSet<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .map(|t| t.id.clone())
            .collect()
    }

    /// IDs of tasks in the Failed state.
    pub fn failed_ids(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Failed { .. }))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Check whether every task is Done.
    pub fn all_done(&self) -> bool {
        self.tasks.iter().all(|t| t.status == TaskStatus::Done)
    }

    /// IDs of tasks not yet in a terminal state.
    pub fn unfinished_ids(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| !t.is_finished())
            .map(|t| t.id.clone())
            .collect()
    }

    /// Validate the graph's structural invariants.
    ///
    /// Task IDs must be unique and every dependency must reference an
    /// existing task. Dangling references are a data error, reported
    /// rather than silently ignored.
    pub fn validate(&self) -> Result<()> {
        let mut seen: HashSet<&TaskId> = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(&task.id) {
                return Err(Error::Validation(format!(
                    "Duplicate task ID: {}",
                    task.id
                )));
            }
        }
        for task in &self.tasks {
            for dep in &task.dependencies {
                if !seen.contains(dep) {
                    return Err(Error::Validation(format!(
                        "Task {} depends on unknown task {}",
                        task.id, dep
                    )));
                }
            }
        }
        Ok(())
    }

    /// Find dependency cycles among unfinished tasks.
    ///
    /// Returns one ID list per strongly connected component of size > 1
    /// (plus self-loops). Used to explain a blocked run; a cyclic graph is
    /// not a load error because the driver's iteration bound already
    /// guarantees termination.
    pub fn find_cycles(&self) -> Vec<Vec<TaskId>> {
        let mut graph: DiGraph<TaskId, ()> = DiGraph::new();
        let mut index = HashMap::new();
        for task in &self.tasks {
            let node = graph.add_node(task.id.clone());
            index.insert(task.id.clone(), node);
        }
        for task in &self.tasks {
            for dep in &task.dependencies {
                if let Some(&dep_node) = index.get(dep) {
                    graph.add_edge(dep_node, index[&task.id], ());
                }
            }
        }

        tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1
                    || scc
                        .first()
                        .map(|&n| graph.find_edge(n, n).is_some())
                        .unwrap_or(false)
            })
            .map(|scc| scc.into_iter().map(|n| graph[n].clone()).collect())
            .collect()
    }
}
