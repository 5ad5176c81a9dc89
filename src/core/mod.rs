//! Core data model: tasks and the task graph.

pub mod graph;
pub mod task;

pub use graph::{GraphMetadata, TaskGraph};
pub use task::{Task, TaskId, TaskStatus};
