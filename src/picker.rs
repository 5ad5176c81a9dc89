//! Task selection and promotion.
//!
//! Pure functions over the in-memory graph. `pick_next` chooses the next
//! eligible task under the (phase, attempts) ordering; `promote_pending`
//! moves tasks whose dependencies have completed from Pending to Ready.
//! Structural errors (dangling dependency IDs) are the driver's job to
//! catch before scheduling begins.

use crate::core::{TaskGraph, TaskId, TaskStatus};

/// Select the next eligible task.
///
/// Ready tasks are stable-sorted ascending by `(phase, attempts)`: lower
/// phase first, and among equal phases fewer prior attempts first so
/// retried tasks cannot starve fresh ones. The first candidate whose every
/// dependency is Done wins. Returns `None` both when no task is Ready and
/// when Ready tasks exist but none has its dependencies met; either way
/// the driver gets nothing to run.
pub fn pick_next(graph: &TaskGraph) -> Option<TaskId> {
    let mut ready: Vec<_> = graph
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Ready)
        .collect();
    ready.sort_by_key(|t| (t.phase, t.attempts));

    ready
        .into_iter()
        .find(|t| graph.deps_met(t))
        .map(|t| t.id.clone())
}

/// Select a batch of eligible tasks for parallel dispatch.
///
/// Same ordering as `pick_next`. Every returned task has all dependencies
/// Done, so the batch is mutually dependency-independent by construction.
pub fn pick_batch(graph: &TaskGraph, limit: usize) -> Vec<TaskId> {
    let mut ready: Vec<_> = graph
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Ready)
        .collect();
    ready.sort_by_key(|t| (t.phase, t.attempts));

    ready
        .into_iter()
        .filter(|t| graph.deps_met(t))
        .take(limit)
        .map(|t| t.id.clone())
        .collect()
}

/// Promote Pending tasks whose dependencies are all Done to Ready.
///
/// Returns the number promoted. Idempotent: a second call with no
/// intervening state change promotes zero tasks.
pub fn promote_pending(graph: &mut TaskGraph) -> usize {
    let promotable: Vec<TaskId> = graph
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending && graph.deps_met(t))
        .map(|t| t.id.clone())
        .collect();

    for id in &promotable {
        if let Some(task) = graph.task_mut(id) {
            task.mark_ready();
        }
    }
    promotable.len()
}
