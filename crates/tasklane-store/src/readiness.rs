//! Readiness computation over the dependency graph.
//!
//! Everything here is a pure function of the task and edge sets passed in.

use crate::task::{Dependency, Task};
use std::collections::{HashMap, HashSet};
use tasklane_core::TaskId;

/// A task is ready when its own status is workable and every blocker is done.
///
/// `blockers` holds one entry per incoming edge; `None` stands for a blocker
/// that could not be resolved and is never treated as done.
pub fn is_ready(task: &Task, blockers: &[Option<&Task>]) -> bool {
    task.status.is_workable()
        && blockers
            .iter()
            .all(|b| b.is_some_and(|b| b.status == crate::TaskStatus::Done))
}

/// Filter `tasks` down to the ready subset, preserving input order.
pub fn compute_ready<'a>(tasks: &'a [Task], edges: &[Dependency]) -> Vec<&'a Task> {
    let by_id: HashMap<&TaskId, &Task> = tasks.iter().map(|t| (&t.id, t)).collect();
    let mut incoming: HashMap<&TaskId, Vec<&TaskId>> = HashMap::new();
    for edge in edges {
        incoming
            .entry(&edge.blocked_id)
            .or_default()
            .push(&edge.blocker_id);
    }

    tasks
        .iter()
        .filter(|task| {
            let blockers: Vec<Option<&Task>> = incoming
                .get(&task.id)
                .map(|ids| ids.iter().map(|id| by_id.get(id).copied()).collect())
                .unwrap_or_default();
            is_ready(task, &blockers)
        })
        .collect()
}

/// Whether adding `blocker -> blocked` to `edges` would close a cycle.
pub fn would_create_cycle(edges: &[Dependency], blocker: &TaskId, blocked: &TaskId) -> bool {
    if blocker == blocked {
        return true;
    }
    // The new edge closes a cycle iff `blocker` is already reachable from `blocked`.
    let mut outgoing: HashMap<&TaskId, Vec<&TaskId>> = HashMap::new();
    for edge in edges {
        outgoing
            .entry(&edge.blocker_id)
            .or_default()
            .push(&edge.blocked_id);
    }
    let mut seen = HashSet::new();
    let mut stack = vec![blocked];
    while let Some(current) = stack.pop() {
        if current == blocker {
            return true;
        }
        if !seen.insert(current) {
            continue;
        }
        if let Some(next) = outgoing.get(current) {
            stack.extend(next.iter().copied());
        }
    }
    false
}
