//! Collapsing an op history into per-entity winners.
//!
//! Within one log, the op with the greatest `ts` wins for its entity; equal
//! timestamps are broken by position, the later line winning.

use crate::ops::{EntityKey, OpKind, SyncOp, TaskData};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tasklane_core::{TaskId, TasklaneError, TasklaneResult};

/// Keep one op per entity, in first-appearance order of the entity.
pub fn collapse(ops: Vec<SyncOp>) -> Vec<SyncOp> {
    let mut order: Vec<EntityKey> = Vec::new();
    let mut winners: HashMap<EntityKey, SyncOp> = HashMap::new();
    for op in ops {
        let key = op.key();
        match winners.get(&key) {
            None => order.push(key.clone()),
            Some(current) if current.ts > op.ts => continue,
            Some(_) => {}
        }
        winners.insert(key, op);
    }
    order
        .into_iter()
        .filter_map(|key| winners.remove(&key))
        .collect()
}

/// Net state described by a log: live tasks and live edges.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EffectiveState {
    pub tasks: BTreeMap<TaskId, TaskData>,
    pub edges: BTreeSet<(TaskId, TaskId)>,
}

impl EffectiveState {
    pub fn from_ops(ops: Vec<SyncOp>) -> Self {
        let mut state = Self::default();
        for op in collapse(ops) {
            match op.kind {
                OpKind::Upsert { id, data } => {
                    state.tasks.insert(id, data);
                }
                OpKind::Delete { .. } => {}
                OpKind::DepAdd {
                    blocker_id,
                    blocked_id,
                } => {
                    state.edges.insert((blocker_id, blocked_id));
                }
                OpKind::DepRemove { .. } => {}
            }
        }
        state
    }
}

/// Collapse a history down to the ops that still have an effect.
///
/// Deletes and removals are dropped together with everything they shadow.
pub fn compact_ops(ops: Vec<SyncOp>) -> Vec<SyncOp> {
    let mut kept: Vec<SyncOp> = collapse(ops)
        .into_iter()
        .filter(|op| matches!(op.kind, OpKind::Upsert { .. } | OpKind::DepAdd { .. }))
        .collect();
    // Tasks before edges, each group by key.
    kept.sort_by(|a, b| {
        let rank = |op: &SyncOp| u8::from(matches!(op.kind, OpKind::DepAdd { .. }));
        rank(a).cmp(&rank(b)).then_with(|| a.key().cmp(&b.key()))
    });
    kept
}

/// Order task ids so that every parent inside `parents` precedes its children.
///
/// `parents` maps each id in the batch to its declared parent. Parents that
/// are not themselves keys of the map impose no ordering. Ties are broken by
/// id so the result is deterministic.
pub fn parent_first_order(
    parents: &BTreeMap<TaskId, Option<TaskId>>,
) -> TasklaneResult<Vec<TaskId>> {
    let mut graph: DiGraph<TaskId, ()> = DiGraph::new();
    let mut index: HashMap<&TaskId, NodeIndex> = HashMap::new();
    // BTreeMap iteration gives sorted insertion order.
    for id in parents.keys() {
        index.insert(id, graph.add_node(id.clone()));
    }
    for (child, parent) in parents {
        if let Some(parent) = parent {
            if let (Some(&p), Some(&c)) = (index.get(parent), index.get(child)) {
                graph.add_edge(p, c, ());
            }
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| {
        let at = graph
            .node_weight(cycle.node_id())
            .map(ToString::to_string)
            .unwrap_or_else(|| "unknown".to_string());
        TasklaneError::Validation(format!("parent cycle in import batch at task {at}"))
    })?;

    Ok(sorted
        .into_iter()
        .filter_map(|i| graph.node_weight(i).cloned())
        .collect())
}
