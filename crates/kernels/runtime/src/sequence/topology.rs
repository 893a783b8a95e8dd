//! Children-first ordering and cycle detection for the sequence arena.

use indexmap::IndexSet;

use crate::types::NodeId;

use super::node::EventNode;

/// Error returned when the arena contains a cycle.
///
/// Durations of nodes on a cycle are undefined, so the tree cannot be
/// prepared.
#[derive(Debug)]
pub struct CycleError {
    /// Nodes that could not be ordered.
    pub involved_nodes: Vec<NodeId>,
}

/// Compute evaluation levels with Kahn's algorithm.
///
/// Level 0 holds the nodes without children; every later level only
/// depends on earlier ones. A node referenced twice by the same parent
/// counts once.
pub(super) fn dependency_levels(nodes: &[EventNode]) -> Result<Vec<Vec<NodeId>>, CycleError> {
    if nodes.is_empty() {
        return Ok(Vec::new());
    }

    let mut pending_children = vec![0usize; nodes.len()];
    let mut parents: Vec<Vec<NodeId>> = vec![Vec::new(); nodes.len()];

    for (index, node) in nodes.iter().enumerate() {
        let distinct: IndexSet<NodeId> = node.children.iter().copied().collect();
        pending_children[index] = distinct.len();
        for child in distinct {
            parents[child.index()].push(NodeId(index));
        }
    }

    let mut levels = Vec::new();
    let mut current: Vec<NodeId> = (0..nodes.len())
        .filter(|&i| pending_children[i] == 0)
        .map(NodeId)
        .collect();
    let mut processed = 0;

    while !current.is_empty() {
        current.sort();
        processed += current.len();

        let mut next = Vec::new();
        for node in &current {
            for parent in &parents[node.index()] {
                let remaining = &mut pending_children[parent.index()];
                *remaining -= 1;
                if *remaining == 0 {
                    next.push(*parent);
                }
            }
        }

        levels.push(std::mem::replace(&mut current, next));
    }

    if processed != nodes.len() {
        let involved_nodes = (0..nodes.len())
            .filter(|&i| pending_children[i] > 0)
            .map(NodeId)
            .collect();
        return Err(CycleError { involved_nodes });
    }

    Ok(levels)
}
