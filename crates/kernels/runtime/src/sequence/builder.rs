//! Arena construction and validation.

use larmor_foundation::{AxisRotation, fnv1a64};
use tracing::debug;

use crate::error::ConfigError;
use crate::tpoi::collect_block_tpois;
use crate::types::NodeId;

use super::SequenceTree;
use super::counters::RepetitionCounters;
use super::node::{EventNode, NodeKind};
use super::pulse::Pulse;
use super::topology::dependency_levels;

/// Incrementally assembles a [`SequenceTree`].
///
/// Nodes may be created before their children exist; structure is only
/// checked by [`SequenceBuilder::build`].
///
/// ```
/// use larmor_runtime::sequence::{Pulse, SequenceBuilder};
///
/// let mut builder = SequenceBuilder::new();
/// let tr = builder.repeating("TR", 2);
/// let a = builder.atomic("a");
/// let b = builder.atomic("b");
/// let pa = builder.leaf("pa", Pulse::delay(5.0));
/// let pb = builder.leaf("pb", Pulse::delay(3.0));
/// builder.push_child(a, pa).push_child(b, pb);
/// builder.push_child(tr, a).push_child(tr, b);
///
/// let tree = builder.build(tr).unwrap();
/// assert_eq!(tree.duration(tree.root()), 16.0);
/// ```
#[derive(Debug, Default)]
pub struct SequenceBuilder {
    nodes: Vec<EventNode>,
}

impl SequenceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, name: impl Into<String>, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(EventNode {
            name: name.into(),
            kind,
            children: Vec::new(),
        });
        id
    }

    pub fn repeating(&mut self, name: impl Into<String>, repetitions: u32) -> NodeId {
        self.push(name, NodeKind::Repeating { repetitions })
    }

    pub fn atomic(&mut self, name: impl Into<String>) -> NodeId {
        self.atomic_rotated(name, AxisRotation::default())
    }

    pub fn atomic_rotated(&mut self, name: impl Into<String>, rotation: AxisRotation) -> NodeId {
        self.push(name, NodeKind::Atomic { rotation })
    }

    pub fn leaf(&mut self, name: impl Into<String>, pulse: Pulse) -> NodeId {
        self.push(name, NodeKind::Leaf(pulse))
    }

    /// Append `child` to `parent`. Unknown parents are ignored here and
    /// reported by `build` through the dangling child instead.
    pub fn push_child(&mut self, parent: NodeId, child: NodeId) -> &mut Self {
        if let Some(node) = self.nodes.get_mut(parent.index()) {
            node.children.push(child);
        }
        self
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Validate the arena and compute all cached durations.
    pub fn build(self, root: NodeId) -> Result<SequenceTree, ConfigError> {
        let nodes = self.nodes;
        let Some(root_node) = nodes.get(root.index()) else {
            return Err(ConfigError::InvalidOption(format!("root {root} does not exist")));
        };
        if root_node.is_leaf() {
            return Err(ConfigError::LeafOutsideAtomic {
                leaf: root_node.name.clone(),
            });
        }

        for node in &nodes {
            for child in &node.children {
                if child.index() >= nodes.len() {
                    return Err(ConfigError::UnknownChild {
                        parent: node.name.clone(),
                        child: child.index(),
                    });
                }
            }
        }

        let levels = dependency_levels(&nodes).map_err(|cycle| ConfigError::CycleDetected {
            nodes: cycle
                .involved_nodes
                .iter()
                .map(|id| nodes[id.index()].name.clone())
                .collect(),
        })?;

        for node in &nodes {
            validate_node(node, &nodes)?;
        }
        check_loop_references(&nodes, root, &mut Vec::new())?;

        let fingerprint = bincode::serialize(&nodes)
            .map(|bytes| fnv1a64(&bytes))
            .map_err(|e| ConfigError::InvalidOption(format!("cannot fingerprint sequence: {e}")))?;

        let order = levels.into_iter().flatten().collect();
        let mut tree = SequenceTree::from_parts(nodes, root, order, fingerprint);
        tree.refresh();

        let counters = RepetitionCounters::new(tree.len());
        let mut blocks = 0usize;
        for block in tree.atomic_blocks() {
            collect_block_tpois(&tree, block, &counters)?;
            blocks += 1;
        }
        debug!(
            nodes = tree.len(),
            blocks,
            duration = tree.duration(root),
            samples = tree.num_samples(root),
            "sequence tree prepared"
        );
        Ok(tree)
    }
}

fn validate_node(node: &EventNode, nodes: &[EventNode]) -> Result<(), ConfigError> {
    match &node.kind {
        NodeKind::Repeating { repetitions } => {
            if *repetitions == 0 {
                return Err(ConfigError::ZeroRepetitions {
                    node: node.name.clone(),
                });
            }
            if let Some(leaf) = node.children.iter().map(|c| &nodes[c.index()]).find(|c| c.is_leaf()) {
                return Err(ConfigError::LeafOutsideAtomic {
                    leaf: leaf.name.clone(),
                });
            }
        }
        NodeKind::Atomic { .. } => {
            if node.children.is_empty() {
                return Err(ConfigError::EmptyAtomicBlock {
                    block: node.name.clone(),
                });
            }
            if let Some(child) = node.children.iter().map(|c| &nodes[c.index()]).find(|c| !c.is_leaf()) {
                return Err(ConfigError::NonLeafInAtomic {
                    block: node.name.clone(),
                    child: child.name.clone(),
                });
            }
        }
        NodeKind::Leaf(pulse) => {
            if !(pulse.duration.is_finite() && pulse.duration >= 0.0) {
                return Err(ConfigError::InvalidDuration {
                    node: node.name.clone(),
                    duration: pulse.duration,
                });
            }
            pulse.validate(&node.name)?;
        }
    }
    Ok(())
}

/// Every loop a leaf depends on must be one of its repeating ancestors,
/// otherwise the counter it reads is never advanced during its block.
fn check_loop_references(
    nodes: &[EventNode],
    id: NodeId,
    loops: &mut Vec<NodeId>,
) -> Result<(), ConfigError> {
    let node = &nodes[id.index()];
    match &node.kind {
        NodeKind::Leaf(pulse) => {
            for reference in pulse.loop_references() {
                if !loops.contains(&reference) {
                    let name = nodes
                        .get(reference.index())
                        .map_or_else(|| reference.to_string(), |n| n.name.clone());
                    return Err(ConfigError::NotALoop {
                        leaf: node.name.clone(),
                        reference: name,
                    });
                }
            }
        }
        NodeKind::Repeating { .. } => {
            loops.push(id);
            for child in &node.children {
                check_loop_references(nodes, *child, loops)?;
            }
            loops.pop();
        }
        NodeKind::Atomic { .. } => {
            for child in &node.children {
                check_loop_references(nodes, *child, loops)?;
            }
        }
    }
    Ok(())
}
