//! Arena node types.

use larmor_foundation::AxisRotation;
use serde::{Deserialize, Serialize};

use crate::types::NodeId;

use super::pulse::Pulse;

/// What a node does when the walker reaches it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Plays its children in order, `repetitions` times.
    Repeating { repetitions: u32 },
    /// Smallest unit integrated in one continuous run. Children are leaves
    /// played back to back; `rotation` turns every gradient in the block.
    Atomic { rotation: AxisRotation },
    /// A pulse segment.
    Leaf(Pulse),
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Repeating { .. } => "repeating",
            NodeKind::Atomic { .. } => "atomic",
            NodeKind::Leaf(_) => "leaf",
        }
    }
}

/// One node of the sequence arena.
///
/// Children are arena indices, so a sub-tree may be referenced from several
/// parents without shared ownership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventNode {
    pub name: String,
    pub kind: NodeKind,
    pub children: Vec<NodeId>,
}

impl EventNode {
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }

    pub fn is_atomic(&self) -> bool {
        matches!(self.kind, NodeKind::Atomic { .. })
    }

    pub fn pulse(&self) -> Option<&Pulse> {
        match &self.kind {
            NodeKind::Leaf(pulse) => Some(pulse),
            _ => None,
        }
    }
}
