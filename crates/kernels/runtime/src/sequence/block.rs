//! Field lookup inside one atomic block.

use larmor_foundation::Mat3;
use larmor_foundation::geometry::mat3_transform;

use crate::types::{FieldSample, NodeId, TIME_EPSILON};

use super::counters::RepetitionCounters;
use super::node::NodeKind;
use super::pulse::ResolvedPulse;
use super::SequenceTree;

/// The piece of a block the integrator is currently inside.
///
/// Chosen once per restart. Between two discontinuities the waveform is
/// smooth, so every right-hand side evaluation of that interval uses the
/// same leaf and the same phase-step state, including evaluations exactly
/// on the closing boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldWindow {
    leaf: usize,
    leaf_start: f64,
    anchor_local: f64,
}

/// Waveforms of one atomic block with the repetition counters bound.
///
/// Lookup is a binary search over leaf start offsets, not the linear
/// [`SequenceTree::value_at`] walk.
#[derive(Debug, Clone)]
pub struct BlockField<'a> {
    leaves: Vec<ResolvedPulse<'a>>,
    starts: Vec<f64>,
    rotation: Option<Mat3>,
    duration: f64,
}

impl<'a> BlockField<'a> {
    pub fn new(tree: &'a SequenceTree, block: NodeId, counters: &RepetitionCounters) -> Self {
        let node = tree.node(block);
        let rotation = match &node.kind {
            NodeKind::Atomic { rotation } if !rotation.is_identity() => Some(rotation.matrix()),
            _ => None,
        };

        let mut leaves = Vec::with_capacity(node.children.len());
        let mut starts = Vec::with_capacity(node.children.len());
        let mut offset = 0.0;
        for child in &node.children {
            if let Some(pulse) = tree.node(*child).pulse() {
                starts.push(offset);
                leaves.push(pulse.resolve(counters));
                offset += pulse.duration;
            }
        }

        Self {
            leaves,
            starts,
            rotation,
            duration: offset,
        }
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Window entered by a restart at block-local time `anchor`.
    pub fn window(&self, anchor: f64) -> FieldWindow {
        let leaf = self
            .starts
            .partition_point(|start| *start <= anchor + TIME_EPSILON)
            .saturating_sub(1);
        let leaf_start = self.starts.get(leaf).copied().unwrap_or(0.0);
        FieldWindow {
            leaf,
            leaf_start,
            anchor_local: anchor - leaf_start,
        }
    }

    /// Field at block-local time `t` inside `window`.
    #[inline]
    pub fn field_at(&self, window: &FieldWindow, t: f64) -> FieldSample {
        let Some(leaf) = self.leaves.get(window.leaf) else {
            return FieldSample::default();
        };
        let mut field = leaf.field_at(t - window.leaf_start, window.anchor_local);
        if let Some(rotation) = &self.rotation {
            field.gradient = mat3_transform(*rotation, field.gradient);
        }
        field
    }
}
