//! Repetition counters observed by repetition-dependent leaves.

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Current iteration of every repeating node, indexed by [`NodeId`].
///
/// Owned by one spin's walk. Entries for non-repeating nodes stay at zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepetitionCounters {
    values: Vec<u32>,
}

impl RepetitionCounters {
    pub fn new(node_count: usize) -> Self {
        Self {
            values: vec![0; node_count],
        }
    }

    #[inline]
    pub fn get(&self, node: NodeId) -> u32 {
        self.values.get(node.index()).copied().unwrap_or(0)
    }

    #[inline]
    pub fn set(&mut self, node: NodeId, value: u32) {
        if let Some(slot) = self.values.get_mut(node.index()) {
            *slot = value;
        }
    }

    pub fn reset(&mut self) {
        self.values.fill(0);
    }
}

/// Amplitude factor `offset + step * counter(node)`.
///
/// Typical use is a phase-encoding gradient stepping through k-space lines.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RepetitionScaling {
    pub node: NodeId,
    pub offset: f64,
    pub step: f64,
}

impl RepetitionScaling {
    #[inline]
    pub fn factor(&self, counters: &RepetitionCounters) -> f64 {
        self.offset + self.step * f64::from(counters.get(self.node))
    }
}

/// Phase offset that grows by `increment` (degrees) per iteration of `node`.
///
/// Quadratic cycling (`quadratic: true`) adds `increment * n(n+1)/2`, the
/// RF-spoiling scheme.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseCycling {
    pub node: NodeId,
    pub increment: f64,
    #[serde(default)]
    pub quadratic: bool,
}

impl PhaseCycling {
    /// Phase offset in radians.
    pub fn offset(&self, counters: &RepetitionCounters) -> f64 {
        let n = f64::from(counters.get(self.node));
        let steps = if self.quadratic { 0.5 * n * (n + 1.0) } else { n };
        (self.increment * steps).to_radians()
    }
}
