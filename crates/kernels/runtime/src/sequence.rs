//! Sequence tree: the nested, repeatable event schedule.
//!
//! The schedule is a composite of three node kinds held in one arena:
//!
//! ```text
//! Repeating (TR x 128)
//!   ├─ Atomic (excitation)     ── Leaf (sinc RF + slice gradient)
//!   └─ Atomic (readout)        ── Leaf (prephaser) ── Leaf (readout + ADC)
//! ```
//!
//! - [`NodeKind::Repeating`] plays its children `repetitions` times.
//! - [`NodeKind::Atomic`] is integrated in one continuous run; its leaves
//!   play back to back.
//! - [`NodeKind::Leaf`] carries a [`Pulse`] whose channels play
//!   simultaneously.
//!
//! Topology is fixed once built. Durations and sample counts are cached and
//! re-derived in children-first order whenever a leaf duration changes.

mod block;
mod builder;
pub mod counters;
mod node;
mod pulse;
pub mod shape;
mod topology;


pub use block::{BlockField, FieldWindow};
pub use builder::SequenceBuilder;
pub use counters::{PhaseCycling, RepetitionCounters, RepetitionScaling};
pub use node::{EventNode, NodeKind};
pub use pulse::{Adc, GradientChannel, PhaseStep, Pulse, ResolvedPulse, RfChannel, SamplePlacement};
pub use shape::{PulseShape, Shape};

use larmor_foundation::Fingerprint;
use larmor_foundation::geometry::mat3_transform;

use crate::error::ConfigError;
use crate::types::{FieldSample, NodeId, TIME_EPSILON};

/// Validated, immutable-topology schedule.
#[derive(Debug, Clone)]
pub struct SequenceTree {
    nodes: Vec<EventNode>,
    root: NodeId,
    /// Children before parents.
    order: Vec<NodeId>,
    durations: Vec<f64>,
    samples: Vec<u64>,
    fingerprint: u64,
}

impl SequenceTree {
    pub(crate) fn from_parts(
        nodes: Vec<EventNode>,
        root: NodeId,
        order: Vec<NodeId>,
        fingerprint: u64,
    ) -> Self {
        let len = nodes.len();
        Self {
            nodes,
            root,
            order,
            durations: vec![0.0; len],
            samples: vec![0; len],
            fingerprint,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &EventNode {
        &self.nodes[id.index()]
    }

    /// Look a node up by name. Linear; meant for setup code and tests.
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.name == name).map(NodeId)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.index()].children
    }

    /// Cached duration of a node.
    ///
    /// `repetitions * sum(children)` for repeating nodes, `sum(children)`
    /// for atomic blocks, intrinsic for leaves.
    #[inline]
    pub fn duration(&self, id: NodeId) -> f64 {
        self.durations[id.index()]
    }

    /// Number of ADC samples produced by walking `id` once.
    #[inline]
    pub fn num_samples(&self, id: NodeId) -> u64 {
        self.samples[id.index()]
    }

    pub fn total_duration(&self) -> f64 {
        self.duration(self.root)
    }

    pub fn total_samples(&self) -> u64 {
        self.num_samples(self.root)
    }

    /// Stable hash of the full arena, parameters included.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Recompute every cached duration and sample count.
    ///
    /// Runs in children-first order, so each node sees final values of its
    /// children. Calling it twice yields identical caches.
    pub fn refresh(&mut self) {
        for &id in &self.order {
            let node = &self.nodes[id.index()];
            let (duration, samples) = match &node.kind {
                NodeKind::Leaf(pulse) => (pulse.duration, pulse.num_samples()),
                NodeKind::Atomic { .. } | NodeKind::Repeating { .. } => {
                    let (d, s) = node.children.iter().fold((0.0, 0u64), |(d, s), c| {
                        (d + self.durations[c.index()], s + self.samples[c.index()])
                    });
                    match node.kind {
                        NodeKind::Repeating { repetitions } => {
                            (f64::from(repetitions) * d, u64::from(repetitions) * s)
                        }
                        _ => (d, s),
                    }
                }
            };
            self.durations[id.index()] = duration;
            self.samples[id.index()] = samples;
        }
    }

    /// Change a leaf's intrinsic duration and re-derive the caches.
    ///
    /// Sample times of the leaf scale with it; explicit ADC times must
    /// still fit and are re-checked.
    pub fn set_leaf_duration(&mut self, id: NodeId, duration: f64) -> Result<(), ConfigError> {
        let node = &mut self.nodes[id.index()];
        let name = node.name.clone();
        let label = node.kind.label();
        let NodeKind::Leaf(pulse) = &mut node.kind else {
            return Err(ConfigError::InvalidOption(format!(
                "'{name}' is a {label} node, only leaves have an intrinsic duration"
            )));
        };
        if !(duration.is_finite() && duration >= 0.0) {
            return Err(ConfigError::InvalidDuration {
                node: name,
                duration,
            });
        }
        let previous = pulse.duration;
        pulse.duration = duration;
        if let Err(err) = pulse
            .validate(&name)
            .and_then(|_| pulse.tpois(&name, &RepetitionCounters::new(0)).map(|_| ()))
        {
            pulse.duration = previous;
            return Err(err);
        }
        self.fingerprint = Fingerprint::new()
            .u64(self.fingerprint)
            .u64(id.index() as u64)
            .f64(duration)
            .finish();
        self.refresh();
        Ok(())
    }

    /// Atomic blocks reachable from the root, each once, in first-visit order.
    pub fn atomic_blocks(&self) -> Vec<NodeId> {
        let mut seen = vec![false; self.nodes.len()];
        let mut blocks = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut seen[id.index()], true) {
                continue;
            }
            let node = self.node(id);
            if node.is_atomic() {
                blocks.push(id);
            } else if !node.is_leaf() {
                stack.extend(node.children.iter().rev());
            }
        }
        blocks
    }

    /// Field of `id` at local time `t`, setting the counters on the way down.
    ///
    /// Walks repetitions and children subtracting durations, so one call is
    /// linear in `repetitions * children` at every level. Fine for probing
    /// and tests; the integrator uses [`BlockField`] instead, which binary
    /// searches one block. Returns `None` outside `[0, duration(id)]`.
    pub fn value_at(
        &self,
        id: NodeId,
        t: f64,
        counters: &mut RepetitionCounters,
    ) -> Option<FieldSample> {
        if t < -TIME_EPSILON || t > self.duration(id) + TIME_EPSILON {
            return None;
        }
        let node = self.node(id);
        match &node.kind {
            NodeKind::Leaf(pulse) => Some(pulse.resolve(counters).field_at(t, t)),
            NodeKind::Atomic { rotation } => {
                let (child, local) = self.locate_child(&node.children, t)?;
                let mut field = self.value_at(child, local, counters)?;
                if !rotation.is_identity() {
                    field.gradient = mat3_transform(rotation.matrix(), field.gradient);
                }
                Some(field)
            }
            NodeKind::Repeating { repetitions } => {
                let period: f64 = node.children.iter().map(|c| self.duration(*c)).sum();
                let mut remaining = t;
                for repetition in 0..*repetitions {
                    let last = repetition + 1 == *repetitions;
                    if remaining < period || last {
                        counters.set(id, repetition);
                        let (child, local) = self.locate_child(&node.children, remaining)?;
                        return self.value_at(child, local, counters);
                    }
                    remaining -= period;
                }
                None
            }
        }
    }

    fn locate_child(&self, children: &[NodeId], t: f64) -> Option<(NodeId, f64)> {
        let mut remaining = t;
        for (i, child) in children.iter().enumerate() {
            let d = self.duration(*child);
            if remaining < d || i + 1 == children.len() {
                return Some((*child, remaining));
            }
            remaining -= d;
        }
        None
    }
}
