//! Schedule walker: drives one spin through the whole sequence tree.
//!
//! The walk is a depth-first traversal. Repeating nodes set their counter
//! and recurse; atomic blocks are integrated in one continuous run:
//!
//! ```text
//! for each TPOI p of the block:
//!     advance_to(p.time, hard stop = next discontinuity or block end)
//!     Sample        -> buffer (global time, sample index, receiver phase, M)
//!     Discontinuity -> restart the stepper at p.time from the current M
//! ```
//!
//! The spin's position inside a block comes from its [`BlockPath`], so
//! flow, motion and diffusion act on the phase continuously.
//!
//! Every bit of per-spin state lives in [`SpinContext`], passed by `&mut`.
//! A block that fails to integrate is rolled back to its starting state and
//! retried with tighter tolerances before the spin is given up.

mod context;

#[cfg(test)]
mod tests;

pub use context::{EmittedSample, SampleRequest, SpinContext};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use larmor_foundation::Vec3;

use crate::error::{ConfigError, IntegrationFailure};
use crate::integrator::{
    ExchangeRates, IntegratorSettings, MagnetizationIntegrator, SpinEnvironment, Tolerances,
};
use crate::sample::SpinProperties;
use crate::sequence::{BlockField, NodeKind, RepetitionCounters, SequenceTree};
use crate::tpoi::{TpoiList, collect_block_tpois};
use crate::trajectory::{BlockPath, MotionOptions};
use crate::types::{Magnetization, NodeId};

/// Consumer of the samples of a finished spin.
pub trait SampleSink {
    fn accept(&mut self, sample: &EmittedSample);
}

/// Why a spin walk stopped.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WalkError {
    /// The block could not be integrated even at the tightest tolerance.
    #[error("spin {spin}: block '{block}' failed to integrate after {attempts} attempts: {source}")]
    Integration {
        spin: usize,
        block: String,
        attempts: u32,
        #[source]
        source: IntegrationFailure,
    },

    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

/// Optional physics corrections applied to every spin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FieldCorrections {
    /// Coefficient of the concomitant gradient field term, `1/(2 B0)` in
    /// field units; 0 disables it.
    pub concomitant: f64,
    /// Gaussian position jitter as a percentage of the voxel size.
    pub position_jitter: f64,
}

/// Immutable inputs shared by every spin of a run.
#[derive(Debug, Clone, Default)]
pub struct WalkerOptions {
    pub seed: u64,
    pub integrator: IntegratorSettings,
    pub exchange: ExchangeRates,
    pub corrections: FieldCorrections,
    pub motion: MotionOptions,
}

/// Walks spins through one tree. One per worker; not shared.
#[derive(Debug)]
pub struct ScheduleWalker<'a> {
    tree: &'a SequenceTree,
    options: &'a WalkerOptions,
    /// Merged time points of blocks whose list does not depend on counters.
    cache: Vec<Option<Arc<TpoiList>>>,
    cacheable: Vec<bool>,
}

impl<'a> ScheduleWalker<'a> {
    pub fn new(tree: &'a SequenceTree, options: &'a WalkerOptions) -> Self {
        let cacheable = (0..tree.len())
            .map(|i| {
                tree.children(NodeId(i)).iter().all(|child| {
                    tree.node(*child)
                        .pulse()
                        .is_none_or(|pulse| !pulse.tpois_depend_on_counters())
                })
            })
            .collect();
        Self {
            tree,
            options,
            cache: vec![None; tree.len()],
            cacheable,
        }
    }

    pub fn tree(&self) -> &'a SequenceTree {
        self.tree
    }

    /// Fresh context for spin `index` at equilibrium.
    pub fn prepare(&self, index: usize, spin: SpinProperties, resolution: Vec3) -> SpinContext {
        SpinContext::new(index, spin, resolution, self.tree.len(), self.options)
    }

    /// Walk the whole tree for one spin.
    ///
    /// On success the context holds the final magnetization and the
    /// buffered samples, `num_samples(root)` of them in increasing order.
    pub fn walk(&mut self, ctx: &mut SpinContext) -> Result<(), WalkError> {
        ctx.counters.reset();
        self.walk_node(self.tree.root(), ctx)?;
        debug_assert_eq!(ctx.sample_index, self.tree.total_samples());
        Ok(())
    }

    /// Convenience: prepare, walk and return the context.
    pub fn simulate(
        &mut self,
        index: usize,
        spin: SpinProperties,
        resolution: Vec3,
    ) -> Result<SpinContext, WalkError> {
        let mut ctx = self.prepare(index, spin, resolution);
        self.walk(&mut ctx)?;
        Ok(ctx)
    }

    fn walk_node(&mut self, id: NodeId, ctx: &mut SpinContext) -> Result<(), WalkError> {
        let tree = self.tree;
        let node = tree.node(id);
        match &node.kind {
            NodeKind::Repeating { repetitions } => {
                for repetition in 0..*repetitions {
                    ctx.counters.set(id, repetition);
                    for &child in &node.children {
                        self.walk_node(child, ctx)?;
                    }
                }
                Ok(())
            }
            NodeKind::Atomic { .. } => self.walk_block(id, ctx),
            NodeKind::Leaf(_) => Err(ConfigError::LeafOutsideAtomic {
                leaf: node.name.clone(),
            }
            .into()),
        }
    }

    fn block_tpois(
        &mut self,
        block: NodeId,
        counters: &RepetitionCounters,
    ) -> Result<Arc<TpoiList>, ConfigError> {
        if let Some(list) = &self.cache[block.index()] {
            return Ok(Arc::clone(list));
        }
        let list = Arc::new(collect_block_tpois(self.tree, block, counters)?);
        if self.cacheable[block.index()] {
            self.cache[block.index()] = Some(Arc::clone(&list));
        }
        Ok(list)
    }

    fn walk_block(&mut self, block: NodeId, ctx: &mut SpinContext) -> Result<(), WalkError> {
        let tree = self.tree;
        let tpois = self.block_tpois(block, &ctx.counters)?;
        let field = BlockField::new(tree, block, &ctx.counters);
        let options = self.options;
        let path = ctx
            .trajectory
            .block_path(&options.motion, ctx.time_offset, field.duration());

        let start = ctx.magnetization.clone();
        let buffered = ctx.samples.len();
        let first_index = ctx.sample_index;

        let mut tolerances = self
            .options
            .integrator
            .for_populated_pools(ctx.populated_pools());
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.integrate_block(&field, &tpois, &path, ctx, &tolerances) {
                Ok(state) => {
                    ctx.magnetization = state;
                    break;
                }
                Err(failure) => {
                    ctx.samples.truncate(buffered);
                    ctx.sample_index = first_index;
                    ctx.magnetization.clone_from(&start);

                    let Some(tighter) = tolerances.tightened(self.options.integrator.retry_factor)
                    else {
                        return Err(WalkError::Integration {
                            spin: ctx.spin_index,
                            block: tree.node(block).name.clone(),
                            attempts,
                            source: failure,
                        });
                    };
                    debug!(
                        spin = ctx.spin_index,
                        block = %tree.node(block).name,
                        rtol = tighter.rtol,
                        error = %failure,
                        "retrying block with tighter tolerances"
                    );
                    ctx.retries += 1;
                    tolerances = tighter;
                }
            }
        }

        trace!(spin = ctx.spin_index, block = %tree.node(block).name, "block done");
        ctx.position = path.position(field.duration());
        ctx.time_offset += field.duration();
        Ok(())
    }

    fn integrate_block(
        &self,
        field: &BlockField<'_>,
        tpois: &TpoiList,
        path: &BlockPath<'_>,
        ctx: &mut SpinContext,
        tolerances: &Tolerances,
    ) -> Result<Magnetization, IntegrationFailure> {
        let duration = field.duration();
        let env = SpinEnvironment {
            path,
            off_resonance: ctx.off_resonance,
            pools: &ctx.spin.pools,
            exchange: &ctx.exchange,
            concomitant: self.options.corrections.concomitant,
        };
        let mut integrator = MagnetizationIntegrator::new(field, env, tolerances, &ctx.magnetization)?;

        for (i, point) in tpois.points().iter().enumerate() {
            let hard_stop = if point.tag.is_discontinuity() {
                point.time
            } else {
                tpois.next_discontinuity_after(i).unwrap_or(duration)
            };
            let state = integrator.advance_to(point.time, hard_stop)?;

            if let Some(slot) = point.tag.sample() {
                ctx.samples.push(EmittedSample {
                    request: SampleRequest {
                        global_time: ctx.time_offset + point.time,
                        sample_index: ctx.sample_index,
                        receiver_phase: slot.receiver_phase,
                    },
                    position: path.position(point.time),
                    magnetization: state.total(),
                });
                ctx.sample_index += 1;
            }
            if point.tag.is_discontinuity() {
                let at = state.clone();
                integrator.restart_at(point.time, &at)?;
            }
        }

        integrator.advance_to(duration, duration)?;
        Ok(integrator.into_state())
    }

    /// Global times of every sample, in sample-index order.
    ///
    /// Walks the tree like a spin would but without integrating, so it
    /// also validates every block's time point list under every counter
    /// combination.
    pub fn sample_timeline(&mut self) -> Result<Vec<f64>, ConfigError> {
        let mut counters = RepetitionCounters::new(self.tree.len());
        let mut times = Vec::with_capacity(self.tree.total_samples() as usize);
        let mut offset = 0.0;
        self.timeline_node(self.tree.root(), &mut counters, &mut offset, &mut times)?;
        Ok(times)
    }

    fn timeline_node(
        &mut self,
        id: NodeId,
        counters: &mut RepetitionCounters,
        offset: &mut f64,
        times: &mut Vec<f64>,
    ) -> Result<(), ConfigError> {
        let tree = self.tree;
        let node = tree.node(id);
        match &node.kind {
            NodeKind::Repeating { repetitions } => {
                for repetition in 0..*repetitions {
                    counters.set(id, repetition);
                    for &child in &node.children {
                        self.timeline_node(child, counters, offset, times)?;
                    }
                }
            }
            NodeKind::Atomic { .. } => {
                let tpois = self.block_tpois(id, counters)?;
                times.extend(
                    tpois
                        .points()
                        .iter()
                        .filter(|p| p.tag.sample().is_some())
                        .map(|p| *offset + p.time),
                );
                *offset += tree.duration(id);
            }
            NodeKind::Leaf(_) => {
                return Err(ConfigError::LeafOutsideAtomic {
                    leaf: node.name.clone(),
                });
            }
        }
        Ok(())
    }
}
