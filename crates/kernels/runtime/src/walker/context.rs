//! Per-spin simulation state.

use larmor_foundation::{RngStream, Vec3};

use crate::integrator::ExchangeMatrix;
use crate::sample::{SpinProperties, jitter_position};
use crate::sequence::RepetitionCounters;
use crate::trajectory::SpinTrajectory;
use crate::types::Magnetization;

use super::WalkerOptions;

/// Where and how a sample was requested.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRequest {
    /// Time since the start of the sequence (ms).
    pub global_time: f64,
    /// Position in the run-wide sample stream.
    pub sample_index: u64,
    /// Receiver phase (rad).
    pub receiver_phase: f64,
}

/// A buffered sample of one spin: summed pool magnetization at the
/// requested instant and the spin's position at that time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmittedSample {
    pub request: SampleRequest,
    pub position: Vec3,
    pub magnetization: Vec3,
}

/// Mutable state of one spin for the duration of its walk.
#[derive(Debug, Clone)]
pub struct SpinContext {
    pub spin_index: usize,
    pub spin: SpinProperties,
    /// Position at the end of the last walked block.
    pub position: Vec3,
    pub trajectory: SpinTrajectory,
    /// Static off-resonance including any drawn R2' contribution.
    pub off_resonance: f64,
    pub exchange: ExchangeMatrix,
    pub magnetization: Magnetization,
    pub counters: RepetitionCounters,
    /// Start of the current block in sequence time.
    pub time_offset: f64,
    /// Index of the next sample to emit.
    pub sample_index: u64,
    /// Blocks that needed tighter tolerances.
    pub retries: u32,
    pub samples: Vec<EmittedSample>,
}

impl SpinContext {
    pub(crate) fn new(
        spin_index: usize,
        spin: SpinProperties,
        resolution: Vec3,
        node_count: usize,
        options: &WalkerOptions,
    ) -> Self {
        let index = spin_index as u64;
        let mut position = spin.position;
        let jitter = options.corrections.position_jitter;
        if jitter > 0.0 {
            let mut rng = RngStream::derive(options.seed, "position.jitter").for_spin(index);
            position = jitter_position(position, resolution, jitter, &mut rng);
        }
        let mut lorentz = RngStream::derive(options.seed, "offresonance.lorentz").for_spin(index);
        let off_resonance = spin.effective_off_resonance(&mut lorentz);

        let walk = RngStream::derive(options.seed, "diffusion.walk").for_spin(index);
        let trajectory = SpinTrajectory::new(position, spin.velocity, spin.diffusion, walk);

        let m0: Vec<f64> = spin.m0().collect();
        Self {
            spin_index,
            position,
            trajectory,
            off_resonance,
            exchange: ExchangeMatrix::derive(&options.exchange, &m0),
            magnetization: Magnetization::equilibrium(m0),
            counters: RepetitionCounters::new(node_count),
            time_offset: 0.0,
            sample_index: 0,
            retries: 0,
            samples: Vec::new(),
            spin,
        }
    }

    pub fn populated_pools(&self) -> usize {
        self.spin.pools.iter().filter(|p| p.m0 > 0.0).count()
    }

    /// Hand every buffered sample to `sink`, in emission order.
    pub fn deliver(&self, sink: &mut impl super::SampleSink) {
        for sample in &self.samples {
            sink.accept(sample);
        }
    }
}
