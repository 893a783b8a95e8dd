//! Larmor Runtime.
//!
//! This crate provides the execution engine for Larmor spin simulations.
//! It takes an event schedule, a spin population and a set of receive
//! coils, integrates the Bloch (or Bloch-McConnell) equations for every
//! spin and sums the coil-weighted magnetization into per-coil signals.
//!
//! # Architecture
//!
//! The runtime is organized into several modules:
//!
//! - [`types`] - Core types: [`NodeId`], [`FieldSample`], [`Magnetization`]
//! - [`sequence`] - Event tree, pulse shapes and repetition counters
//! - [`tpoi`] - Time points of interest of an atomic block
//! - [`integrator`] - Adaptive Dormand-Prince stepper and right-hand sides
//! - [`walker`] - Depth-first walk of one spin through the tree
//! - [`sample`] - Spin properties and populations
//! - [`trajectory`] - Flow, rigid motion, respiration and diffusion paths
//! - [`coil`] - Receive coil sensitivities
//! - [`signal`] - Per-coil signal records and their files
//! - [`reductions`] - Fixed-order reductions of partial signals
//! - [`dispatch`] - Worker threads, batching and load balancing
//! - [`checkpoint`] - Restart files
//! - [`scenario`] - YAML description of a complete run
//! - [`error`] - Error types for runtime failures
//!
//! # Execution Model
//!
//! Each spin is simulated independently:
//!
//! 1. **Prepare** - Derive the spin's random streams and field corrections
//! 2. **Walk** - Visit the tree depth first, counting repetitions and
//!    laying out the spin's path through each block
//! 3. **Integrate** - Step each atomic block between its time points
//! 4. **Sample** - Emit magnetization at every ADC sample
//! 5. **Receive** - Weight by each coil and add to the accumulators
//!
//! # Example
//!
//! ```ignore
//! use larmor_runtime::{Scenario, run_dispatch};
//!
//! let scenario = Scenario::load(Path::new("spin_echo.yaml"))?;
//! let (inputs, options) = scenario.into_run(Some(output_dir))?;
//! let report = run_dispatch(inputs, &options)?;
//! println!("{} spins, {} failed", report.completed, report.failed.len());
//! ```

pub mod checkpoint;
pub mod coil;
pub mod dispatch;
pub mod error;
pub mod integrator;
pub mod reductions;
pub mod sample;
pub mod scenario;
pub mod sequence;
pub mod signal;
pub mod tpoi;
pub mod trajectory;
pub mod types;
pub mod walker;

pub use checkpoint::{CheckpointError, CheckpointOptions, RestartCheckpoint, RunShape, SpinStatus};
pub use coil::{CoilSpec, GaussianCoil, IdealCoil, ReceiveCoil, UniformCoil};
pub use dispatch::{
    DispatchOptions, LoadBalancing, RunInputs, RunReport, partition_static, run_dispatch,
    run_fingerprint,
};
pub use error::{ConfigError, Error, IntegrationFailure, Result};
pub use integrator::{ExchangeRate, ExchangeRates, IntegratorSettings, Tolerances};
pub use sample::{GridSpec, Pool, SampleSpec, SpinProperties, SpinSource, SpinTable};
pub use scenario::{Scenario, ScenarioError, ScenarioMetadata, ScenarioResult, SequenceSpec};
pub use sequence::{SequenceBuilder, SequenceTree};
pub use signal::{SignalRecord, SignalSet};
pub use trajectory::{MotionKeyframe, MotionOptions, Respiration, RigidMotion};
pub use types::*;
pub use walker::{FieldCorrections, ScheduleWalker, WalkError, WalkerOptions};
