//! Errors raised while preparing and executing a simulation run.
//!
//! # Error Categories
//!
//! - **Configuration**: [`ConfigError`], detected while the sequence tree and
//!   spin population are prepared, before any spin is simulated. Always fatal.
//! - **Integration**: [`IntegrationFailure`], raised by the ODE stepper for a
//!   single spin. Recovered at the spin level; the spin is recorded as failed
//!   and its buffered signal is discarded.
//! - **Checkpoint**: [`CheckpointError`], raised by checkpoint I/O. A resume
//!   mismatch is recovered by archiving the stale file and starting over.
//! - **Communication**: a worker died or the coordinator lost contact with it.
//!   Fatal for the run; the partial reduction is never returned as a result.

use std::path::PathBuf;

use thiserror::Error;

use crate::checkpoint::CheckpointError;

/// Runtime result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for a simulation run.
#[derive(Debug, Error)]
pub enum Error {
    /// The sequence tree, spin population or run options are malformed.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Checkpoint persistence failed in a way that cannot be recovered.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// A worker failed or disconnected before reporting all of its spins.
    #[error("worker {worker} failed: {message}")]
    Communication {
        /// Rank of the failed worker.
        worker: usize,
        /// What the coordinator observed.
        message: String,
    },

    /// Writing a result file failed.
    #[error("failed to write {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A malformed schedule, population or run setup.
///
/// Node names are carried instead of arena indices so the message can be
/// matched against the scenario file.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// An atomic block has no children. Walking it would emit nothing.
    #[error("atomic block '{block}' has no children")]
    EmptyAtomicBlock { block: String },

    /// An atomic block produced no time points at all.
    #[error("atomic block '{block}' yields no time points of interest")]
    NoTimePoints { block: String },

    /// A non-leaf node was placed inside an atomic block.
    #[error("atomic block '{block}' contains non-leaf child '{child}'")]
    NonLeafInAtomic { block: String, child: String },

    /// A leaf was placed directly under a repeating node or used as root.
    #[error("leaf '{leaf}' must be a child of an atomic block")]
    LeafOutsideAtomic { leaf: String },

    #[error("repeating node '{node}' has zero repetitions")]
    ZeroRepetitions { node: String },

    #[error("node '{node}' has invalid duration {duration}")]
    InvalidDuration { node: String, duration: f64 },

    /// A child index does not refer to a node in the arena.
    #[error("node '{parent}' references unknown child #{child}")]
    UnknownChild { parent: String, child: usize },

    /// The node graph contains a cycle; durations are undefined.
    #[error("cycle detected in sequence tree: {nodes:?}")]
    CycleDetected { nodes: Vec<String> },

    /// Two sample points of one block fall within the merge tolerance.
    #[error("atomic block '{block}' has coincident samples at t={time}")]
    CoincidentSamples { block: String, time: f64 },

    /// A leaf declared a time point outside `[0, duration]`.
    #[error("leaf '{leaf}' has time point {time} outside [0, {duration}]")]
    TimePointOutOfRange {
        leaf: String,
        time: f64,
        duration: f64,
    },

    /// The merged sample count of a block disagrees with its declared count.
    #[error("atomic block '{block}' declares {expected} samples but collected {collected}")]
    SampleCountMismatch {
        block: String,
        expected: u64,
        collected: u64,
    },

    /// A leaf parameter refers to a node that is not a repeating ancestor.
    #[error("leaf '{leaf}' depends on '{reference}', which is not a repeating node")]
    NotALoop { leaf: String, reference: String },

    /// A name lookup in the scenario failed.
    #[error("unknown loop '{reference}' referenced from '{leaf}'")]
    UnknownLoop { leaf: String, reference: String },

    #[error("invalid pulse shape in '{leaf}': {reason}")]
    InvalidShape { leaf: String, reason: String },

    /// Spin pool layout disagrees with the configured pool count.
    #[error("spin {spin} has {found} pools, expected {expected}")]
    PoolMismatch {
        spin: usize,
        expected: usize,
        found: usize,
    },

    #[error("invalid exchange rate {from} -> {to}: {reason}")]
    InvalidExchange {
        from: usize,
        to: usize,
        reason: String,
    },

    #[error("invalid tolerance: {0}")]
    InvalidTolerance(String),

    #[error("the spin population is empty")]
    EmptyPopulation,

    #[error("at least one receive coil is required")]
    NoCoils,

    #[error("invalid run option: {0}")]
    InvalidOption(String),
}

/// Non-convergence of the adaptive stepper for one spin.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntegrationFailure {
    /// The controller asked for a step smaller than the resolvable minimum.
    #[error("step size underflow at t={time} (h={step:e})")]
    StepUnderflow { time: f64, step: f64 },

    /// The per-block step budget ran out before reaching the target.
    #[error("step budget of {steps} exhausted at t={time}")]
    StepBudgetExhausted { time: f64, steps: usize },

    /// The right-hand side or the state produced NaN/Inf.
    #[error("non-finite state at t={time}")]
    NonFinite { time: f64 },

    /// The caller asked to step backwards in time.
    #[error("cannot advance backwards from t={from} to t={to}")]
    Backwards { from: f64, to: f64 },
}
