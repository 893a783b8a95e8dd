//! Parallel spin dispatch.
//!
//! The coordinator (the calling thread) partitions the population into
//! contiguous ranges, one per worker thread, and feeds each worker batches
//! from its range. With load balancing enabled an idle worker takes further
//! batches from the ranges of busier ones. Workers share nothing mutable;
//! the coordinator alone owns the accumulators, the progress file and the
//! checkpoint.
//!
//! # Synchronization points
//!
//! ```text
//! start     resume checkpoint, partition, first batch per worker
//! batch     outcome per spin + partial signal -> accumulate, progress,
//!           periodic checkpoint, next batch or shutdown
//! end       join workers, fixed-order reduction, normalize, noise, write
//! ```
//!
//! A run stops early when its spin budget is spent; the state reached so
//! far is checkpointed synchronously and a later run with the same inputs
//! continues from there.

mod coordinator;
mod partition;
mod progress;
mod worker;


pub use coordinator::{BatchCoordinator, ClaimViolation, LoadBalancing, SpinState};
pub use partition::partition_static;
pub use progress::{PROGRESS_FILE_NAME, ProgressReporter};
pub use worker::RunInputs;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use larmor_foundation::stable_hash::Fingerprint;

use crate::checkpoint::{
    CheckpointError, CheckpointOptions, CheckpointWriter, RestartCheckpoint, RunShape,
    remove_checkpoint, resume_checkpoint, write_checkpoint,
};
use crate::error::{ConfigError, Error, Result};
use crate::reductions::reduce_signal_sets;
use crate::signal::SignalSet;
use crate::walker::{ScheduleWalker, WalkError};

use worker::{Command, Report, panic_message, spawn_worker};

/// How a run is spread over workers and persisted.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub workers: usize,
    pub load_balancing: Option<LoadBalancing>,
    /// Largest batch handed out at once; also the checkpoint granularity.
    pub batch_size: usize,
    pub checkpoint: CheckpointOptions,
    pub progress_interval: Duration,
    /// Signal files, progress and the default checkpoint go here.
    pub output_dir: Option<PathBuf>,
    /// Receiver noise level; 0 disables noise.
    pub noise: f64,
    /// Stop after this many spins finished in this run.
    pub spin_budget: Option<usize>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            load_balancing: None,
            batch_size: 64,
            checkpoint: CheckpointOptions::default(),
            progress_interval: Duration::from_secs(1),
            output_dir: None,
            noise: 0.0,
            spin_budget: None,
        }
    }
}

/// Outcome of [`run_dispatch`].
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Normalized signal of a completed run; the raw accumulators of an
    /// interrupted one.
    pub signal: SignalSet,
    /// Spins finished successfully, including resumed ones.
    pub completed: usize,
    /// Spins whose walk failed; they contribute nothing.
    pub failed: Vec<usize>,
    /// Number of finished spins taken over from a checkpoint.
    pub resumed_from: Option<usize>,
    pub interrupted: bool,
    /// Signal files written to the output directory.
    pub files: Vec<PathBuf>,
}

/// Fingerprint of everything that shapes a spin's contribution.
pub fn run_fingerprint(inputs: &RunInputs) -> u64 {
    let walker = &inputs.walker;
    let tolerances = [walker.integrator.single_pool, walker.integrator.coupled];
    let fp = tolerances.iter().fold(
        Fingerprint::new()
            .u64(inputs.tree.fingerprint())
            .f64(walker.corrections.concomitant)
            .f64(walker.corrections.position_jitter)
            .f64(walker.integrator.retry_factor),
        |fp, tol| {
            fp.f64(tol.rtol)
                .f64(tol.atol)
                .f64(tol.atol_floor)
                .u64(tol.max_steps as u64)
                .f64(tol.max_step)
        },
    );
    let fp = walker
        .exchange
        .paths()
        .iter()
        .fold(fp, |fp, path| {
            fp.u64(path.from as u64).u64(path.to as u64).f64(path.rate)
        });
    let fp = walker.motion.fingerprint(fp).u64(inputs.spins.fingerprint());
    inputs
        .coils
        .iter()
        .fold(fp.u64(inputs.coils.len() as u64), |fp, coil| coil.fingerprint(fp))
        .finish()
}

fn validate(inputs: &RunInputs, options: &DispatchOptions) -> std::result::Result<(), ConfigError> {
    if inputs.spins.is_empty() {
        return Err(ConfigError::EmptyPopulation);
    }
    if inputs.coils.is_empty() {
        return Err(ConfigError::NoCoils);
    }
    if options.workers == 0 {
        return Err(ConfigError::InvalidOption("at least one worker is required".into()));
    }
    if !(options.noise.is_finite() && options.noise >= 0.0) {
        return Err(ConfigError::InvalidOption(format!(
            "noise level must be non-negative, got {}",
            options.noise
        )));
    }
    if let Some(bounds) = &options.load_balancing {
        bounds.validate()?;
    }
    inputs.walker.integrator.validate()?;
    inputs.walker.motion.validate()?;
    let exchange = &inputs.walker.exchange;
    if !exchange.paths().is_empty() && exchange.pools() != inputs.spins.pool_count() {
        return Err(ConfigError::InvalidOption(format!(
            "exchange rates are given for {} pools but spins carry {}",
            exchange.pools(),
            inputs.spins.pool_count()
        )));
    }
    Ok(())
}

/// Simulate every spin of `inputs` and return the receiver signal.
pub fn run_dispatch(inputs: RunInputs, options: &DispatchOptions) -> Result<RunReport> {
    validate(&inputs, options)?;
    let timeline: Arc<[f64]> = ScheduleWalker::new(&inputs.tree, &inputs.walker)
        .sample_timeline()?
        .into();

    let total = inputs.spins.len();
    let channels = inputs.coils.len();
    let shape = RunShape {
        fingerprint: run_fingerprint(&inputs),
        spins: total,
        channels,
        samples: timeline.len(),
        pools: inputs.spins.pool_count(),
        seed: inputs.walker.seed,
    };
    info!(
        spins = total,
        channels,
        samples = timeline.len(),
        workers = options.workers,
        balanced = options.load_balancing.is_some(),
        "starting run"
    );

    let checkpoint_path = options.checkpoint.resolve(options.output_dir.as_deref());
    let resumed = match &checkpoint_path {
        Some(path) => resume_checkpoint(path, &shape)?,
        None => None,
    };

    let mut coordinator = BatchCoordinator::new(
        total,
        options.workers,
        options.batch_size,
        options.load_balancing,
    );
    let mut generation = 0;
    let resumed_partial = resumed.map(|checkpoint| {
        coordinator.restore(&checkpoint.spins);
        generation = checkpoint.header.generation;
        checkpoint.signal()
    });
    let resumed_from = resumed_partial.as_ref().map(|_| coordinator.finished());

    let mut session = Session {
        coordinator,
        partials: vec![None; options.workers],
        resumed: resumed_partial,
        finished_here: 0,
        since_checkpoint: 0,
        generation,
        shape,
        timeline: Arc::clone(&timeline),
    };
    let mut progress = ProgressReporter::new(options.output_dir.as_deref(), options.progress_interval);
    let writer = match &checkpoint_path {
        Some(_) => Some(CheckpointWriter::new(options.checkpoint.queue_depth)?),
        None => None,
    };

    let inputs = Arc::new(inputs);
    let outcome = session.drive(&inputs, options, &checkpoint_path, writer.as_ref(), &mut progress);
    // drain queued checkpoints before the final write
    drop(writer);
    let interrupted = outcome?;

    let mut signal = session.reduce();
    let completed = session.coordinator.count(SpinState::Done);
    let failed = session.coordinator.spins_in(SpinState::Failed);

    if interrupted {
        if let Some(path) = &checkpoint_path {
            let checkpoint = session.checkpoint(signal.clone());
            write_checkpoint(path, &checkpoint, options.checkpoint.compression_level)?;
            info!(
                path = %path.display(),
                finished = session.coordinator.finished(),
                total,
                "run interrupted, checkpoint written"
            );
        }
        return Ok(RunReport {
            signal,
            completed,
            failed,
            resumed_from,
            interrupted: true,
            files: Vec::new(),
        });
    }

    progress.finish(session.coordinator.finished(), total);
    if let Some(path) = &checkpoint_path {
        if options.checkpoint.keep {
            let checkpoint = session.checkpoint(signal.clone());
            write_checkpoint(path, &checkpoint, options.checkpoint.compression_level)?;
        } else {
            remove_checkpoint(path)?;
        }
    }

    signal.normalize(total);
    signal.add_noise(options.noise, inputs.walker.seed);

    let files = match &options.output_dir {
        Some(dir) => signal.write_to_dir(dir).map_err(|source| Error::Output {
            path: dir.clone(),
            source,
        })?,
        None => Vec::new(),
    };
    info!(
        completed,
        failed = failed.len(),
        files = files.len(),
        "run complete"
    );

    Ok(RunReport {
        signal,
        completed,
        failed,
        resumed_from,
        interrupted: false,
        files,
    })
}

/// Coordinator-side state of one run.
struct Session {
    coordinator: BatchCoordinator,
    /// Accumulated partial signal of each worker, in rank order.
    partials: Vec<Option<SignalSet>>,
    resumed: Option<SignalSet>,
    finished_here: usize,
    since_checkpoint: usize,
    generation: u64,
    shape: RunShape,
    timeline: Arc<[f64]>,
}

struct WorkerPool {
    commands: Vec<Sender<Command>>,
    handles: Vec<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    fn shutdown(&mut self) {
        for tx in &self.commands {
            let _ = tx.send(Command::Shutdown);
        }
    }

    fn join(&mut self) -> Result<()> {
        let mut first_error = None;
        for (rank, slot) in self.handles.iter_mut().enumerate() {
            if let Some(handle) = slot.take()
                && let Err(payload) = handle.join()
            {
                let message = panic_message(payload.as_ref());
                error!(rank, message = %message, "worker panicked");
                first_error.get_or_insert(Error::Communication {
                    worker: rank,
                    message,
                });
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Session {
    /// Run every worker to completion. Returns whether the run was
    /// interrupted by the spin budget.
    fn drive(
        &mut self,
        inputs: &Arc<RunInputs>,
        options: &DispatchOptions,
        checkpoint_path: &Option<PathBuf>,
        writer: Option<&CheckpointWriter>,
        progress: &mut ProgressReporter,
    ) -> Result<bool> {
        let (report_tx, reports) = mpsc::channel();
        let mut pool = WorkerPool {
            commands: Vec::with_capacity(options.workers),
            handles: Vec::with_capacity(options.workers),
        };
        for rank in 0..options.workers {
            let (tx, rx) = mpsc::channel();
            let spawned = spawn_worker(
                rank,
                Arc::clone(inputs),
                Arc::clone(&self.timeline),
                rx,
                report_tx.clone(),
            );
            match spawned {
                Ok(handle) => {
                    pool.commands.push(tx);
                    pool.handles.push(Some(handle));
                }
                Err(e) => {
                    pool.shutdown();
                    pool.commands.clear();
                    let _ = pool.join();
                    return Err(Error::Communication {
                        worker: rank,
                        message: format!("cannot spawn worker: {e}"),
                    });
                }
            }
        }
        // workers hold the only senders now
        drop(report_tx);

        let result = self.coordinate(&mut pool, &reports, options, checkpoint_path, writer, progress);
        pool.shutdown();
        pool.commands.clear();
        let joined = pool.join();
        let interrupted = result?;
        joined?;
        Ok(interrupted)
    }

    fn coordinate(
        &mut self,
        pool: &mut WorkerPool,
        reports: &mpsc::Receiver<Report>,
        options: &DispatchOptions,
        checkpoint_path: &Option<PathBuf>,
        writer: Option<&CheckpointWriter>,
        progress: &mut ProgressReporter,
    ) -> Result<bool> {
        let mut busy = vec![false; options.workers];
        let mut interrupted = false;
        for rank in 0..options.workers {
            busy[rank] = self.dispatch_next(pool, rank, options, &mut interrupted)?;
        }

        while busy.iter().any(|b| *b) {
            let report = reports.recv().map_err(|_| Error::Communication {
                worker: busy.iter().position(|b| *b).unwrap_or(0),
                message: "all workers disconnected with batches outstanding".into(),
            })?;
            match report {
                Report::BatchDone {
                    rank,
                    outcomes,
                    partial,
                } => {
                    self.record_batch(rank, outcomes, partial)?;
                    progress.update(self.coordinator.finished(), self.coordinator.total());
                    if let (Some(path), Some(writer)) = (checkpoint_path, writer) {
                        self.maybe_checkpoint(path, writer, options);
                    }
                    busy[rank] = self.dispatch_next(pool, rank, options, &mut interrupted)?;
                }
                Report::Exited { rank, panic } => {
                    if busy[rank] || panic.is_some() {
                        return Err(Error::Communication {
                            worker: rank,
                            message: panic.unwrap_or_else(|| "exited with a batch outstanding".into()),
                        });
                    }
                }
            }
        }
        Ok(interrupted)
    }

    /// Send `rank` its next batch. Returns whether the worker is now busy.
    fn dispatch_next(
        &mut self,
        pool: &WorkerPool,
        rank: usize,
        options: &DispatchOptions,
        interrupted: &mut bool,
    ) -> Result<bool> {
        let budget_spent = options
            .spin_budget
            .is_some_and(|budget| self.finished_here >= budget);
        let batch = if budget_spent {
            *interrupted |= self.coordinator.pending() > 0;
            None
        } else {
            self.coordinator.claim(rank)
        };
        let command = match batch {
            Some(batch) => {
                debug!(rank, spins = batch.len(), first = batch[0], "dispatching batch");
                Command::Batch(batch)
            }
            None => Command::Shutdown,
        };
        let busy = matches!(command, Command::Batch(_));
        pool.commands[rank]
            .send(command)
            .map_err(|_| Error::Communication {
                worker: rank,
                message: "command channel closed".into(),
            })?;
        Ok(busy)
    }

    fn record_batch(
        &mut self,
        rank: usize,
        outcomes: Vec<worker::SpinOutcome>,
        partial: SignalSet,
    ) -> Result<()> {
        for outcome in outcomes {
            let ok = match outcome.result {
                Ok(()) => true,
                Err(WalkError::Configuration(err)) => return Err(err.into()),
                Err(WalkError::Integration { .. }) => false,
            };
            self.coordinator
                .complete(rank, outcome.spin, ok)
                .map_err(|violation| Error::Communication {
                    worker: rank,
                    message: violation.to_string(),
                })?;
            self.finished_here += 1;
            self.since_checkpoint += 1;
        }
        match &mut self.partials[rank] {
            Some(sum) => sum.accumulate(&partial),
            slot @ None => *slot = Some(partial),
        }
        Ok(())
    }

    fn maybe_checkpoint(
        &mut self,
        path: &Path,
        writer: &CheckpointWriter,
        options: &DispatchOptions,
    ) {
        if self.since_checkpoint < options.checkpoint.interval_spins.max(1) {
            return;
        }
        let checkpoint = self.checkpoint(self.reduce());
        let level = options.checkpoint.compression_level;
        match writer.request_checkpoint(path.to_path_buf(), checkpoint, level) {
            Ok(()) | Err(CheckpointError::QueueFull) => self.since_checkpoint = 0,
            Err(e) => warn!(error = %e, "periodic checkpoint skipped"),
        }
    }

    /// Unnormalized sum of the resumed partial and every worker partial,
    /// paired in that fixed order.
    fn reduce(&self) -> SignalSet {
        let parts: Vec<SignalSet> = self
            .resumed
            .iter()
            .chain(self.partials.iter().flatten())
            .cloned()
            .collect();
        reduce_signal_sets(parts)
            .unwrap_or_else(|| SignalSet::with_timeline(self.shape.channels, &self.timeline))
    }

    fn checkpoint(&mut self, signal: SignalSet) -> RestartCheckpoint {
        self.generation += 1;
        RestartCheckpoint::new(self.shape, self.generation, self.coordinator.statuses(), signal)
    }
}
