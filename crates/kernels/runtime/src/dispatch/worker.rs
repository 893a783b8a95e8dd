//! Worker threads.
//!
//! A worker owns its walker and integrator state outright and sees the run
//! inputs only through a shared, immutable [`RunInputs`]. It receives spin
//! batches over its own command channel and answers on the shared report
//! channel with the outcome of every spin plus a partial signal set for
//! the batch.

use std::any::Any;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::coil::ReceiveCoil;
use crate::sample::SpinSource;
use crate::sequence::SequenceTree;
use crate::signal::{CoilReceiver, SignalSet};
use crate::walker::{ScheduleWalker, WalkError, WalkerOptions};

/// Immutable inputs shared by the coordinator and every worker.
pub struct RunInputs {
    pub tree: SequenceTree,
    pub spins: Arc<dyn SpinSource>,
    pub coils: Vec<Box<dyn ReceiveCoil>>,
    pub walker: WalkerOptions,
}

impl std::fmt::Debug for RunInputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunInputs")
            .field("nodes", &self.tree.len())
            .field("spins", &self.spins.len())
            .field("coils", &self.coils)
            .finish_non_exhaustive()
    }
}

pub(crate) enum Command {
    Batch(Vec<usize>),
    Shutdown,
}

/// Result of one spin of a batch.
#[derive(Debug)]
pub(crate) struct SpinOutcome {
    pub spin: usize,
    pub result: Result<(), WalkError>,
}

pub(crate) enum Report {
    BatchDone {
        rank: usize,
        outcomes: Vec<SpinOutcome>,
        partial: SignalSet,
    },
    /// Sent by every worker on the way out, including when it unwinds.
    Exited { rank: usize, panic: Option<String> },
}

/// Announces the end of a worker thread, however it ended.
struct ExitGuard {
    rank: usize,
    reports: Sender<Report>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let panic = thread::panicking().then(|| "worker thread panicked".to_string());
        // the coordinator may already be gone
        let _ = self.reports.send(Report::Exited {
            rank: self.rank,
            panic,
        });
    }
}

pub(crate) fn spawn_worker(
    rank: usize,
    inputs: Arc<RunInputs>,
    timeline: Arc<[f64]>,
    commands: Receiver<Command>,
    reports: Sender<Report>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("spin-worker-{rank}"))
        .spawn(move || {
            let _guard = ExitGuard {
                rank,
                reports: reports.clone(),
            };
            run_worker(rank, &inputs, &timeline, &commands, &reports);
        })
}

fn run_worker(
    rank: usize,
    inputs: &RunInputs,
    timeline: &[f64],
    commands: &Receiver<Command>,
    reports: &Sender<Report>,
) {
    let mut walker = ScheduleWalker::new(&inputs.tree, &inputs.walker);
    let resolution = inputs.spins.resolution();
    debug!(rank, "worker started");

    while let Ok(Command::Batch(batch)) = commands.recv() {
        let mut partial = SignalSet::with_timeline(inputs.coils.len(), timeline);
        let mut outcomes = Vec::with_capacity(batch.len());
        for spin in batch {
            let result = walker
                .simulate(spin, inputs.spins.spin(spin), resolution)
                .map(|ctx| {
                    if ctx.retries > 0 {
                        debug!(rank, spin, retries = ctx.retries, "spin needed tighter tolerances");
                    }
                    ctx.deliver(&mut CoilReceiver::new(&inputs.coils, &mut partial));
                });
            if let Err(err) = &result {
                warn!(rank, spin, error = %err, "spin failed, its signal is discarded");
            }
            outcomes.push(SpinOutcome { spin, result });
        }
        let report = Report::BatchDone {
            rank,
            outcomes,
            partial,
        };
        if reports.send(report).is_err() {
            break;
        }
    }
    debug!(rank, "worker stopped");
}

/// Readable message of a join error payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker thread panicked".to_string())
}
