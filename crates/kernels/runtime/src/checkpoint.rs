//! Restart checkpoints for long simulation runs.
//!
//! A checkpoint records which spins are finished and the unnormalized
//! per-channel accumulators they produced, which together are enough to
//! resume a run exactly where it stopped. The checkpoint system is designed
//! with these principles:
//!
//! - **Non-blocking I/O**: periodic checkpoints never stall the coordinator
//! - **Exact resume**: same scenario + checkpoint -> same final sums
//! - **Never reuse a stale file**: a checkpoint whose run shape or
//!   fingerprint disagrees is archived and the run starts from zero
//! - **Atomic replacement**: written to a temp file, then renamed
//!
//! # Architecture
//!
//! ```text
//! Coordinator Thread            Background Writer Thread
//! ──────────────────            ─────────────────────────
//! request_checkpoint()
//!   ├─ snapshot accumulators
//!   ├─ try_send to queue ───────→ receive job
//!   └─ return immediately           ├─ serialize to bincode
//!                                   ├─ compress with zstd
//!                                   └─ write temp file, rename
//! ```
//!
//! If the queue is full, checkpoint requests are dropped with a warning.
//! The final checkpoint of an interrupted run is written synchronously
//! after the writer has drained.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::signal::{SignalRecord, SignalSet};

/// Checkpoint format version (increment on breaking changes).
pub const CHECKPOINT_VERSION: u32 = 1;

/// Default queue depth for checkpoint writer (bounded channel capacity).
pub const DEFAULT_QUEUE_DEPTH: usize = 3;

/// Default zstd compression level (3 = good balance of speed/size).
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// File name of the checkpoint inside the output directory.
pub const CHECKPOINT_FILE_NAME: &str = "restart.ckpt";

// ============================================================================
// Checkpoint Format
// ============================================================================

/// Everything a checkpoint must agree on to be resumable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunShape {
    /// Fingerprint of the sequence tree.
    pub fingerprint: u64,
    pub spins: usize,
    pub channels: usize,
    pub samples: usize,
    pub pools: usize,
    pub seed: u64,
}

/// Checkpoint file header with metadata and validation info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointHeader {
    /// Checkpoint format version
    pub version: u32,

    /// Shape of the run that wrote the file
    pub shape: RunShape,

    /// End of the finished prefix of the spin range, if any
    pub last_completed_spin: Option<usize>,

    /// Incremented on every write of one run
    pub generation: u64,

    /// Timestamp when checkpoint was created
    pub created_at: SystemTime,
}

/// Persisted progress of one spin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpinStatus {
    Pending,
    Done,
    Failed,
}

impl SpinStatus {
    pub fn is_finished(self) -> bool {
        !matches!(self, SpinStatus::Pending)
    }
}

/// Complete checkpoint (header + per-spin status + accumulators).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartCheckpoint {
    pub header: CheckpointHeader,
    pub spins: Vec<SpinStatus>,
    /// Unnormalized sums of every finished spin, one vector per channel.
    pub accumulators: Vec<Vec<SignalRecord>>,
}

impl RestartCheckpoint {
    pub fn new(shape: RunShape, generation: u64, spins: Vec<SpinStatus>, signal: SignalSet) -> Self {
        let last_completed_spin = spins
            .iter()
            .take_while(|s| s.is_finished())
            .count()
            .checked_sub(1);
        Self {
            header: CheckpointHeader {
                version: CHECKPOINT_VERSION,
                shape,
                last_completed_spin,
                generation,
                created_at: SystemTime::now(),
            },
            spins,
            accumulators: signal.into_channels(),
        }
    }

    pub fn completed(&self) -> usize {
        self.spins.iter().filter(|s| s.is_finished()).count()
    }

    /// Accumulators as a signal set.
    pub fn signal(&self) -> SignalSet {
        SignalSet::from_channels(self.accumulators.clone())
    }

    /// Check that this checkpoint can resume a run of `shape`.
    pub fn validate(&self, shape: &RunShape) -> Result<(), CheckpointError> {
        let header = &self.header;
        if header.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::Mismatch(format!(
                "format version {} (expected {CHECKPOINT_VERSION})",
                header.version
            )));
        }
        if header.shape != *shape {
            return Err(CheckpointError::Mismatch(format!(
                "run shape {:?} differs from current {:?}",
                header.shape, shape
            )));
        }
        if self.spins.len() != shape.spins {
            return Err(CheckpointError::Mismatch(format!(
                "{} spin states for {} spins",
                self.spins.len(),
                shape.spins
            )));
        }
        let accumulators_fit = self.accumulators.len() == shape.channels
            && self.accumulators.iter().all(|c| c.len() == shape.samples);
        if !accumulators_fit {
            return Err(CheckpointError::Mismatch(
                "accumulator layout differs from channel and sample counts".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where and how checkpoints are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckpointOptions {
    pub enabled: bool,
    /// Explicit checkpoint path; defaults to `restart.ckpt` in the output directory.
    pub path: Option<PathBuf>,
    /// Write a checkpoint after this many newly finished spins.
    pub interval_spins: usize,
    /// Leave the checkpoint in place after a completed run.
    pub keep: bool,
    pub compression_level: i32,
    pub queue_depth: usize,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            interval_spins: 1000,
            keep: false,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl CheckpointOptions {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Checkpoint path for a run writing into `output_dir`.
    pub fn resolve(&self, output_dir: Option<&Path>) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }
        self.path
            .clone()
            .or_else(|| output_dir.map(|dir| dir.join(CHECKPOINT_FILE_NAME)))
    }
}

// ============================================================================
// Checkpoint Writer (Non-Blocking Background Thread)
// ============================================================================

/// Job submitted to background checkpoint writer.
struct CheckpointJob {
    path: PathBuf,
    checkpoint: RestartCheckpoint,
    compression_level: i32,
}

/// Non-blocking checkpoint writer with bounded queue.
pub struct CheckpointWriter {
    tx: Option<SyncSender<CheckpointJob>>,
    handle: Option<JoinHandle<()>>,
}

impl CheckpointWriter {
    /// Create a new checkpoint writer with specified queue depth.
    pub fn new(queue_depth: usize) -> Result<Self, CheckpointError> {
        let (tx, rx) = sync_channel(queue_depth.max(1));
        let handle = spawn_writer_thread(rx)?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Request a checkpoint write (non-blocking).
    ///
    /// If the queue is full, returns an error and drops the checkpoint.
    pub fn request_checkpoint(
        &self,
        path: PathBuf,
        checkpoint: RestartCheckpoint,
        compression_level: i32,
    ) -> Result<(), CheckpointError> {
        let tx = self.tx.as_ref().ok_or(CheckpointError::WriterDied)?;

        let generation = checkpoint.header.generation;
        let job = CheckpointJob {
            path,
            checkpoint,
            compression_level,
        };

        match tx.try_send(job) {
            Ok(()) => {
                debug!(generation, "checkpoint job queued");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                warn!(generation, "checkpoint queue full, dropping checkpoint request");
                Err(CheckpointError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => {
                error!("checkpoint writer thread died");
                Err(CheckpointError::WriterDied)
            }
        }
    }
}

impl Drop for CheckpointWriter {
    fn drop(&mut self) {
        self.tx.take();

        // Wait for writer thread to finish pending jobs
        if let Some(handle) = self.handle.take() {
            debug!("waiting for checkpoint writer thread to finish");
            if let Err(e) = handle.join() {
                error!("checkpoint writer thread panicked: {:?}", e);
            }
        }
    }
}

fn spawn_writer_thread(rx: Receiver<CheckpointJob>) -> Result<JoinHandle<()>, CheckpointError> {
    thread::Builder::new()
        .name("checkpoint-writer".to_string())
        .spawn(move || {
            debug!("checkpoint writer thread started");

            while let Ok(job) = rx.recv() {
                let generation = job.checkpoint.header.generation;
                if let Err(e) = write_checkpoint(&job.path, &job.checkpoint, job.compression_level)
                {
                    error!(
                        path = %job.path.display(),
                        generation,
                        error = %e,
                        "failed to write checkpoint"
                    );
                } else {
                    debug!(
                        path = %job.path.display(),
                        generation,
                        completed = job.checkpoint.completed(),
                        "checkpoint written"
                    );
                }
            }

            debug!("checkpoint writer thread shutting down");
        })
        .map_err(|e| CheckpointError::Io(format!("cannot spawn checkpoint writer: {e}")))
}

// ============================================================================
// Serialization and Compression
// ============================================================================

/// Write a checkpoint to disk (bincode + zstd), replacing `path` atomically.
pub fn write_checkpoint(
    path: &Path,
    checkpoint: &RestartCheckpoint,
    compression_level: i32,
) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CheckpointError::Io(e.to_string()))?;
    }

    let serialized = bincode::serialize(checkpoint)
        .map_err(|e| CheckpointError::Serialization(e.to_string()))?;

    let compressed = zstd::encode_all(&serialized[..], compression_level)
        .map_err(|e| CheckpointError::Compression(e.to_string()))?;

    debug!(
        bytes = serialized.len(),
        compressed_bytes = compressed.len(),
        "checkpoint encoded"
    );

    let temp = sibling(path, ".tmp");
    fs::write(&temp, compressed).map_err(|e| CheckpointError::Io(e.to_string()))?;
    fs::rename(&temp, path).map_err(|e| CheckpointError::Io(e.to_string()))?;

    Ok(())
}

/// Load a checkpoint from disk (decompress + deserialize).
pub fn load_checkpoint(path: &Path) -> Result<RestartCheckpoint, CheckpointError> {
    let compressed = fs::read(path).map_err(|e| CheckpointError::Io(e.to_string()))?;

    let serialized = zstd::decode_all(&compressed[..])
        .map_err(|e| CheckpointError::Decompression(e.to_string()))?;

    let checkpoint: RestartCheckpoint = bincode::deserialize(&serialized)
        .map_err(|e| CheckpointError::Deserialization(e.to_string()))?;

    debug!(
        path = %path.display(),
        generation = checkpoint.header.generation,
        "checkpoint loaded"
    );

    Ok(checkpoint)
}

/// Load the checkpoint at `path` if it can resume a run of `shape`.
///
/// Returns `Ok(None)` when there is nothing to resume. A checkpoint that
/// cannot be decoded or does not match `shape` is archived next to the
/// original as `<name>.stale-<unix seconds>` and also yields `None`.
pub fn resume_checkpoint(
    path: &Path,
    shape: &RunShape,
) -> Result<Option<RestartCheckpoint>, CheckpointError> {
    if !path.exists() {
        return Ok(None);
    }
    let outcome = load_checkpoint(path).and_then(|checkpoint| {
        checkpoint.validate(shape)?;
        Ok(checkpoint)
    });
    match outcome {
        Ok(checkpoint) => {
            info!(
                path = %path.display(),
                completed = checkpoint.completed(),
                last_completed_spin = ?checkpoint.header.last_completed_spin,
                "resuming from checkpoint"
            );
            Ok(Some(checkpoint))
        }
        Err(err @ CheckpointError::Io(_)) => Err(err),
        Err(reason) => {
            let archived = archive_checkpoint(path)?;
            warn!(
                path = %path.display(),
                archived = %archived.display(),
                reason = %reason,
                "checkpoint does not match this run, starting from zero"
            );
            Ok(None)
        }
    }
}

/// Move `path` aside as `<name>.stale-<unix seconds>`.
pub fn archive_checkpoint(path: &Path) -> Result<PathBuf, CheckpointError> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut target = sibling(path, &format!(".stale-{secs}"));
    let mut attempt = 1;
    while target.exists() {
        target = sibling(path, &format!(".stale-{secs}-{attempt}"));
        attempt += 1;
    }
    fs::rename(path, &target).map_err(|e| CheckpointError::Io(e.to_string()))?;
    Ok(target)
}

/// Delete the checkpoint of a completed run; a missing file is fine.
pub fn remove_checkpoint(path: &Path) -> Result<(), CheckpointError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CheckpointError::Io(e.to_string())),
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint queue is full (dropped to avoid blocking the run)")]
    QueueFull,

    #[error("checkpoint writer thread has died")]
    WriterDied,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("checkpoint mismatch: {0}")]
    Mismatch(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> RunShape {
        RunShape {
            fingerprint: 0xfeed,
            spins: 4,
            channels: 2,
            samples: 3,
            pools: 1,
            seed: 42,
        }
    }

    fn create_test_checkpoint() -> RestartCheckpoint {
        let mut signal = SignalSet::with_timeline(2, &[0.5, 1.0, 1.5]);
        signal.add(0, 1, [1.0, 2.0, 3.0]);
        signal.add(1, 2, [-1.0, 0.5, 0.0]);
        let spins = vec![
            SpinStatus::Done,
            SpinStatus::Failed,
            SpinStatus::Pending,
            SpinStatus::Done,
        ];
        RestartCheckpoint::new(shape(), 7, spins, signal)
    }

    #[test]
    fn test_last_completed_spin_is_end_of_finished_prefix() {
        let checkpoint = create_test_checkpoint();
        assert_eq!(checkpoint.header.last_completed_spin, Some(1));
        assert_eq!(checkpoint.completed(), 3);

        let none = RestartCheckpoint::new(
            shape(),
            0,
            vec![SpinStatus::Pending; 4],
            SignalSet::with_timeline(2, &[0.5, 1.0, 1.5]),
        );
        assert_eq!(none.header.last_completed_spin, None);
    }

    #[test]
    fn test_checkpoint_write_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);
        let checkpoint = create_test_checkpoint();

        write_checkpoint(&path, &checkpoint, DEFAULT_COMPRESSION_LEVEL).unwrap();
        assert!(!sibling(&path, ".tmp").exists());

        let loaded = load_checkpoint(&path).unwrap();
        assert_eq!(loaded.header.shape, checkpoint.header.shape);
        assert_eq!(loaded.header.generation, 7);
        assert_eq!(loaded.spins, checkpoint.spins);
        assert_eq!(loaded.accumulators, checkpoint.accumulators);
    }

    #[test]
    fn test_resume_accepts_matching_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);
        write_checkpoint(&path, &create_test_checkpoint(), DEFAULT_COMPRESSION_LEVEL).unwrap();

        let resumed = resume_checkpoint(&path, &shape()).unwrap().unwrap();
        assert_eq!(resumed.signal().channel(0)[1].mx, 1.0);
        assert!(path.exists());
    }

    #[test]
    fn test_missing_checkpoint_is_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);
        assert!(resume_checkpoint(&path, &shape()).unwrap().is_none());
    }

    #[test]
    fn test_mismatched_checkpoint_is_archived() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);
        write_checkpoint(&path, &create_test_checkpoint(), DEFAULT_COMPRESSION_LEVEL).unwrap();

        let other = RunShape {
            spins: 5,
            ..shape()
        };
        assert!(resume_checkpoint(&path, &other).unwrap().is_none());
        assert!(!path.exists());

        let archived: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(archived.len(), 1);
        assert!(archived[0].starts_with("restart.ckpt.stale-"));
    }

    #[test]
    fn test_corrupt_checkpoint_is_archived() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE_NAME);
        fs::write(&path, b"not a checkpoint").unwrap();

        assert!(resume_checkpoint(&path, &shape()).unwrap().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_validate_rejects_foreign_fingerprint() {
        let checkpoint = create_test_checkpoint();
        let other = RunShape {
            fingerprint: 1,
            ..shape()
        };
        assert!(matches!(
            checkpoint.validate(&other),
            Err(CheckpointError::Mismatch(_))
        ));
        assert!(checkpoint.validate(&shape()).is_ok());
    }

    #[test]
    fn test_background_writer_flushes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CHECKPOINT_FILE_NAME);
        {
            let writer = CheckpointWriter::new(DEFAULT_QUEUE_DEPTH).unwrap();
            writer
                .request_checkpoint(path.clone(), create_test_checkpoint(), DEFAULT_COMPRESSION_LEVEL)
                .unwrap();
        }
        assert_eq!(load_checkpoint(&path).unwrap().header.generation, 7);
    }

    #[test]
    fn test_remove_missing_checkpoint_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        remove_checkpoint(&dir.path().join(CHECKPOINT_FILE_NAME)).unwrap();
    }

    #[test]
    fn test_options_resolve_against_output_dir() {
        let options = CheckpointOptions::default();
        assert_eq!(
            options.resolve(Some(Path::new("out"))),
            Some(PathBuf::from("out/restart.ckpt"))
        );
        assert_eq!(options.resolve(None), None);
        assert_eq!(CheckpointOptions::disabled().resolve(Some(Path::new("out"))), None);
    }
}
