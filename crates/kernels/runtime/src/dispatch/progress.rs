use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info};

/// File name of the progress side channel inside the output directory.
pub const PROGRESS_FILE_NAME: &str = "progress";

/// Best-effort progress percentage, rate limited.
///
/// Writes the integer percentage to `<output>/progress` and logs it, at
/// most once per interval and only when the value changed. Failures to
/// write are logged and otherwise ignored.
#[derive(Debug)]
pub struct ProgressReporter {
    path: Option<PathBuf>,
    interval: Duration,
    last_report: Option<Instant>,
    last_percent: Option<u32>,
}

impl ProgressReporter {
    pub fn new(output_dir: Option<&Path>, interval: Duration) -> Self {
        Self {
            path: output_dir.map(|dir| dir.join(PROGRESS_FILE_NAME)),
            interval,
            last_report: None,
            last_percent: None,
        }
    }

    pub fn update(&mut self, finished: usize, total: usize) {
        let percent = percent(finished, total);
        if self.last_percent == Some(percent) {
            return;
        }
        if self
            .last_report
            .is_some_and(|last| last.elapsed() < self.interval)
        {
            return;
        }
        self.publish(percent, finished, total);
    }

    /// Report the final value regardless of the rate limit.
    pub fn finish(&mut self, finished: usize, total: usize) {
        let percent = percent(finished, total);
        if self.last_percent != Some(percent) {
            self.publish(percent, finished, total);
        }
    }

    pub fn last_percent(&self) -> Option<u32> {
        self.last_percent
    }

    fn publish(&mut self, percent: u32, finished: usize, total: usize) {
        self.last_report = Some(Instant::now());
        self.last_percent = Some(percent);
        info!(percent, finished, total, "progress");
        if let Some(path) = &self.path
            && let Err(e) = fs::write(path, format!("{percent}\n"))
        {
            debug!(path = %path.display(), error = %e, "cannot write progress file");
        }
    }
}

fn percent(finished: usize, total: usize) -> u32 {
    if total == 0 {
        return 100;
    }
    ((finished.min(total) * 100) / total) as u32
}
