use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkpoint::CheckpointOptions;
use crate::coil::CoilSpec;
use crate::dispatch::{DispatchOptions, LoadBalancing, RunInputs};
use crate::error::ConfigError;
use crate::integrator::{ExchangeRate, ExchangeRates, IntegratorSettings};
use crate::sample::{SampleSpec, SpinSource};
use crate::trajectory::MotionOptions;
use crate::walker::{FieldCorrections, WalkerOptions};

use super::SequenceSpec;

/// API version accepted by this release.
pub const API_VERSION: &str = "larmor/v1";

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Invalid API version: expected '{API_VERSION}', got '{0}'")]
    InvalidApiVersion(String),

    #[error("Invalid kind: expected 'Scenario', got '{0}'")]
    InvalidKind(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Duplicate sequence node '{name}'")]
    DuplicateNode { name: String },

    #[error("Unknown sequence node '{name}' referenced from '{parent}'")]
    UnknownNode { name: String, parent: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type ScenarioResult<T> = Result<T, ScenarioError>;

/// One simulation run as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default = "default_kind")]
    pub kind: String,

    pub metadata: ScenarioMetadata,

    /// Root of every random stream of the run.
    #[serde(default)]
    pub seed: u64,

    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Absent means static ranges.
    #[serde(default)]
    pub load_balancing: Option<LoadBalancing>,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub tolerances: IntegratorSettings,

    #[serde(default)]
    pub field_corrections: FieldCorrections,

    /// Rigid motion, respiration and the diffusion knot spacing.
    #[serde(default)]
    pub motion: MotionOptions,

    /// One entry per exchanging pool pair; reverse rates follow from
    /// equilibrium.
    #[serde(default)]
    pub exchange_rates: Vec<ExchangeRate>,

    pub sequence: SequenceSpec,

    pub sample: SampleSpec,

    #[serde(default = "default_coils")]
    pub coils: Vec<CoilSpec>,

    #[serde(default)]
    pub checkpoint: CheckpointOptions,

    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Receiver noise standard deviation; 0 disables noise.
    #[serde(default)]
    pub noise: f64,
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    "Scenario".to_string()
}

fn default_workers() -> usize {
    1
}

fn default_batch_size() -> usize {
    64
}

fn default_coils() -> Vec<CoilSpec> {
    vec![CoilSpec::Ideal]
}

fn default_progress_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioMetadata {
    pub name: String,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub description: Option<String>,
}

impl Scenario {
    pub fn new(name: String, sequence: SequenceSpec, sample: SampleSpec) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ScenarioMetadata {
                name,
                title: None,
                description: None,
            },
            seed: 0,
            workers: default_workers(),
            load_balancing: None,
            batch_size: default_batch_size(),
            tolerances: IntegratorSettings::default(),
            field_corrections: FieldCorrections::default(),
            motion: MotionOptions::default(),
            exchange_rates: Vec::new(),
            sequence,
            sample,
            coils: default_coils(),
            checkpoint: CheckpointOptions::default(),
            progress_interval_ms: default_progress_interval_ms(),
            noise: 0.0,
        }
    }

    pub fn load(path: &Path) -> ScenarioResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> ScenarioResult<Self> {
        let scenario: Scenario = serde_yaml::from_str(yaml)?;
        scenario.validate_schema()?;
        Ok(scenario)
    }

    pub fn to_yaml(&self) -> ScenarioResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    fn validate_schema(&self) -> ScenarioResult<()> {
        if self.api_version != API_VERSION {
            return Err(ScenarioError::InvalidApiVersion(self.api_version.clone()));
        }
        if self.kind != "Scenario" {
            return Err(ScenarioError::InvalidKind(self.kind.clone()));
        }
        if self.metadata.name.is_empty() {
            return Err(ScenarioError::MissingField("metadata.name".to_string()));
        }
        if self.sequence.root.is_empty() {
            return Err(ScenarioError::MissingField("sequence.root".to_string()));
        }
        Ok(())
    }

    pub fn with_title(mut self, title: String) -> Self {
        self.metadata.title = Some(title);
        self
    }

    pub fn with_description(mut self, description: String) -> Self {
        self.metadata.description = Some(description);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_load_balancing(mut self, balancing: LoadBalancing) -> Self {
        self.load_balancing = Some(balancing);
        self
    }

    pub fn with_coil(mut self, coil: CoilSpec) -> Self {
        self.coils.push(coil);
        self
    }

    pub fn with_coils(mut self, coils: Vec<CoilSpec>) -> Self {
        self.coils = coils;
        self
    }

    pub fn with_motion(mut self, motion: MotionOptions) -> Self {
        self.motion = motion;
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: CheckpointOptions) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }

    /// Resolve names and build everything a run needs.
    ///
    /// Signal files, progress and the default checkpoint location go to
    /// `output_dir` when one is given.
    pub fn into_run(&self, output_dir: Option<PathBuf>) -> ScenarioResult<(RunInputs, DispatchOptions)> {
        let tree = self.sequence.build()?;
        let spins = self.sample.build()?;
        self.motion.validate()?;
        let exchange = if self.exchange_rates.is_empty() {
            ExchangeRates::none(spins.pool_count())
        } else {
            ExchangeRates::new(spins.pool_count(), self.exchange_rates.clone())?
        };
        let inputs = RunInputs {
            tree,
            spins: Arc::new(spins),
            coils: self.coils.iter().map(CoilSpec::build).collect(),
            walker: WalkerOptions {
                seed: self.seed,
                integrator: self.tolerances,
                exchange,
                corrections: self.field_corrections,
                motion: self.motion.clone(),
            },
        };
        let options = DispatchOptions {
            workers: self.workers,
            load_balancing: self.load_balancing,
            batch_size: self.batch_size,
            checkpoint: self.checkpoint.clone(),
            progress_interval: Duration::from_millis(self.progress_interval_ms),
            output_dir,
            noise: self.noise,
            spin_budget: None,
        };
        Ok((inputs, options))
    }
}
