//! Larmor Run - Simulates a scenario and writes one signal file per coil
//!
//! Re-running the same command after an interruption continues from the
//! restart checkpoint in the output directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use larmor_runtime::{LoadBalancing, Scenario, run_dispatch};

#[derive(Parser, Debug)]
#[command(name = "larmor-run")]
#[command(about = "Run a Larmor spin simulation scenario")]
struct Cli {
    /// Scenario YAML file.
    #[arg(value_name = "SCENARIO")]
    scenario: PathBuf,

    /// Directory for signal files, progress and the restart checkpoint.
    #[arg(long, short, default_value = "out")]
    output: PathBuf,

    /// Override the worker count of the scenario.
    #[arg(long, short)]
    workers: Option<usize>,

    /// Enable load balancing with this maximum batch size.
    #[arg(long)]
    balance: Option<usize>,

    /// Stop after this many spins and checkpoint.
    #[arg(long)]
    spin_budget: Option<usize>,

    /// Override the scenario seed.
    #[arg(long)]
    seed: Option<u64>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,larmor_runtime=debug"));

    fmt().with_env_filter(filter).with_target(false).init();
}

fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    info!("Loading scenario from: {}", cli.scenario.display());
    let mut scenario = Scenario::load(&cli.scenario)
        .with_context(|| format!("cannot load {}", cli.scenario.display()))?;
    if let Some(workers) = cli.workers {
        scenario = scenario.with_workers(workers);
    }
    if let Some(seed) = cli.seed {
        scenario = scenario.with_seed(seed);
    }
    if let Some(max_batch) = cli.balance {
        scenario = scenario.with_load_balancing(LoadBalancing {
            min_batch: 1,
            max_batch,
        });
    }

    std::fs::create_dir_all(&cli.output)
        .with_context(|| format!("cannot create {}", cli.output.display()))?;

    let (inputs, mut options) = scenario
        .into_run(Some(cli.output.clone()))
        .context("invalid scenario")?;
    options.spin_budget = cli.spin_budget;

    let report = run_dispatch(inputs, &options).context("simulation failed")?;

    if let Some(resumed) = report.resumed_from {
        info!("Resumed with {resumed} spins already finished");
    }
    if !report.failed.is_empty() {
        warn!(
            "{} spins failed to integrate and were left out",
            report.failed.len()
        );
    }
    if report.interrupted {
        info!(
            "Interrupted after {} spins; run again to continue",
            report.completed + report.failed.len()
        );
        return Ok(());
    }

    info!("Simulated {} spins", report.completed);
    for file in &report.files {
        info!("  {}", file.display());
    }
    Ok(())
}
