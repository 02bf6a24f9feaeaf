//! Entry point for the process a tuning job runs.
//!
//! The trainer lives outside this workspace, so a trainer binary flattens
//! [`WorkerArgs`] into its own CLI and hands its [`Trainer`] to
//! [`run_worker`]. Every argument can also come from the variables the job
//! was queued with, which is how `run-tuning-jobs` passes them.

use anyhow::{Context, Result};
use clap::Args;
use hpo_objective::{DatasetReader, Trainer};
use hpo_study::OptimizeReport;
use hpo_types::ConfigError;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::config::{overrides_from_vars, HpoConfig};
use crate::orchestrator::{Orchestrator, TuneSettings, DEFAULT_STUDY};

#[derive(Debug, Clone, Args)]
pub struct WorkerArgs {
    #[arg(long, env = "study", default_value = DEFAULT_STUDY)]
    pub study: String,
    /// Trials run by this worker
    #[arg(long, env = "trials", default_value_t = 10)]
    pub trials: usize,
    #[arg(long, env = "sampler", default_value = "CmaEs")]
    pub sampler: String,
    #[arg(long, env = "pruner", default_value = "Median")]
    pub pruner: String,
    #[arg(long, env = "epochs", default_value_t = 100)]
    pub epochs: u64,
    #[arg(long, env = "data")]
    pub data: PathBuf,
    /// Validation data. Without it trials score on training loss alone
    #[arg(long, env = "valid")]
    pub valid: Option<PathBuf>,
    #[arg(long, env = "gpus", default_value_t = 0)]
    pub gpus: u32,
    /// Print per-epoch training output
    #[arg(long)]
    pub train_verbose: bool,
    /// Run against a process-local store instead of the shared backend
    #[arg(long)]
    pub local: bool,
}

impl WorkerArgs {
    /// Tuning settings for this worker. `param_*` entries of `vars` pin
    /// parameters for every trial.
    pub fn settings(&self, vars: &HashMap<String, String>) -> Result<TuneSettings, ConfigError> {
        let mut settings = TuneSettings::new(&self.study, &self.data);
        settings.n_trials = self.trials;
        settings.with_db = !self.local;
        settings.sampler = self.sampler.clone();
        settings.pruner = self.pruner.clone();
        settings.evaluator.epochs = self.epochs;
        settings.evaluator.valid_file = self.valid.clone();
        settings.evaluator.gpus = self.gpus;
        settings.evaluator.verbose = self.train_verbose;
        settings.evaluator.fixed = overrides_from_vars(vars)?;
        Ok(settings)
    }
}

/// Run this worker's share of the study.
pub async fn run_worker(
    args: &WorkerArgs,
    trainer: Arc<dyn Trainer>,
    reader: &dyn DatasetReader,
) -> Result<OptimizeReport> {
    let vars: HashMap<String, String> = std::env::vars().collect();
    let settings = args.settings(&vars).context("reading parameter overrides")?;
    let config = HpoConfig::from_env().context("reading configuration")?;
    let orchestrator = Orchestrator::new(config);

    let report = orchestrator.tune(&settings, trainer, reader).await?;
    info!(
        study = %settings.study,
        complete = report.complete,
        pruned = report.pruned,
        failed = report.failed,
        "worker finished"
    );
    Ok(report)
}
