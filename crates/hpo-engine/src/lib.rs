//! Distributed hyperparameter tuning on a PBS cluster.

pub mod config;
pub mod orchestrator;
pub mod report;
pub mod worker;

pub use config::{overrides_from_vars, HpoConfig, PARAM_PREFIX};
pub use orchestrator::{format_jobs, Orchestrator, TuneSettings, TuningJobs, DEFAULT_STUDY};
pub use report::PlotDataRenderer;
pub use worker::{run_worker, WorkerArgs};
