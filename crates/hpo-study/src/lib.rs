//! # hpo-study
//!
//! Study coordination for distributed hyperparameter optimization.
//!
//! Workers on different nodes open the same named study through a shared
//! [`StudyStorage`] backend, each running its own sequential optimization loop.
//! Parameters are drawn by a sampler and running trials are stopped early by a
//! pruner, both chosen by name from a fixed registry.

mod connection;
mod pruner;
mod registry;
mod report;
mod sampler;
#[cfg(feature = "duckdb")]
mod sql_storage;
mod storage;
mod store;
mod study;
mod trial;
mod tunnel;

pub use connection::{BackendContext, ConnectionSettings, ConnectionTarget, DEFAULT_SCHEME};
pub use pruner::{HyperbandPruner, MedianPruner, NopPruner, Pruner, PruningContext};
pub use registry::{PrunerConfig, SamplerConfig, PRUNER_NAMES, SAMPLER_NAMES};
pub use report::{create_report_dir, generate_report, PlotKind, ReportOutcome, ReportRenderer};
pub use sampler::{
    CmaEsSampler, GridSampler, RandomSampler, Sampler, SamplingContext, TpeSampler,
};
#[cfg(feature = "duckdb")]
pub use sql_storage::DuckDbStorage;
pub use storage::{InMemoryStorage, StudyRecord, StudyStorage};
pub use store::{StudyStore, DEFAULT_PRUNER, DEFAULT_SAMPLER};
pub use study::{BestTrial, OptimizeReport, Study, StudySummary};
pub use trial::{FixedTrial, FrozenTrial, ObjectiveDirection, StudyId, Trial, TrialId, TrialState};
pub use tunnel::{SshTunnelOpener, TunnelHandle, TunnelOpener, TunnelSettings};
