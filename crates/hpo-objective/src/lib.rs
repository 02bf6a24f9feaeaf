//! # hpo-objective
//!
//! The objective evaluated by every trial. Hyperparameters are resolved from
//! fixed overrides and trial suggestions, assembled into the trainer's
//! configuration tree, trained with a pruning hook attached, and scored.

mod config;
mod evaluator;
mod pruning;
mod resolver;
mod space;
mod trainer;

pub use config::{RunOptions, TrainingConfig, SEED, VAL_SPLIT};
pub use evaluator::{
    eval_score, mean_absolute_error, EvaluatorSettings, ObjectiveEvaluator, VALIDATION_METRIC,
};
pub use pruning::{PruningCallback, PRUNING_METRIC};
pub use resolver::ParameterResolver;
pub use space::{SearchEntry, SearchSpace, Section};
pub use trainer::{
    DatasetReader, EpochCallback, EpochMetrics, JsonDatasetReader, Structure, TrainedModel,
    Trainer, TrainingHistory,
};
