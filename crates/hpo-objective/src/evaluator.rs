//! Objective function: build the trial's training config, train, score.

use hpo_study::FixedTrial;
use hpo_types::{ConfigError, HpoError, HpoResult, ParamMap, TrialContext, TrialError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{RunOptions, TrainingConfig, VAL_SPLIT};
use crate::pruning::{PruningCallback, PRUNING_METRIC};
use crate::resolver::ParameterResolver;
use crate::space::SearchSpace;
use crate::trainer::{DatasetReader, Structure, Trainer};

/// Metric the trainer records on its own validation split.
pub const VALIDATION_METRIC: &str = "val_energy_mae";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorSettings {
    pub epochs: u64,
    pub verbose: bool,
    pub gpus: u32,
    pub train_file: PathBuf,
    pub valid_file: Option<PathBuf>,
    /// Parameters pinned for every trial.
    pub fixed: ParamMap,
}

impl EvaluatorSettings {
    pub fn new(train_file: impl Into<PathBuf>, epochs: u64) -> Self {
        Self {
            epochs,
            verbose: false,
            gpus: 0,
            train_file: train_file.into(),
            valid_file: None,
            fixed: ParamMap::new(),
        }
    }
}

struct ValidationSet {
    structures: Vec<Structure>,
    targets: Vec<f64>,
}

pub struct ObjectiveEvaluator {
    settings: EvaluatorSettings,
    space: SearchSpace,
    resolver: ParameterResolver,
    trainer: Arc<dyn Trainer>,
    validation: Option<ValidationSet>,
}

impl std::fmt::Debug for ObjectiveEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectiveEvaluator")
            .field("settings", &self.settings)
            .field("space", &self.space.names())
            .field(
                "validation_structures",
                &self.validation.as_ref().map(|v| v.targets.len()),
            )
            .finish()
    }
}

/// Keep trial errors, turn anything else the trainer raised into a training
/// failure of this trial.
fn as_trial_error(err: HpoError) -> HpoError {
    if err.is_trial_scoped() {
        err
    } else {
        TrialError::Training {
            message: err.to_string(),
        }
        .into()
    }
}

pub fn mean_absolute_error(predicted: &[f64], expected: &[f64]) -> Result<f64, TrialError> {
    if predicted.len() != expected.len() || expected.is_empty() {
        return Err(TrialError::PredictionMismatch {
            predicted: predicted.len(),
            expected: expected.len(),
        });
    }
    let total: f64 = predicted
        .iter()
        .zip(expected)
        .map(|(p, e)| (p - e).abs())
        .sum();
    Ok(total / expected.len() as f64)
}

impl ObjectiveEvaluator {
    /// Validation targets are read here, once, and reused by every trial.
    pub fn new(
        settings: EvaluatorSettings,
        trainer: Arc<dyn Trainer>,
        reader: &dyn DatasetReader,
    ) -> HpoResult<Self> {
        let validation = match &settings.valid_file {
            Some(path) => {
                info!(path = %path.display(), "loading validation data labels");
                let structures = reader.read(path)?;
                if structures.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        key: "valid_file".into(),
                        message: format!("{} holds no structures", path.display()),
                    }
                    .into());
                }
                let targets = structures.iter().map(|s| s.energy).collect();
                Some(ValidationSet {
                    structures,
                    targets,
                })
            }
            None => None,
        };

        Ok(Self {
            resolver: ParameterResolver::new(settings.fixed.clone()),
            space: SearchSpace::default(),
            settings,
            trainer,
            validation,
        })
    }

    pub fn with_space(mut self, space: SearchSpace) -> Self {
        self.space = space;
        self
    }

    pub fn settings(&self) -> &EvaluatorSettings {
        &self.settings
    }

    fn run_options(&self) -> RunOptions {
        RunOptions {
            epochs: self.settings.epochs,
            verbose: self.settings.verbose,
            gpus: self.settings.gpus,
            train_file: self.settings.train_file.clone(),
            val_split: self.validation.is_none().then_some(VAL_SPLIT),
        }
    }

    /// Train once with the trial's parameters and return its score; lower is
    /// better.
    pub fn evaluate(&self, trial: &mut dyn TrialContext) -> HpoResult<f64> {
        let number = trial.number();
        let params = self.resolver.resolve_all(trial, self.space.specs())?;
        let identifier = Uuid::new_v4();
        let config = TrainingConfig::build(&self.space, &params, &self.run_options(), identifier);
        info!(trial = number, run = %identifier, ?params, "training");

        let (trained, failure) = {
            let mut callback = PruningCallback::new(&mut *trial, PRUNING_METRIC);
            let trained = self.trainer.train(&config, &mut callback);
            (trained, callback.into_failure())
        };
        if let Some(err) = failure {
            return Err(err);
        }
        let model = trained.map_err(as_trial_error)?;

        let score = match &self.validation {
            Some(validation) => {
                debug!(trial = number, "predicting on validation data");
                let predicted = model
                    .predict_energies(&validation.structures)
                    .map_err(as_trial_error)?;
                mean_absolute_error(&predicted, &validation.targets)?
            }
            None => model
                .history()
                .last(VALIDATION_METRIC)
                .ok_or_else(|| TrialError::MissingMetric {
                    metric: VALIDATION_METRIC.to_string(),
                })?,
        };

        info!(trial = number, score, "trial scored");
        Ok(score)
    }
}

/// Score one known configuration outside of any study.
pub fn eval_score(
    settings: EvaluatorSettings,
    params: ParamMap,
    trainer: Arc<dyn Trainer>,
    reader: &dyn DatasetReader,
) -> HpoResult<f64> {
    let evaluator = ObjectiveEvaluator::new(settings, trainer, reader)?;
    evaluator.evaluate(&mut FixedTrial::new(params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainer::{EpochCallback, EpochMetrics, TrainedModel, TrainingHistory};
    use hpo_study::StudyStore;
    use hpo_types::ParameterValue;
    use parking_lot::Mutex;
    use std::path::Path;

    /// Records configs, replays a fixed metric curve through the callback and
    /// predicts `energy + offset`.
    struct FakeTrainer {
        curve: Vec<f64>,
        val_mae: f64,
        offset: f64,
        fail: bool,
        configs: Mutex<Vec<TrainingConfig>>,
    }

    impl FakeTrainer {
        fn new(curve: Vec<f64>) -> Self {
            Self {
                curve,
                val_mae: 0.42,
                offset: 0.5,
                fail: false,
                configs: Mutex::new(Vec::new()),
            }
        }
    }

    struct FakeModel {
        history: TrainingHistory,
        offset: f64,
    }

    impl TrainedModel for FakeModel {
        fn history(&self) -> &TrainingHistory {
            &self.history
        }

        fn predict_energies(&self, structures: &[Structure]) -> HpoResult<Vec<f64>> {
            Ok(structures.iter().map(|s| s.energy + self.offset).collect())
        }
    }

    impl Trainer for FakeTrainer {
        fn train(
            &self,
            config: &TrainingConfig,
            callback: &mut dyn EpochCallback,
        ) -> HpoResult<Box<dyn TrainedModel>> {
            self.configs.lock().push(config.clone());
            if self.fail {
                return Err(HpoError::Internal("CUDA out of memory".into()));
            }
            let mut history = TrainingHistory::new();
            for (epoch, value) in self.curve.iter().enumerate() {
                let metrics = EpochMetrics::from([
                    (PRUNING_METRIC.to_string(), *value),
                    (VALIDATION_METRIC.to_string(), self.val_mae),
                ]);
                callback.on_epoch_end(epoch as u64, &metrics)?;
                history.push(metrics);
            }
            Ok(Box::new(FakeModel {
                history,
                offset: self.offset,
            }))
        }
    }

    struct StaticReader(Vec<f64>);

    impl DatasetReader for StaticReader {
        fn read(&self, _path: &Path) -> HpoResult<Vec<Structure>> {
            Ok(self
                .0
                .iter()
                .map(|energy| Structure {
                    energy: *energy,
                    data: serde_json::Value::Null,
                })
                .collect())
        }
    }

    fn full_params() -> ParamMap {
        [
            ("num_layers", ParameterValue::Int(4)),
            ("num_nodes", ParameterValue::Int(8)),
            ("batchnorm", ParameterValue::Int(0)),
            ("dropout_rate", ParameterValue::Float(0.1)),
            ("lr", ParameterValue::Float(1e-3)),
            ("step_size", ParameterValue::Int(6)),
            ("gamma", ParameterValue::Float(0.01)),
            ("batch_size", ParameterValue::Int(200)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    #[test]
    fn scores_with_validation_file_by_mae() {
        let trainer = Arc::new(FakeTrainer::new(vec![1.0, 0.8]));
        let mut settings = EvaluatorSettings::new("train.lmdb", 2);
        settings.valid_file = Some(PathBuf::from("valid.traj"));

        let score = eval_score(
            settings,
            full_params(),
            trainer.clone(),
            &StaticReader(vec![-1.0, -2.0, -3.0]),
        )
        .unwrap();
        assert!((score - 0.5).abs() < 1e-12, "MAE, not the history metric");

        let config = &trainer.configs.lock()[0];
        assert!(config.get("dataset.val_split").is_none());
    }

    #[test]
    fn scores_without_validation_file_from_history() {
        let trainer = Arc::new(FakeTrainer::new(vec![1.0, 0.8]));
        let score = eval_score(
            EvaluatorSettings::new("train.lmdb", 2),
            full_params(),
            trainer.clone(),
            &StaticReader(vec![]),
        )
        .unwrap();
        assert_eq!(score, 0.42);

        let config = &trainer.configs.lock()[0];
        assert_eq!(config.get("dataset.val_split"), Some(&serde_json::json!(0.1)));
    }

    #[test]
    fn validation_targets_are_loaded_once() {
        struct CountingReader(Mutex<usize>);
        impl DatasetReader for CountingReader {
            fn read(&self, _path: &Path) -> HpoResult<Vec<Structure>> {
                *self.0.lock() += 1;
                Ok(vec![Structure {
                    energy: 1.0,
                    data: serde_json::Value::Null,
                }])
            }
        }

        let reader = CountingReader(Mutex::new(0));
        let mut settings = EvaluatorSettings::new("train.lmdb", 1);
        settings.valid_file = Some(PathBuf::from("valid.traj"));
        let evaluator =
            ObjectiveEvaluator::new(settings, Arc::new(FakeTrainer::new(vec![1.0])), &reader).unwrap();

        for _ in 0..3 {
            evaluator
                .evaluate(&mut FixedTrial::new(full_params()))
                .unwrap();
        }
        assert_eq!(*reader.0.lock(), 1);
    }

    #[test]
    fn fixed_overrides_reach_the_config() {
        let trainer = Arc::new(FakeTrainer::new(vec![1.0]));
        let mut settings = EvaluatorSettings::new("train.lmdb", 1);
        settings
            .fixed
            .insert("num_layers".into(), ParameterValue::Int(8));

        let mut params = full_params();
        params.insert("num_nodes".into(), ParameterValue::Int(10));
        params.remove("num_layers");

        eval_score(settings, params, trainer.clone(), &StaticReader(vec![])).unwrap();
        let config = &trainer.configs.lock()[0];
        assert_eq!(config.get("model.num_layers"), Some(&serde_json::json!(8)));
        assert_eq!(config.get("model.num_nodes"), Some(&serde_json::json!(10)));
    }

    #[test]
    fn trainer_failure_becomes_trial_failure() {
        let mut trainer = FakeTrainer::new(vec![1.0]);
        trainer.fail = true;
        let err = eval_score(
            EvaluatorSettings::new("train.lmdb", 1),
            full_params(),
            Arc::new(trainer),
            &StaticReader(vec![]),
        )
        .unwrap_err();
        assert!(err.is_trial_scoped());
        assert!(err.to_string().contains("CUDA out of memory"));
    }

    /// Suggests the lower bound and loses its storage on the first report.
    struct DisconnectedTrial;

    impl hpo_types::Suggest for DisconnectedTrial {
        fn suggest_int(&mut self, _: &str, low: i64, _: i64, _: i64, _: bool) -> HpoResult<i64> {
            Ok(low)
        }
        fn suggest_float(&mut self, _: &str, low: f64, _: f64, _: Option<f64>, _: bool) -> HpoResult<f64> {
            Ok(low)
        }
    }

    impl TrialContext for DisconnectedTrial {
        fn number(&self) -> u64 {
            0
        }
        fn report(&mut self, _: u64, _: f64) -> HpoResult<()> {
            Err(hpo_types::StudyError::Storage {
                message: "server has gone away".into(),
            }
            .into())
        }
        fn should_prune(&self) -> HpoResult<bool> {
            Ok(false)
        }
    }

    #[test]
    fn lost_storage_during_training_is_not_a_trial_failure() {
        let evaluator = ObjectiveEvaluator::new(
            EvaluatorSettings::new("train.lmdb", 2),
            Arc::new(FakeTrainer::new(vec![1.0, 0.8])),
            &StaticReader(vec![]),
        )
        .unwrap();

        let err = evaluator.evaluate(&mut DisconnectedTrial).unwrap_err();

        assert!(!err.is_trial_scoped());
        assert!(matches!(
            err,
            HpoError::Study(hpo_types::StudyError::Storage { .. })
        ));
    }

    #[test]
    fn study_loop_continues_past_failed_and_pruned_trials() {
        let store = StudyStore::in_memory().with_seed(12);
        let study = store.create_or_load("eval", "Random", "None").unwrap();

        let good = ObjectiveEvaluator::new(
            EvaluatorSettings::new("train.lmdb", 3),
            Arc::new(FakeTrainer::new(vec![1.0, 0.9, 0.8])),
            &StaticReader(vec![]),
        )
        .unwrap();
        let mut broken_trainer = FakeTrainer::new(vec![1.0]);
        broken_trainer.fail = true;
        let broken = ObjectiveEvaluator::new(
            EvaluatorSettings::new("train.lmdb", 3),
            Arc::new(broken_trainer),
            &StaticReader(vec![]),
        )
        .unwrap();

        let report = study
            .optimize(4, |trial| {
                if trial.number() % 2 == 0 {
                    broken.evaluate(trial)
                } else {
                    good.evaluate(trial)
                }
            })
            .unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(report.complete, 2);

        let best = study.best_trial().unwrap().unwrap();
        assert_eq!(best.value, Some(0.42));
        assert!(best.params.contains_key("num_nodes"));
        assert_eq!(best.intermediate_values.len(), 3);
    }

    #[test]
    fn mae_rejects_mismatched_lengths() {
        assert!(mean_absolute_error(&[1.0], &[1.0, 2.0]).is_err());
        assert_eq!(mean_absolute_error(&[1.0, 3.0], &[2.0, 2.0]).unwrap(), 1.0);
    }
}
