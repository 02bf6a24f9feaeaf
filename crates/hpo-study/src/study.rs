//! Study handle and the sequential optimization loop.

use hpo_types::{Distribution, HpoResult, ParamMap, ParameterValue};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::pruner::{Pruner, PruningContext};
use crate::registry::{PrunerConfig, SamplerConfig};
use crate::sampler::{Sampler, SamplingContext};
use crate::storage::{StudyRecord, StudyStorage};
use crate::trial::{FrozenTrial, ObjectiveDirection, StudyId, Trial, TrialId, TrialState};

/// A named study bound to a storage backend, a sampler and a pruner.
pub struct Study {
    record: StudyRecord,
    storage: Arc<dyn StudyStorage>,
    sampler_config: SamplerConfig,
    pruner_config: PrunerConfig,
    sampler: Arc<dyn Sampler>,
    pruner: Arc<dyn Pruner>,
}

impl std::fmt::Debug for Study {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Study")
            .field("record", &self.record)
            .field("sampler", &self.sampler_config.name())
            .field("pruner", &self.pruner_config.name())
            .finish()
    }
}

impl Study {
    pub fn new(
        record: StudyRecord,
        storage: Arc<dyn StudyStorage>,
        sampler_config: SamplerConfig,
        pruner_config: PrunerConfig,
        seed: Option<u64>,
    ) -> Self {
        let sampler = sampler_config.build(seed);
        let pruner = pruner_config.build();
        Self {
            record,
            storage,
            sampler_config,
            pruner_config,
            sampler,
            pruner,
        }
    }

    pub fn id(&self) -> StudyId {
        self.record.id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn direction(&self) -> ObjectiveDirection {
        self.record.direction
    }

    pub fn sampler_config(&self) -> &SamplerConfig {
        &self.sampler_config
    }

    pub fn pruner_config(&self) -> &PrunerConfig {
        &self.pruner_config
    }

    pub(crate) fn storage(&self) -> &dyn StudyStorage {
        self.storage.as_ref()
    }

    pub fn trials(&self) -> HpoResult<Vec<FrozenTrial>> {
        self.storage.get_all_trials(self.record.id)
    }

    pub(crate) fn other_trials(&self, trial_id: TrialId) -> HpoResult<Vec<FrozenTrial>> {
        let mut trials = self.trials()?;
        trials.retain(|t| t.id != trial_id);
        Ok(trials)
    }

    pub(crate) fn sample(
        &self,
        history: &[FrozenTrial],
        trial: &FrozenTrial,
        name: &str,
        distribution: &Distribution,
    ) -> HpoResult<ParameterValue> {
        let ctx = SamplingContext {
            history,
            trial,
            direction: self.record.direction,
        };
        self.sampler.sample(&ctx, name, distribution)
    }

    pub(crate) fn prune(&self, history: &[FrozenTrial], trial: &FrozenTrial) -> bool {
        let ctx = PruningContext {
            history,
            trial,
            direction: self.record.direction,
        };
        self.pruner.prune(&ctx)
    }

    /// Best completed trial, if any trial has completed.
    pub fn best_trial(&self) -> HpoResult<Option<FrozenTrial>> {
        Ok(best_of(self.record.direction, &self.trials()?).cloned())
    }

    /// Start a new trial.
    pub fn ask(&self) -> HpoResult<Trial<'_>> {
        let frozen = self.storage.create_trial(self.record.id)?;
        Ok(Trial::new(self, frozen))
    }

    /// Record the outcome of an objective evaluation on its trial.
    ///
    /// Trial-scoped errors are recorded (pruned or failed) and swallowed;
    /// any other error is recorded as a failure and returned.
    pub fn tell(&self, trial: Trial<'_>, outcome: HpoResult<f64>) -> HpoResult<FrozenTrial> {
        let number = trial.snapshot().number;
        let id = trial.id();

        match outcome {
            Ok(value) if value.is_finite() => {
                let done = self
                    .storage
                    .finish_trial(id, TrialState::Complete, Some(value))?;
                info!(study = %self.name(), trial = number, value, params = ?done.params, "trial complete");
                Ok(done)
            }
            Ok(value) => {
                warn!(study = %self.name(), trial = number, value, "objective returned a non-finite value");
                self.storage.finish_trial(id, TrialState::Failed, None)
            }
            Err(e) if e.is_pruned() => {
                let last = trial.snapshot().last_intermediate().map(|(_, v)| v);
                info!(study = %self.name(), trial = number, "trial pruned: {e}");
                self.storage.finish_trial(id, TrialState::Pruned, last)
            }
            Err(e) if e.is_trial_scoped() => {
                warn!(study = %self.name(), trial = number, "trial failed: {e}");
                self.storage.finish_trial(id, TrialState::Failed, None)
            }
            Err(e) => {
                if let Err(record_err) = self.storage.finish_trial(id, TrialState::Failed, None) {
                    warn!(trial = number, "could not record failure: {record_err}");
                }
                Err(e)
            }
        }
    }

    /// Run `n_trials` sequential trials of `objective`.
    ///
    /// Other workers may run the same study at the same time; the shared
    /// storage keeps their trials apart.
    pub fn optimize<F>(&self, n_trials: usize, mut objective: F) -> HpoResult<OptimizeReport>
    where
        F: FnMut(&mut Trial<'_>) -> HpoResult<f64>,
    {
        info!(
            study = %self.name(),
            n_trials,
            sampler = self.sampler_config.name(),
            pruner = self.pruner_config.name(),
            "starting optimization"
        );

        let mut report = OptimizeReport::default();
        for _ in 0..n_trials {
            let mut trial = self.ask()?;
            let outcome = objective(&mut trial);
            let done = self.tell(trial, outcome)?;
            report.record(&done);
        }

        info!(
            study = %self.name(),
            complete = report.complete,
            pruned = report.pruned,
            failed = report.failed,
            "optimization finished"
        );
        Ok(report)
    }

    pub fn summary(&self) -> HpoResult<StudySummary> {
        Ok(StudySummary::from_trials(
            self.name(),
            self.record.direction,
            &self.trials()?,
        ))
    }
}

fn best_of(direction: ObjectiveDirection, trials: &[FrozenTrial]) -> Option<&FrozenTrial> {
    trials
        .iter()
        .filter(|t| t.state == TrialState::Complete)
        .filter_map(|t| t.value.map(|v| (t, direction.loss(v))))
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(t, _)| t)
}

/// Counts of trial outcomes from one `optimize` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizeReport {
    pub complete: usize,
    pub pruned: usize,
    pub failed: usize,
}

impl OptimizeReport {
    fn record(&mut self, trial: &FrozenTrial) {
        match trial.state {
            TrialState::Complete => self.complete += 1,
            TrialState::Pruned => self.pruned += 1,
            TrialState::Failed => self.failed += 1,
            TrialState::Running => {}
        }
    }
}

/// Best trial of a study as shown in summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestTrial {
    pub number: u64,
    pub params: ParamMap,
    pub value: f64,
}

/// Aggregate view of one study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudySummary {
    pub name: String,
    pub direction: ObjectiveDirection,
    pub best_trial: Option<BestTrial>,
    pub n_trials: usize,
    pub n_complete: usize,
    pub n_pruned: usize,
    pub n_failed: usize,
}

impl StudySummary {
    pub fn from_trials(name: &str, direction: ObjectiveDirection, trials: &[FrozenTrial]) -> Self {
        let count = |state| trials.iter().filter(|t| t.state == state).count();
        let best_trial = best_of(direction, trials).and_then(|t| {
            Some(BestTrial {
                number: t.number,
                params: t.params.clone(),
                value: t.value?,
            })
        });

        Self {
            name: name.to_string(),
            direction,
            best_trial,
            n_trials: trials.len(),
            n_complete: count(TrialState::Complete),
            n_pruned: count(TrialState::Pruned),
            n_failed: count(TrialState::Failed),
        }
    }
}

impl std::fmt::Display for StudySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Study {}:", self.name)?;
        match &self.best_trial {
            Some(best) => {
                writeln!(f, "  Params:")?;
                for (name, value) in &best.params {
                    writeln!(f, "    - {name}: {value}")?;
                }
                writeln!(f, "  Best score: {}", best.value)?;
            }
            None => writeln!(f, "  Best score: no successful trials yet")?,
        }
        write!(
            f,
            "  Num trials: {} ({} complete, {} pruned, {} failed)",
            self.n_trials, self.n_complete, self.n_pruned, self.n_failed
        )
    }
}
