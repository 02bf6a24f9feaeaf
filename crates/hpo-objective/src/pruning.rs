//! Epoch hook reporting a training metric to the trial and stopping
//! unpromising trials.

use hpo_types::{HpoError, HpoResult, TrialContext, TrialError};
use tracing::debug;

use crate::trainer::{EpochCallback, EpochMetrics};

/// Metric reported to the pruner after every epoch.
pub const PRUNING_METRIC: &str = "train_energy_mae";

/// Errors from the trial itself (storage, pruner) are kept aside so they
/// survive however the trainer wraps the error it gets back; see
/// [`PruningCallback::into_failure`].
pub struct PruningCallback<'t> {
    trial: &'t mut dyn TrialContext,
    metric: String,
    failure: Option<HpoError>,
}

impl<'t> PruningCallback<'t> {
    pub fn new(trial: &'t mut dyn TrialContext, metric: impl Into<String>) -> Self {
        Self {
            trial,
            metric: metric.into(),
            failure: None,
        }
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// Error raised by the trial while reporting, if any. It takes precedence
    /// over whatever the trainer returned.
    pub fn into_failure(self) -> Option<HpoError> {
        self.failure
    }

    fn keep(&mut self, err: HpoError) -> HpoError {
        if err.is_trial_scoped() {
            return err;
        }
        let message = format!("trial bookkeeping failed: {err}");
        self.failure = Some(err);
        HpoError::Internal(message)
    }
}

impl EpochCallback for PruningCallback<'_> {
    fn on_epoch_end(&mut self, epoch: u64, metrics: &EpochMetrics) -> HpoResult<()> {
        let value = metrics
            .get(&self.metric)
            .copied()
            .ok_or_else(|| TrialError::MissingMetric {
                metric: self.metric.clone(),
            })?;

        if let Err(err) = self.trial.report(epoch, value) {
            return Err(self.keep(err));
        }
        let prune = match self.trial.should_prune() {
            Ok(prune) => prune,
            Err(err) => return Err(self.keep(err)),
        };
        if prune {
            debug!(trial = self.trial.number(), epoch, value, "pruning trial");
            return Err(TrialError::Pruned { step: epoch }.into());
        }
        Ok(())
    }
}
