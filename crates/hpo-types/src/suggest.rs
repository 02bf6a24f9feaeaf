//! Capabilities a trial exposes to objective code.

use crate::errors::HpoResult;

/// Parameter suggestion, scoped to one trial. Implementations record the
/// suggestion against the trial themselves.
pub trait Suggest {
    fn suggest_int(
        &mut self,
        name: &str,
        low: i64,
        high: i64,
        step: i64,
        log: bool,
    ) -> HpoResult<i64>;

    fn suggest_float(
        &mut self,
        name: &str,
        low: f64,
        high: f64,
        step: Option<f64>,
        log: bool,
    ) -> HpoResult<f64>;
}

/// Everything the objective and its pruning hook need from a trial.
pub trait TrialContext: Suggest {
    /// Sequential number of the trial within its study.
    fn number(&self) -> u64;

    /// Record an intermediate objective value for `step`.
    fn report(&mut self, step: u64, value: f64) -> HpoResult<()>;

    /// Ask the study's pruner whether the trial should stop now.
    fn should_prune(&self) -> HpoResult<bool>;
}
