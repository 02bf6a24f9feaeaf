//! Pruners deciding whether a running trial should stop early.

use crate::trial::{FrozenTrial, ObjectiveDirection, TrialState};

/// What a pruner sees when the trial reports a new intermediate value.
#[derive(Debug, Clone, Copy)]
pub struct PruningContext<'a> {
    /// Every other trial of the study.
    pub history: &'a [FrozenTrial],
    pub trial: &'a FrozenTrial,
    pub direction: ObjectiveDirection,
}

pub trait Pruner: Send + Sync {
    /// True when the trial should be stopped at its latest reported step.
    fn prune(&self, ctx: &PruningContext<'_>) -> bool;

    fn name(&self) -> &str;
}

/// Never prunes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopPruner;

impl Pruner for NopPruner {
    fn prune(&self, _ctx: &PruningContext<'_>) -> bool {
        false
    }

    fn name(&self) -> &str {
        "None"
    }
}

/// Prunes a trial whose latest intermediate value is worse than the median
/// of completed trials at the same step.
#[derive(Debug, Clone)]
pub struct MedianPruner {
    pub n_startup_trials: usize,
    pub n_warmup_steps: u64,
    pub interval_steps: u64,
}

impl MedianPruner {
    pub fn new(n_startup_trials: usize, n_warmup_steps: u64) -> Self {
        Self {
            n_startup_trials,
            n_warmup_steps,
            interval_steps: 1,
        }
    }
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

impl Pruner for MedianPruner {
    fn prune(&self, ctx: &PruningContext<'_>) -> bool {
        let Some((step, value)) = ctx.trial.last_intermediate() else {
            return false;
        };
        if step < self.n_warmup_steps {
            return false;
        }
        if (step - self.n_warmup_steps) % self.interval_steps.max(1) != 0 {
            return false;
        }

        let completed: Vec<&FrozenTrial> = ctx
            .history
            .iter()
            .filter(|t| t.state == TrialState::Complete)
            .collect();
        if completed.len() < self.n_startup_trials {
            return false;
        }
        if value.is_nan() {
            return true;
        }

        let mut at_step: Vec<f64> = completed
            .iter()
            .filter_map(|t| t.intermediate_values.get(&step).copied())
            .filter(|v| !v.is_nan())
            .map(|v| ctx.direction.loss(v))
            .collect();

        match median(&mut at_step) {
            Some(m) => ctx.direction.loss(value) > m,
            None => false,
        }
    }

    fn name(&self) -> &str {
        "Median"
    }
}

/// Hyperband over successive-halving brackets.
///
/// A trial is assigned to bracket `number % n_brackets`. Within bracket `b`
/// rungs sit at `min_resource * reduction_factor^(b + k)` steps, and a trial
/// survives a rung only if it ranks in the top `1 / reduction_factor` of the
/// bracket's trials at that rung.
#[derive(Debug, Clone)]
pub struct HyperbandPruner {
    pub min_resource: u64,
    pub max_resource: u64,
    pub reduction_factor: u64,
}

impl Default for HyperbandPruner {
    fn default() -> Self {
        Self {
            min_resource: 1,
            max_resource: 100,
            reduction_factor: 3,
        }
    }
}

impl HyperbandPruner {
    pub fn n_brackets(&self) -> u64 {
        let eta = self.reduction_factor.max(2) as f64;
        let ratio = (self.max_resource.max(1) as f64) / (self.min_resource.max(1) as f64);
        (ratio.ln() / eta.ln()).floor() as u64 + 1
    }

    fn bracket_of(&self, trial: &FrozenTrial) -> u64 {
        trial.number % self.n_brackets()
    }

    /// Highest rung resource of `bracket` reached at `step`.
    fn rung_at(&self, bracket: u64, step: u64) -> Option<u64> {
        let eta = self.reduction_factor.max(2);
        let mut resource = self
            .min_resource
            .max(1)
            .checked_mul(eta.checked_pow(bracket as u32)?)?;
        let mut reached = None;
        while resource <= step && resource < self.max_resource {
            reached = Some(resource);
            resource = resource.checked_mul(eta)?;
        }
        reached
    }
}

impl Pruner for HyperbandPruner {
    fn prune(&self, ctx: &PruningContext<'_>) -> bool {
        let Some((step, _)) = ctx.trial.last_intermediate() else {
            return false;
        };
        let bracket = self.bracket_of(ctx.trial);
        let Some(rung) = self.rung_at(bracket, step) else {
            return false;
        };
        let Some(own) = ctx.trial.value_at_or_before(rung) else {
            return false;
        };
        if own.is_nan() {
            return true;
        }

        let mut competitors: Vec<f64> = ctx
            .history
            .iter()
            .filter(|t| self.bracket_of(t) == bracket)
            .filter(|t| t.last_intermediate().map_or(false, |(s, _)| s >= rung))
            .filter_map(|t| t.value_at_or_before(rung))
            .filter(|v| !v.is_nan())
            .map(|v| ctx.direction.loss(v))
            .collect();
        let own = ctx.direction.loss(own);
        competitors.push(own);
        competitors.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let eta = self.reduction_factor.max(2) as usize;
        let promotable = (competitors.len() / eta).saturating_sub(1);
        own > competitors[promotable]
    }

    fn name(&self) -> &str {
        "Hyperband"
    }
}
