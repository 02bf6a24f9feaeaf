//! Trial records, the live trial handle and fixed trials.

use chrono::{DateTime, Utc};
use hpo_types::{
    Distribution, HpoResult, ParamMap, ParameterValue, Suggest, TrialContext, TrialError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

use crate::study::Study;

/// Unique study identifier.
pub type StudyId = Uuid;

/// Unique trial identifier. Never reused across processes.
pub type TrialId = Uuid;

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

impl Default for ObjectiveDirection {
    fn default() -> Self {
        Self::Minimize
    }
}

impl ObjectiveDirection {
    /// Orient a value so that lower is always better.
    pub fn loss(&self, value: f64) -> f64 {
        match self {
            Self::Minimize => value,
            Self::Maximize => -value,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minimize => "minimize",
            Self::Maximize => "maximize",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "minimize" => Some(Self::Minimize),
            "maximize" => Some(Self::Maximize),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialState {
    Running,
    Complete,
    Pruned,
    Failed,
}

impl TrialState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Pruned => "pruned",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "complete" => Some(Self::Complete),
            "pruned" => Some(Self::Pruned),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TrialState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a trial as stored in the shared backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenTrial {
    pub id: TrialId,
    pub study_id: StudyId,
    pub number: u64,
    pub state: TrialState,
    pub params: ParamMap,
    pub distributions: BTreeMap<String, Distribution>,
    pub intermediate_values: BTreeMap<u64, f64>,
    pub value: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl FrozenTrial {
    pub fn new(study_id: StudyId, number: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            study_id,
            number,
            state: TrialState::Running,
            params: ParamMap::new(),
            distributions: BTreeMap::new(),
            intermediate_values: BTreeMap::new(),
            value: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Latest reported step and its value.
    pub fn last_intermediate(&self) -> Option<(u64, f64)> {
        self.intermediate_values
            .iter()
            .next_back()
            .map(|(step, value)| (*step, *value))
    }

    /// Most recent value reported at or before `step`.
    pub fn value_at_or_before(&self, step: u64) -> Option<f64> {
        self.intermediate_values
            .range(..=step)
            .next_back()
            .map(|(_, value)| *value)
    }

    pub fn duration_seconds(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_seconds())
    }
}

// ---------------------------------------------------------------------------
// Live trial
// ---------------------------------------------------------------------------

/// A running trial handed to the objective by [`Study::optimize`].
///
/// Suggestions and intermediate reports go straight to the study's storage so
/// other worker processes see them.
pub struct Trial<'a> {
    study: &'a Study,
    frozen: FrozenTrial,
}

impl<'a> Trial<'a> {
    pub(crate) fn new(study: &'a Study, frozen: FrozenTrial) -> Self {
        Self { study, frozen }
    }

    pub fn id(&self) -> TrialId {
        self.frozen.id
    }

    pub fn params(&self) -> &ParamMap {
        &self.frozen.params
    }

    pub fn snapshot(&self) -> &FrozenTrial {
        &self.frozen
    }

    fn suggest(&mut self, name: &str, distribution: Distribution) -> HpoResult<ParameterValue> {
        let distribution = distribution.normalized(name)?;

        if let Some(existing) = self.frozen.distributions.get(name) {
            if *existing != distribution {
                return Err(TrialError::DistributionChanged {
                    name: name.to_string(),
                }
                .into());
            }
            if let Some(value) = self.frozen.params.get(name) {
                return Ok(*value);
            }
        }

        let history = self.study.other_trials(self.frozen.id)?;
        let value = self
            .study
            .sample(&history, &self.frozen, name, &distribution)?;

        self.study
            .storage()
            .set_trial_param(self.frozen.id, name, &distribution, value)?;
        debug!(trial = self.frozen.number, param = name, %value, "suggested");

        self.frozen.params.insert(name.to_string(), value);
        self.frozen
            .distributions
            .insert(name.to_string(), distribution);
        Ok(value)
    }
}

impl Suggest for Trial<'_> {
    fn suggest_int(
        &mut self,
        name: &str,
        low: i64,
        high: i64,
        step: i64,
        log: bool,
    ) -> HpoResult<i64> {
        let value = self.suggest(
            name,
            Distribution::Int {
                low,
                high,
                step,
                log,
            },
        )?;
        value.as_i64().ok_or_else(|| {
            TrialError::DistributionChanged {
                name: name.to_string(),
            }
            .into()
        })
    }

    fn suggest_float(
        &mut self,
        name: &str,
        low: f64,
        high: f64,
        step: Option<f64>,
        log: bool,
    ) -> HpoResult<f64> {
        let value = self.suggest(
            name,
            Distribution::Float {
                low,
                high,
                step,
                log,
            },
        )?;
        Ok(value.as_f64())
    }
}

impl TrialContext for Trial<'_> {
    fn number(&self) -> u64 {
        self.frozen.number
    }

    fn report(&mut self, step: u64, value: f64) -> HpoResult<()> {
        if self.frozen.intermediate_values.contains_key(&step) {
            debug!(trial = self.frozen.number, step, "step already reported, ignoring");
            return Ok(());
        }
        self.study
            .storage()
            .set_intermediate_value(self.frozen.id, step, value)?;
        self.frozen.intermediate_values.insert(step, value);
        Ok(())
    }

    fn should_prune(&self) -> HpoResult<bool> {
        let history = self.study.other_trials(self.frozen.id)?;
        Ok(self.study.prune(&history, &self.frozen))
    }
}

// ---------------------------------------------------------------------------
// Fixed trial
// ---------------------------------------------------------------------------

/// A trial whose parameters are all given up front. Used to re-evaluate a
/// known configuration outside of any study; it never prunes.
#[derive(Debug, Clone, Default)]
pub struct FixedTrial {
    params: ParamMap,
    intermediate_values: BTreeMap<u64, f64>,
    number: u64,
}

impl FixedTrial {
    pub fn new(params: ParamMap) -> Self {
        Self {
            params,
            intermediate_values: BTreeMap::new(),
            number: 0,
        }
    }

    pub fn intermediate_values(&self) -> &BTreeMap<u64, f64> {
        &self.intermediate_values
    }

    fn fixed(&self, name: &str) -> HpoResult<ParameterValue> {
        self.params.get(name).copied().ok_or_else(|| {
            TrialError::MissingFixedParameter {
                name: name.to_string(),
            }
            .into()
        })
    }
}

impl Suggest for FixedTrial {
    fn suggest_int(&mut self, name: &str, _: i64, _: i64, _: i64, _: bool) -> HpoResult<i64> {
        let value = self.fixed(name)?;
        match value {
            ParameterValue::Int(v) => Ok(v),
            ParameterValue::Float(v) if v.fract() == 0.0 => Ok(v as i64),
            ParameterValue::Float(v) => Err(TrialError::UnsupportedParameterKind {
                name: name.to_string(),
                found: format!("float {v}"),
            }
            .into()),
        }
    }

    fn suggest_float(
        &mut self,
        name: &str,
        _: f64,
        _: f64,
        _: Option<f64>,
        _: bool,
    ) -> HpoResult<f64> {
        Ok(self.fixed(name)?.as_f64())
    }
}

impl TrialContext for FixedTrial {
    fn number(&self) -> u64 {
        self.number
    }

    fn report(&mut self, step: u64, value: f64) -> HpoResult<()> {
        self.intermediate_values.entry(step).or_insert(value);
        Ok(())
    }

    fn should_prune(&self) -> HpoResult<bool> {
        Ok(false)
    }
}
