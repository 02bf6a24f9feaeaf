//! Per-trial parameter resolution: fixed overrides first, suggestions second.

use hpo_types::{Distribution, HpoResult, ParamMap, ParameterSpec, ParameterValue, Suggest};

/// Resolves declared hyperparameters for one trial.
///
/// A name present in the fixed overrides is used verbatim and never reaches
/// the sampler; every other name is suggested by the trial according to its
/// distribution.
#[derive(Debug, Clone, Default)]
pub struct ParameterResolver {
    fixed: ParamMap,
}

impl ParameterResolver {
    pub fn new(fixed: ParamMap) -> Self {
        Self { fixed }
    }

    pub fn fixed(&self) -> &ParamMap {
        &self.fixed
    }

    /// One-entry map `{spec.name: value}`.
    pub fn resolve<S: Suggest + ?Sized>(
        &self,
        trial: &mut S,
        spec: &ParameterSpec,
    ) -> HpoResult<ParamMap> {
        let value = match self.fixed.get(&spec.name) {
            Some(value) => *value,
            None => match spec.distribution {
                Distribution::Int {
                    low,
                    high,
                    step,
                    log,
                } => ParameterValue::Int(trial.suggest_int(&spec.name, low, high, step, log)?),
                Distribution::Float {
                    low,
                    high,
                    step,
                    log,
                } => ParameterValue::Float(trial.suggest_float(&spec.name, low, high, step, log)?),
            },
        };

        let mut resolved = ParamMap::new();
        resolved.insert(spec.name.clone(), value);
        Ok(resolved)
    }

    pub fn resolve_all<'s, S, I>(&self, trial: &mut S, specs: I) -> HpoResult<ParamMap>
    where
        S: Suggest + ?Sized,
        I: IntoIterator<Item = &'s ParameterSpec>,
    {
        let mut resolved = ParamMap::new();
        for spec in specs {
            resolved.extend(self.resolve(trial, spec)?);
        }
        Ok(resolved)
    }
}
