//! Samplers choosing the next value of a parameter from the study history.

use hpo_types::{Distribution, HpoResult, ParameterValue, TrialError};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

use crate::trial::{FrozenTrial, ObjectiveDirection, TrialState};

/// What a sampler sees when asked for one parameter value.
#[derive(Debug, Clone, Copy)]
pub struct SamplingContext<'a> {
    /// Every other trial of the study, in any state.
    pub history: &'a [FrozenTrial],
    /// The trial being sampled, with the parameters chosen so far.
    pub trial: &'a FrozenTrial,
    pub direction: ObjectiveDirection,
}

impl SamplingContext<'_> {
    /// Completed observations of `name` drawn from `distribution`, as
    /// `(unit position, loss)` with lower loss better.
    pub fn observations(&self, name: &str, distribution: &Distribution) -> Vec<(f64, f64)> {
        self.history
            .iter()
            .filter(|t| t.state == TrialState::Complete)
            .filter_map(|t| {
                let value = t.value.filter(|v| v.is_finite())?;
                let param = t.params.get(name)?;
                distribution.contains(param).then(|| {
                    (
                        distribution.to_unit(param),
                        self.direction.loss(value),
                    )
                })
            })
            .collect()
    }
}

/// Common trait for all samplers.
pub trait Sampler: Send + Sync {
    fn sample(
        &self,
        ctx: &SamplingContext<'_>,
        name: &str,
        distribution: &Distribution,
    ) -> HpoResult<ParameterValue>;

    /// Name the sampler is registered under.
    fn name(&self) -> &str;
}

fn seeded(seed: Option<u64>) -> Mutex<StdRng> {
    let seed = seed.unwrap_or_else(rand::random);
    Mutex::new(StdRng::seed_from_u64(seed))
}

/// Uniform draw over the distribution (log-uniform when log scaled).
fn uniform(rng: &mut StdRng, distribution: &Distribution) -> ParameterValue {
    match *distribution {
        Distribution::Int {
            low,
            high,
            step,
            log: false,
        } => {
            let slots = (high - low) / step;
            ParameterValue::Int(low + rng.random_range(0..=slots) * step)
        }
        _ => distribution.from_unit(rng.random::<f64>()),
    }
}

/// Standard normal draw (Box-Muller).
fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn std_dev(points: &[f64]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let mean = points.iter().sum::<f64>() / points.len() as f64;
    let var = points.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / points.len() as f64;
    var.sqrt()
}

fn sort_by_loss(observations: &mut [(f64, f64)]) {
    observations.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
}

// ---- Random ----

/// Independent uniform sampling.
#[derive(Debug)]
pub struct RandomSampler {
    rng: Mutex<StdRng>,
}

impl RandomSampler {
    pub fn new(seed: Option<u64>) -> Self {
        Self { rng: seeded(seed) }
    }
}

impl Sampler for RandomSampler {
    fn sample(
        &self,
        _ctx: &SamplingContext<'_>,
        _name: &str,
        distribution: &Distribution,
    ) -> HpoResult<ParameterValue> {
        Ok(uniform(&mut self.rng.lock(), distribution))
    }

    fn name(&self) -> &str {
        "Random"
    }
}

// ---- Grid ----

/// Exhaustive search over a fixed grid.
///
/// Each trial takes the least-used combination consistent with the grid
/// parameters it already holds, so workers spread over the grid before any
/// combination repeats.
#[derive(Debug, Clone)]
pub struct GridSampler {
    search_space: BTreeMap<String, Vec<ParameterValue>>,
    combos: Vec<BTreeMap<String, ParameterValue>>,
}

impl GridSampler {
    pub fn new(search_space: BTreeMap<String, Vec<ParameterValue>>) -> Self {
        let combos = Self::build_grid(&search_space);
        Self {
            search_space,
            combos,
        }
    }

    pub fn grid_size(&self) -> usize {
        self.combos.len()
    }

    fn build_grid(
        space: &BTreeMap<String, Vec<ParameterValue>>,
    ) -> Vec<BTreeMap<String, ParameterValue>> {
        // Cartesian product
        let mut result: Vec<BTreeMap<String, ParameterValue>> = vec![BTreeMap::new()];
        for (name, axis) in space {
            let mut next = Vec::with_capacity(result.len() * axis.len());
            for existing in &result {
                for value in axis {
                    let mut combo = existing.clone();
                    combo.insert(name.clone(), *value);
                    next.push(combo);
                }
            }
            result = next;
        }
        result
    }

    fn matches(&self, combo: &BTreeMap<String, ParameterValue>, trial: &FrozenTrial) -> bool {
        self.search_space.keys().all(|name| match trial.params.get(name) {
            Some(value) => combo.get(name) == Some(value),
            None => true,
        })
    }

    fn uses(&self, combo: &BTreeMap<String, ParameterValue>, trial: &FrozenTrial) -> bool {
        let mut any = false;
        for name in self.search_space.keys() {
            match trial.params.get(name) {
                Some(value) if combo.get(name) == Some(value) => any = true,
                Some(_) => return false,
                None => {}
            }
        }
        any
    }
}

impl Sampler for GridSampler {
    fn sample(
        &self,
        ctx: &SamplingContext<'_>,
        name: &str,
        _distribution: &Distribution,
    ) -> HpoResult<ParameterValue> {
        if !self.search_space.contains_key(name) {
            return Err(TrialError::ParameterOutsideGrid {
                name: name.to_string(),
            }
            .into());
        }

        let chosen = self
            .combos
            .iter()
            .filter(|combo| self.matches(combo, ctx.trial))
            .min_by_key(|combo| ctx.history.iter().filter(|t| self.uses(combo, t)).count());

        chosen
            .and_then(|combo| combo.get(name).copied())
            .ok_or_else(|| {
                TrialError::ParameterOutsideGrid {
                    name: name.to_string(),
                }
                .into()
            })
    }

    fn name(&self) -> &str {
        "Grid"
    }
}

// ---- TPE ----

/// Tree-structured Parzen estimator, one parameter at a time.
///
/// After `n_startup_trials` random trials, completed observations are split
/// into a good and a bad group; candidates are drawn around the good group
/// and the one maximizing `l(x) / g(x)` is returned.
#[derive(Debug)]
pub struct TpeSampler {
    n_startup_trials: usize,
    n_ei_candidates: usize,
    rng: Mutex<StdRng>,
}

impl TpeSampler {
    pub fn new(n_startup_trials: usize, n_ei_candidates: usize, seed: Option<u64>) -> Self {
        Self {
            n_startup_trials,
            n_ei_candidates: n_ei_candidates.max(1),
            rng: seeded(seed),
        }
    }

    /// Size of the good group: 10% of the observations, capped at 25.
    fn n_good(n: usize) -> usize {
        ((n as f64 * 0.1).ceil() as usize).clamp(1, 25)
    }

    fn bandwidth(points: &[f64]) -> f64 {
        let n = points.len().max(1) as f64;
        (1.06 * std_dev(points).max(0.1) * n.powf(-0.2)).clamp(0.02, 0.5)
    }

    /// Parzen density over [0, 1] with a flat prior component.
    fn density(points: &[f64], bandwidth: f64, x: f64) -> f64 {
        let weight = 1.0 / (points.len() + 1) as f64;
        let norm = 1.0 / (bandwidth * (2.0 * std::f64::consts::PI).sqrt());
        let kernels: f64 = points
            .iter()
            .map(|p| norm * (-0.5 * ((x - p) / bandwidth).powi(2)).exp())
            .sum();
        weight * (1.0 + kernels)
    }
}

impl Sampler for TpeSampler {
    fn sample(
        &self,
        ctx: &SamplingContext<'_>,
        name: &str,
        distribution: &Distribution,
    ) -> HpoResult<ParameterValue> {
        let mut rng = self.rng.lock();
        let mut observations = ctx.observations(name, distribution);
        if observations.len() < self.n_startup_trials || observations.len() < 2 {
            return Ok(uniform(&mut rng, distribution));
        }

        sort_by_loss(&mut observations);
        let n_good = Self::n_good(observations.len());
        let good: Vec<f64> = observations[..n_good].iter().map(|o| o.0).collect();
        let bad: Vec<f64> = observations[n_good..].iter().map(|o| o.0).collect();
        let (h_good, h_bad) = (Self::bandwidth(&good), Self::bandwidth(&bad));

        let mut best = (f64::NEG_INFINITY, 0.5);
        for _ in 0..self.n_ei_candidates {
            let component = rng.random_range(0..=good.len());
            let x = match good.get(component) {
                Some(center) => (center + h_good * gaussian(&mut rng)).clamp(0.0, 1.0),
                None => rng.random::<f64>(),
            };
            let score = Self::density(&good, h_good, x).ln() - Self::density(&bad, h_bad, x).ln();
            if score > best.0 {
                best = (score, x);
            }
        }

        Ok(distribution.from_unit(best.1))
    }

    fn name(&self) -> &str {
        "TPE"
    }
}

// ---- CMA-ES ----

/// Evolution strategy with a diagonal covariance.
///
/// The most recent `window` completed trials form the current generation;
/// the better half is recombined with log-rank weights into a mean and a
/// step size, and the next value is drawn from that normal in unit space.
#[derive(Debug)]
pub struct CmaEsSampler {
    n_startup_trials: usize,
    window: usize,
    rng: Mutex<StdRng>,
}

impl CmaEsSampler {
    pub fn new(n_startup_trials: usize, seed: Option<u64>) -> Self {
        Self {
            n_startup_trials,
            window: 20,
            rng: seeded(seed),
        }
    }

    fn recombine(elites: &[(f64, f64)]) -> (f64, f64) {
        let mu = elites.len();
        let raw: Vec<f64> = (0..mu)
            .map(|i| ((mu as f64 + 0.5).ln() - ((i + 1) as f64).ln()).max(0.0))
            .collect();
        let total: f64 = raw.iter().sum();
        let weights: Vec<f64> = if total > 0.0 {
            raw.iter().map(|w| w / total).collect()
        } else {
            vec![1.0 / mu as f64; mu]
        };

        let mean: f64 = elites.iter().zip(&weights).map(|(e, w)| e.0 * w).sum();
        let var: f64 = elites
            .iter()
            .zip(&weights)
            .map(|(e, w)| w * (e.0 - mean).powi(2))
            .sum();
        (mean, var.sqrt().clamp(0.02, 0.3))
    }
}

impl Sampler for CmaEsSampler {
    fn sample(
        &self,
        ctx: &SamplingContext<'_>,
        name: &str,
        distribution: &Distribution,
    ) -> HpoResult<ParameterValue> {
        let mut rng = self.rng.lock();
        let observations = ctx.observations(name, distribution);
        if observations.len() < self.n_startup_trials || observations.is_empty() {
            return Ok(uniform(&mut rng, distribution));
        }

        let start = observations.len().saturating_sub(self.window);
        let mut generation = observations[start..].to_vec();
        sort_by_loss(&mut generation);
        let mu = (generation.len() / 2).max(1);
        let (mean, sigma) = Self::recombine(&generation[..mu]);

        let x = (mean + sigma * gaussian(&mut rng)).clamp(0.0, 1.0);
        Ok(distribution.from_unit(x))
    }

    fn name(&self) -> &str {
        "CmaEs"
    }
}
