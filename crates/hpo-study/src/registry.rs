//! Fixed registries of sampler and pruner configurations, selectable by name.

use hpo_types::{ConfigError, ParameterValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::pruner::{HyperbandPruner, MedianPruner, NopPruner, Pruner};
use crate::sampler::{CmaEsSampler, GridSampler, RandomSampler, Sampler, TpeSampler};

pub const SAMPLER_NAMES: [&str; 4] = ["CmaEs", "TPE", "Random", "Grid"];
pub const PRUNER_NAMES: [&str; 3] = ["Hyperband", "Median", "None"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SamplerConfig {
    CmaEs {
        n_startup_trials: usize,
    },
    Tpe {
        n_startup_trials: usize,
        n_ei_candidates: usize,
    },
    Random,
    Grid {
        search_space: BTreeMap<String, Vec<ParameterValue>>,
    },
}

impl SamplerConfig {
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name {
            "CmaEs" => Ok(Self::CmaEs {
                n_startup_trials: 10,
            }),
            "TPE" => Ok(Self::Tpe {
                n_startup_trials: 40,
                n_ei_candidates: 24,
            }),
            "Random" => Ok(Self::Random),
            "Grid" => Ok(Self::Grid {
                search_space: default_grid(),
            }),
            other => Err(ConfigError::UnknownSampler {
                name: other.to_string(),
                expected: SAMPLER_NAMES.join(", "),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CmaEs { .. } => "CmaEs",
            Self::Tpe { .. } => "TPE",
            Self::Random => "Random",
            Self::Grid { .. } => "Grid",
        }
    }

    pub fn build(&self, seed: Option<u64>) -> Arc<dyn Sampler> {
        match self {
            Self::CmaEs { n_startup_trials } => Arc::new(CmaEsSampler::new(*n_startup_trials, seed)),
            Self::Tpe {
                n_startup_trials,
                n_ei_candidates,
            } => Arc::new(TpeSampler::new(*n_startup_trials, *n_ei_candidates, seed)),
            Self::Random => Arc::new(RandomSampler::new(seed)),
            Self::Grid { search_space } => Arc::new(GridSampler::new(search_space.clone())),
        }
    }
}

impl FromStr for SamplerConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

/// Grid over the network shape: 3..=8 layers, 4..=15 nodes per layer.
fn default_grid() -> BTreeMap<String, Vec<ParameterValue>> {
    let mut space = BTreeMap::new();
    space.insert(
        "num_layers".to_string(),
        (3..=8).map(ParameterValue::Int).collect(),
    );
    space.insert(
        "num_nodes".to_string(),
        (4..=15).map(ParameterValue::Int).collect(),
    );
    space
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PrunerConfig {
    Hyperband {
        min_resource: u64,
        max_resource: u64,
        reduction_factor: u64,
    },
    Median {
        n_startup_trials: usize,
        n_warmup_steps: u64,
    },
    Nop,
}

impl PrunerConfig {
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name {
            "Hyperband" => {
                let defaults = HyperbandPruner::default();
                Ok(Self::Hyperband {
                    min_resource: defaults.min_resource,
                    max_resource: defaults.max_resource,
                    reduction_factor: defaults.reduction_factor,
                })
            }
            "Median" => Ok(Self::Median {
                n_startup_trials: 10,
                n_warmup_steps: 10,
            }),
            "None" => Ok(Self::Nop),
            other => Err(ConfigError::UnknownPruner {
                name: other.to_string(),
                expected: PRUNER_NAMES.join(", "),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Hyperband { .. } => "Hyperband",
            Self::Median { .. } => "Median",
            Self::Nop => "None",
        }
    }

    pub fn build(&self) -> Arc<dyn Pruner> {
        match self {
            Self::Hyperband {
                min_resource,
                max_resource,
                reduction_factor,
            } => Arc::new(HyperbandPruner {
                min_resource: *min_resource,
                max_resource: *max_resource,
                reduction_factor: *reduction_factor,
            }),
            Self::Median {
                n_startup_trials,
                n_warmup_steps,
            } => Arc::new(MedianPruner::new(*n_startup_trials, *n_warmup_steps)),
            Self::Nop => Arc::new(NopPruner),
        }
    }
}

impl FromStr for PrunerConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}
