//! The tunable hyperparameters and where each lands in the training config.

use hpo_types::ParameterSpec;
use serde::{Deserialize, Serialize};

/// Section of the configuration tree a parameter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Section {
    /// `model`
    Model,
    /// `optim`
    Optim,
    /// `optim.scheduler.params`
    Scheduler,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchEntry {
    pub section: Section,
    pub spec: ParameterSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    entries: Vec<SearchEntry>,
}

impl SearchSpace {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn with(mut self, section: Section, spec: ParameterSpec) -> Self {
        self.entries.push(SearchEntry { section, spec });
        self
    }

    pub fn entries(&self) -> &[SearchEntry] {
        &self.entries
    }

    pub fn specs(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.entries.iter().map(|e| &e.spec)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.spec.name.as_str()).collect()
    }
}

impl Default for SearchSpace {
    /// Network shape, regularization, learning rate schedule and batch size.
    fn default() -> Self {
        Self::empty()
            .with(Section::Model, ParameterSpec::int("num_layers", 3, 8))
            .with(Section::Model, ParameterSpec::int("num_nodes", 4, 15))
            .with(Section::Model, ParameterSpec::int("batchnorm", 0, 1))
            .with(Section::Model, ParameterSpec::float("dropout_rate", 0.0, 1.0))
            .with(Section::Optim, ParameterSpec::float("lr", 1e-5, 1e-2).log_scale())
            .with(Section::Scheduler, ParameterSpec::int_step("step_size", 1, 30, 5))
            .with(Section::Scheduler, ParameterSpec::float("gamma", 1e-5, 1e-1).log_scale())
            .with(Section::Optim, ParameterSpec::int_step("batch_size", 100, 500, 50))
    }
}
