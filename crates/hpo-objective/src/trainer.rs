//! Interfaces of the external trainer and dataset reader.

use hpo_types::HpoResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::TrainingConfig;

/// Metrics recorded at the end of one epoch, by name.
pub type EpochMetrics = BTreeMap<String, f64>;

/// Per-epoch metric history of a training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    epochs: Vec<EpochMetrics>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn epochs(&self) -> &[EpochMetrics] {
        &self.epochs
    }

    /// `metric` as recorded in the final epoch.
    pub fn last(&self, metric: &str) -> Option<f64> {
        self.epochs.last()?.get(metric).copied()
    }
}

/// One atomic structure from a dataset file. Only the energy is interpreted
/// here; the rest is passed through to the trainer untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    pub energy: f64,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Called by the trainer after every epoch. An error stops training and is
/// returned from [`Trainer::train`].
pub trait EpochCallback {
    fn on_epoch_end(&mut self, epoch: u64, metrics: &EpochMetrics) -> HpoResult<()>;
}

pub trait TrainedModel {
    fn history(&self) -> &TrainingHistory;

    fn predict_energies(&self, structures: &[Structure]) -> HpoResult<Vec<f64>>;
}

/// The model trainer. Consumes a configuration tree, produces a trained
/// model with its metric history.
pub trait Trainer: Send + Sync {
    fn train(
        &self,
        config: &TrainingConfig,
        callback: &mut dyn EpochCallback,
    ) -> HpoResult<Box<dyn TrainedModel>>;
}

pub trait DatasetReader: Send + Sync {
    fn read(&self, path: &Path) -> HpoResult<Vec<Structure>>;
}

/// Reads structures from a JSON array file.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDatasetReader;

impl DatasetReader for JsonDatasetReader {
    fn read(&self, path: &Path) -> HpoResult<Vec<Structure>> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}
