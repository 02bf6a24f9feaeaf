//! The nested configuration tree handed to the trainer.

use hpo_types::ParamMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use uuid::Uuid;

use crate::space::{SearchSpace, Section};

pub const SEED: u64 = 12;
/// Fraction held out for internal validation when no validation file is given.
pub const VAL_SPLIT: f64 = 0.1;

/// Run level values that are not tuned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    pub epochs: u64,
    pub verbose: bool,
    pub gpus: u32,
    pub train_file: PathBuf,
    /// Set when the trainer has to split off its own validation data.
    pub val_split: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrainingConfig {
    tree: Value,
}

impl TrainingConfig {
    pub fn build(
        space: &SearchSpace,
        params: &ParamMap,
        options: &RunOptions,
        identifier: Uuid,
    ) -> Self {
        let mut model = Map::new();
        model.insert("name".into(), json!("singlenn"));
        model.insert("get_forces".into(), json!(false));
        model.insert("dropout".into(), json!(1));
        model.insert("initialization".into(), json!("xavier"));
        model.insert("activation".into(), json!("Tanh"));

        let mut optim = Map::new();
        optim.insert("gpus".into(), json!(options.gpus));
        optim.insert("loss".into(), json!("mae"));
        optim.insert("epochs".into(), json!(options.epochs));

        let mut scheduler = Map::new();

        for entry in space.entries() {
            let Some(value) = params.get(&entry.spec.name) else {
                continue;
            };
            let section = match entry.section {
                Section::Model => &mut model,
                Section::Optim => &mut optim,
                Section::Scheduler => &mut scheduler,
            };
            section.insert(entry.spec.name.clone(), value.to_json());
        }

        optim.insert(
            "scheduler".into(),
            json!({ "policy": "StepLR", "params": scheduler }),
        );

        let mut dataset = Map::new();
        dataset.insert(
            "lmdb_path".into(),
            json!([options.train_file.display().to_string()]),
        );
        dataset.insert("cache".into(), json!("full"));
        if let Some(split) = options.val_split {
            dataset.insert("val_split".into(), json!(split));
        }

        let tree = json!({
            "model": model,
            "optim": optim,
            "dataset": dataset,
            "cmd": {
                "seed": SEED,
                "identifier": identifier.to_string(),
                "dtype": "torch.DoubleTensor",
                "verbose": options.verbose,
            },
        });
        Self { tree }
    }

    /// Value at a dotted path such as `optim.scheduler.params.gamma`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('.').try_fold(&self.tree, |node, key| node.get(key))
    }

    pub fn identifier(&self) -> Option<&str> {
        self.get("cmd.identifier")?.as_str()
    }

    pub fn as_json(&self) -> &Value {
        &self.tree
    }
}
