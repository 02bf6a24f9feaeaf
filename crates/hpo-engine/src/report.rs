//! Report renderer writing the data behind each plot as JSON.

use async_trait::async_trait;
use hpo_study::{FrozenTrial, PlotKind, ReportRenderer, TrialState};
use hpo_types::{HpoResult, ParamMap};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Writes `<plot>.json` next to where the image would go. Plotting is left to
/// whatever reads the files.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlotDataRenderer;

#[derive(Debug, Serialize)]
struct PlotData<'a> {
    plot: PlotKind,
    trials: Vec<PlotPoint<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum PlotPoint<'a> {
    Contour {
        number: u64,
        num_layers: Option<f64>,
        num_nodes: Option<f64>,
        value: f64,
    },
    Curve {
        number: u64,
        state: TrialState,
        intermediate_values: &'a BTreeMap<u64, f64>,
    },
    History {
        number: u64,
        value: f64,
    },
    Params {
        number: u64,
        params: &'a ParamMap,
        value: f64,
    },
}

fn completed(trials: &[FrozenTrial]) -> impl Iterator<Item = (&FrozenTrial, f64)> {
    trials
        .iter()
        .filter(|t| t.state == TrialState::Complete)
        .filter_map(|t| t.value.map(|v| (t, v)))
}

fn points(kind: PlotKind, trials: &[FrozenTrial]) -> Vec<PlotPoint<'_>> {
    match kind {
        PlotKind::Contour => completed(trials)
            .map(|(t, value)| PlotPoint::Contour {
                number: t.number,
                num_layers: t.params.get("num_layers").map(|v| v.as_f64()),
                num_nodes: t.params.get("num_nodes").map(|v| v.as_f64()),
                value,
            })
            .collect(),
        PlotKind::Intermediate => trials
            .iter()
            .filter(|t| !t.intermediate_values.is_empty())
            .map(|t| PlotPoint::Curve {
                number: t.number,
                state: t.state,
                intermediate_values: &t.intermediate_values,
            })
            .collect(),
        PlotKind::OptimizationHistory => completed(trials)
            .map(|(t, value)| PlotPoint::History {
                number: t.number,
                value,
            })
            .collect(),
        PlotKind::ParamImportances => completed(trials)
            .map(|(t, value)| PlotPoint::Params {
                number: t.number,
                params: &t.params,
                value,
            })
            .collect(),
    }
}

#[async_trait]
impl ReportRenderer for PlotDataRenderer {
    async fn render(
        &self,
        kind: PlotKind,
        trials: &[FrozenTrial],
        path: &Path,
    ) -> HpoResult<PathBuf> {
        let data = PlotData {
            plot: kind,
            trials: points(kind, trials),
        };
        let json = serde_json::to_vec_pretty(&data)?;
        let path = path.with_extension("json");
        tokio::fs::write(&path, json).await?;
        debug!(plot = ?kind, path = %path.display(), points = data.trials.len(), "plot data written");
        Ok(path)
    }
}
