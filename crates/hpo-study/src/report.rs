//! Study reports: a directory of plots plus the best trial.

use async_trait::async_trait;
use hpo_types::{HpoResult, StudyError};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::study::Study;
use crate::trial::FrozenTrial;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlotKind {
    /// Contour over `num_layers` and `num_nodes`.
    Contour,
    Intermediate,
    OptimizationHistory,
    ParamImportances,
}

impl PlotKind {
    pub const ALL: [PlotKind; 4] = [
        PlotKind::Contour,
        PlotKind::Intermediate,
        PlotKind::OptimizationHistory,
        PlotKind::ParamImportances,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            PlotKind::Contour => "contour_plot.png",
            PlotKind::Intermediate => "intermediate.png",
            PlotKind::OptimizationHistory => "optimization_history.png",
            PlotKind::ParamImportances => "param_importances.png",
        }
    }
}

/// Draws one plot of a study's trials to a file.
#[async_trait]
pub trait ReportRenderer: Send + Sync {
    /// Render `kind` at `path` and return the file written. Renderers that
    /// emit another format may swap the extension.
    async fn render(&self, kind: PlotKind, trials: &[FrozenTrial], path: &Path)
        -> HpoResult<PathBuf>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportOutcome {
    pub dir: PathBuf,
    pub plots: Vec<PathBuf>,
    pub best: Option<FrozenTrial>,
}

/// Create `<root>/<study>`. An existing directory is an error so reports are
/// never overwritten.
pub async fn create_report_dir(root: &Path, study: &str) -> HpoResult<PathBuf> {
    let dir = root.join(study);
    tokio::fs::create_dir_all(root).await?;
    match tokio::fs::create_dir(&dir).await {
        Ok(()) => Ok(dir),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(StudyError::ReportExists {
            path: dir.display().to_string(),
        }
        .into()),
        Err(e) => Err(e.into()),
    }
}

pub async fn generate_report(
    study: &Study,
    root: &Path,
    renderer: &dyn ReportRenderer,
) -> HpoResult<ReportOutcome> {
    let dir = create_report_dir(root, study.name()).await?;
    let trials = study.trials()?;

    let mut plots = Vec::with_capacity(PlotKind::ALL.len());
    for kind in PlotKind::ALL {
        let path = dir.join(kind.file_name());
        plots.push(renderer.render(kind, &trials, &path).await?);
    }

    let best = study.best_trial()?;
    match &best {
        Some(trial) => info!(
            study = %study.name(),
            params = ?trial.params,
            mae = ?trial.value,
            "best params"
        ),
        None => info!(study = %study.name(), "no successful trials yet"),
    }
    info!(dir = %dir.display(), "report saved");

    Ok(ReportOutcome { dir, plots, best })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{PrunerConfig, SamplerConfig};
    use crate::storage::{InMemoryStorage, StudyStorage};
    use crate::trial::ObjectiveDirection;
    use hpo_types::{HpoError, Suggest};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingRenderer {
        rendered: Mutex<Vec<(PlotKind, usize)>>,
    }

    #[async_trait]
    impl ReportRenderer for RecordingRenderer {
        async fn render(
            &self,
            kind: PlotKind,
            trials: &[FrozenTrial],
            path: &Path,
        ) -> HpoResult<PathBuf> {
            tokio::fs::write(path, b"png").await?;
            self.rendered.lock().push((kind, trials.len()));
            Ok(path.to_path_buf())
        }
    }

    fn study() -> Study {
        let storage: Arc<dyn StudyStorage> = Arc::new(InMemoryStorage::new());
        let record = storage
            .get_or_create_study("report-me", ObjectiveDirection::Minimize)
            .unwrap();
        Study::new(record, storage, SamplerConfig::Random, PrunerConfig::Nop, Some(1))
    }

    #[tokio::test]
    async fn renders_every_plot_once() {
        let root = tempfile::tempdir().unwrap();
        let study = study();
        study
            .optimize(3, |trial| Ok(trial.suggest_int("num_layers", 3, 8, 1, false)? as f64))
            .unwrap();

        let renderer = RecordingRenderer::default();
        let outcome = generate_report(&study, root.path(), &renderer).await.unwrap();

        assert_eq!(outcome.dir, root.path().join("report-me"));
        assert_eq!(outcome.plots.len(), 4);
        assert!(outcome.plots.iter().all(|p| p.exists()));
        assert!(outcome.best.is_some());
        assert_eq!(renderer.rendered.lock().len(), 4);
    }

    #[tokio::test]
    async fn existing_directory_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("report-me")).unwrap();

        let renderer = RecordingRenderer::default();
        let err = generate_report(&study(), root.path(), &renderer)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HpoError::Study(StudyError::ReportExists { .. })
        ));
        assert!(renderer.rendered.lock().is_empty());
    }

    #[tokio::test]
    async fn concurrent_reports_claim_the_directory_once() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("reports");

        let (a, b) = tokio::join!(
            create_report_dir(&nested, "same-study"),
            create_report_dir(&nested, "same-study")
        );

        let claimed = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(claimed, 1);
        let loser = if a.is_err() { a } else { b };
        assert!(matches!(
            loser,
            Err(HpoError::Study(StudyError::ReportExists { .. }))
        ));
    }
}
