//! Creating, loading, listing and deleting studies by name.

use hpo_types::{HpoResult, StudyError};
use std::sync::Arc;
use tracing::info;

use crate::connection::BackendContext;
use crate::registry::{PrunerConfig, SamplerConfig};
use crate::storage::{InMemoryStorage, StudyStorage};
use crate::study::{Study, StudySummary};
use crate::trial::ObjectiveDirection;

/// Sampler used when loading a study without naming one.
pub const DEFAULT_SAMPLER: &str = "TPE";
/// Pruner used when loading a study without naming one.
pub const DEFAULT_PRUNER: &str = "Median";

#[derive(Clone)]
pub struct StudyStore {
    storage: Arc<dyn StudyStorage>,
    seed: Option<u64>,
}

impl std::fmt::Debug for StudyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StudyStore").field("seed", &self.seed).finish()
    }
}

impl StudyStore {
    pub fn new(storage: Arc<dyn StudyStorage>) -> Self {
        Self {
            storage,
            seed: None,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStorage::new()))
    }

    /// Seed every sampler built by this store.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Store backed by the shared database when `with_db` is set, otherwise
    /// process-local.
    pub async fn open(ctx: &BackendContext, with_db: bool) -> HpoResult<Self> {
        if !with_db {
            return Ok(Self::in_memory());
        }
        let target = ctx.connection_target().await?;

        #[cfg(feature = "duckdb")]
        {
            let storage = crate::sql_storage::DuckDbStorage::open(target)?;
            return Ok(Self::new(Arc::new(storage)));
        }

        #[cfg(not(feature = "duckdb"))]
        {
            tracing::warn!(backend = %target.redacted(), "shared storage not compiled in");
            return Err(hpo_types::ConfigError::FeatureUnavailable {
                feature: "duckdb".into(),
            }
            .into());
        }
    }

    pub fn storage(&self) -> &Arc<dyn StudyStorage> {
        &self.storage
    }

    /// Load the named study, creating it first if it does not exist.
    ///
    /// Unknown sampler or pruner names fail before anything is stored.
    pub fn create_or_load(&self, name: &str, sampler: &str, pruner: &str) -> HpoResult<Study> {
        let sampler = SamplerConfig::from_name(sampler)?;
        let pruner = PrunerConfig::from_name(pruner)?;

        let record = self
            .storage
            .get_or_create_study(name, ObjectiveDirection::Minimize)?;
        info!(
            study = %record.name,
            id = %record.id,
            sampler = sampler.name(),
            pruner = pruner.name(),
            "study ready"
        );
        Ok(Study::new(record, self.storage.clone(), sampler, pruner, self.seed))
    }

    /// Load an existing study with the default sampler and pruner.
    pub fn load(&self, name: &str) -> HpoResult<Study> {
        let record = self
            .storage
            .find_study(name)?
            .ok_or_else(|| StudyError::NotFound {
                name: name.to_string(),
            })?;
        Ok(Study::new(
            record,
            self.storage.clone(),
            SamplerConfig::from_name(DEFAULT_SAMPLER)?,
            PrunerConfig::from_name(DEFAULT_PRUNER)?,
            self.seed,
        ))
    }

    pub fn delete(&self, name: &str) -> HpoResult<()> {
        self.storage.delete_study(name)?;
        info!(study = %name, "deleted study");
        Ok(())
    }

    /// Delete studies in order, stopping at the first one that fails.
    pub fn delete_many<S: AsRef<str>>(&self, names: &[S]) -> HpoResult<()> {
        for name in names {
            self.delete(name.as_ref())?;
        }
        Ok(())
    }

    pub fn list_all(&self) -> HpoResult<Vec<StudySummary>> {
        self.storage
            .list_studies()?
            .into_iter()
            .map(|record| {
                let trials = self.storage.get_all_trials(record.id)?;
                Ok(StudySummary::from_trials(
                    &record.name,
                    record.direction,
                    &trials,
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpo_types::{ConfigError, HpoError, Suggest};
    use std::thread;

    #[test]
    fn create_or_load_is_idempotent() {
        let store = StudyStore::in_memory();
        let a = store.create_or_load("nn", "CmaEs", "Hyperband").unwrap();
        let b = store.create_or_load("nn", "Random", "None").unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(b.sampler_config().name(), "Random");
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[test]
    fn concurrent_callers_share_one_study() {
        let store = StudyStore::in_memory();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || store.create_or_load("shared", "TPE", "Median").unwrap().id())
            })
            .collect();
        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[test]
    fn unknown_sampler_creates_nothing() {
        let store = StudyStore::in_memory();
        let err = store.create_or_load("nn", "Bayes", "Median").unwrap_err();
        assert!(matches!(
            err,
            HpoError::Config(ConfigError::UnknownSampler { .. })
        ));
        let err = store.create_or_load("nn", "TPE", "Patient").unwrap_err();
        assert!(matches!(
            err,
            HpoError::Config(ConfigError::UnknownPruner { .. })
        ));
        assert!(store.list_all().unwrap().is_empty());
    }

    #[test]
    fn load_uses_defaults_and_reports_missing() {
        let store = StudyStore::in_memory();
        assert!(matches!(
            store.load("ghost"),
            Err(HpoError::Study(StudyError::NotFound { .. }))
        ));

        store.create_or_load("nn", "Grid", "None").unwrap();
        let study = store.load("nn").unwrap();
        assert_eq!(study.sampler_config().name(), "TPE");
        assert_eq!(study.pruner_config().name(), "Median");
    }

    #[test]
    fn delete_many_stops_at_first_missing() {
        let store = StudyStore::in_memory();
        store.create_or_load("a", "TPE", "Median").unwrap();
        store.create_or_load("c", "TPE", "Median").unwrap();

        let err = store.delete_many(&["a", "b", "c"]).unwrap_err();
        assert!(matches!(err, HpoError::Study(StudyError::NotFound { ref name }) if name == "b"));

        let remaining: Vec<_> = store
            .list_all()
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(remaining, vec!["c".to_string()]);
    }

    #[test]
    fn list_all_summarizes_empty_and_finished_studies() {
        let store = StudyStore::in_memory().with_seed(7);
        store.create_or_load("empty", "TPE", "Median").unwrap();
        let busy = store.create_or_load("busy", "Random", "None").unwrap();
        busy.optimize(3, |trial| {
            let layers = trial.suggest_int("num_layers", 3, 8, 1, false)?;
            Ok(layers as f64 / 10.0)
        })
        .unwrap();

        let summaries = store.list_all().unwrap();
        let empty = summaries.iter().find(|s| s.name == "empty").unwrap();
        assert!(empty.best_trial.is_none());
        assert!(empty.to_string().contains("no successful trials yet"));

        let busy = summaries.iter().find(|s| s.name == "busy").unwrap();
        assert_eq!(busy.n_trials, 3);
        let best = busy.best_trial.as_ref().unwrap();
        assert!(best.params.contains_key("num_layers"));
    }

    #[tokio::test]
    async fn open_without_db_is_process_local() {
        let values = [
            ("MYSQL_USERNAME", "u"),
            ("MYSQL_PASSWORD", "p"),
            ("MYSQL_NODE", "n"),
            ("HPOPT_DB", "d"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let ctx = BackendContext::from_map(&values).unwrap();
        let store = StudyStore::open(&ctx, false).await.unwrap();
        assert!(store.list_all().unwrap().is_empty());
    }
}
