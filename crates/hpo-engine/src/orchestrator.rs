//! Top-level operations: tuning, job fan-out, backend bootstrap and study
//! housekeeping.

use hpo_jobs::{BatchQueue, JobParams, JobRecord, JobScheduler, JobTemplates, PbsQueue};
use hpo_objective::{DatasetReader, EvaluatorSettings, ObjectiveEvaluator, Trainer};
use hpo_study::{
    generate_report, BackendContext, OptimizeReport, PrunerConfig, ReportOutcome, ReportRenderer,
    SamplerConfig, StudyStore, StudySummary,
};
use hpo_types::{ConfigError, HpoError, HpoResult, ParamMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::config::{HpoConfig, PARAM_PREFIX};

pub const DEFAULT_STUDY: &str = "distributed-amptorch-tuning";

/// One worker's tuning run.
#[derive(Debug, Clone)]
pub struct TuneSettings {
    pub study: String,
    pub n_trials: usize,
    /// Coordinate through the shared backend instead of a process-local store.
    pub with_db: bool,
    pub sampler: String,
    pub pruner: String,
    pub evaluator: EvaluatorSettings,
}

impl TuneSettings {
    pub fn new(study: impl Into<String>, train_file: impl Into<PathBuf>) -> Self {
        Self {
            study: study.into(),
            n_trials: 10,
            with_db: false,
            sampler: "CmaEs".into(),
            pruner: "Median".into(),
            evaluator: EvaluatorSettings::new(train_file, 100),
        }
    }
}

/// A batch of identical worker jobs, each running `trials_per_job` trials.
#[derive(Debug, Clone)]
pub struct TuningJobs {
    pub n_jobs: usize,
    pub trials_per_job: usize,
    pub study: String,
    pub sampler: String,
    pub pruner: String,
    pub epochs: u64,
    pub data: PathBuf,
    pub params: ParamMap,
}

impl TuningJobs {
    fn job_params(&self) -> HpoResult<JobParams> {
        let data = std::path::absolute(&self.data)?;
        let mut params = JobParams::new()
            .with("trials", self.trials_per_job)
            .with("data", data.display())
            .with("study", &self.study)
            .with("pruner", &self.pruner)
            .with("sampler", &self.sampler)
            .with("epochs", self.epochs);
        params.extend_prefixed(PARAM_PREFIX, &self.params);
        Ok(params)
    }
}

pub struct Orchestrator {
    config: HpoConfig,
    scheduler: JobScheduler,
    backend: OnceCell<BackendContext>,
    shared: OnceCell<StudyStore>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler)
            .field("backend_ready", &self.backend.initialized())
            .finish()
    }
}

impl Orchestrator {
    /// Orchestrator driving the PBS queue as the configured user.
    pub fn new(config: HpoConfig) -> Self {
        let queue = Arc::new(PbsQueue::new(config.queue_user.clone()));
        Self::with_queue(config, queue)
    }

    pub fn with_queue(config: HpoConfig, queue: Arc<dyn BatchQueue>) -> Self {
        let scheduler = JobScheduler::new(
            queue,
            JobTemplates::new(config.job_templates.clone()),
            config.wait,
        );
        Self {
            config,
            scheduler,
            backend: OnceCell::new(),
            shared: OnceCell::new(),
        }
    }

    /// Use `store` as the shared study store instead of bootstrapping the
    /// backend job.
    pub fn with_store(mut self, store: StudyStore) -> Self {
        self.shared = OnceCell::from(store);
        self
    }

    pub fn config(&self) -> &HpoConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    /// Make sure the backend job is running and point the connection at the
    /// node it runs on. Done once per orchestrator.
    pub async fn ensure_backend(&self) -> HpoResult<&BackendContext> {
        self.backend
            .get_or_try_init(|| async {
                let settings = self.config.connection.clone().ok_or_else(|| {
                    ConfigError::MissingKey {
                        key: "MYSQL_NODE".into(),
                    }
                })?;
                let job = self.scheduler.ensure_running(&self.config.backend_job).await?;
                let settings = match job.host() {
                    Some(host) => {
                        info!(job = %job.name, id = %job.id, host, "backend job running");
                        settings.with_host(host)
                    }
                    None => {
                        warn!(
                            job = %job.name,
                            host = %settings.host,
                            "backend job reports no node, keeping configured host"
                        );
                        settings
                    }
                };
                Ok::<_, HpoError>(BackendContext::new(settings))
            })
            .await
    }

    async fn shared_store(&self) -> HpoResult<&StudyStore> {
        self.shared
            .get_or_try_init(|| async {
                let ctx = self.ensure_backend().await?;
                StudyStore::open(ctx, true).await
            })
            .await
    }

    async fn store(&self, with_db: bool) -> HpoResult<StudyStore> {
        if with_db {
            Ok(self.shared_store().await?.clone())
        } else {
            Ok(StudyStore::in_memory())
        }
    }

    /// Run `settings.n_trials` trials of the study in this process.
    pub async fn tune(
        &self,
        settings: &TuneSettings,
        trainer: Arc<dyn Trainer>,
        reader: &dyn DatasetReader,
    ) -> HpoResult<OptimizeReport> {
        info!(
            study = %settings.study,
            n_trials = settings.n_trials,
            shared = settings.with_db,
            sampler = %settings.sampler,
            pruner = %settings.pruner,
            "running hyperparameter tuning"
        );
        let store = self.store(settings.with_db).await?;
        let study = store.create_or_load(&settings.study, &settings.sampler, &settings.pruner)?;
        let evaluator = ObjectiveEvaluator::new(settings.evaluator.clone(), trainer, reader)?;

        let n_trials = settings.n_trials;
        tokio::task::spawn_blocking(move || {
            study.optimize(n_trials, |trial| evaluator.evaluate(trial))
        })
        .await
        .map_err(|e| HpoError::Internal(format!("optimization task failed: {e}")))?
    }

    /// Queue `jobs.n_jobs` worker jobs sharing one study. Returns the queue
    /// acknowledgements.
    pub async fn run_tuning_jobs(&self, jobs: &TuningJobs) -> HpoResult<Vec<String>> {
        SamplerConfig::from_name(&jobs.sampler)?;
        PrunerConfig::from_name(&jobs.pruner)?;

        let params = jobs.job_params()?;
        let acks = self
            .scheduler
            .fan_out(&self.config.trial_job, jobs.n_jobs, &params)
            .await?;
        info!(
            study = %jobs.study,
            n_jobs = acks.len(),
            trials_per_job = jobs.trials_per_job,
            "tuning jobs queued"
        );
        Ok(acks)
    }

    /// Queued and running jobs, optionally only those named `name`.
    pub async fn view_jobs(&self, name: Option<&str>) -> HpoResult<Vec<JobRecord>> {
        self.scheduler.monitor().status(name).await
    }

    pub async fn view_studies(&self) -> HpoResult<Vec<StudySummary>> {
        self.shared_store().await?.list_all()
    }

    pub async fn delete_studies<S: AsRef<str>>(&self, names: &[S]) -> HpoResult<()> {
        self.shared_store().await?.delete_many(names)
    }

    pub async fn generate_report(
        &self,
        name: &str,
        renderer: &dyn ReportRenderer,
    ) -> HpoResult<ReportOutcome> {
        let study = self.shared_store().await?.load(name)?;
        generate_report(&study, &self.config.report_dir, renderer).await
    }
}

/// Job listing as printed by `view_jobs`.
pub fn format_jobs(jobs: &[JobRecord], name: Option<&str>) -> String {
    if jobs.is_empty() {
        return match name {
            Some(name) => format!("No running jobs with name {name}."),
            None => "No running jobs.".to_string(),
        };
    }
    jobs.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hpo_jobs::JobStatus;
    use hpo_objective::{
        EpochCallback, EpochMetrics, Structure, TrainedModel, TrainingConfig, TrainingHistory,
        PRUNING_METRIC, VALIDATION_METRIC,
    };
    use hpo_study::{FrozenTrial, PlotKind};
    use hpo_types::{JobError, ParameterValue, StudyError};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::path::Path;

    fn record(name: &str, status: &str, node: &str) -> JobRecord {
        JobRecord {
            id: "4242".into(),
            username: "alice".into(),
            queue: "inferno".into(),
            name: name.into(),
            session_id: "--".into(),
            nodes: "1".into(),
            tasks: "4".into(),
            memory: "8gb".into(),
            requested_time: "12:00".into(),
            status: JobStatus::parse(status),
            elapsed: "--".into(),
            node: node.into(),
        }
    }

    #[derive(Default)]
    struct StaticQueue {
        jobs: Vec<JobRecord>,
        queries: Mutex<usize>,
        submissions: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl BatchQueue for StaticQueue {
        async fn query(&self) -> HpoResult<Vec<JobRecord>> {
            *self.queries.lock() += 1;
            Ok(self.jobs.clone())
        }

        async fn submit(&self, _script: &Path, variables: Option<&str>) -> HpoResult<String> {
            let mut submissions = self.submissions.lock();
            submissions.push(variables.map(str::to_string));
            Ok(format!("{}.sched-host", 500 + submissions.len()))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        queue: Arc<StaticQueue>,
        orchestrator: Orchestrator,
    }

    fn fixture(jobs: Vec<JobRecord>, with_connection: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let templates = dir.path().join("jobs");
        std::fs::create_dir(&templates).unwrap();
        std::fs::write(templates.join("mysql.pbs"), "#PBS -N mysql\n").unwrap();
        std::fs::write(
            templates.join("tune-amptorch-hyperparams.pbs"),
            "#PBS -N tune-amptorch-hyperparams\n",
        )
        .unwrap();

        let mut values: HashMap<String, String> = [
            ("USER", "alice".to_string()),
            ("HPO_JOB_TEMPLATES", templates.display().to_string()),
            ("HPO_REPORT_DIR", dir.path().join("report").display().to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        if with_connection {
            for (key, value) in [
                ("MYSQL_USERNAME", "hpo"),
                ("MYSQL_PASSWORD", "secret"),
                ("MYSQL_NODE", "login-1"),
                ("HPOPT_DB", "studies"),
            ] {
                values.insert(key.into(), value.into());
            }
        }

        let queue = Arc::new(StaticQueue {
            jobs,
            ..Default::default()
        });
        let config = HpoConfig::from_map(&values).unwrap();
        Fixture {
            _dir: dir,
            orchestrator: Orchestrator::with_queue(config, queue.clone()),
            queue,
        }
    }

    fn tuning_jobs() -> TuningJobs {
        TuningJobs {
            n_jobs: 3,
            trials_per_job: 5,
            study: "s1".into(),
            sampler: "CmaEs".into(),
            pruner: "Median".into(),
            epochs: 40,
            data: PathBuf::from("data/train.lmdb"),
            params: ParamMap::from([("num_layers".to_string(), ParameterValue::Int(8))]),
        }
    }

    #[tokio::test]
    async fn tuning_jobs_carry_study_and_overrides() {
        let f = fixture(Vec::new(), false);

        let acks = f.orchestrator.run_tuning_jobs(&tuning_jobs()).await.unwrap();

        assert_eq!(acks, vec!["501.sched-host", "502.sched-host", "503.sched-host"]);
        let submissions = f.queue.submissions.lock().clone();
        assert_eq!(submissions.len(), 3);
        let vars = submissions[0].clone().unwrap();
        assert!(vars.starts_with("trials=5,data=/"), "{vars}");
        assert!(vars.contains("data/train.lmdb,study=s1,pruner=Median,sampler=CmaEs,epochs=40"));
        assert!(vars.ends_with("param_num_layers=8"));
    }

    #[tokio::test]
    async fn unknown_sampler_queues_nothing() {
        let f = fixture(Vec::new(), false);
        let mut jobs = tuning_jobs();
        jobs.sampler = "Bayes".into();

        let err = f.orchestrator.run_tuning_jobs(&jobs).await.unwrap_err();

        assert!(matches!(err, HpoError::Config(ConfigError::UnknownSampler { .. })));
        assert!(f.queue.submissions.lock().is_empty());
    }

    #[tokio::test]
    async fn backend_host_follows_the_job_node() {
        let f = fixture(vec![record("mysql", "R", "node042/0")], true);

        let ctx = f.orchestrator.ensure_backend().await.unwrap();
        assert_eq!(ctx.settings().host, "node042");
        assert_eq!(ctx.settings().username, "hpo");

        f.orchestrator.ensure_backend().await.unwrap();
        assert_eq!(*f.queue.queries.lock(), 1);
        assert!(f.queue.submissions.lock().is_empty());
    }

    #[tokio::test]
    async fn backend_without_connection_settings_does_not_touch_the_queue() {
        let f = fixture(vec![record("mysql", "R", "node042/0")], false);

        let err = f.orchestrator.ensure_backend().await.unwrap_err();

        assert!(matches!(err, HpoError::Config(ConfigError::MissingKey { .. })));
        assert_eq!(*f.queue.queries.lock(), 0);
    }

    #[tokio::test]
    async fn two_backend_jobs_abort_the_bootstrap() {
        let f = fixture(
            vec![record("mysql", "R", "node042/0"), record("mysql", "Q", "--")],
            true,
        );

        let err = f.orchestrator.ensure_backend().await.unwrap_err();

        assert!(matches!(
            err,
            HpoError::Job(JobError::AmbiguousSingleton { count: 2, .. })
        ));
        assert!(f.queue.submissions.lock().is_empty());
    }

    #[tokio::test]
    async fn job_listing_messages() {
        let f = fixture(vec![record("mysql", "R", "node042/0")], false);

        let none = f.orchestrator.view_jobs(Some("tune")).await.unwrap();
        assert_eq!(format_jobs(&none, Some("tune")), "No running jobs with name tune.");
        assert_eq!(format_jobs(&[], None), "No running jobs.");

        let all = f.orchestrator.view_jobs(None).await.unwrap();
        let listing = format_jobs(&all, None);
        assert!(listing.contains("mysql"));
        assert!(listing.contains("node042/0"));
    }

    #[tokio::test]
    async fn study_housekeeping_uses_the_shared_store() {
        let f = fixture(Vec::new(), false);
        let store = StudyStore::in_memory();
        store.create_or_load("a", "TPE", "Median").unwrap();
        store.create_or_load("b", "Random", "None").unwrap();
        let orchestrator = f.orchestrator.with_store(store);

        let names: Vec<_> = orchestrator
            .view_studies()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names.len(), 2);

        orchestrator.delete_studies(&["a"]).await.unwrap();
        let remaining = orchestrator.view_studies().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "b");
        assert!(remaining[0].best_trial.is_none());
    }

    struct NamingRenderer {
        rendered: Mutex<Vec<PlotKind>>,
    }

    #[async_trait]
    impl ReportRenderer for NamingRenderer {
        async fn render(
            &self,
            kind: PlotKind,
            _: &[FrozenTrial],
            path: &Path,
        ) -> HpoResult<PathBuf> {
            self.rendered.lock().push(kind);
            tokio::fs::write(path, b"png").await?;
            Ok(path.to_path_buf())
        }
    }

    #[tokio::test]
    async fn report_is_written_once() {
        let f = fixture(Vec::new(), false);
        let store = StudyStore::in_memory();
        store.create_or_load("s1", "TPE", "Median").unwrap();
        let orchestrator = f.orchestrator.with_store(store);
        let renderer = NamingRenderer {
            rendered: Mutex::new(Vec::new()),
        };

        let outcome = orchestrator.generate_report("s1", &renderer).await.unwrap();
        assert_eq!(outcome.plots.len(), 4);
        assert!(outcome.dir.ends_with("report/s1"));
        assert!(outcome.best.is_none());

        let err = orchestrator.generate_report("s1", &renderer).await.unwrap_err();
        assert!(matches!(err, HpoError::Study(StudyError::ReportExists { .. })));
        assert_eq!(renderer.rendered.lock().len(), 4);
    }

    #[tokio::test]
    async fn report_writes_plot_data_files() {
        let f = fixture(Vec::new(), false);
        let store = StudyStore::in_memory();
        store.create_or_load("s1", "TPE", "Median").unwrap();
        let orchestrator = f.orchestrator.with_store(store);

        let outcome = orchestrator
            .generate_report("s1", &crate::PlotDataRenderer)
            .await
            .unwrap();

        assert_eq!(outcome.plots.len(), 4);
        assert!(outcome.plots[0].ends_with("report/s1/contour_plot.json"));
        assert!(outcome.plots.iter().all(|p| p.is_file()));
    }

    struct CurveTrainer;

    struct CurveModel(TrainingHistory);

    impl TrainedModel for CurveModel {
        fn history(&self) -> &TrainingHistory {
            &self.0
        }

        fn predict_energies(&self, structures: &[Structure]) -> HpoResult<Vec<f64>> {
            Ok(structures.iter().map(|s| s.energy).collect())
        }
    }

    impl Trainer for CurveTrainer {
        fn train(
            &self,
            config: &TrainingConfig,
            callback: &mut dyn EpochCallback,
        ) -> HpoResult<Box<dyn TrainedModel>> {
            let layers = config
                .get("model.num_layers")
                .and_then(|v| v.as_f64())
                .unwrap_or(1.0);
            let mut history = TrainingHistory::new();
            for epoch in 0..3 {
                let metrics = EpochMetrics::from([
                    (PRUNING_METRIC.to_string(), 1.0 / (epoch as f64 + 1.0)),
                    (VALIDATION_METRIC.to_string(), 0.1 * layers),
                ]);
                callback.on_epoch_end(epoch, &metrics)?;
                history.push(metrics);
            }
            Ok(Box::new(CurveModel(history)))
        }
    }

    struct NoData;

    impl DatasetReader for NoData {
        fn read(&self, path: &Path) -> HpoResult<Vec<Structure>> {
            Err(HpoError::Internal(format!("unexpected read of {}", path.display())))
        }
    }

    #[tokio::test]
    async fn local_tuning_runs_every_trial() {
        let f = fixture(Vec::new(), false);
        let mut settings = TuneSettings::new("local", "train.lmdb");
        settings.n_trials = 3;
        settings.sampler = "Random".into();
        settings.pruner = "None".into();
        settings.evaluator.fixed =
            ParamMap::from([("num_layers".to_string(), ParameterValue::Int(8))]);

        let report = f
            .orchestrator
            .tune(&settings, Arc::new(CurveTrainer), &NoData)
            .await
            .unwrap();

        assert_eq!(report.complete, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(*f.queue.queries.lock(), 0);
    }

    #[tokio::test]
    async fn shared_tuning_needs_backend_settings() {
        let f = fixture(Vec::new(), false);
        let mut settings = TuneSettings::new("shared", "train.lmdb");
        settings.with_db = true;

        let err = f
            .orchestrator
            .tune(&settings, Arc::new(CurveTrainer), &NoData)
            .await
            .unwrap_err();
        assert!(matches!(err, HpoError::Config(ConfigError::MissingKey { .. })));
    }
}
