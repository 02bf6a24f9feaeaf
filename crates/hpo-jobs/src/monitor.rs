//! Watching the queue for named jobs and keeping singleton jobs alive.

use hpo_types::{HpoResult, JobError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::queue::{BatchQueue, JobRecord, JobStatus};
use crate::template::JobTemplates;

/// How `ensure_running` waits for a job to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitPolicy {
    /// Pause between checks while the job is queued.
    pub poll_interval: Duration,
    /// Pause once a job we submitted starts, so the service inside it can
    /// come up.
    pub settle_delay: Duration,
    /// Give up polling a queued job after waiting this long in total.
    pub max_wait: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            settle_delay: Duration::from_secs(5),
            max_wait: Duration::from_secs(12 * 60 * 60),
        }
    }
}

/// Queue state of a singleton job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Absent,
    Queued(JobRecord),
    Running(JobRecord),
}

#[derive(Clone)]
pub struct JobMonitor {
    queue: Arc<dyn BatchQueue>,
    templates: JobTemplates,
    policy: WaitPolicy,
}

impl std::fmt::Debug for JobMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobMonitor")
            .field("templates", &self.templates)
            .field("policy", &self.policy)
            .finish()
    }
}

impl JobMonitor {
    pub fn new(queue: Arc<dyn BatchQueue>, templates: JobTemplates, policy: WaitPolicy) -> Self {
        Self {
            queue,
            templates,
            policy,
        }
    }

    pub fn policy(&self) -> &WaitPolicy {
        &self.policy
    }

    /// Queued or running jobs, optionally only those called `name`.
    pub async fn status(&self, name: Option<&str>) -> HpoResult<Vec<JobRecord>> {
        let jobs = self.queue.query().await?;
        Ok(jobs
            .into_iter()
            .filter(|job| job.status.is_active())
            .filter(|job| name.map_or(true, |n| job.name == n))
            .collect())
    }

    /// State of a job that must have at most one instance.
    pub async fn classify(&self, name: &str) -> HpoResult<JobState> {
        let mut jobs = self.status(Some(name)).await?;
        if jobs.len() > 1 {
            return Err(JobError::AmbiguousSingleton {
                job: name.to_string(),
                count: jobs.len(),
            }
            .into());
        }
        Ok(match jobs.pop() {
            None => JobState::Absent,
            Some(job) if job.status == JobStatus::Running => JobState::Running(job),
            Some(job) => JobState::Queued(job),
        })
    }

    /// Make sure exactly one instance of `name` is running, submitting it if
    /// needed and waiting until it starts.
    pub async fn ensure_running(&self, name: &str) -> HpoResult<JobRecord> {
        let script = self.templates.validate(name).await?;
        let started = Instant::now();
        let mut submitted = false;

        loop {
            match self.classify(name).await? {
                JobState::Running(job) => {
                    info!(job = %name, id = %job.id, node = %job.node, "job running");
                    if submitted {
                        // Settling is not bounded by max_wait once the job exists.
                        tokio::time::sleep(self.policy.settle_delay).await;
                    }
                    return Ok(job);
                }
                JobState::Queued(job) => {
                    info!(job = %name, id = %job.id, "waiting for job to start");
                    self.pause(name, started, self.policy.poll_interval).await?;
                }
                JobState::Absent if submitted => {
                    return Err(JobError::Vanished {
                        job: name.to_string(),
                    }
                    .into());
                }
                JobState::Absent => {
                    info!(job = %name, "starting job");
                    let ack = self.queue.submit(&script, None).await?;
                    debug!(job = %name, ack = %ack, "submitted");
                    submitted = true;
                }
            }
        }
    }

    async fn pause(&self, name: &str, started: Instant, delay: Duration) -> HpoResult<()> {
        let waited = started.elapsed();
        if waited + delay > self.policy.max_wait {
            return Err(JobError::StartTimeout {
                job: name.to_string(),
                waited_secs: waited.as_secs(),
            }
            .into());
        }
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{job, FakeQueue};
    use hpo_types::HpoError;

    fn monitor(queue: Arc<FakeQueue>, dir: &std::path::Path) -> JobMonitor {
        std::fs::write(dir.join("mysql.pbs"), "#PBS -N mysql\n").unwrap();
        JobMonitor::new(queue, JobTemplates::new(dir), WaitPolicy::default())
    }

    #[tokio::test]
    async fn status_keeps_active_rows_and_filters_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(FakeQueue::new(vec![vec![
            job("1", "mysql", "R"),
            job("2", "tune", "Q"),
            job("3", "tune", "C"),
            job("4", "tune", "H"),
        ]]));
        let monitor = monitor(queue, dir.path());

        assert_eq!(monitor.status(None).await.unwrap().len(), 2);
        let tune = monitor.status(Some("tune")).await.unwrap();
        assert_eq!(tune.len(), 1);
        assert_eq!(tune[0].id, "2");
        assert!(monitor.status(Some("nothing")).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn already_running_returns_without_submitting() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(FakeQueue::new(vec![vec![job("7", "mysql", "R")]]));
        let monitor = monitor(queue.clone(), dir.path());

        let started = Instant::now();
        let record = monitor.ensure_running("mysql").await.unwrap();
        assert_eq!(record.id, "7");
        assert!(queue.submissions().is_empty());
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn absent_job_is_submitted_and_awaited() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(FakeQueue::new(vec![
            vec![],
            vec![job("9", "mysql", "Q")],
            vec![job("9", "mysql", "Q")],
            vec![job("9", "mysql", "R")],
        ]));
        let monitor = monitor(queue.clone(), dir.path());

        let started = Instant::now();
        let record = monitor.ensure_running("mysql").await.unwrap();
        assert_eq!(record.id, "9");
        assert_eq!(queue.submissions().len(), 1);
        assert_eq!(queue.submissions()[0].1, None);
        // two polls, then one settle once running
        assert_eq!(started.elapsed(), Duration::from_secs(10 + 10 + 5));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_singleton_never_submits() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(FakeQueue::new(vec![vec![
            job("1", "mysql", "R"),
            job("2", "mysql", "Q"),
        ]]));
        let monitor = monitor(queue.clone(), dir.path());

        let err = monitor.ensure_running("mysql").await.unwrap_err();
        assert!(matches!(
            err,
            HpoError::Job(JobError::AmbiguousSingleton { count: 2, .. })
        ));
        assert_eq!(
            err.to_string(),
            "Job error: More than 1 mysql job running (2 found) - aborting"
        );
        assert!(queue.submissions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_after_submit_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(FakeQueue::new(vec![vec![]]));
        let monitor = monitor(queue.clone(), dir.path());

        let err = monitor.ensure_running("mysql").await.unwrap_err();
        assert!(matches!(err, HpoError::Job(JobError::Vanished { .. })));
        assert_eq!(queue.submissions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_wait() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mysql.pbs"), "#PBS -N mysql\n").unwrap();
        let queue = Arc::new(FakeQueue::new(vec![vec![job("3", "mysql", "Q")]]));
        let policy = WaitPolicy {
            max_wait: Duration::from_secs(60),
            ..WaitPolicy::default()
        };
        let monitor = JobMonitor::new(queue, JobTemplates::new(dir.path()), policy);

        match monitor.ensure_running("mysql").await {
            Err(HpoError::Job(JobError::StartTimeout { waited_secs, .. })) => {
                assert_eq!(waited_secs, 60)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_near_the_deadline_still_returns_the_job() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mysql.pbs"), "#PBS -N mysql\n").unwrap();
        let queued = || vec![job("5", "mysql", "Q")];
        let queue = Arc::new(FakeQueue::new(vec![
            vec![],
            queued(),
            queued(),
            queued(),
            queued(),
            queued(),
            vec![job("5", "mysql", "R")],
        ]));
        let policy = WaitPolicy {
            poll_interval: Duration::from_secs(10),
            settle_delay: Duration::from_secs(5),
            max_wait: Duration::from_secs(52),
        };
        let monitor = JobMonitor::new(queue.clone(), JobTemplates::new(dir.path()), policy);

        let started = Instant::now();
        let record = monitor.ensure_running("mysql").await.unwrap();

        assert_eq!(record.id, "5");
        assert_eq!(queue.submissions().len(), 1);
        assert_eq!(started.elapsed(), Duration::from_secs(55));
    }

    #[tokio::test]
    async fn invalid_template_stops_before_querying() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(FakeQueue::new(vec![vec![]]));
        let monitor = JobMonitor::new(
            queue.clone(),
            JobTemplates::new(dir.path()),
            WaitPolicy::default(),
        );
        assert!(matches!(
            monitor.ensure_running("mysql").await,
            Err(HpoError::Job(JobError::TemplateMissing { .. }))
        ));
        assert_eq!(queue.queries(), 0);
    }
}
