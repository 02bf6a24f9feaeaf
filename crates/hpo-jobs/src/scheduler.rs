//! Submitting named jobs with parameters.

use hpo_types::{HpoResult, JobError, ParamMap};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::monitor::{JobMonitor, WaitPolicy};
use crate::queue::{BatchQueue, JobRecord};
use crate::template::JobTemplates;

/// Variables handed to a job script, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParams {
    entries: Vec<(String, String)>,
}

impl JobParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, replacing any earlier value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        let key = key.into();
        let value = value.to_string();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    /// Add every parameter under `<prefix><name>`.
    pub fn extend_prefixed(&mut self, prefix: &str, params: &ParamMap) {
        for (name, value) in params {
            self.insert(format!("{prefix}{name}"), value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `k=v,k=v` as passed to `qsub -v`. `None` when there are no variables.
    pub fn to_vars(&self) -> HpoResult<Option<String>> {
        if self.entries.is_empty() {
            return Ok(None);
        }
        let mut pairs = Vec::with_capacity(self.entries.len());
        for (key, value) in &self.entries {
            if key.is_empty() || key.contains([',', '=']) || key.contains(char::is_whitespace) {
                return Err(JobError::InvalidParameter {
                    key: key.clone(),
                    message: "keys must be non-empty without ',', '=' or whitespace".into(),
                }
                .into());
            }
            if value.contains(',') {
                return Err(JobError::InvalidParameter {
                    key: key.clone(),
                    message: format!("value {value:?} contains ','"),
                }
                .into());
            }
            pairs.push(format!("{key}={value}"));
        }
        Ok(Some(pairs.join(",")))
    }
}

#[derive(Clone)]
pub struct JobScheduler {
    queue: Arc<dyn BatchQueue>,
    templates: JobTemplates,
    monitor: JobMonitor,
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("templates", &self.templates)
            .field("monitor", &self.monitor)
            .finish()
    }
}

impl JobScheduler {
    pub fn new(queue: Arc<dyn BatchQueue>, templates: JobTemplates, policy: WaitPolicy) -> Self {
        let monitor = JobMonitor::new(queue.clone(), templates.clone(), policy);
        Self {
            queue,
            templates,
            monitor,
        }
    }

    pub fn monitor(&self) -> &JobMonitor {
        &self.monitor
    }

    pub fn templates(&self) -> &JobTemplates {
        &self.templates
    }

    /// Submit one job and return the queue's acknowledgement. Does not wait
    /// for the job to start.
    pub async fn schedule(&self, name: &str, params: &JobParams) -> HpoResult<String> {
        let script = self.templates.validate(name).await?;
        let vars = params.to_vars()?;
        let ack = self.queue.submit(&script, vars.as_deref()).await?;
        info!(job = %name, ack = %ack, n_vars = params.len(), "job queued");
        Ok(ack)
    }

    /// Submit `n_jobs` identical jobs.
    pub async fn fan_out(
        &self,
        name: &str,
        n_jobs: usize,
        params: &JobParams,
    ) -> HpoResult<Vec<String>> {
        let mut acks = Vec::with_capacity(n_jobs);
        for _ in 0..n_jobs {
            acks.push(self.schedule(name, params).await?);
        }
        Ok(acks)
    }

    pub async fn ensure_running(&self, name: &str) -> HpoResult<JobRecord> {
        self.monitor.ensure_running(name).await
    }
}
