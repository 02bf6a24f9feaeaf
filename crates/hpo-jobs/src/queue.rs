//! PBS queue access: status parsing and job submission.

use async_trait::async_trait;
use hpo_types::{HpoResult, JobError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// Number of whitespace separated columns in a `qstat -n1` job row.
pub const QSTAT_COLUMNS: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    /// Any other PBS state letter (held, exiting, ...).
    Other(String),
}

impl JobStatus {
    pub fn parse(code: &str) -> Self {
        match code {
            "Q" => JobStatus::Queued,
            "R" => JobStatus::Running,
            other => JobStatus::Other(other.to_string()),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn code(&self) -> &str {
        match self {
            JobStatus::Queued => "Q",
            JobStatus::Running => "R",
            JobStatus::Other(code) => code,
        }
    }
}

/// One row of the queue status listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub username: String,
    pub queue: String,
    pub name: String,
    pub session_id: String,
    pub nodes: String,
    pub tasks: String,
    pub memory: String,
    pub requested_time: String,
    pub status: JobStatus,
    pub elapsed: String,
    pub node: String,
}

impl JobRecord {
    fn from_columns(columns: &[&str]) -> Option<Self> {
        let [id, username, queue, name, session_id, nodes, tasks, memory, requested_time, status, elapsed, node] =
            columns
        else {
            return None;
        };
        Some(Self {
            id: id.split('.').next().unwrap_or(*id).to_string(),
            username: username.to_string(),
            queue: queue.to_string(),
            name: name.to_string(),
            session_id: session_id.to_string(),
            nodes: nodes.to_string(),
            tasks: tasks.to_string(),
            memory: memory.to_string(),
            requested_time: requested_time.to_string(),
            status: JobStatus::parse(status),
            elapsed: elapsed.to_string(),
            node: node.to_string(),
        })
    }

    /// Host the job runs on, without the cpu slot suffix (`node042/3` ⇒
    /// `node042`). `None` until the job has been placed.
    pub fn host(&self) -> Option<&str> {
        let host = self.node.split('/').next().unwrap_or_default();
        if host.is_empty() || host == "--" {
            None
        } else {
            Some(host)
        }
    }
}

impl std::fmt::Display for JobRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:<10} {:<24} {:<8} {:<2} {:<9} {}",
            self.id,
            self.name,
            self.queue,
            self.status.code(),
            self.elapsed,
            self.node
        )
    }
}

/// Parse `qstat -u <user> -n1` output. Only rows starting with a digit are
/// job rows; anything else is header or decoration.
pub fn parse_qstat(output: &str) -> Vec<JobRecord> {
    output
        .lines()
        .filter(|line| line.starts_with(|c: char| c.is_ascii_digit()))
        .filter_map(|line| {
            let columns: Vec<&str> = line.split_whitespace().collect();
            let record = JobRecord::from_columns(&columns);
            if record.is_none() {
                debug!(columns = columns.len(), expected = QSTAT_COLUMNS, "skipping malformed qstat row: {line}");
            }
            record
        })
        .collect()
}

/// The external batch queue.
#[async_trait]
pub trait BatchQueue: Send + Sync {
    /// Every job of the configured user, in any state.
    async fn query(&self) -> HpoResult<Vec<JobRecord>>;

    /// Submit a job script with optional `k=v,k=v` variables. Returns the
    /// queue's acknowledgement (normally the job id).
    async fn submit(&self, script: &Path, variables: Option<&str>) -> HpoResult<String>;
}

/// `qsub` / `qstat` command line client.
#[derive(Debug, Clone)]
pub struct PbsQueue {
    user: String,
}

impl PbsQueue {
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }

    pub fn user(&self) -> &str {
        &self.user
    }
}

#[async_trait]
impl BatchQueue for PbsQueue {
    async fn query(&self) -> HpoResult<Vec<JobRecord>> {
        let output = Command::new("qstat")
            .args(["-u", &self.user, "-n1"])
            .output()
            .await
            .map_err(|e| JobError::StatusQuery {
                message: format!("failed to run qstat: {e}"),
            })?;
        if !output.status.success() {
            return Err(JobError::StatusQuery {
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(parse_qstat(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn submit(&self, script: &Path, variables: Option<&str>) -> HpoResult<String> {
        let job = script
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut cmd = Command::new("qsub");
        cmd.arg(script);
        if let Some(vars) = variables.filter(|v| !v.is_empty()) {
            cmd.arg("-v").arg(vars);
        }
        debug!(?cmd, "submitting job");

        let output = cmd.output().await.map_err(|e| JobError::Submission {
            job: job.clone(),
            message: format!("failed to run qsub: {e}"),
        })?;
        if !output.status.success() {
            return Err(JobError::Submission {
                job,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
