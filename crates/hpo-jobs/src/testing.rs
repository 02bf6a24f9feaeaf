//! Scripted queue used by the unit tests.

use async_trait::async_trait;
use hpo_types::HpoResult;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::queue::{BatchQueue, JobRecord, JobStatus};

pub fn job(id: &str, name: &str, status: &str) -> JobRecord {
    JobRecord {
        id: id.to_string(),
        username: "alice".into(),
        queue: "inferno".into(),
        name: name.to_string(),
        session_id: "--".into(),
        nodes: "1".into(),
        tasks: "4".into(),
        memory: "8gb".into(),
        requested_time: "12:00".into(),
        status: JobStatus::parse(status),
        elapsed: "--".into(),
        node: if status == "R" {
            "node042/0".into()
        } else {
            "--".into()
        },
    }
}

/// Answers queries from a script of listings; the last listing repeats.
pub struct FakeQueue {
    listings: Mutex<VecDeque<Vec<JobRecord>>>,
    submissions: Mutex<Vec<(PathBuf, Option<String>)>>,
    queries: Mutex<usize>,
}

impl FakeQueue {
    pub fn new(listings: Vec<Vec<JobRecord>>) -> Self {
        Self {
            listings: Mutex::new(listings.into()),
            submissions: Mutex::new(Vec::new()),
            queries: Mutex::new(0),
        }
    }

    pub fn submissions(&self) -> Vec<(PathBuf, Option<String>)> {
        self.submissions.lock().clone()
    }

    pub fn queries(&self) -> usize {
        *self.queries.lock()
    }
}

#[async_trait]
impl BatchQueue for FakeQueue {
    async fn query(&self) -> HpoResult<Vec<JobRecord>> {
        *self.queries.lock() += 1;
        let mut listings = self.listings.lock();
        let listing = if listings.len() > 1 {
            listings.pop_front().unwrap_or_default()
        } else {
            listings.front().cloned().unwrap_or_default()
        };
        Ok(listing)
    }

    async fn submit(&self, script: &Path, variables: Option<&str>) -> HpoResult<String> {
        let mut submissions = self.submissions.lock();
        submissions.push((script.to_path_buf(), variables.map(str::to_string)));
        Ok(format!("{}.sched-host", 1000 + submissions.len()))
    }
}
