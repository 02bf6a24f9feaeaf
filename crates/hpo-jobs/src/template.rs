//! Job templates: `<dir>/<name>.pbs` scripts that declare their own name.

use hpo_types::{HpoResult, JobError};
use std::path::{Path, PathBuf};

const NAME_DIRECTIVE: &str = "#PBS -N ";

#[derive(Debug, Clone)]
pub struct JobTemplates {
    dir: PathBuf,
}

impl JobTemplates {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, job: &str) -> PathBuf {
        self.dir.join(format!("{job}.pbs"))
    }

    /// Check that the template exists and its `#PBS -N` line names `job`.
    /// Returns the script path.
    pub async fn validate(&self, job: &str) -> HpoResult<PathBuf> {
        let path = self.path(job);
        let script = match tokio::fs::read_to_string(&path).await {
            Ok(script) => script,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JobError::TemplateMissing {
                    job: job.to_string(),
                    path: path.display().to_string(),
                }
                .into())
            }
            Err(e) => return Err(e.into()),
        };

        let declared = declared_name(&script);
        if declared != Some(job) {
            return Err(JobError::TemplateNameMismatch {
                job: job.to_string(),
                declared: declared.map(str::to_string),
            }
            .into());
        }
        Ok(path)
    }
}

/// Name given by the first `#PBS -N` directive of a script.
pub fn declared_name(script: &str) -> Option<&str> {
    script
        .lines()
        .find_map(|line| line.strip_prefix(NAME_DIRECTIVE))
        .map(str::trim)
}
