//! # hpo-jobs
//!
//! Client side of the PBS batch queue. Jobs are submitted from named
//! templates, observed through `qstat`, and singleton jobs such as the study
//! database are started on demand and awaited.

mod monitor;
mod queue;
mod scheduler;
mod template;
#[cfg(test)]
mod testing;

pub use monitor::{JobMonitor, JobState, WaitPolicy};
pub use queue::{parse_qstat, BatchQueue, JobRecord, JobStatus, PbsQueue, QSTAT_COLUMNS};
pub use scheduler::{JobParams, JobScheduler};
pub use template::{declared_name, JobTemplates};
