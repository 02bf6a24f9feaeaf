use thiserror::Error;

/// Main error type for the HPO coordinator
#[derive(Error, Debug)]
pub enum HpoError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Study error: {0}")]
    Study(#[from] StudyError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Trial error: {0}")]
    Trial(#[from] TrialError),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HpoError {
    /// Errors that belong to a single trial. The optimization loop records
    /// these on the trial and moves on; everything else aborts the run.
    pub fn is_trial_scoped(&self) -> bool {
        matches!(self, HpoError::Trial(_))
    }

    /// True when the trial was stopped by the pruner rather than failing.
    pub fn is_pruned(&self) -> bool {
        matches!(self, HpoError::Trial(TrialError::Pruned { .. }))
    }
}

/// Startup configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration key: {key}")]
    MissingKey { key: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown sampler: {name} (expected one of {expected})")]
    UnknownSampler { name: String, expected: String },

    #[error("Unknown pruner: {name} (expected one of {expected})")]
    UnknownPruner { name: String, expected: String },

    #[error("Feature not available in this build: {feature}")]
    FeatureUnavailable { feature: String },
}

/// Study and storage errors
#[derive(Error, Debug)]
pub enum StudyError {
    #[error("Study not found: {name}")]
    NotFound { name: String },

    #[error("Trial not found: {trial_id}")]
    TrialNotFound { trial_id: String },

    #[error("Trial {number} already finished as {state}")]
    TrialAlreadyFinished { number: u64, state: String },

    #[error("Report directory already exists: {path}")]
    ReportExists { path: String },

    #[error("Storage backend failed: {message}")]
    Storage { message: String },
}

/// Batch queue and job lifecycle errors
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job template for {job} not found at {path}")]
    TemplateMissing { job: String, path: String },

    #[error("Job template for {job} declares name {declared:?}")]
    TemplateNameMismatch { job: String, declared: Option<String> },

    #[error("More than 1 {job} job running ({count} found) - aborting")]
    AmbiguousSingleton { job: String, count: usize },

    #[error("Job {job} did not start within {waited_secs} seconds")]
    StartTimeout { job: String, waited_secs: u64 },

    #[error("Job {job} disappeared from the queue after submission")]
    Vanished { job: String },

    #[error("Invalid job parameter {key}: {message}")]
    InvalidParameter { key: String, message: String },

    #[error("Job submission failed for {job}: {message}")]
    Submission { job: String, message: String },

    #[error("Queue status query failed: {message}")]
    StatusQuery { message: String },
}

/// Errors scoped to a single trial
#[derive(Error, Debug)]
pub enum TrialError {
    #[error("Unsupported parameter kind for {name}: {found}")]
    UnsupportedParameterKind { name: String, found: String },

    #[error("Invalid distribution for {name}: {message}")]
    InvalidDistribution { name: String, message: String },

    #[error("Parameter {name} is not part of the grid search space")]
    ParameterOutsideGrid { name: String },

    #[error("Parameter {name} was already suggested with a different distribution")]
    DistributionChanged { name: String },

    #[error("Fixed trial has no value for parameter {name}")]
    MissingFixedParameter { name: String },

    #[error("Trial pruned at step {step}")]
    Pruned { step: u64 },

    #[error("Metric {metric} was not recorded by the trainer")]
    MissingMetric { metric: String },

    #[error("Prediction count {predicted} does not match target count {expected}")]
    PredictionMismatch { predicted: usize, expected: usize },

    #[error("Training failed: {message}")]
    Training { message: String },
}

/// Result type alias for HPO operations
pub type HpoResult<T> = Result<T, HpoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = JobError::AmbiguousSingleton {
            job: "mysql".to_string(),
            count: 2,
        };

        assert!(error.to_string().contains("More than 1 mysql job"));
        assert!(error.to_string().contains("2 found"));
    }

    #[test]
    fn test_error_conversion() {
        let trial_error = TrialError::Training {
            message: "nan loss".to_string(),
        };
        let err: HpoError = trial_error.into();

        assert!(err.is_trial_scoped());
        assert!(!err.is_pruned());
    }

    #[test]
    fn test_pruned_is_trial_scoped() {
        let err: HpoError = TrialError::Pruned { step: 12 }.into();
        assert!(err.is_trial_scoped());
        assert!(err.is_pruned());
    }

    #[test]
    fn test_config_errors_are_fatal() {
        let err: HpoError = ConfigError::MissingKey {
            key: "MYSQL_PASSWORD".to_string(),
        }
        .into();
        assert!(!err.is_trial_scoped());
        assert!(err.to_string().contains("MYSQL_PASSWORD"));
    }
}
