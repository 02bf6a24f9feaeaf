//! Startup configuration, assembled once from a key/value map.

use hpo_jobs::WaitPolicy;
use hpo_study::ConnectionSettings;
use hpo_types::{ConfigError, HpoResult, ParamMap, parse_value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TEMPLATES_DIR: &str = "jobs";
pub const DEFAULT_REPORT_DIR: &str = "report";
pub const DEFAULT_BACKEND_JOB: &str = "mysql";
pub const DEFAULT_TRIAL_JOB: &str = "tune-amptorch-hyperparams";
/// Prefix of job variables carrying fixed parameter overrides.
pub const PARAM_PREFIX: &str = "param_";

const CONNECTION_KEYS: [&str; 4] = ["MYSQL_USERNAME", "MYSQL_PASSWORD", "MYSQL_NODE", "HPOPT_DB"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HpoConfig {
    /// `None` when no backend keys are set; only queue operations work then.
    pub connection: Option<ConnectionSettings>,
    pub job_templates: PathBuf,
    pub queue_user: String,
    pub wait: WaitPolicy,
    pub report_dir: PathBuf,
    pub backend_job: String,
    pub trial_job: String,
}

impl HpoConfig {
    pub fn from_env() -> HpoResult<Self> {
        let values: HashMap<String, String> = std::env::vars().collect();
        Ok(Self::from_map(&values)?)
    }

    pub fn from_map(values: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let connection = if CONNECTION_KEYS.iter().any(|key| values.contains_key(*key)) {
            Some(ConnectionSettings::from_map(values)?)
        } else {
            None
        };

        let defaults = WaitPolicy::default();
        let wait = WaitPolicy {
            poll_interval: seconds(values, "HPO_POLL_SECS")?.unwrap_or(defaults.poll_interval),
            settle_delay: seconds(values, "HPO_SETTLE_SECS")?.unwrap_or(defaults.settle_delay),
            max_wait: seconds(values, "HPO_MAX_WAIT_SECS")?.unwrap_or(defaults.max_wait),
        };

        Ok(Self {
            connection,
            job_templates: path_or(values, "HPO_JOB_TEMPLATES", DEFAULT_TEMPLATES_DIR),
            queue_user: values
                .get("USER")
                .cloned()
                .ok_or_else(|| ConfigError::MissingKey { key: "USER".into() })?,
            wait,
            report_dir: path_or(values, "HPO_REPORT_DIR", DEFAULT_REPORT_DIR),
            backend_job: string_or(values, "HPO_BACKEND_JOB", DEFAULT_BACKEND_JOB),
            trial_job: string_or(values, "HPO_TRIAL_JOB", DEFAULT_TRIAL_JOB),
        })
    }
}

fn string_or(values: &HashMap<String, String>, key: &str, default: &str) -> String {
    values
        .get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

fn path_or(values: &HashMap<String, String>, key: &str, default: &str) -> PathBuf {
    PathBuf::from(string_or(values, key, default))
}

fn seconds(values: &HashMap<String, String>, key: &str) -> Result<Option<Duration>, ConfigError> {
    let Some(raw) = values.get(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(|secs| Some(Duration::from_secs(secs)))
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("not a whole number of seconds: {raw}"),
        })
}

/// Fixed overrides a worker job was launched with, read back from its
/// `param_*` variables.
pub fn overrides_from_vars(values: &HashMap<String, String>) -> Result<ParamMap, ConfigError> {
    let mut params = ParamMap::new();
    for (key, raw) in values {
        let Some(name) = key.strip_prefix(PARAM_PREFIX) else {
            continue;
        };
        let value = parse_value(raw).ok_or_else(|| ConfigError::InvalidValue {
            key: key.clone(),
            message: format!("not a number: {raw}"),
        })?;
        params.insert(name.to_string(), value);
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpo_types::ParameterValue;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_without_backend_keys() {
        let config = HpoConfig::from_map(&map(&[("USER", "alice")])).unwrap();

        assert!(config.connection.is_none());
        assert_eq!(config.job_templates, PathBuf::from("jobs"));
        assert_eq!(config.report_dir, PathBuf::from("report"));
        assert_eq!(config.backend_job, "mysql");
        assert_eq!(config.trial_job, DEFAULT_TRIAL_JOB);
        assert_eq!(config.wait, WaitPolicy::default());
    }

    #[test]
    fn wait_overrides_and_connection() {
        let config = HpoConfig::from_map(&map(&[
            ("USER", "alice"),
            ("MYSQL_USERNAME", "hpo"),
            ("MYSQL_PASSWORD", "secret"),
            ("MYSQL_NODE", "node001"),
            ("HPOPT_DB", "studies"),
            ("HPO_POLL_SECS", "1"),
            ("HPO_MAX_WAIT_SECS", "60"),
            ("HPO_BACKEND_JOB", "postgres"),
        ]))
        .unwrap();

        let connection = config.connection.unwrap();
        assert_eq!(connection.host, "node001");
        assert_eq!(config.wait.poll_interval, Duration::from_secs(1));
        assert_eq!(config.wait.settle_delay, WaitPolicy::default().settle_delay);
        assert_eq!(config.wait.max_wait, Duration::from_secs(60));
        assert_eq!(config.backend_job, "postgres");
    }

    #[test]
    fn partial_backend_keys_are_an_error() {
        let err = HpoConfig::from_map(&map(&[("USER", "alice"), ("MYSQL_NODE", "node001")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { .. }));
    }

    #[test]
    fn bad_seconds_are_rejected() {
        let err = HpoConfig::from_map(&map(&[("USER", "alice"), ("HPO_SETTLE_SECS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("HPO_SETTLE_SECS"));
    }

    #[test]
    fn overrides_are_read_back_from_job_variables() {
        let params = overrides_from_vars(&map(&[
            ("param_num_layers", "8"),
            ("param_lr", "0.001"),
            ("study", "s1"),
        ]))
        .unwrap();

        assert_eq!(params.len(), 2);
        assert_eq!(params["num_layers"], ParameterValue::Int(8));
        assert_eq!(params["lr"], ParameterValue::Float(0.001));
    }
}
