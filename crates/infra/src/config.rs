//! Configuration loading and representation.
//!
//! Everything is read from `LEADFLOW_*` environment variables. Unset variables
//! take their defaults; a set but unparsable variable is an error rather than
//! a silent default.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::tasks::{ExecutorConfig, SchedulerConfig};

pub const BROKER_ENABLED: &str = "LEADFLOW_BROKER_ENABLED";
pub const BROKER_URL: &str = "LEADFLOW_BROKER_URL";
pub const WORKERS: &str = "LEADFLOW_WORKERS";
pub const POLL_INTERVAL_MS: &str = "LEADFLOW_POLL_INTERVAL_MS";
pub const TICK_INTERVAL_SECS: &str = "LEADFLOW_TICK_INTERVAL_SECS";
pub const RUN_RETENTION_HOURS: &str = "LEADFLOW_RUN_RETENTION_HOURS";
pub const RUN_TIMEOUT_SECS: &str = "LEADFLOW_RUN_TIMEOUT_SECS";
pub const MIN_TRAINING_SAMPLES: &str = "LEADFLOW_MIN_TRAINING_SAMPLES";
pub const MODEL_DIR: &str = "LEADFLOW_MODEL_DIR";
pub const MODEL_FAILURE_THRESHOLD: &str = "LEADFLOW_MODEL_FAILURE_THRESHOLD";
/// Prefix of per-task interval overrides, e.g. `LEADFLOW_TASK_INTERVAL_SCORE_REFRESH=3600`.
pub const TASK_INTERVAL_PREFIX: &str = "LEADFLOW_TASK_INTERVAL_";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: `{value}`")]
    Invalid { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeadflowConfig {
    pub broker_enabled: bool,
    pub broker_url: Option<String>,
    pub workers: usize,
    pub poll_interval: Duration,
    pub tick_interval: Duration,
    pub run_retention: Duration,
    pub run_timeout: Duration,
    pub min_training_samples: usize,
    /// `None` keeps model artifacts in memory only.
    pub model_dir: Option<PathBuf>,
    pub model_failure_threshold: u32,
    /// Interval overrides keyed by task name (`score-refresh`, ...).
    pub task_intervals: BTreeMap<String, Duration>,
}

impl Default for LeadflowConfig {
    fn default() -> Self {
        Self {
            broker_enabled: false,
            broker_url: None,
            workers: 4,
            poll_interval: Duration::from_millis(100),
            tick_interval: Duration::from_secs(30),
            run_retention: Duration::from_secs(168 * 3600),
            run_timeout: Duration::from_secs(3600),
            min_training_samples: leadflow_scoring::DEFAULT_MIN_TRAINING_SAMPLES,
            model_dir: None,
            model_failure_threshold: leadflow_scoring::DEFAULT_FAILURE_THRESHOLD,
            task_intervals: BTreeMap::new(),
        }
    }
}

impl LeadflowConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Build from an explicit set of variables; anything not prefixed
    /// `LEADFLOW_` is ignored.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| k.starts_with("LEADFLOW_"))
            .collect();
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let defaults = Self::default();
        let mut task_intervals = BTreeMap::new();
        for (key, value) in &vars {
            if let Some(suffix) = key.strip_prefix(TASK_INTERVAL_PREFIX) {
                let secs: u64 = parse(key, value.trim())?;
                task_intervals.insert(task_name_from_env(suffix), Duration::from_secs(secs));
            }
        }

        Ok(Self {
            broker_enabled: match get(BROKER_ENABLED) {
                Some(v) => parse_bool(BROKER_ENABLED, v)?,
                None => defaults.broker_enabled,
            },
            broker_url: get(BROKER_URL).map(str::to_string),
            workers: get(WORKERS)
                .map(|v| positive(WORKERS, v))
                .transpose()?
                .unwrap_or(defaults.workers),
            poll_interval: get(POLL_INTERVAL_MS)
                .map(|v| parse(POLL_INTERVAL_MS, v).map(Duration::from_millis))
                .transpose()?
                .unwrap_or(defaults.poll_interval),
            tick_interval: get(TICK_INTERVAL_SECS)
                .map(|v| positive(TICK_INTERVAL_SECS, v).map(Duration::from_secs))
                .transpose()?
                .unwrap_or(defaults.tick_interval),
            run_retention: get(RUN_RETENTION_HOURS)
                .map(|v| hours(RUN_RETENTION_HOURS, v))
                .transpose()?
                .unwrap_or(defaults.run_retention),
            run_timeout: get(RUN_TIMEOUT_SECS)
                .map(|v| positive(RUN_TIMEOUT_SECS, v).map(Duration::from_secs))
                .transpose()?
                .unwrap_or(defaults.run_timeout),
            min_training_samples: get(MIN_TRAINING_SAMPLES)
                .map(|v| positive(MIN_TRAINING_SAMPLES, v))
                .transpose()?
                .unwrap_or(defaults.min_training_samples),
            model_dir: get(MODEL_DIR).map(PathBuf::from),
            model_failure_threshold: get(MODEL_FAILURE_THRESHOLD)
                .map(|v| positive(MODEL_FAILURE_THRESHOLD, v))
                .transpose()?
                .unwrap_or(defaults.model_failure_threshold),
            task_intervals,
        })
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            broker_enabled: self.broker_enabled,
            workers: self.workers,
            poll_interval: self.poll_interval,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: self.tick_interval,
            run_timeout: self.run_timeout,
            run_retention: self.run_retention,
        }
    }
}

/// `SCORE_REFRESH` -> `score-refresh`
fn task_name_from_env(suffix: &str) -> String {
    suffix.to_ascii_lowercase().replace('_', "-")
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(key, value))
}

fn positive<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + From<u8>,
{
    let n: T = parse(key, value)?;
    if n == T::from(0) {
        return Err(invalid(key, value));
    }
    Ok(n)
}

fn hours(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(key, value)?
        .checked_mul(3600)
        .map(Duration::from_secs)
        .ok_or_else(|| invalid(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = LeadflowConfig::from_vars([("PATH", "/usr/bin")]).unwrap();
        assert_eq!(config, LeadflowConfig::default());
        assert!(!config.executor_config().broker_enabled);
        assert_eq!(config.min_training_samples, 50);
        assert_eq!(config.scheduler_config().run_retention, Duration::from_secs(168 * 3600));
    }

    #[test]
    fn reads_every_variable() {
        let config = LeadflowConfig::from_vars([
            (BROKER_ENABLED, "true"),
            (BROKER_URL, "redis://localhost:6379"),
            (WORKERS, "8"),
            (POLL_INTERVAL_MS, "250"),
            (TICK_INTERVAL_SECS, "5"),
            (RUN_RETENTION_HOURS, "24"),
            (RUN_TIMEOUT_SECS, "600"),
            (MIN_TRAINING_SAMPLES, "100"),
            (MODEL_DIR, "/var/lib/leadflow/models"),
            (MODEL_FAILURE_THRESHOLD, "3"),
            ("LEADFLOW_TASK_INTERVAL_SNOOZE_EXPIRATION", "600"),
        ])
        .unwrap();

        assert!(config.broker_enabled);
        assert_eq!(config.broker_url.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(config.workers, 8);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.tick_interval, Duration::from_secs(5));
        assert_eq!(config.run_retention, Duration::from_secs(24 * 3600));
        assert_eq!(config.run_timeout, Duration::from_secs(600));
        assert_eq!(config.min_training_samples, 100);
        assert_eq!(config.model_dir, Some(PathBuf::from("/var/lib/leadflow/models")));
        assert_eq!(config.model_failure_threshold, 3);
        assert_eq!(
            config.task_intervals.get("snooze-expiration"),
            Some(&Duration::from_secs(600))
        );
    }

    #[test]
    fn rejects_unparsable_values() {
        let err = LeadflowConfig::from_vars([(BROKER_ENABLED, "maybe")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: BROKER_ENABLED.into(),
                value: "maybe".into()
            }
        );
        assert!(LeadflowConfig::from_vars([(WORKERS, "0")]).is_err());
        assert!(LeadflowConfig::from_vars([("LEADFLOW_TASK_INTERVAL_SCORE_REFRESH", "soon")]).is_err());
    }

    #[test]
    fn rejects_out_of_range_numbers() {
        assert_eq!(
            LeadflowConfig::from_vars([(RUN_RETENTION_HOURS, "10000000000000000")]).unwrap_err(),
            ConfigError::Invalid {
                key: RUN_RETENTION_HOURS.into(),
                value: "10000000000000000".into()
            }
        );
        // Would wrap to 1 if read through a wider type.
        assert!(LeadflowConfig::from_vars([(MODEL_FAILURE_THRESHOLD, "4294967297")]).is_err());

        let config =
            LeadflowConfig::from_vars([(RUN_RETENTION_HOURS, "1000000000000")]).unwrap();
        assert_eq!(config.run_retention, Duration::from_secs(1_000_000_000_000 * 3600));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = LeadflowConfig::from_vars([(BROKER_URL, "  "), (WORKERS, "")]).unwrap();
        assert_eq!(config.broker_url, None);
        assert_eq!(config.workers, 4);
    }
}
