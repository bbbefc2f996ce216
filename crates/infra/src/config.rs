//! Per-service configuration for the outbox relay and recurring jobs.
//!
//! Values come from JSON (`ServiceConfig::from_json`) or from environment
//! variables (`ServiceConfig::from_env`). Missing values fall back to defaults;
//! malformed values are errors.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Job type under which the outbox relay registers with the scheduler.
pub const OUTBOX_RELAY_JOB_TYPE: &str = "OutboxRelay";

/// Default name of the relay's recurring job.
pub const OUTBOX_RELAY_JOB_NAME: &str = "ProcessOutboxMessages";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Outbox relay settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxOptions {
    /// Seconds between relay cycles.
    pub interval_in_seconds: u64,
    /// Publish retries per message within one cycle (transport-level budget).
    pub retry_count: u32,
    /// Maximum number of messages selected per cycle.
    pub batch_size: usize,
}

impl Default for OutboxOptions {
    fn default() -> Self {
        Self {
            interval_in_seconds: 10,
            retry_count: 3,
            batch_size: 20,
        }
    }
}

impl OutboxOptions {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_in_seconds)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_in_seconds == 0 {
            return Err(ConfigError::Invalid(
                "outbox interval_in_seconds must be positive".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "outbox batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// A `{Name, Type, IntervalInSeconds}` triple declaring one recurring job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub interval_in_seconds: u64,
}

impl JobDefinition {
    pub fn new(
        name: impl Into<String>,
        job_type: impl Into<String>,
        interval_in_seconds: u64,
    ) -> Self {
        Self {
            name: name.into(),
            job_type: job_type.into(),
            interval_in_seconds,
        }
    }

    /// The relay job, ticking at the outbox interval.
    pub fn outbox_relay(options: &OutboxOptions) -> Self {
        Self::new(
            OUTBOX_RELAY_JOB_NAME,
            OUTBOX_RELAY_JOB_TYPE,
            options.interval_in_seconds,
        )
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_in_seconds)
    }
}

/// Complete configuration of one service's event delivery subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Database schema holding this service's outbox and consumer tables.
    pub schema: String,
    #[serde(default)]
    pub outbox: OutboxOptions,
    /// Recurring jobs. Empty means "just the outbox relay".
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,
}

impl ServiceConfig {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            outbox: OutboxOptions::default(),
            jobs: Vec::new(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::InvalidValue {
            key: "config".to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `{PREFIX}_SCHEMA`, `{PREFIX}_OUTBOX_INTERVAL_IN_SECONDS`,
    /// `{PREFIX}_OUTBOX_RETRY_COUNT`, `{PREFIX}_OUTBOX_BATCH_SIZE` and
    /// `{PREFIX}_JOBS` (a JSON array of job definitions).
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(prefix, |key| std::env::var(key).ok())
    }

    fn from_lookup(
        prefix: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let key = |name: &str| format!("{prefix}_{name}");
        let defaults = OutboxOptions::default();

        let schema = lookup(&key("SCHEMA")).unwrap_or_else(|| prefix.to_ascii_lowercase());
        let outbox = OutboxOptions {
            interval_in_seconds: parse_var(&lookup, &key("OUTBOX_INTERVAL_IN_SECONDS"))?
                .unwrap_or(defaults.interval_in_seconds),
            retry_count: parse_var(&lookup, &key("OUTBOX_RETRY_COUNT"))?
                .unwrap_or(defaults.retry_count),
            batch_size: parse_var(&lookup, &key("OUTBOX_BATCH_SIZE"))?
                .unwrap_or(defaults.batch_size),
        };

        let jobs_key = key("JOBS");
        let jobs = match lookup(&jobs_key) {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidValue {
                key: jobs_key,
                reason: e.to_string(),
            })?,
            None => Vec::new(),
        };

        let config = Self {
            schema,
            outbox,
            jobs,
        };
        config.validate()?;
        Ok(config)
    }

    /// Jobs to schedule, defaulting to the outbox relay alone.
    pub fn job_definitions(&self) -> Vec<JobDefinition> {
        if self.jobs.is_empty() {
            vec![JobDefinition::outbox_relay(&self.outbox)]
        } else {
            self.jobs.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema.trim().is_empty() {
            return Err(ConfigError::Invalid("schema must not be empty".to_string()));
        }
        self.outbox.validate()?;

        let mut names = std::collections::HashSet::new();
        for job in &self.jobs {
            if job.interval_in_seconds == 0 {
                return Err(ConfigError::Invalid(format!(
                    "job {} must have a positive interval",
                    job.name
                )));
            }
            if !names.insert(job.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate job name: {}",
                    job.name
                )));
            }
        }
        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}
