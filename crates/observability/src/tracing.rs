//! Tracing/logging initialization.

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Environment variable selecting the output format (`json` or `pretty`).
pub const LOG_FORMAT_ENV: &str = "COURIER_LOG_FORMAT";

#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("invalid log filter {filter:?}: {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("unknown log format: {0}")]
    UnknownFormat(String),

    #[error("a global subscriber is already installed")]
    AlreadyInitialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line (production default).
    #[default]
    Json,
    /// Human-readable multi-line output for local runs.
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = ObservabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(ObservabilityError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directives, e.g. `info,courier_infra=debug`.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl LogConfig {
    /// `RUST_LOG` and `COURIER_LOG_FORMAT`, falling back to defaults when
    /// unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            filter: std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or(defaults.filter),
            format: std::env::var(LOG_FORMAT_ENV)
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.format),
        }
    }

    fn env_filter(&self) -> Result<EnvFilter, ObservabilityError> {
        EnvFilter::try_new(&self.filter).map_err(|e| ObservabilityError::InvalidFilter {
            filter: self.filter.clone(),
            reason: e.to_string(),
        })
    }
}

/// Install the global subscriber described by `config`.
pub fn try_init(config: &LogConfig) -> Result<(), ObservabilityError> {
    let filter = config.env_filter()?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
    installed.map_err(|_| ObservabilityError::AlreadyInitialized)
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops). An invalid
/// filter falls back to `info`.
pub fn init(config: &LogConfig) {
    let config = match config.env_filter() {
        Ok(_) => config.clone(),
        Err(_) => LogConfig {
            format: config.format,
            ..LogConfig::default()
        },
    };
    let _ = try_init(&config);
}
