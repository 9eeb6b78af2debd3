//! Structured logging setup
//!
//! Installs a `tracing-subscriber` registry with an env filter and either a
//! JSON or plain-text formatter. `RUST_LOG` takes precedence over the
//! configured level.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Logging error types
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("Initialization error: {0}")]
    InitError(String),
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, e.g. `info` or `chatflow=debug`
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Human-readable lines
    #[default]
    Text,
}

/// Build the env filter, preferring `RUST_LOG` when set.
fn build_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives),
        _ => EnvFilter::try_new(level),
    };
    filter.map_err(|e| LoggingError::InvalidFilter(e.to_string()))
}

/// Initialize logging with the given configuration
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let env_filter = build_filter(&config.level)?;

    // Logs go to stderr so the `chat` command keeps stdout for answers.
    let result = match config.format {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };
    result.map_err(|e| LoggingError::InitError(e.to_string()))?;

    info!(level = %config.level, format = ?config.format, "logging initialized");
    Ok(())
}
