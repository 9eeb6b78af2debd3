//! Configuration loading
//!
//! A single JSON5 file holds engine tuning, logging, history storage and the
//! flow definitions. Every section is optional.
//!
//! ```json5
//! {
//!   engine: { default_delay_ms: 0, max_jump_chain: 25, idle_timeout_ms: 300000 },
//!   logging: { level: "info", format: "text" },
//!   history: { path: "history.json" },
//!   flows: [
//!     { id: "hola", trigger: { type: "keywords", keywords: ["hola"] },
//!       steps: [{ type: "answer", text: "Buenas!" }] },
//!   ],
//! }
//! ```

use crate::flows::FlowDefinition;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable holding the config file path
pub const CONFIG_ENV: &str = "CHATFLOW_CONFIG";

/// Default maximum number of jumps followed for one inbound message
pub const DEFAULT_MAX_JUMP_CHAIN: usize = 25;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {message}", path.display())]
    Io { path: PathBuf, message: String },

    #[error("failed to parse config {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("invalid config value {path}: {message}")]
    Invalid { path: String, message: String },
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Dispatcher tuning
    pub engine: EngineConfig,
    /// Logging setup
    pub logging: LoggingConfig,
    /// History storage
    pub history: HistoryConfig,
    /// Flow definitions
    pub flows: Vec<FlowDefinition>,
}

/// Dispatcher tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Pause after each answer unless the step sets its own (0 = none)
    pub default_delay_ms: u64,
    /// Jumps allowed while handling one inbound message
    pub max_jump_chain: usize,
    /// Reset a conversation left waiting on a capture this long (unset = never)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
    /// Maximum pending events per sender (unset = unbounded)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_queue_depth: Option<usize>,
    /// Recent inputs remembered per conversation
    pub input_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_delay_ms: 0,
            max_jump_chain: DEFAULT_MAX_JUMP_CHAIN,
            idle_timeout_ms: None,
            max_queue_depth: None,
            input_window: crate::flows::state::DEFAULT_INPUT_WINDOW,
        }
    }
}

impl EngineConfig {
    pub fn default_delay(&self) -> Option<Duration> {
        (self.default_delay_ms > 0).then(|| Duration::from_millis(self.default_delay_ms))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Set the default inter-step delay
    pub fn with_default_delay_ms(mut self, ms: u64) -> Self {
        self.default_delay_ms = ms;
        self
    }

    /// Set the jump chain limit
    pub fn with_max_jump_chain(mut self, max: usize) -> Self {
        self.max_jump_chain = max;
        self
    }

    /// Set the idle timeout
    pub fn with_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = Some(ms);
        self
    }

    /// Set the per-sender queue limit
    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = Some(depth);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_jump_chain == 0 {
            return Err(ConfigError::Invalid {
                path: "engine.max_jump_chain".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_queue_depth == Some(0) {
            return Err(ConfigError::Invalid {
                path: "engine.max_queue_depth".to_string(),
                message: "must be at least 1 when set".to_string(),
            });
        }
        Ok(())
    }
}

/// History storage configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// JSON file for history; in-memory when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Resolve the config file path: explicit argument, then `CHATFLOW_CONFIG`,
/// then `<config dir>/chatflow/chatflow.json5`.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("chatflow")
        .join("chatflow.json5")
}

/// Parse configuration from JSON5 text
pub fn parse_config(raw: &str, path: &Path) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = json5::from_str(raw).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    config.engine.validate()?;
    Ok(config)
}

/// Load configuration from a file
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let mut config = parse_config(&raw, path)?;

    // A relative history path is relative to the config file.
    if let (Some(history), Some(dir)) = (config.history.path.take(), path.parent()) {
        config.history.path = Some(if history.is_relative() {
            dir.join(history)
        } else {
            history
        });
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_engine_defaults() {
        let engine = EngineConfig::default();
        assert_eq!(engine.max_jump_chain, DEFAULT_MAX_JUMP_CHAIN);
        assert_eq!(engine.default_delay(), None);
        assert_eq!(engine.idle_timeout(), None);
        assert!(engine.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let raw = r#"{
            // comments are allowed
            engine: { default_delay_ms: 20, idle_timeout_ms: 100, max_queue_depth: 8 },
            logging: { level: "debug", format: "json" },
            flows: [
                { id: "hola", trigger: { type: "keywords", keywords: ["hola"] },
                  steps: [{ type: "answer", text: "Buenas!" }] },
            ],
        }"#;
        let config = parse_config(raw, Path::new("test.json5")).unwrap();

        assert_eq!(config.engine.default_delay(), Some(Duration::from_millis(20)));
        assert_eq!(config.engine.idle_timeout(), Some(Duration::from_millis(100)));
        assert_eq!(config.engine.max_queue_depth, Some(8));
        assert_eq!(config.engine.max_jump_chain, DEFAULT_MAX_JUMP_CHAIN);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.flows.len(), 1);
    }

    #[test]
    fn test_parse_empty_config() {
        let config = parse_config("{}", Path::new("empty.json5")).unwrap();
        assert!(config.flows.is_empty());
        assert_eq!(config.history.path, None);
    }

    #[test]
    fn test_parse_rejects_zero_jump_chain() {
        let err = parse_config("{ engine: { max_jump_chain: 0 } }", Path::new("x.json5"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_parse_error_reports_path() {
        let err = parse_config("{ engine: ", Path::new("broken.json5")).unwrap_err();
        assert!(err.to_string().contains("broken.json5"));
    }

    #[test]
    fn test_load_config_resolves_history_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("chatflow.json5");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{{ history: {{ path: \"history.json\" }} }}").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.history.path, Some(dir.path().join("history.json")));
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Path::new("/nonexistent/chatflow.json5")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_resolve_explicit_path() {
        let path = resolve_config_path(Some(Path::new("flows.json5")));
        assert_eq!(path, PathBuf::from("flows.json5"));
    }
}
