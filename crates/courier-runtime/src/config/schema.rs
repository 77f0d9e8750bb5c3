//! Configuration schema definitions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use courier_framework::{ConversationConfig, DispatcherConfig};

/// Root configuration structure.
///
/// ```toml
/// [dispatcher]
/// workers = 8
///
/// [conversation]
/// timeout_secs = 300
/// collision = "replace"
///
/// [logging]
/// level = "debug"
/// filters = { courier_framework = "trace" }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourierConfig {
    /// Handler groups and the worker pool.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Defaults for conversations built through the dispatcher.
    #[serde(default)]
    pub conversation: ConversationConfig,

    /// The push queue in front of the dispatch loop.
    #[serde(default)]
    pub intake: IntakeConfig,

    /// Long polling through the bot.
    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

// =============================================================================
// Intake / Polling
// =============================================================================

/// Push-queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// Updates buffered before `try_submit` reports the queue as full.
    #[serde(default = "default_intake_capacity")]
    pub capacity: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            capacity: default_intake_capacity(),
        }
    }
}

fn default_intake_capacity() -> usize {
    1024
}

/// `getUpdates` settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Long-poll timeout passed to the platform.
    #[serde(default = "default_poll_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum updates per request (1-100).
    #[serde(default = "default_poll_limit")]
    pub limit: u32,

    /// Pause after a failed request.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Update types to receive. Empty means the platform default.
    #[serde(default)]
    pub allowed_updates: Vec<String>,
}

impl PollingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_poll_timeout_secs(),
            limit: default_poll_limit(),
            retry_delay_ms: default_retry_delay_ms(),
            allowed_updates: Vec::new(),
        }
    }
}

fn default_poll_timeout_secs() -> u64 {
    10
}

fn default_poll_limit() -> u32 {
    100
}

fn default_retry_delay_ms() -> u64 {
    1000
}

// =============================================================================
// Logging
// =============================================================================

/// Log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Line format of the log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    /// Newline-delimited JSON. Requires the `json-log` feature.
    #[cfg(feature = "json-log")]
    Json,
}

/// Where log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    /// Append to [`LoggingConfig::file_path`].
    File,
}

/// How often the log file is rotated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Minutely,
    Hourly,
    Daily,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpanEventConfig {
    pub new: bool,
    pub enter: bool,
    pub exit: bool,
    pub close: bool,
}

/// Logging settings, consumed by [`crate::logging::init_from_config`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub output: LogOutput,

    /// Log file for [`LogOutput::File`].
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    /// Per-target overrides, e.g. `courier_framework = "trace"`.
    #[serde(default)]
    pub filters: HashMap<String, LogLevel>,

    #[serde(default)]
    pub span_events: SpanEventConfig,

    #[serde(default)]
    pub thread_ids: bool,

    /// Include source file and line.
    #[serde(default)]
    pub file_location: bool,

    #[serde(default)]
    pub rotation: LogRotation,

    /// Rotated files kept on disk. Zero keeps all of them.
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
            output: LogOutput::default(),
            file_path: None,
            filters: HashMap::new(),
            span_events: SpanEventConfig::default(),
            thread_ids: false,
            file_location: false,
            rotation: LogRotation::default(),
            max_files: default_max_files(),
        }
    }
}

fn default_max_files() -> usize {
    5
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_framework::EntryCollision;

    #[test]
    fn test_defaults() {
        let config = CourierConfig::default();
        assert_eq!(config.dispatcher.workers, 4);
        assert_eq!(config.intake.capacity, 1024);
        assert_eq!(config.polling.limit, 100);
        assert_eq!(config.conversation.collision, EntryCollision::Block);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let config: CourierConfig = serde_json::from_value(serde_json::json!({
            "polling": { "limit": 20 },
            "logging": { "level": "debug", "filters": { "courier_framework": "trace" } },
        }))
        .unwrap();

        assert_eq!(config.polling.limit, 20);
        assert_eq!(config.polling.timeout_secs, 10);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(
            config.logging.filters.get("courier_framework"),
            Some(&LogLevel::Trace)
        );
        assert_eq!(config.logging.max_files, 5);
    }
}
