//! Configuration schema definitions.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use courier_core::ChannelConfig;

/// Root configuration structure.
///
/// ```toml
/// [logging]
/// level = "debug"
///
/// [channels.qqbot]
/// app_id = "102000000"
/// client_secret = "..."
///
/// [channels.feishu]
/// enabled = false
/// app_id = "cli_a1b2c3"
/// app_secret = "..."
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CourierConfig {
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Per-channel settings keyed by channel id.
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
}

impl CourierConfig {
    /// Adds or replaces a channel entry.
    pub fn with_channel(mut self, id: impl Into<String>, config: ChannelConfig) -> Self {
        self.channels.insert(id.into(), config);
        self
    }
}

// =============================================================================
// Logging
// =============================================================================

/// Log verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
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
    /// Returns the level as used in filter directives.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Converts to a [`tracing::Level`].
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

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single line, abbreviated.
    #[default]
    Compact,
    /// Single line with all span fields.
    Full,
    /// Multi-line, human oriented.
    Pretty,
    /// Newline-delimited JSON; requires the `json-log` feature.
    Json,
}

/// Where log lines go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    /// `logging.file_path`, rotated according to `logging.rotation`.
    File,
}

/// Rotation period of file output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Minutely,
    Hourly,
    Daily,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpanEventConfig {
    pub new: bool,
    pub enter: bool,
    pub exit: bool,
    pub close: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base level; `RUST_LOG` takes precedence when set.
    pub level: LogLevel,

    /// Line format.
    pub format: LogFormat,

    /// Destination.
    pub output: LogOutput,

    /// Span lifecycle events.
    pub span_events: SpanEventConfig,

    /// Include thread ids.
    pub thread_ids: bool,

    /// Include source file and line.
    pub file_location: bool,

    /// Log file for `output = "file"`.
    pub file_path: Option<PathBuf>,

    /// Rotation of the log file.
    pub rotation: LogRotation,

    /// Rotated files to keep; 0 keeps all.
    pub max_files: usize,

    /// Per-module levels, e.g. `courier_adapter_qqbot = "trace"`.
    pub filters: BTreeMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            output: LogOutput::Stdout,
            span_events: SpanEventConfig::default(),
            thread_ids: false,
            file_location: false,
            file_path: None,
            rotation: LogRotation::Never,
            max_files: 5,
            filters: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channels_flatten_settings() {
        let config: CourierConfig = serde_json::from_value(serde_json::json!({
            "logging": {"level": "debug", "filters": {"courier_adapter_qqbot": "trace"}},
            "channels": {
                "qqbot": {"app_id": "1", "client_secret": "s"},
                "feishu": {"enabled": false, "app_id": "cli_a"}
            }
        }))
        .unwrap();

        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.filters["courier_adapter_qqbot"], LogLevel::Trace);
        assert_eq!(config.logging.format, LogFormat::Compact);

        let qq = &config.channels["qqbot"];
        assert!(qq.enabled);
        assert_eq!(qq.get_str("client_secret"), Some("s"));
        assert!(!config.channels["feishu"].enabled);
        assert!(config.channels["feishu"].get("enabled").is_none());
    }

    #[test]
    fn test_unknown_log_level_rejected() {
        let parsed = serde_json::from_value::<LoggingConfig>(serde_json::json!({"level": "loud"}));
        assert!(parsed.is_err());
    }
}
