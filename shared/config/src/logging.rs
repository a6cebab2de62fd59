//! Logger configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text lines
    Text,
    /// Structured JSON records
    Json,
}

/// Destination for emitted log lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSink {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
    /// A file path, rotated per the rotation policy
    File { path: PathBuf },
    /// Discard everything; used by tests
    Null,
}

/// Log file rotation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    /// Never rotate
    None,
    /// Rotate once the file exceeds `max_bytes`
    Size { max_bytes: u64 },
    /// Rotate at each local-date change
    Time,
}

/// Logger contract configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LoggerSettings {
    /// Minimum level: trace, debug, info, warn, error
    #[validate(length(min = 1))]
    #[serde(default = "default_level")]
    pub level: String,

    /// Line format
    #[serde(default = "default_format")]
    pub format: LogFormat,

    /// Output sink
    #[serde(default = "default_sink")]
    pub sink: LogSink,

    /// Colorize text output
    #[serde(default)]
    pub colorize: bool,

    /// Capture file/line source locations
    #[serde(default)]
    pub source_location: bool,

    /// File rotation policy; ignored for non-file sinks
    #[serde(default = "default_rotation")]
    pub rotation: LogRotation,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> LogFormat {
    LogFormat::Text
}

fn default_sink() -> LogSink {
    LogSink::Stdout
}

fn default_rotation() -> LogRotation {
    LogRotation::None
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
            sink: default_sink(),
            colorize: false,
            source_location: false,
            rotation: default_rotation(),
        }
    }
}

impl LoggerSettings {
    /// Settings for a silent logger, used by test suites.
    pub fn null() -> Self {
        Self {
            sink: LogSink::Null,
            ..Self::default()
        }
    }
}
