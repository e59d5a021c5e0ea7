//! Run log entries and export.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use tfpilot_runner::{LogLine, LogStream};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// One entry of a workflow run's log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    /// Entry for a streamed process line, ANSI sequences removed.
    ///
    /// stderr lines are logged at error level.
    pub fn from_line(line: &LogLine) -> Self {
        let level = match line.stream {
            LogStream::Stdout => LogLevel::Info,
            LogStream::Stderr => LogLevel::Error,
        };
        Self {
            timestamp: line.timestamp,
            level,
            message: tfpilot_iac::strip_ansi(&line.message).into_owned(),
        }
    }
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] [{}] {}",
            self.timestamp.to_rfc3339(),
            self.level,
            self.message
        )
    }
}

/// Export format for [`export`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    /// JSON for `.json` paths, text otherwise.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Render entries as `[timestamp] [LEVEL] message` lines.
pub fn render_text(entries: &[LogEntry]) -> String {
    entries.iter().map(|e| format!("{}\n", e)).collect()
}

/// Write the run log to `path`.
pub fn export(entries: &[LogEntry], path: &Path, format: LogFormat) -> CoreResult<()> {
    let contents = match format {
        LogFormat::Text => render_text(entries),
        LogFormat::Json => serde_json::to_string_pretty(entries)?,
    };

    fs::write(path, contents).map_err(|e| CoreError::WriteFailed {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    info!("Exported {} log entries to {:?}", entries.len(), path);
    Ok(())
}
