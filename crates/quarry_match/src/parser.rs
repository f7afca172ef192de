//! The contract parsers are invoked through.
//!
//! Parsers are opaque callables: they receive the mainfile path and an
//! archive to fill, and log through the provided logger. Everything they
//! raise is caught by the entry processor and turned into an entry failure.

use chrono::{DateTime, Utc};
use quarry_protocol::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One captured processing log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub event: String,
    pub step: String,
    pub timestamp: DateTime<Utc>,
}

/// Log sink handed to parsers and normalizers; records are captured into the
/// entry archive's `processing_logs`.
pub trait ParseLogger {
    fn record(&mut self, level: LogLevel, event: &str);

    fn debug(&mut self, event: &str) {
        self.record(LogLevel::Debug, event);
    }

    fn info(&mut self, event: &str) {
        self.record(LogLevel::Info, event);
    }

    fn warning(&mut self, event: &str) {
        self.record(LogLevel::Warning, event);
    }

    fn error(&mut self, event: &str) {
        self.record(LogLevel::Error, event);
    }
}

/// Captures log records in memory, tagged with the current step.
#[derive(Debug, Default)]
pub struct RecordingLogger {
    step: String,
    records: Vec<LogRecord>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_step(&mut self, step: impl Into<String>) {
        self.step = step.into();
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<LogRecord> {
        self.records
    }
}

impl ParseLogger for RecordingLogger {
    fn record(&mut self, level: LogLevel, event: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(step = %self.step, "{event}"),
            LogLevel::Info => tracing::info!(step = %self.step, "{event}"),
            LogLevel::Warning => tracing::warn!(step = %self.step, "{event}"),
            LogLevel::Error => tracing::error!(step = %self.step, "{event}"),
        }
        self.records.push(LogRecord {
            level,
            event: event.to_string(),
            step: self.step.clone(),
            timestamp: Utc::now(),
        });
    }
}

/// A domain parser.
pub trait Parser: Send + Sync {
    /// Parse the mainfile into the archive. Errors become entry failures;
    /// whatever was already written to the archive is kept for forensics.
    fn parse(
        &self,
        mainfile: &Path,
        archive: &mut serde_json::Value,
        logger: &mut dyn ParseLogger,
    ) -> Result<()>;
}
