//! Process-wide ordered diagnostics log.
//!
//! Every discard, veto and decoding failure lands here in the order it
//! happened.  Entries are mirrored to `tracing` so a subscriber sees them
//! live; the log itself is what UI consumers read back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub severity:  Severity,
    /// Originating component, e.g. `"loader/decompress"` or `"format/midi"`.
    pub component: String,
    pub message:   String,
    pub time:      DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    entries: Vec<LogEntry>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, severity: Severity, component: &str, message: impl Into<String>) {
        let message = message.into();
        match severity {
            Severity::Debug   => tracing::debug!(component, "{message}"),
            Severity::Info    => tracing::info!(component, "{message}"),
            Severity::Warning => tracing::warn!(component, "{message}"),
            Severity::Error   => tracing::error!(component, "{message}"),
        }
        self.entries.push(LogEntry {
            severity,
            component: component.to_owned(),
            message,
            time: Utc::now(),
        });
    }

    pub fn info(&mut self, component: &str, message: impl Into<String>) {
        self.push(Severity::Info, component, message);
    }

    pub fn warn(&mut self, component: &str, message: impl Into<String>) {
        self.push(Severity::Warning, component, message);
    }

    pub fn error(&mut self, component: &str, message: impl Into<String>) {
        self.push(Severity::Error, component, message);
    }

    pub fn entries(&self) -> &[LogEntry] { &self.entries }
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn at_least(&self, severity: Severity) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(move |e| e.severity >= severity)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(&self.entries)
    }
}
