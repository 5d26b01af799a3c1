//! Routed command outcomes, step results and run logs.

use std::path::Path;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CommandError, ImportError};
use crate::step::StepKind;

/// Which channel actually carried a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Mqtt,
    Ssh,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Mqtt => "mqtt",
            Self::Ssh => "ssh",
        })
    }
}

/// Result of a command tagged with the path it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    pub via: TransportKind,
    pub result: Result<Value, CommandError>,
}

impl Routed {
    #[must_use]
    pub const fn new(via: TransportKind, result: Result<Value, CommandError>) -> Self {
        Self { via, result }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Response or error rendered as plain text.
    #[must_use]
    pub fn output_text(&self) -> String {
        match &self.result {
            Ok(value) => render_value(value),
            Err(e) => e.to_string(),
        }
    }
}

/// Render a decoded response without quoting plain strings.
#[must_use]
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Outcome of one executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Fail,
    Waited,
    Invalid,
    Error,
    Timeout,
}

impl StepStatus {
    /// Status for a routed command result.
    #[must_use]
    pub const fn from_routed(result: &Result<Value, CommandError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(CommandError::Timeout) => Self::Timeout,
            Err(CommandError::Cancelled) => Self::Error,
            Err(_) => Self::Fail,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Waited => "waited",
            Self::Invalid => "invalid",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Zero-based position of the step in the list.
    pub step: usize,
    /// One-based repeat number.
    pub repeat: usize,
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub command: String,
    /// Channel that carried the step, if any was used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<TransportKind>,
    pub start: DateTime<Local>,
    pub end: DateTime<Local>,
    pub duration_sec: f64,
    pub status: StepStatus,
    pub output: String,
}

/// Ordered step results of one run, covering all repeats.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunLog {
    results: Vec<StepResult>,
}

impl RunLog {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            results: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, result: StepResult) {
        self.results.push(result);
    }

    #[must_use]
    pub fn results(&self) -> &[StepResult] {
        &self.results
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Count results with the given status.
    #[must_use]
    pub fn count(&self, status: StepStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    /// Serialize as a pretty JSON array.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parse an exported run log.
    ///
    /// # Errors
    /// Returns error if the document is not an array of step results.
    pub fn from_json(json: &str) -> Result<Self, ImportError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Write the log to `path` as JSON, replacing it atomically.
    ///
    /// # Errors
    /// Returns error if the file cannot be written.
    pub async fn export(&self, path: &Path) -> Result<(), ImportError> {
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, self.to_json()?).await?;
        tokio::fs::rename(&tmp, path).await?;
        tracing::debug!(path = %path.display(), results = self.len(), "Run log exported");
        Ok(())
    }
}

/// Builder used by the sequencer; keeps `RunLog` append-only from outside the crate.
#[derive(Debug, Default)]
pub struct RunLogBuilder {
    log: RunLog,
}

impl RunLogBuilder {
    #[must_use]
    pub const fn new() -> Self {
        Self { log: RunLog::new() }
    }

    pub fn push(&mut self, result: StepResult) {
        self.log.push(result);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.log.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    #[must_use]
    pub fn finish(self) -> RunLog {
        self.log
    }
}
