//! Error taxonomy shared by every component.

use thiserror::Error;

/// Transport handshake or reconnect failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Handshake with {broker} failed: {reason}")]
    Handshake { broker: String, reason: String },
    #[error("Handshake with {broker} timed out after {seconds}s")]
    HandshakeTimeout { broker: String, seconds: u64 },
    #[error("Connection dropped again after reconnect: {0}")]
    Dropped(String),
    #[error("Connection profile can only change while disconnected")]
    Busy,
    #[error("Invalid connection profile: {0}")]
    InvalidProfile(String),
}

/// Failure of a single routed command.
///
/// These never abort a run: the sequencer turns each one into a step status.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    /// No correlated response arrived before the deadline.
    #[error("timeout")]
    Timeout,
    /// Publish or subscribe exhausted its retries.
    #[error("Transmission failed: {0}")]
    Transmission(String),
    /// Remote shell wrote to stderr or the session could not be established.
    #[error("{0}")]
    RemoteExec(String),
    /// Remote shell credentials are incomplete; no connection was attempted.
    #[error("Incomplete shell credentials: {0}")]
    Credentials(String),
    /// A request is already in flight on this correlator.
    #[error("A request is already in flight")]
    Busy,
    #[error("cancelled")]
    Cancelled,
}

/// Step is missing required data at dispatch time.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MalformedStepError {
    #[error("Command `{0}` is missing the `=` separator")]
    MissingSeparator(String),
    #[error("Command `{0}` has an empty target path")]
    EmptyTarget(String),
    #[error("Wait value `{0}` is not a number of seconds")]
    InvalidWait(String),
    #[error("Unknown step type `{0}`")]
    UnknownKind(String),
    #[error("Step command is empty")]
    EmptyCommand,
}

/// A persisted step list or run log failed structural validation.
///
/// Imports are all-or-nothing, so the index names the first offending record.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Document is not a valid step list: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Record {index}: {reason}")]
    Invalid { index: usize, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage backend error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Run not found: {0}")]
    NotFound(uuid::Uuid),
    #[error("Storage error: {0}")]
    Internal(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Invalid configuration value.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be a number, got `{value}`")]
    InvalidNumber { key: &'static str, value: String },
    #[error("Failed to load env file: {0}")]
    EnvFile(#[from] dotenvy::Error),
}
