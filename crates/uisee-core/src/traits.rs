//! Core traits for transports, shells and storage.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{CommandError, StorageError};
use crate::result::{RunLog, TransportKind};

/// Publish/subscribe connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Message delivered by the transport's receive loop.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Callback invoked from the receive loop for every inbound message.
///
/// Runs on the receive loop's task, so it must not block.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Publish/subscribe transport.
///
/// `publish` and `subscribe` report failure as `false`; the details are logged.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Receiver that observes every state change.
    fn watch_state(&self) -> watch::Receiver<ConnectionState>;

    /// Publish a payload.
    async fn publish(&self, topic: &str, payload: Bytes) -> bool;

    /// Subscribe to a topic. Subscribing twice is a no-op.
    async fn subscribe(&self, topic: &str) -> bool;

    /// Register the single handler for inbound messages, replacing any previous one.
    fn set_handler(&self, handler: MessageHandler);

    /// Topics subscribed in the current session, sorted.
    fn subscriptions(&self) -> Vec<String>;
}

/// Captured output of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ShellOutput {
    /// Apply the stderr rule: any non-blank stderr is a failure, whatever the exit code.
    ///
    /// Both streams are passed on verbatim.
    ///
    /// # Errors
    /// Returns `RemoteExec` carrying the stderr text.
    pub fn into_result(self) -> Result<String, CommandError> {
        if self.stderr.trim().is_empty() {
            Ok(self.stdout)
        } else {
            Err(CommandError::RemoteExec(self.stderr))
        }
    }
}

/// Remote shell that runs exactly one command per call.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run a command verbatim and capture stdout and stderr separately.
    ///
    /// # Errors
    /// Returns error if credentials are incomplete or the session fails.
    async fn run(&self, command: &str) -> Result<ShellOutput, CommandError>;

    /// Run a command and apply the stderr rule.
    ///
    /// # Errors
    /// Returns error on session failure or non-empty stderr.
    async fn exec(&self, command: &str) -> Result<String, CommandError> {
        let output = self.run(command).await?;
        output.into_result()
    }

    /// Release any open session.
    async fn close(&self) {}
}

/// A command sent through the command adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: String,
    pub via: TransportKind,
    pub success: bool,
    pub result: String,
    pub timestamp: DateTime<Local>,
}

/// Trait for command history backends.
#[async_trait]
pub trait HistoryStorage: Send + Sync {
    /// Append a record.
    async fn append(&self, record: CommandRecord) -> Result<(), StorageError>;

    /// Most recent records first.
    async fn recent(&self, limit: usize) -> Result<Vec<CommandRecord>, StorageError>;
}

/// Run identifier.
pub type RunId = Uuid;

/// Final state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Aborted,
}

/// A finished run as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRun {
    pub id: RunId,
    pub state: RunState,
    pub finished_at: DateTime<Local>,
    pub log: RunLog,
}

/// Run filter for queries.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub state: Option<RunState>,
    pub limit: Option<usize>,
}

/// Trait for run log storage backends.
#[async_trait]
pub trait RunStorage: Send + Sync {
    /// Store a finished run.
    async fn save(&self, run: StoredRun) -> Result<(), StorageError>;

    /// Get a run by ID.
    async fn get(&self, id: RunId) -> Result<Option<StoredRun>, StorageError>;

    /// List runs, newest first.
    async fn list(&self, filter: RunFilter) -> Result<Vec<StoredRun>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_marks_failure_even_with_zero_exit() {
        let output = ShellOutput {
            stdout: String::new(),
            stderr: "ec: unknown input\n".into(),
            exit_code: Some(0),
        };
        assert_eq!(
            output.into_result(),
            Err(CommandError::RemoteExec("ec: unknown input\n".into()))
        );
    }

    #[test]
    fn test_stdout_is_returned_verbatim() {
        let output = ShellOutput {
            stdout: "  col1  col2\n  42\n".into(),
            stderr: " \n".into(),
            exit_code: Some(1),
        };
        assert_eq!(output.into_result(), Ok("  col1  col2\n  42\n".into()));
    }
}
