//! In-process shell with canned outputs.

use std::{
    sync::{Mutex, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use uisee_core::{CommandError, RemoteShell, ShellOutput};

/// [`RemoteShell`] that answers from a script and records every command.
///
/// Commands matching no rule are echoed back on stdout.
#[derive(Default)]
pub struct ScriptedShell {
    rules: RwLock<Vec<(String, ShellOutput)>>,
    commands: Mutex<Vec<String>>,
    delay: Duration,
}

impl ScriptedShell {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a remote command that takes `delay` to finish.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Answer commands starting with `prefix` with `output`.
    #[must_use]
    pub fn respond(self, prefix: impl Into<String>, output: ShellOutput) -> Self {
        if let Ok(mut rules) = self.rules.write() {
            rules.push((prefix.into(), output));
        }
        self
    }

    /// Answer commands starting with `prefix` with `stdout`.
    #[must_use]
    pub fn stdout(self, prefix: impl Into<String>, stdout: impl Into<String>) -> Self {
        self.respond(
            prefix,
            ShellOutput {
                stdout: stdout.into(),
                exit_code: Some(0),
                ..ShellOutput::default()
            },
        )
    }

    /// Answer commands starting with `prefix` with `stderr` and an empty stdout.
    #[must_use]
    pub fn stderr(self, prefix: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.respond(
            prefix,
            ShellOutput {
                stderr: stderr.into(),
                exit_code: Some(0),
                ..ShellOutput::default()
            },
        )
    }

    /// Commands received so far, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    fn answer(&self, command: &str) -> ShellOutput {
        let rules = self.rules.read().map(|r| r.clone()).unwrap_or_default();
        rules
            .into_iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map_or_else(
                || ShellOutput {
                    stdout: command.to_string(),
                    exit_code: Some(0),
                    ..ShellOutput::default()
                },
                |(_, output)| output,
            )
    }
}

#[async_trait]
impl RemoteShell for ScriptedShell {
    async fn run(&self, command: &str) -> Result<ShellOutput, CommandError> {
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command.to_string());
        }
        tracing::debug!(command, "Scripted shell command");
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.answer(command))
    }
}
