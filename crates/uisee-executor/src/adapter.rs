//! Command adapter: one entry point for "apply a value to a target".
//!
//! Commands go through the correlator while the transport is connected and
//! through the remote shell otherwise. The returned [`Routed`] records which
//! path was taken.

use std::{sync::Arc, time::Duration};

use chrono::Local;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uisee_core::{
    CommandError, CommandRecord, HistoryStorage, RemoteShell, Routed, TargetCommand,
    TransportKind,
};
use uisee_transport::Correlator;

use crate::command::{self, CommandBuildError};

/// Default wait for an acknowledgement.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from adapter queries that parse device output.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Build(#[from] CommandBuildError),
}

pub struct CommandAdapter {
    correlator: Arc<Correlator>,
    shell: Arc<dyn RemoteShell>,
    history: Option<Arc<dyn HistoryStorage>>,
    response_timeout: Duration,
}

impl CommandAdapter {
    #[must_use]
    pub fn new(correlator: Arc<Correlator>, shell: Arc<dyn RemoteShell>) -> Self {
        Self {
            correlator,
            shell,
            history: None,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Record every command in `history`.
    #[must_use]
    pub fn with_history(mut self, history: Arc<dyn HistoryStorage>) -> Self {
        self.history = Some(history);
        self
    }

    #[must_use]
    pub const fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    #[must_use]
    pub const fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    /// Path a command would take right now.
    #[must_use]
    pub fn route(&self) -> TransportKind {
        if self.correlator.transport().state().is_connected() {
            TransportKind::Mqtt
        } else {
            TransportKind::Ssh
        }
    }

    /// Apply `target`, over MQTT when connected and the remote shell otherwise.
    pub async fn send_command(
        &self,
        target: &TargetCommand,
        cancel: Option<&CancellationToken>,
    ) -> Routed {
        let routed = match self.route() {
            TransportKind::Mqtt => Routed::new(
                TransportKind::Mqtt,
                self.correlator
                    .send_and_wait(target, self.response_timeout, cancel)
                    .await,
            ),
            TransportKind::Ssh => {
                tracing::info!(command = %target, "Transport not connected; using remote shell");
                let result = match command::assign(target) {
                    Ok(line) => self.run_shell(&line, cancel).await,
                    Err(e) => Err(CommandError::RemoteExec(e.to_string())),
                };
                Routed::new(TransportKind::Ssh, result)
            }
        };
        self.record(target.to_string(), &routed).await;
        routed
    }

    /// Run a shell command verbatim, regardless of transport state.
    pub async fn exec(&self, command: &str, cancel: Option<&CancellationToken>) -> Routed {
        let routed = Routed::new(TransportKind::Ssh, self.run_shell(command, cancel).await);
        self.record(command.to_string(), &routed).await;
        routed
    }

    /// Simulate a sensor input on the device.
    ///
    /// # Errors
    /// Returns error if the input name or value is empty.
    pub async fn simulate_input(
        &self,
        input: &str,
        value: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Routed, CommandBuildError> {
        let line = command::simulate_input(input, value)?;
        Ok(self.exec(&line, cancel).await)
    }

    /// Input names configured on the device.
    ///
    /// # Errors
    /// Returns error if the query fails or its output is not an input list.
    pub async fn configured_inputs(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<String>, AdapterError> {
        let stdout = self.shell_text(&command::input_config(), cancel).await?;
        Ok(command::parse_input_config(&stdout)?)
    }

    /// Name of the screen the device is showing.
    ///
    /// # Errors
    /// Returns error if the query fails.
    pub async fn current_screen(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<String, CommandError> {
        self.shell_text(&command::current_screen(), cancel).await
    }

    async fn shell_text(
        &self,
        command: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<String, CommandError> {
        let run = self.shell.exec(command);
        match cancel {
            Some(token) => tokio::select! {
                () = token.cancelled() => Err(CommandError::Cancelled),
                res = run => res,
            },
            None => run.await,
        }
    }

    async fn run_shell(
        &self,
        command: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, CommandError> {
        let result = self.shell_text(command, cancel).await.map(Value::String);
        if let Err(e) = &result {
            tracing::warn!(command, "Remote command failed: {e}");
        }
        result
    }

    async fn record(&self, command: String, routed: &Routed) {
        let Some(history) = &self.history else {
            return;
        };
        let record = CommandRecord {
            command,
            via: routed.via,
            success: routed.is_success(),
            result: routed.output_text(),
            timestamp: Local::now(),
        };
        if let Err(e) = history.append(record).await {
            tracing::warn!("Failed to record command history: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;
    use uisee_core::{ConnectionState, MessageTransport, StorageError, Topics};
    use uisee_shell::ScriptedShell;
    use uisee_transport::{LoopbackTransport, Reply};

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<CommandRecord>>);

    #[async_trait]
    impl HistoryStorage for Recorder {
        async fn append(&self, record: CommandRecord) -> Result<(), StorageError> {
            self.0.lock().unwrap().push(record);
            Ok(())
        }

        async fn recent(&self, limit: usize) -> Result<Vec<CommandRecord>, StorageError> {
            Ok(self.0.lock().unwrap().iter().rev().take(limit).cloned().collect())
        }
    }

    fn adapter(
        transport: &Arc<LoopbackTransport>,
        shell: &Arc<ScriptedShell>,
    ) -> CommandAdapter {
        let transport: Arc<dyn MessageTransport> = transport.clone();
        let correlator = Arc::new(Correlator::new(transport, Topics::default()));
        let shell: Arc<dyn RemoteShell> = shell.clone();
        CommandAdapter::new(correlator, shell)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_routes_over_mqtt() {
        let transport = Arc::new(
            LoopbackTransport::connected().with_reply(Reply::Json(json!({"status": "ok"}))),
        );
        let shell = Arc::new(ScriptedShell::new());
        let adapter = adapter(&transport, &shell);

        let routed = adapter
            .send_command(&TargetCommand::widget("Pump1", "IsSet", "1"), None)
            .await;
        assert_eq!(routed.via, TransportKind::Mqtt);
        assert_eq!(routed.result, Ok(json!({"status": "ok"})));
        assert!(shell.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_falls_back_to_shell() {
        let transport = Arc::new(LoopbackTransport::new(ConnectionState::Disconnected));
        let shell = Arc::new(ScriptedShell::new().stdout("ec Page", "applied"));
        let adapter = adapter(&transport, &shell);

        assert_eq!(adapter.route(), TransportKind::Ssh);
        let routed = adapter
            .send_command(&TargetCommand::widget("Pump1", "IsSet", "1"), None)
            .await;
        assert_eq!(routed.via, TransportKind::Ssh);
        assert_eq!(routed.output_text(), "applied");
        assert_eq!(shell.commands(), vec!["ec Page.Widgets.Pump1.IsSet=1"]);
        assert!(transport.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_transport_also_falls_back() {
        let transport = Arc::new(LoopbackTransport::new(ConnectionState::Failed));
        let shell = Arc::new(ScriptedShell::new().stderr("ec", "no such widget"));
        let adapter = adapter(&transport, &shell);

        let routed = adapter
            .send_command(&TargetCommand::widget("Nope", "IsSet", "1"), None)
            .await;
        assert_eq!(routed.via, TransportKind::Ssh);
        assert_eq!(
            routed.result,
            Err(CommandError::RemoteExec("no such widget".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exec_ignores_transport_state() {
        let transport = Arc::new(LoopbackTransport::connected());
        let shell = Arc::new(ScriptedShell::new());
        let adapter = adapter(&transport, &shell);

        let routed = adapter.exec("ec simin a_tra1 55.5", None).await;
        assert_eq!(routed.via, TransportKind::Ssh);
        assert!(routed.is_success());
        assert!(transport.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shell_call_is_cancellable() {
        let transport = Arc::new(LoopbackTransport::new(ConnectionState::Disconnected));
        let shell = Arc::new(ScriptedShell::new().with_delay(Duration::from_secs(60)));
        let adapter = adapter(&transport, &shell);
        let token = CancellationToken::new();
        token.cancel();

        let routed = adapter.exec("sleep 60", Some(&token)).await;
        assert_eq!(routed.result, Err(CommandError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_records_both_paths() {
        let transport = Arc::new(LoopbackTransport::connected());
        let shell = Arc::new(ScriptedShell::new());
        let history = Arc::new(Recorder::default());
        let adapter = adapter(&transport, &shell).with_history(history.clone());

        adapter
            .send_command(&TargetCommand::widget("Pump1", "IsSet", "1"), None)
            .await;
        transport.set_state(ConnectionState::Disconnected);
        adapter
            .send_command(&TargetCommand::widget("Pump1", "IsSet", "0"), None)
            .await;

        let recent = history.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].via, TransportKind::Ssh);
        assert_eq!(recent[0].command, "Page.Widgets.Pump1.IsSet=0");
        assert_eq!(recent[1].via, TransportKind::Mqtt);
        assert!(recent.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn test_configured_inputs() {
        let transport = Arc::new(LoopbackTransport::connected());
        let shell = Arc::new(
            ScriptedShell::new().stdout("ec get_input_config", r#"[{"name":"a_tra1"},{"name":"d_in2"}]"#),
        );
        let adapter = adapter(&transport, &shell);

        let inputs = adapter.configured_inputs(None).await.unwrap();
        assert_eq!(inputs, vec!["a_tra1", "d_in2"]);

        let routed = adapter.simulate_input("a_tra1", "55.5", None).await.unwrap();
        assert!(routed.is_success());
        assert_eq!(shell.commands()[1], "ec -s simin a_tra1 55.5");
    }
}
