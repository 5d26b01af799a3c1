//! Wiring of transport, shell and adapter from settings.

use std::{path::Path, sync::Arc};

use uisee_core::{HistoryStorage, MessageTransport, RemoteShell, Settings};
use uisee_executor::{CommandAdapter, DeviceManager};
use uisee_sequencer::storage::JsonlHistory;
use uisee_shell::{ScriptedShell, SshShell};
use uisee_transport::{Correlator, LoopbackTransport, MqttClient, Reply};

/// Everything a subcommand needs to talk to the device.
pub struct Context {
    pub adapter: Arc<CommandAdapter>,
    pub devices: DeviceManager,
    shell: Arc<dyn RemoteShell>,
    mqtt: Option<Arc<MqttClient>>,
}

impl Context {
    /// Connect to the broker (unless `offline`) and build the adapter.
    ///
    /// A failed broker connection is logged; commands then take the shell path.
    pub async fn open(settings: &Settings, history: &Path, offline: bool, dry_run: bool) -> Self {
        let (transport, mqtt): (Arc<dyn MessageTransport>, Option<Arc<MqttClient>>) = if dry_run {
            tracing::info!("Dry run: using loopback transport and scripted shell");
            let loopback = LoopbackTransport::connected()
                .with_topics(settings.topics.clone())
                .with_reply(Reply::Echo);
            let transport: Arc<dyn MessageTransport> = Arc::new(loopback);
            (transport, None)
        } else {
            let client = Arc::new(MqttClient::new(settings.mqtt.clone()));
            if !offline {
                if let Err(e) = client.connect().await {
                    tracing::warn!("MQTT unavailable, commands will use the remote shell: {e}");
                }
            }
            let transport: Arc<dyn MessageTransport> = client.clone();
            (transport, Some(client))
        };

        let shell: Arc<dyn RemoteShell> = if dry_run {
            Arc::new(ScriptedShell::new())
        } else {
            Arc::new(SshShell::new(settings.shell.clone()))
        };

        let history: Arc<dyn HistoryStorage> = Arc::new(JsonlHistory::new(history));
        let correlator = Arc::new(Correlator::new(transport, settings.topics.clone()));
        let devices = DeviceManager::new(Arc::clone(&correlator), settings.device_topics.clone())
            .with_status_timeout(settings.response_timeout);
        let adapter = CommandAdapter::new(correlator, Arc::clone(&shell))
            .with_response_timeout(settings.response_timeout)
            .with_history(history);

        Self {
            adapter: Arc::new(adapter),
            devices,
            shell,
            mqtt,
        }
    }

    /// Close the shell session and disconnect from the broker.
    pub async fn close(self) {
        self.shell.close().await;
        if let Some(mqtt) = self.mqtt {
            mqtt.disconnect().await;
        }
    }
}
