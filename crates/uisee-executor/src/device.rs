//! Firmware updates and test plans for devices addressed by id.
//!
//! Requests go out on per-device topics built from [`DeviceTopics`] templates
//! and share the correlator's single pending slot with UI commands.

use std::{sync::Arc, time::Duration};

use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uisee_core::{CommandError, DeviceTopics, render_value};
use uisee_transport::Correlator;

use crate::adapter::DEFAULT_RESPONSE_TIMEOUT;

#[derive(Debug, Error, PartialEq)]
pub enum DeviceError {
    #[error("invalid device id {0:?}")]
    InvalidDevice(String),
    #[error("firmware update failed: {0}")]
    Firmware(CommandError),
    #[error("test plan not sent: {0}")]
    Tests(CommandError),
}

pub struct DeviceManager {
    correlator: Arc<Correlator>,
    topics: DeviceTopics,
    status_timeout: Duration,
}

impl DeviceManager {
    #[must_use]
    pub fn new(correlator: Arc<Correlator>, topics: DeviceTopics) -> Self {
        Self {
            correlator,
            topics,
            status_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    /// How long to wait for the firmware status report.
    #[must_use]
    pub const fn with_status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = timeout;
        self
    }

    /// Topics subscribed on the transport.
    #[must_use]
    pub fn list_topics(&self) -> Vec<String> {
        self.correlator.transport().subscriptions()
    }

    /// Ask `device` to install the firmware at `url` and wait for its status report.
    ///
    /// # Errors
    /// - `InvalidDevice` if the id is empty or contains topic separators or wildcards
    /// - `Firmware` if the request fails, times out, or the device reports failure
    pub async fn update_firmware(
        &self,
        device: &str,
        url: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, DeviceError> {
        check_device(device)?;
        tracing::info!(device, url, "Starting firmware update");
        let status = self
            .correlator
            .request(
                &self.topics.firmware(device),
                &json!({"action": "update_firmware", "url": url}),
                &self.topics.firmware_status(device),
                self.status_timeout,
                cancel,
            )
            .await
            .map_err(DeviceError::Firmware)?;
        if reports_failure(&status) {
            tracing::error!(device, status = %status, "Device reported firmware failure");
            return Err(DeviceError::Firmware(CommandError::RemoteExec(render_value(
                &status,
            ))));
        }
        tracing::info!(device, "Firmware update finished");
        Ok(status)
    }

    /// Send a test plan to `device`. The device does not acknowledge it.
    ///
    /// # Errors
    /// - `InvalidDevice` if the id is unusable in a topic
    /// - `Tests` if the publish failed
    pub async fn run_tests(&self, device: &str, plan: &Value) -> Result<(), DeviceError> {
        check_device(device)?;
        let topic = self.topics.tests(device);
        let payload = json!({"action": "run_tests", "test_plan": plan});
        if !self
            .correlator
            .transport()
            .publish(&topic, payload.to_string().into())
            .await
        {
            return Err(DeviceError::Tests(CommandError::Transmission(format!(
                "publish to {topic} failed"
            ))));
        }
        tracing::info!(device, topic = %topic, "Test plan sent");
        Ok(())
    }

    /// Update firmware, then send the test plan. Stops at the first failure.
    ///
    /// # Errors
    /// Returns the error of the stage that failed.
    pub async fn provision(
        &self,
        device: &str,
        url: &str,
        plan: &Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, DeviceError> {
        tracing::info!(device, "Provisioning device");
        let status = self.update_firmware(device, url, cancel).await.inspect_err(|e| {
            tracing::error!(device, "Provisioning stopped: {e}");
        })?;
        self.run_tests(device, plan).await?;
        Ok(status)
    }
}

fn check_device(device: &str) -> Result<(), DeviceError> {
    if device.trim().is_empty() || device.contains(['/', '+', '#']) {
        return Err(DeviceError::InvalidDevice(device.to_string()));
    }
    Ok(())
}

/// `{"success": false}` or a `status` of `error`/`failed`.
fn reports_failure(status: &Value) -> bool {
    if status.get("success").and_then(Value::as_bool) == Some(false) {
        return true;
    }
    status
        .get("status")
        .and_then(Value::as_str)
        .is_some_and(|s| matches!(s.to_ascii_lowercase().as_str(), "error" | "failed"))
}

#[cfg(test)]
mod tests {
    use tokio_test::assert_ok;
    use uisee_core::{MessageTransport, Topics};
    use uisee_transport::{LoopbackTransport, Reply};

    use super::*;

    const FIRMWARE: &str = "device/pi-7/firmware";
    const STATUS: &str = "device/pi-7/firmware/status";
    const TESTS: &str = "device/pi-7/tests";

    fn manager(transport: &Arc<LoopbackTransport>) -> DeviceManager {
        let transport: Arc<dyn MessageTransport> = transport.clone();
        let correlator = Arc::new(Correlator::new(transport, Topics::default()));
        DeviceManager::new(correlator, DeviceTopics::default())
            .with_status_timeout(Duration::from_secs(2))
    }

    fn plan() -> Value {
        json!({"suite": "smoke", "cases": ["boot", "pump"]})
    }

    fn published_on(transport: &LoopbackTransport, topic: &str) -> Vec<Value> {
        transport
            .published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| serde_json::from_slice(&payload).unwrap())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_firmware_waits_for_status() {
        let transport = Arc::new(LoopbackTransport::connected().with_route(
            FIRMWARE,
            STATUS,
            Reply::Json(json!({"status": "done", "version": "2.1"})),
        ));
        let devices = manager(&transport);

        let status = assert_ok!(devices.update_firmware("pi-7", "http://fw/2.1.bin", None).await);
        assert_eq!(status["version"], "2.1");
        assert_eq!(
            published_on(&transport, FIRMWARE),
            vec![json!({"action": "update_firmware", "url": "http://fw/2.1.bin"})]
        );
        assert_eq!(devices.list_topics(), vec![STATUS]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_firmware_without_status_times_out() {
        let transport = Arc::new(LoopbackTransport::connected());
        let devices = manager(&transport);

        let err = devices
            .update_firmware("pi-7", "http://fw/2.1.bin", None)
            .await
            .unwrap_err();
        assert_eq!(err, DeviceError::Firmware(CommandError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_stops_when_firmware_fails() {
        let transport = Arc::new(LoopbackTransport::connected().with_route(
            FIRMWARE,
            STATUS,
            Reply::Json(json!({"success": false, "error": "checksum mismatch"})),
        ));
        let devices = manager(&transport);

        let err = devices
            .provision("pi-7", "http://fw/bad.bin", &plan(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Firmware(CommandError::RemoteExec(ref text)) if text.contains("checksum")));
        assert!(published_on(&transport, TESTS).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_sends_plan_after_firmware() {
        let transport = Arc::new(LoopbackTransport::connected().with_route(
            FIRMWARE,
            STATUS,
            Reply::Json(json!({"status": "done"})),
        ));
        let devices = manager(&transport);

        assert_ok!(devices.provision("pi-7", "http://fw/2.1.bin", &plan(), None).await);
        assert_eq!(
            published_on(&transport, TESTS),
            vec![json!({"action": "run_tests", "test_plan": plan()})]
        );
        let order: Vec<String> = transport.published().into_iter().map(|(t, _)| t).collect();
        assert_eq!(order, vec![FIRMWARE, TESTS]);
    }

    #[tokio::test]
    async fn test_run_tests_needs_connection() {
        let transport = Arc::new(LoopbackTransport::new(
            uisee_core::ConnectionState::Disconnected,
        ));
        let devices = manager(&transport);

        let err = devices.run_tests("pi-7", &plan()).await.unwrap_err();
        assert!(matches!(err, DeviceError::Tests(CommandError::Transmission(_))));
    }

    #[tokio::test]
    async fn test_device_id_must_fit_in_a_topic() {
        let transport = Arc::new(LoopbackTransport::connected());
        let devices = manager(&transport);

        for bad in ["", "a/b", "pi+", "#"] {
            assert_eq!(
                devices.run_tests(bad, &plan()).await,
                Err(DeviceError::InvalidDevice(bad.to_string()))
            );
        }
        assert!(transport.published().is_empty());
    }
}
