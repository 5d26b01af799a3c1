//! Request/response correlation over a publish/subscribe transport.
//!
//! The correlator turns "publish a command, some message arrives later" into a
//! single awaited call. Each call owns a one-shot channel; the transport's
//! receive loop completes it from its own task, so the waiter never processes
//! inbound messages itself.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use serde_json::Value;
use tokio::{sync::oneshot, time::Instant};
use tokio_util::sync::CancellationToken;
use uisee_core::{CommandError, InboundMessage, MessageTransport, TargetCommand, Topics};

use crate::protocol::{CommandMessage, decode_response};

/// The one outstanding request.
struct PendingRequest {
    /// Label for logs; UI commands also match it against the echoed `command`.
    command: String,
    echo_check: bool,
    response_topic: String,
    submitted_at: Instant,
    timeout: Duration,
    tx: oneshot::Sender<Value>,
}

type Slot = Arc<Mutex<Option<PendingRequest>>>;

/// Clears the pending slot when a call exits, whatever the exit path.
struct SlotGuard<'a>(&'a Slot);

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.0.lock() {
            slot.take();
        }
    }
}

/// Pairs each published command with the next response.
///
/// Registers itself as the transport's message handler, so one transport
/// serves one correlator.
pub struct Correlator {
    transport: Arc<dyn MessageTransport>,
    topics: Topics,
    pending: Slot,
}

impl Correlator {
    #[must_use]
    pub fn new(transport: Arc<dyn MessageTransport>, topics: Topics) -> Self {
        let pending: Slot = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&pending);
        transport.set_handler(Arc::new(move |message: InboundMessage| {
            handle_inbound(&slot, &message);
        }));
        Self {
            transport,
            topics,
            pending,
        }
    }

    #[must_use]
    pub const fn transport(&self) -> &Arc<dyn MessageTransport> {
        &self.transport
    }

    #[must_use]
    pub const fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Whether a call is currently waiting for its response.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_ok_and(|slot| slot.is_some())
    }

    /// Publish `target` and wait for the response.
    ///
    /// The deadline covers subscribe, publish and the wait itself.
    ///
    /// # Errors
    /// - `Busy` if another call is in flight
    /// - `Transmission` if subscribe or publish exhausted their retries
    /// - `Timeout` if nothing usable arrived within `timeout`
    /// - `Cancelled` if `cancel` fired first
    pub async fn send_and_wait(
        &self,
        target: &TargetCommand,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, CommandError> {
        let payload = CommandMessage::new(target)
            .encode()
            .map_err(|e| CommandError::Transmission(e.to_string()))?;
        let exchange = Exchange {
            label: target.to_string(),
            echo_check: true,
            topic: &self.topics.command,
            response_topic: &self.topics.response,
            payload,
        };
        self.exchange(exchange, timeout, cancel).await
    }

    /// Publish `payload` on `topic` and wait for the next message on `response_topic`.
    ///
    /// Shares the pending slot with [`Correlator::send_and_wait`].
    ///
    /// # Errors
    /// Same as [`Correlator::send_and_wait`].
    pub async fn request(
        &self,
        topic: &str,
        payload: &Value,
        response_topic: &str,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, CommandError> {
        let exchange = Exchange {
            label: topic.to_string(),
            echo_check: false,
            topic,
            response_topic,
            payload: Bytes::from(payload.to_string()),
        };
        self.exchange(exchange, timeout, cancel).await
    }

    async fn exchange(
        &self,
        exchange: Exchange<'_>,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, CommandError> {
        let Exchange {
            label: command,
            echo_check,
            topic,
            response_topic,
            payload,
        } = exchange;
        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self
                .pending
                .lock()
                .map_err(|e| CommandError::Transmission(e.to_string()))?;
            if slot.is_some() {
                tracing::warn!(command = %command, "Rejected: another command is awaiting its response");
                return Err(CommandError::Busy);
            }
            *slot = Some(PendingRequest {
                command: command.clone(),
                echo_check,
                response_topic: response_topic.to_string(),
                submitted_at: Instant::now(),
                timeout,
                tx,
            });
        }
        let _guard = SlotGuard(&self.pending);

        let exchange = async {
            if !self.transport.subscribe(response_topic).await {
                return Err(CommandError::Transmission(format!(
                    "subscribe to {response_topic} failed"
                )));
            }
            if !self.transport.publish(topic, payload).await {
                return Err(CommandError::Transmission(format!("publish to {topic} failed")));
            }
            tracing::debug!(command = %command, topic, "Command published");
            rx.await
                .map_err(|_| CommandError::Transmission("response channel closed".into()))
        };
        let bounded = tokio::time::timeout(timeout, exchange);

        let outcome = match cancel {
            Some(token) => tokio::select! {
                () = token.cancelled() => Err(CommandError::Cancelled),
                res = bounded => res.unwrap_or(Err(CommandError::Timeout)),
            },
            None => bounded.await.unwrap_or(Err(CommandError::Timeout)),
        };

        match &outcome {
            Ok(_) => tracing::info!(command = %command, "Command acknowledged"),
            Err(CommandError::Timeout) => {
                tracing::warn!(command = %command, timeout_secs = timeout.as_secs_f64(), "No response before timeout");
            }
            Err(e) => tracing::warn!(command = %command, "Command failed: {e}"),
        }
        outcome
    }
}

/// One publish with the topic its response arrives on.
struct Exchange<'a> {
    label: String,
    echo_check: bool,
    topic: &'a str,
    response_topic: &'a str,
    payload: Bytes,
}

/// Runs on the transport's receive-loop task.
fn handle_inbound(slot: &Slot, message: &InboundMessage) {
    let Ok(mut slot) = slot.lock() else {
        tracing::error!("Pending request lock poisoned");
        return;
    };
    let Some(pending) = slot.as_ref() else {
        tracing::debug!(topic = %message.topic, "Dropping late response: no command pending");
        return;
    };
    if message.topic != pending.response_topic {
        tracing::debug!(topic = %message.topic, "Ignoring message on unrelated topic");
        return;
    }
    let value = match decode_response(&message.payload) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(topic = %message.topic, "Dropping malformed response: {e}");
            return;
        }
    };
    // Acks that echo a different command belong to an earlier, abandoned call.
    if pending.echo_check {
        if let Some(echoed) = value.get("command").and_then(Value::as_str) {
            if echoed != pending.command {
                tracing::debug!(echoed, pending = %pending.command, "Dropping stale response");
                return;
            }
        }
    }
    if let Some(pending) = slot.take() {
        tracing::debug!(
            command = %pending.command,
            elapsed_ms = pending.submitted_at.elapsed().as_millis(),
            timeout_ms = pending.timeout.as_millis(),
            "Response matched"
        );
        if pending.tx.send(value).is_err() {
            tracing::debug!("Waiter already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;
    use tokio_test::assert_ok;
    use uisee_core::ConnectionState;

    use super::*;
    use crate::loopback::{LoopbackTransport, Reply};

    fn correlator(transport: &Arc<LoopbackTransport>) -> Correlator {
        let transport: Arc<dyn MessageTransport> = transport.clone();
        Correlator::new(transport, Topics::default())
    }

    fn pump() -> TargetCommand {
        TargetCommand::widget("Pump1", "IsSet", "1")
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledged_within_timeout() {
        let transport = Arc::new(
            LoopbackTransport::connected()
                .with_reply(Reply::Json(json!({"status": "ok"})))
                .with_delay(Duration::from_millis(800)),
        );
        let correlator = correlator(&transport);

        let response = assert_ok!(
            correlator
                .send_and_wait(&pump(), Duration::from_secs(5), None)
                .await
        );
        assert_eq!(response["status"], "ok");
        assert!(!correlator.is_pending());
        assert_eq!(
            transport.published_commands(),
            vec!["Page.Widgets.Pump1.IsSet=1".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_bounded() {
        let transport = Arc::new(LoopbackTransport::connected().with_reply(Reply::Silent));
        let correlator = correlator(&transport);

        let started = Instant::now();
        let err = correlator
            .send_and_wait(&pump(), Duration::from_secs(3), None)
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err, CommandError::Timeout);
        assert_eq!(err.to_string(), "timeout");
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_millis(3100));
        assert!(!correlator.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_response_times_out() {
        let transport = Arc::new(
            LoopbackTransport::connected().with_reply(Reply::Raw(Bytes::from_static(b"<html>"))),
        );
        let correlator = correlator(&transport);

        let err = correlator
            .send_and_wait(&pump(), Duration::from_secs(2), None)
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_call_rejected_while_pending() {
        let transport = Arc::new(LoopbackTransport::connected().with_reply(Reply::Silent));
        let correlator = Arc::new(correlator(&transport));

        let first = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator
                    .send_and_wait(&pump(), Duration::from_secs(5), None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(correlator.is_pending());

        let second = correlator
            .send_and_wait(&pump(), Duration::from_secs(5), None)
            .await;
        assert_eq!(second, Err(CommandError::Busy));

        assert_eq!(first.await.unwrap(), Err(CommandError::Timeout));
        assert!(!correlator.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_ack_does_not_satisfy_next_call() {
        let transport = Arc::new(
            LoopbackTransport::connected()
                .with_reply(Reply::Echo)
                .with_delay(Duration::from_secs(3)),
        );
        let correlator = correlator(&transport);

        let first = correlator
            .send_and_wait(&pump(), Duration::from_secs(1), None)
            .await;
        assert_eq!(first, Err(CommandError::Timeout));

        // The first ack lands at t=3s while this call is pending; its own ack lands at t=4s.
        let next = TargetCommand::widget("Pump2", "IsSet", "0");
        let started = Instant::now();
        let response = assert_ok!(
            correlator
                .send_and_wait(&next, Duration::from_secs(5), None)
                .await
        );
        assert_eq!(response["command"], "Page.Widgets.Pump2.IsSet=0");
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsolicited_response_is_dropped() {
        let transport = Arc::new(LoopbackTransport::connected().with_reply(Reply::Silent));
        let correlator = correlator(&transport);

        transport.inject("exec/response", Bytes::from_static(br#"{"status":"ok"}"#));
        tokio::task::yield_now().await;

        let err = correlator
            .send_and_wait(&pump(), Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_clears_pending() {
        let transport = Arc::new(LoopbackTransport::connected().with_reply(Reply::Silent));
        let correlator = correlator(&transport);
        let token = CancellationToken::new();

        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = correlator
            .send_and_wait(&pump(), Duration::from_secs(10), Some(&token))
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!correlator.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_transport_reports_transmission() {
        let transport = Arc::new(LoopbackTransport::new(ConnectionState::Disconnected));
        let correlator = correlator(&transport);

        let err = correlator
            .send_and_wait(&pump(), Duration::from_secs(5), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Transmission(_)));
        assert!(!correlator.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_waits_on_its_own_topic() {
        let transport = Arc::new(LoopbackTransport::connected().with_route(
            "device/pi-7/firmware",
            "device/pi-7/firmware/status",
            Reply::Json(json!({"status": "done"})),
        ));
        let correlator = correlator(&transport);

        // Traffic on the UI response topic must not complete a device request.
        transport.inject("exec/response", Bytes::from_static(br#"{"status":"ok"}"#));
        let status = assert_ok!(
            correlator
                .request(
                    "device/pi-7/firmware",
                    &json!({"action": "update_firmware"}),
                    "device/pi-7/firmware/status",
                    Duration::from_secs(5),
                    None,
                )
                .await
        );
        assert_eq!(status["status"], "done");
        assert!(!correlator.is_pending());

        let silent = correlator
            .request("device/pi-7/tests", &json!({}), "device/pi-7/tests/status", Duration::from_secs(1), None)
            .await;
        assert_eq!(silent, Err(CommandError::Timeout));
    }
}
