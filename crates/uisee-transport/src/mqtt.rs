//! MQTT transport client.
//!
//! Owns one broker connection. The handshake runs on the caller's task; once
//! it succeeds a background receive loop polls the event loop and hands every
//! inbound publish to the registered handler.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport,
};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use uisee_core::{
    ConnectionError, ConnectionProfile, ConnectionState, InboundMessage, MessageHandler,
    MessageTransport,
};
use uuid::Uuid;

use crate::retry::RetryPolicy;

/// Request queue depth between client handle and event loop.
const REQUEST_CAPACITY: usize = 10;

/// Grace period for the receive loop to flush a disconnect.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// State shared with the receive loop.
struct Shared {
    state: watch::Sender<ConnectionState>,
    last_error: RwLock<Option<String>>,
    handler: RwLock<Option<MessageHandler>>,
    subscriptions: Mutex<BTreeSet<String>>,
}

impl Shared {
    fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            last_error: RwLock::new(None),
            handler: RwLock::new(None),
            subscriptions: Mutex::new(BTreeSet::new()),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(?previous, current = ?state, "Connection state changed");
        }
    }

    fn fail(&self, cause: String) {
        if let Ok(mut last) = self.last_error.write() {
            *last = Some(cause);
        }
        self.set_state(ConnectionState::Failed);
    }

    fn dispatch(&self, message: InboundMessage) {
        let handler = self.handler.read().ok().and_then(|h| h.clone());
        match handler {
            Some(handler) => handler(message),
            None => tracing::debug!(topic = %message.topic, "No handler registered; dropping message"),
        }
    }

    fn subscribed(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Live broker session.
struct Session {
    client: AsyncClient,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop.cancel();
        self.task.abort();
    }
}

/// MQTT implementation of [`MessageTransport`].
pub struct MqttClient {
    profile: RwLock<ConnectionProfile>,
    retry: RetryPolicy,
    shared: Arc<Shared>,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl MqttClient {
    #[must_use]
    pub fn new(profile: ConnectionProfile) -> Self {
        Self::with_retry(profile, RetryPolicy::default())
    }

    #[must_use]
    pub fn with_retry(profile: ConnectionProfile, retry: RetryPolicy) -> Self {
        Self {
            profile: RwLock::new(profile),
            retry,
            shared: Arc::new(Shared::new()),
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Current connection profile.
    #[must_use]
    pub fn profile(&self) -> ConnectionProfile {
        self.profile
            .read()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Replace the connection profile.
    ///
    /// # Errors
    /// Returns `Busy` unless the client is disconnected or failed.
    pub fn set_profile(&self, profile: ConnectionProfile) -> Result<(), ConnectionError> {
        if matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            return Err(ConnectionError::Busy);
        }
        let mut current = self
            .profile
            .write()
            .map_err(|e| ConnectionError::InvalidProfile(e.to_string()))?;
        *current = profile;
        Ok(())
    }

    /// Cause of the last connection failure.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.read().ok().and_then(|e| e.clone())
    }

    /// Connect to the broker and start the receive loop.
    ///
    /// # Errors
    /// Returns error if the handshake fails or times out.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let mut session = self.session.lock().await;
        if session.is_some() && self.state().is_connected() {
            return Ok(());
        }
        // Drop any session left behind by a hard failure.
        session.take();

        let profile = self.profile();
        if profile.broker.trim().is_empty() {
            let err = ConnectionError::InvalidProfile("broker address is empty".into());
            self.shared.fail(err.to_string());
            return Err(err);
        }

        self.shared.set_state(ConnectionState::Connecting);
        tracing::info!(broker = %profile.address(), tls = profile.tls, "Connecting to MQTT broker");

        let (client, mut eventloop) = AsyncClient::new(mqtt_options(&profile), REQUEST_CAPACITY);
        if let Err(e) = handshake(&mut eventloop, &profile).await {
            tracing::error!("Error connecting to MQTT broker: {e}");
            self.shared.fail(e.to_string());
            return Err(e);
        }

        if let Ok(mut last) = self.shared.last_error.write() {
            *last = None;
        }
        self.shared.set_state(ConnectionState::Connected);
        tracing::info!(broker = %profile.address(), "Connected to MQTT broker");

        let stop = CancellationToken::new();
        let task = tokio::spawn(receive_loop(
            eventloop,
            client.clone(),
            Arc::clone(&self.shared),
            stop.clone(),
            profile,
        ));
        *session = Some(Session { client, stop, task });
        Ok(())
    }

    /// Stop the receive loop and close the session. Idempotent.
    pub async fn disconnect(&self) {
        let session = self.session.lock().await.take();
        if let Some(mut session) = session {
            session.stop.cancel();
            if let Err(e) = session.client.disconnect().await {
                tracing::debug!("Disconnect request not delivered: {e}");
            }
            if tokio::time::timeout(STOP_GRACE, &mut session.task).await.is_err() {
                tracing::debug!("Receive loop did not stop in time; aborting");
            }
            tracing::info!("MQTT connection closed");
        }
        if let Ok(mut subs) = self.shared.subscriptions.lock() {
            subs.clear();
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    async fn client(&self) -> Option<AsyncClient> {
        self.session.lock().await.as_ref().map(|s| s.client.clone())
    }
}

#[async_trait]
impl MessageTransport for MqttClient {
    fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> bool {
        let Some(client) = self.client().await else {
            tracing::warn!(topic, "Not connected; cannot publish");
            return false;
        };
        let ok = self
            .retry
            .run(&format!("publish to {topic}"), || {
                let client = client.clone();
                let payload = payload.to_vec();
                async move { client.publish(topic, QoS::AtLeastOnce, false, payload).await }
            })
            .await;
        if ok {
            tracing::debug!(topic, bytes = payload.len(), "Published");
        }
        ok
    }

    async fn subscribe(&self, topic: &str) -> bool {
        let already = self
            .shared
            .subscriptions
            .lock()
            .is_ok_and(|subs| subs.contains(topic));
        if already {
            return true;
        }
        let Some(client) = self.client().await else {
            tracing::warn!(topic, "Not connected; cannot subscribe");
            return false;
        };
        let ok = self
            .retry
            .run(&format!("subscribe to {topic}"), || {
                let client = client.clone();
                async move { client.subscribe(topic, QoS::AtLeastOnce).await }
            })
            .await;
        if ok {
            if let Ok(mut subs) = self.shared.subscriptions.lock() {
                subs.insert(topic.to_string());
            }
            tracing::info!(topic, "Subscribed");
        }
        ok
    }

    fn set_handler(&self, handler: MessageHandler) {
        if let Ok(mut slot) = self.shared.handler.write() {
            *slot = Some(handler);
        }
    }

    fn subscriptions(&self) -> Vec<String> {
        self.shared.subscribed()
    }
}

fn mqtt_options(profile: &ConnectionProfile) -> MqttOptions {
    let client_id = format!("uisee_{}", Uuid::new_v4());
    let mut options = MqttOptions::new(client_id, profile.broker.clone(), profile.port);
    options.set_keep_alive(profile.keep_alive.max(Duration::from_secs(5)));
    options.set_clean_session(true);
    if let (Some(user), Some(pass)) = (&profile.username, &profile.password) {
        options.set_credentials(user.clone(), pass.clone());
    }
    if profile.tls {
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Native));
    }
    options
}

/// Poll until the broker acknowledges the connection.
async fn handshake(
    eventloop: &mut EventLoop,
    profile: &ConnectionProfile,
) -> Result<(), ConnectionError> {
    let broker = profile.address();
    let wait = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return if ack.code == ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err(ConnectionError::Handshake {
                            broker: broker.clone(),
                            reason: format!("{:?}", ack.code),
                        })
                    };
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(ConnectionError::Handshake {
                        broker: broker.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    };
    tokio::time::timeout(profile.connect_timeout, wait)
        .await
        .map_err(|_| ConnectionError::HandshakeTimeout {
            broker: broker.clone(),
            seconds: profile.connect_timeout.as_secs(),
        })?
}

/// Receive loop: dispatches inbound publishes and reconnects at most once.
async fn receive_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    stop: CancellationToken,
    profile: ConnectionProfile,
) {
    let mut reconnected = false;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                tracing::debug!(topic = %publish.topic, bytes = publish.payload.len(), "Received message");
                shared.dispatch(InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                });
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) if stop.is_cancelled() => break,
            Ok(_) => {}
            Err(_) if stop.is_cancelled() => break,
            Err(e) if reconnected => {
                tracing::error!("MQTT connection dropped again: {e}");
                shared.fail(ConnectionError::Dropped(e.to_string()).to_string());
                break;
            }
            Err(e) => {
                reconnected = true;
                tracing::warn!("Unexpected disconnection from MQTT broker: {e}. Attempting to reconnect...");
                shared.set_state(ConnectionState::Connecting);
                let attempt = tokio::select! {
                    () = stop.cancelled() => break,
                    attempt = handshake(&mut eventloop, &profile) => attempt,
                };
                match attempt {
                    Ok(()) => {
                        shared.set_state(ConnectionState::Connected);
                        tracing::info!(broker = %profile.address(), "Reconnected to MQTT broker");
                        for topic in shared.subscribed() {
                            if let Err(e) = client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
                                tracing::warn!(topic = %topic, "Failed to resubscribe: {e}");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!("Reconnect failed: {e}");
                        shared.fail(e.to_string());
                        break;
                    }
                }
            }
        }
    }
    tracing::debug!("Receive loop stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        sync::mpsc,
    };

    use super::*;

    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    /// Read one MQTT control packet: fixed header byte and body.
    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            len |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    /// First topic filter of a SUBSCRIBE body.
    fn subscribed_topic(body: &[u8]) -> String {
        let len = usize::from(u16::from_be_bytes([body[2], body[3]]));
        String::from_utf8_lossy(&body[4..4 + len]).into_owned()
    }

    /// Broker that accepts every connection, waits for one SUBSCRIBE, reports
    /// its topic and then drops the socket.
    async fn dropping_broker(
        listener: TcpListener,
        accepted: Arc<AtomicUsize>,
        topics: mpsc::UnboundedSender<String>,
    ) {
        while let Ok((mut stream, _)) = listener.accept().await {
            accepted.fetch_add(1, Ordering::SeqCst);
            let (header, _) = read_packet(&mut stream).await.unwrap();
            assert_eq!(header >> 4, 1, "expected CONNECT");
            stream.write_all(&CONNACK).await.unwrap();

            let subscribe = async {
                loop {
                    match read_packet(&mut stream).await {
                        Ok((header, body)) if header >> 4 == 8 => return Some(subscribed_topic(&body)),
                        Ok(_) => {}
                        Err(_) => return None,
                    }
                }
            };
            if let Ok(Some(topic)) = tokio::time::timeout(Duration::from_secs(5), subscribe).await {
                let _ = topics.send(topic);
            }
        }
    }

    #[tokio::test]
    async fn test_reconnects_once_and_resubscribes_then_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let (topics_tx, mut topics_rx) = mpsc::unbounded_channel();
        tokio::spawn(dropping_broker(listener, Arc::clone(&accepted), topics_tx));

        let client = MqttClient::new(ConnectionProfile::new("127.0.0.1", port));
        let mut states = client.watch_state();
        client.connect().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        assert!(client.last_error().is_none());

        assert!(client.subscribe("exec/response").await);
        assert_eq!(client.subscriptions(), vec!["exec/response"]);

        let wait = Duration::from_secs(5);
        let first = tokio::time::timeout(wait, topics_rx.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some("exec/response"));
        // Only a reconnected session sends a second SUBSCRIBE.
        let replayed = tokio::time::timeout(wait, topics_rx.recv()).await.unwrap();
        assert_eq!(replayed.as_deref(), Some("exec/response"));

        tokio::time::timeout(wait, states.wait_for(|s| *s == ConnectionState::Failed))
            .await
            .unwrap()
            .unwrap();
        let cause = client.last_error().unwrap();
        assert!(
            cause.starts_with("Connection dropped again after reconnect"),
            "{cause}"
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 2);

        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.subscriptions().is_empty());
    }

    #[test]
    fn test_new_client_is_disconnected() {
        let client = MqttClient::new(ConnectionProfile::default());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.last_error().is_none());
    }

    #[test]
    fn test_profile_replaceable_while_disconnected() {
        let client = MqttClient::new(ConnectionProfile::default());
        client
            .set_profile(ConnectionProfile::new("10.0.0.9", 1884))
            .unwrap();
        assert_eq!(client.profile().address(), "10.0.0.9:1884");

        client.shared.set_state(ConnectionState::Connected);
        assert_eq!(
            client.set_profile(ConnectionProfile::default()),
            Err(ConnectionError::Busy)
        );
    }

    #[tokio::test]
    async fn test_publish_without_session_fails_fast() {
        let client = MqttClient::new(ConnectionProfile::default());
        assert!(!client.publish("exec", Bytes::from_static(b"{}")).await);
        assert!(!client.subscribe("exec/response").await);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let client = MqttClient::new(ConnectionProfile::default());
        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_empty_broker_fails_without_network() {
        let client = MqttClient::new(ConnectionProfile::new(" ", 1883));
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidProfile(_)));
        assert_eq!(client.state(), ConnectionState::Failed);
        assert!(client.last_error().is_some());
    }

    #[test]
    fn test_dispatch_reaches_single_handler() {
        let shared = Shared::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        *shared.handler.write().unwrap() = Some(Arc::new(move |_msg: InboundMessage| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        shared.dispatch(InboundMessage {
            topic: "exec/response".into(),
            payload: Bytes::from_static(b"{}"),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
