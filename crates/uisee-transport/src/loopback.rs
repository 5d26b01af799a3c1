//! In-process transport for offline runs and tests.
//!
//! Publishes are recorded and, when a reply is configured, answered on the
//! response topic from a separate task after an optional delay. Extra routes
//! answer publishes on other topics the same way.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use tokio::sync::watch;
use uisee_core::{ConnectionState, InboundMessage, MessageHandler, MessageTransport, Topics};

use crate::protocol::CommandMessage;

/// How the loopback answers a publish.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Never answer.
    Silent,
    /// Answer with this JSON value.
    Json(Value),
    /// Answer with raw bytes, e.g. a malformed payload.
    Raw(Bytes),
    /// Answer `{"status": "ok", "command": <published command>}`.
    /// On a route, the published payload is sent back unchanged.
    Echo,
}

/// Answer publishes on `topic` with `reply` on `reply_topic`.
#[derive(Debug, Clone)]
struct Route {
    topic: String,
    reply_topic: String,
    reply: Reply,
}

struct Inner {
    state: watch::Sender<ConnectionState>,
    handler: RwLock<Option<MessageHandler>>,
    subscriptions: Mutex<BTreeSet<String>>,
    published: Mutex<Vec<(String, Bytes)>>,
    reply: RwLock<Reply>,
    delay: RwLock<Duration>,
    routes: RwLock<Vec<Route>>,
    topics: Topics,
}

impl Inner {
    fn deliver(&self, message: InboundMessage) {
        let handler = self.handler.read().ok().and_then(|h| h.clone());
        if let Some(handler) = handler {
            handler(message);
        }
    }

    fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.lock().is_ok_and(|s| s.contains(topic))
    }

    /// Reply topic and answer for a publish, if anything should answer it.
    fn answer_for(&self, topic: &str, payload: &Bytes, reply: Reply) -> Option<(String, Bytes)> {
        if topic == self.topics.command {
            if !self.is_subscribed(&self.topics.response) {
                return None;
            }
            let answer = match reply {
                Reply::Silent => return None,
                Reply::Json(value) => Bytes::from(value.to_string()),
                Reply::Raw(bytes) => bytes,
                Reply::Echo => {
                    let command = serde_json::from_slice::<CommandMessage>(payload)
                        .map(|m| m.command)
                        .unwrap_or_default();
                    Bytes::from(json!({"status": "ok", "command": command}).to_string())
                }
            };
            return Some((self.topics.response.clone(), answer));
        }

        let route = self
            .routes
            .read()
            .ok()?
            .iter()
            .find(|r| r.topic == topic)
            .cloned()?;
        if !self.is_subscribed(&route.reply_topic) {
            return None;
        }
        let answer = match route.reply {
            Reply::Silent => return None,
            Reply::Json(value) => Bytes::from(value.to_string()),
            Reply::Raw(bytes) => bytes,
            Reply::Echo => payload.clone(),
        };
        Some((route.reply_topic, answer))
    }
}

/// [`MessageTransport`] that never leaves the process.
pub struct LoopbackTransport {
    inner: Arc<Inner>,
}

impl LoopbackTransport {
    #[must_use]
    pub fn new(state: ConnectionState) -> Self {
        Self::build(state, Topics::default())
    }

    fn build(state: ConnectionState, topics: Topics) -> Self {
        let (tx, _) = watch::channel(state);
        Self {
            inner: Arc::new(Inner {
                state: tx,
                handler: RwLock::new(None),
                subscriptions: Mutex::new(BTreeSet::new()),
                published: Mutex::new(Vec::new()),
                reply: RwLock::new(Reply::Echo),
                delay: RwLock::new(Duration::ZERO),
                routes: RwLock::new(Vec::new()),
                topics,
            }),
        }
    }

    /// Connected loopback that echoes every command.
    #[must_use]
    pub fn connected() -> Self {
        Self::new(ConnectionState::Connected)
    }

    #[must_use]
    pub fn with_reply(self, reply: Reply) -> Self {
        self.set_reply(reply);
        self
    }

    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        if let Ok(mut d) = self.inner.delay.write() {
            *d = delay;
        }
        self
    }

    /// Use custom topics. Call before registering a handler.
    #[must_use]
    pub fn with_topics(self, topics: Topics) -> Self {
        let rebuilt = Self::build(self.state(), topics)
            .with_reply(self.reply())
            .with_delay(self.delay());
        let routes = self.inner.routes.read().map(|r| r.clone()).unwrap_or_default();
        if let Ok(mut slot) = rebuilt.inner.routes.write() {
            *slot = routes;
        }
        rebuilt
    }

    /// Answer publishes on `topic` with `reply` on `reply_topic`, once subscribed.
    #[must_use]
    pub fn with_route(
        self,
        topic: impl Into<String>,
        reply_topic: impl Into<String>,
        reply: Reply,
    ) -> Self {
        if let Ok(mut routes) = self.inner.routes.write() {
            routes.push(Route {
                topic: topic.into(),
                reply_topic: reply_topic.into(),
                reply,
            });
        }
        self
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.inner.state.send_replace(state);
    }

    pub fn set_reply(&self, reply: Reply) {
        if let Ok(mut r) = self.inner.reply.write() {
            *r = reply;
        }
    }

    fn reply(&self) -> Reply {
        self.inner
            .reply
            .read()
            .map(|r| r.clone())
            .unwrap_or(Reply::Silent)
    }

    fn delay(&self) -> Duration {
        self.inner.delay.read().map(|d| *d).unwrap_or_default()
    }

    /// Everything published so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.inner
            .published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Command texts published on the command topic.
    #[must_use]
    pub fn published_commands(&self) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|(topic, _)| *topic == self.inner.topics.command)
            .filter_map(|(_, payload)| serde_json::from_slice::<CommandMessage>(&payload).ok())
            .map(|msg| msg.command)
            .collect()
    }

    /// Deliver a message to the handler on the caller's task.
    pub fn inject(&self, topic: &str, payload: Bytes) {
        self.inner.deliver(InboundMessage {
            topic: topic.to_string(),
            payload,
        });
    }
}

#[async_trait]
impl MessageTransport for LoopbackTransport {
    fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> bool {
        if !self.state().is_connected() {
            tracing::warn!(topic, "Loopback not connected; cannot publish");
            return false;
        }
        if let Ok(mut published) = self.inner.published.lock() {
            published.push((topic.to_string(), payload.clone()));
        }
        tracing::debug!(topic, bytes = payload.len(), "Loopback publish");

        let Some((reply_topic, answer)) = self.inner.answer_for(topic, &payload, self.reply())
        else {
            return true;
        };
        let delay = self.delay();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            inner.deliver(InboundMessage {
                topic: reply_topic,
                payload: answer,
            });
        });
        true
    }

    async fn subscribe(&self, topic: &str) -> bool {
        if !self.state().is_connected() {
            tracing::warn!(topic, "Loopback not connected; cannot subscribe");
            return false;
        }
        if let Ok(mut subs) = self.inner.subscriptions.lock() {
            subs.insert(topic.to_string());
        }
        true
    }

    fn set_handler(&self, handler: MessageHandler) {
        if let Ok(mut slot) = self.inner.handler.write() {
            *slot = Some(handler);
        }
    }

    fn subscriptions(&self) -> Vec<String> {
        self.inner
            .subscriptions
            .lock()
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }
}
