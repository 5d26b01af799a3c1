//! Transport layer for pushing UI commands to a device.
//!
//! Provides:
//! - Wire protocol (JSON command / response payloads)
//! - MQTT transport client with single-shot reconnect (feature: mqtt)
//! - Request/response correlator
//! - Bounded retry policy
//! - In-process loopback transport

pub mod correlator;
pub mod loopback;
pub mod protocol;
pub mod retry;

#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use correlator::Correlator;
pub use loopback::{LoopbackTransport, Reply};
#[cfg(feature = "mqtt")]
pub use mqtt::MqttClient;
pub use protocol::{CommandMessage, decode_response};
pub use retry::RetryPolicy;
