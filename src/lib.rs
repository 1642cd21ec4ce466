//! mqttdeck - MQTT session and topic-state manager over WebSocket
//!
//! One broker connection, topics composed from a group/participant scheme,
//! runtime subscribe/unsubscribe, timestamped publishing and a rolling
//! per-topic message history with a numeric series view.

pub mod config;
pub mod console;
pub mod mqtt;
pub mod topics;

pub use config::AppConfig;
pub use mqtt::{ConnectionState, MqttHandle, MqttHandler, SessionEvent};
pub use topics::{GroupCatalog, Topic};
