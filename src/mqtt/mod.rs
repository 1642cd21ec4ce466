//! # MQTT Session Module
//!
//! Owns the single broker connection over WebSocket and everything whose
//! lifetime is tied to it: the subscription lists, the per-topic message
//! history and the outgoing publish path.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker and display settings
//! ├── error.rs            - Error taxonomy
//! ├── transport.rs        - Transport seam (connector, client, events)
//! ├── ws_transport.rs     - rumqttc WebSocket transport
//! ├── session.rs          - Connection state machine, typestate session handle
//! ├── subscriptions.rs    - Subscribed / queued topic lists
//! ├── message_manager.rs  - Message history and numeric series view
//! ├── publisher.rs        - Timestamped outgoing messages
//! └── mqtt_handler.rs     - Single-owner event loop and its handle
//! ```
//!
//! ## Concurrency
//!
//! All state lives on the [`MqttHandler`] task. Transport callbacks never
//! touch it directly: they push epoch-tagged events into the handler's signal
//! channel, where stale events of torn-down transports are discarded.
//!
//! ## Usage
//!
//! 1. Spawn the handler with a [`WsConnector`]
//! 2. Subscribe to resolved topics (queued until connected)
//! 3. Connect and wait for the ticket
//! 4. Read `latest_messages` / `numeric_series`, publish to subscribed topics
//! 5. `disconnect_all` to unsubscribe everything and close

pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod publisher;
pub mod session;
pub mod subscriptions;
pub mod transport;
pub mod ws_transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{DisplayConfig, MqttConfig};
pub use error::{PublishError, SessionError, TransportError};
pub use message_manager::{Message, MessageStore, SeriesPoint};
pub use mqtt_handler::{
    ConnectTicket, DisconnectOutcome, MqttHandle, MqttHandler, MqttStatus, SessionEvent,
};
pub use session::ConnectionState;
pub use subscriptions::{SubscribeReport, SubscriptionSnapshot, Unsubscribe};
pub use ws_transport::WsConnector;
