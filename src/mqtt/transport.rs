//! Transport seam between the connection session and the wire
//!
//! A [`BrokerConnector`] opens one transport per connect attempt and returns
//! the command side as a [`BrokerClient`]. Everything the broker sends back is
//! pushed through the [`EventSink`] handed to `open`, tagged with the attempt's
//! epoch so that events of a torn-down transport can be told apart from the
//! live one.

use super::error::TransportError;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

/// Asynchronous events delivered by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Broker accepted the connection
    ConnAck,
    /// Connect attempt failed before a CONNACK arrived
    ConnectFailed(String),
    /// Inbound PUBLISH
    Message { topic: String, payload: Vec<u8> },
    /// Non-fatal error on an established connection
    Error(String),
    /// Transport closed, either acknowledged close or dropped connection
    Closed,
}

/// Everything the session manager's event loop reacts to besides commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    Transport { epoch: u64, event: TransportEvent },
    ConnectDeadline { epoch: u64 },
    CloseDeadline { epoch: u64 },
}

/// Per-attempt handle a transport uses to report events
#[derive(Debug, Clone)]
pub struct EventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<SessionSignal>,
}

impl EventSink {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<SessionSignal>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns `false` once the event loop is gone
    pub fn send(&self, event: TransportEvent) -> bool {
        trace!("transport event (epoch {}): {:?}", self.epoch, event);
        self.tx
            .send(SessionSignal::Transport {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}

/// Options for a single connect attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub endpoint: String,
    pub client_id: String,
    pub keep_alive: Duration,
    pub request_capacity: usize,
}

/// Opens transports. One call per connect attempt.
pub trait BrokerConnector: Send + Sync {
    fn open(
        &self,
        options: &ConnectOptions,
        sink: EventSink,
    ) -> Result<Box<dyn BrokerClient>, TransportError>;
}

/// Command side of an open transport. All calls enqueue and return without
/// waiting on the network; QoS 0, no retain.
pub trait BrokerClient: Send {
    fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Requests a clean close; acknowledged later with [`TransportEvent::Closed`]
    fn close(&self) -> Result<(), TransportError>;

    /// Tears the transport down immediately. No further events are delivered.
    fn abort(&self);
}
