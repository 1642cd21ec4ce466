//! Connection session: the single broker connection and its lifecycle
//!
//! The live connection is held as a typestate [`Session`] inside a slot. The
//! observable [`ConnectionState`] is derived from which stage occupies the
//! slot, so there can never be two live sessions and the state can never
//! disagree with the handle.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──connect──► Connecting ──CONNACK──► Connected
//!      ▲                        │                      │
//!      │     failure/timeout    │                 disconnect
//!      ├────────────────────────┘                      ▼
//!      └──────── close ack / fallback timeout ── Disconnecting
//! ```
//!
//! Every connect attempt gets a new epoch. Transport events and deadlines carry
//! the epoch they were issued for; anything that does not match the session in
//! the slot is stale and ignored.

use super::config::MqttConfig;
use super::error::SessionError;
use super::transport::{BrokerClient, BrokerConnector, ConnectOptions, EventSink, SessionSignal};
use chrono::{DateTime, Local};
use statum::{machine, state};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Process-wide view of the connection
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Stages of one session handle
#[state]
#[derive(Debug, Clone)]
pub enum SessionStage {
    Opening, // transport opened, waiting for CONNACK
    Open,    // CONNACK received
    Closing, // close requested, waiting for acknowledgment
}

/// One connect-to-disconnect lifetime of the broker connection
#[machine]
pub struct Session<S: SessionStage> {
    client_id: String,
    epoch: u64,
    client: Box<dyn BrokerClient>,
    opened_at: DateTime<Local>,
}

impl<S: SessionStage> Session<S> {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn client(&self) -> &dyn BrokerClient {
        self.client.as_ref()
    }

    /// Drops the transport without waiting for the broker
    fn abort(self) {
        let lifetime = Local::now() - self.opened_at;
        debug!(
            "Aborting transport of {} after {}s",
            self.client_id,
            lifetime.num_seconds()
        );
        self.client.abort();
    }
}

impl Session<Opening> {
    fn start(client_id: String, epoch: u64, client: Box<dyn BrokerClient>) -> Self {
        Self::new(client_id, epoch, client, Local::now())
    }

    fn established(self) -> Session<Open> {
        info!("Session {} established", self.client_id);
        self.transition()
    }
}

impl Session<Open> {
    fn begin_close(self) -> Session<Closing> {
        info!("Closing session {}", self.client_id);
        self.transition()
    }
}

enum SessionSlot {
    Empty,
    Opening(Session<Opening>),
    Open(Session<Open>),
    Closing(Session<Closing>),
}

impl SessionSlot {
    fn state(&self) -> ConnectionState {
        match self {
            SessionSlot::Empty => ConnectionState::Disconnected,
            SessionSlot::Opening(_) => ConnectionState::Connecting,
            SessionSlot::Open(_) => ConnectionState::Connected,
            SessionSlot::Closing(_) => ConnectionState::Disconnecting,
        }
    }

    fn epoch(&self) -> Option<u64> {
        match self {
            SessionSlot::Empty => None,
            SessionSlot::Opening(s) => Some(s.epoch()),
            SessionSlot::Open(s) => Some(s.epoch()),
            SessionSlot::Closing(s) => Some(s.epoch()),
        }
    }

    fn client_id(&self) -> Option<&str> {
        match self {
            SessionSlot::Empty => None,
            SessionSlot::Opening(s) => Some(s.client_id()),
            SessionSlot::Open(s) => Some(s.client_id()),
            SessionSlot::Closing(s) => Some(s.client_id()),
        }
    }

    fn abort(self) {
        match self {
            SessionSlot::Empty => {}
            SessionSlot::Opening(s) => s.abort(),
            SessionSlot::Open(s) => s.abort(),
            SessionSlot::Closing(s) => s.abort(),
        }
    }
}

/// A connect attempt that has been handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAttempt {
    pub epoch: u64,
    pub client_id: String,
    /// A live session was torn down to make room for this one
    pub replaced: bool,
}

/// What a disconnect request turned into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectStart {
    /// Nothing to close
    AlreadyDisconnected,
    /// Close requested, acknowledgment pending
    Closing,
    /// A close is already pending
    AlreadyClosing,
    /// A connect attempt is pending; close once it resolves
    AwaitingConnect,
    /// The close request could not be issued; the session was dropped
    Forced,
}

/// How a transport close relates to the session in the slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    Stale,
    /// Acknowledgment of a requested close
    Requested,
    /// The broker or network dropped an established connection
    Unexpected,
    /// Closed before CONNACK
    DuringConnect,
}

/// Operations gated on the connection state
pub trait SessionOps {
    fn state(&self) -> ConnectionState;

    fn subscribe(&self, topic: &str) -> Result<(), SessionError>;

    fn unsubscribe(&self, topic: &str) -> Result<(), SessionError>;

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError>;
}

pub fn generate_client_id(prefix: &str) -> String {
    format!("{}{}", prefix, Uuid::new_v4().simple())
}

/// Owner of the single broker session
pub struct ConnectionSession {
    config: MqttConfig,
    connector: Arc<dyn BrokerConnector>,
    signals: mpsc::UnboundedSender<SessionSignal>,
    slot: SessionSlot,
    last_epoch: u64,
}

impl ConnectionSession {
    pub fn new(
        config: MqttConfig,
        connector: Arc<dyn BrokerConnector>,
        signals: mpsc::UnboundedSender<SessionSignal>,
    ) -> Self {
        Self {
            config,
            connector,
            signals,
            slot: SessionSlot::Empty,
            last_epoch: 0,
        }
    }

    pub fn client_id(&self) -> Option<&str> {
        self.slot.client_id()
    }

    pub fn epoch(&self) -> Option<u64> {
        self.slot.epoch()
    }

    fn take_slot(&mut self) -> SessionSlot {
        std::mem::replace(&mut self.slot, SessionSlot::Empty)
    }

    fn open_client(&self) -> Option<&dyn BrokerClient> {
        match &self.slot {
            SessionSlot::Open(s) => Some(s.client()),
            _ => None,
        }
    }

    fn schedule(&self, delay: Duration, signal: SessionSignal) {
        let tx = self.signals.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(signal);
        });
    }

    /// Starts a connect attempt.
    ///
    /// Valid from `Disconnected` and `Connected`. A live session is torn down
    /// before the new transport is opened.
    ///
    /// # Errors
    ///
    /// * [`SessionError::ConnectInProgress`] / [`SessionError::DisconnectInProgress`]
    ///   when another transition is pending
    /// * [`SessionError::Transport`] when the transport cannot be opened; the
    ///   state stays `Disconnected`
    pub fn connect(&mut self) -> Result<ConnectAttempt, SessionError> {
        match self.slot.state() {
            ConnectionState::Connecting => return Err(SessionError::ConnectInProgress),
            ConnectionState::Disconnecting => return Err(SessionError::DisconnectInProgress),
            ConnectionState::Connected | ConnectionState::Disconnected => {}
        }
        let replaced = match self.take_slot() {
            SessionSlot::Empty => false,
            live => {
                warn!(
                    "Replacing live session {}",
                    live.client_id().unwrap_or_default()
                );
                live.abort();
                true
            }
        };

        self.last_epoch += 1;
        let epoch = self.last_epoch;
        let client_id = generate_client_id(&self.config.client_id_prefix);
        let options = ConnectOptions {
            endpoint: self.config.url.clone(),
            client_id: client_id.clone(),
            keep_alive: self.config.keep_alive(),
            request_capacity: self.config.request_capacity,
        };

        info!("Connecting to {} as {}", options.endpoint, client_id);
        let client = self
            .connector
            .open(&options, EventSink::new(epoch, self.signals.clone()))
            .map_err(|e| {
                error!("Failed to open transport: {}", e);
                SessionError::from(e)
            })?;

        self.slot = SessionSlot::Opening(Session::start(client_id.clone(), epoch, client));
        self.schedule(
            self.config.connect_timeout(),
            SessionSignal::ConnectDeadline { epoch },
        );

        Ok(ConnectAttempt {
            epoch,
            client_id,
            replaced,
        })
    }

    /// CONNACK for `epoch`. Returns `true` on the `Connecting → Connected` edge.
    pub fn on_connack(&mut self, epoch: u64) -> bool {
        match self.take_slot() {
            SessionSlot::Opening(s) if s.epoch() == epoch => {
                self.slot = SessionSlot::Open(s.established());
                true
            }
            other => {
                self.slot = other;
                false
            }
        }
    }

    /// Connect failure or connect deadline for `epoch`. Returns `true` if the
    /// pending attempt was dropped.
    pub fn on_connect_failed(&mut self, epoch: u64) -> bool {
        match self.take_slot() {
            SessionSlot::Opening(s) if s.epoch() == epoch => {
                s.abort();
                true
            }
            other => {
                self.slot = other;
                false
            }
        }
    }

    /// Requests a clean close of the live session.
    pub fn disconnect(&mut self) -> DisconnectStart {
        match self.take_slot() {
            SessionSlot::Empty => DisconnectStart::AlreadyDisconnected,
            SessionSlot::Opening(s) => {
                self.slot = SessionSlot::Opening(s);
                DisconnectStart::AwaitingConnect
            }
            SessionSlot::Closing(s) => {
                self.slot = SessionSlot::Closing(s);
                DisconnectStart::AlreadyClosing
            }
            SessionSlot::Open(s) => {
                let closing = s.begin_close();
                match closing.client().close() {
                    Ok(()) => {
                        let epoch = closing.epoch();
                        self.slot = SessionSlot::Closing(closing);
                        self.schedule(
                            self.config.disconnect_timeout(),
                            SessionSignal::CloseDeadline { epoch },
                        );
                        DisconnectStart::Closing
                    }
                    Err(e) => {
                        warn!("Close request failed ({}), dropping session", e);
                        closing.abort();
                        DisconnectStart::Forced
                    }
                }
            }
        }
    }

    /// Transport close for `epoch`
    pub fn on_closed(&mut self, epoch: u64) -> CloseKind {
        if self.slot.epoch() != Some(epoch) {
            return CloseKind::Stale;
        }
        match self.take_slot() {
            SessionSlot::Closing(s) => {
                info!("Session {} closed cleanly", s.client_id());
                s.abort();
                CloseKind::Requested
            }
            SessionSlot::Open(s) => {
                warn!("Session {} closed by transport", s.client_id());
                s.abort();
                CloseKind::Unexpected
            }
            SessionSlot::Opening(s) => {
                s.abort();
                CloseKind::DuringConnect
            }
            SessionSlot::Empty => CloseKind::Stale,
        }
    }

    /// Fallback when a close is not acknowledged in time. Returns `true` if the
    /// session was force-cleared.
    pub fn on_close_deadline(&mut self, epoch: u64) -> bool {
        match self.take_slot() {
            SessionSlot::Closing(s) if s.epoch() == epoch => {
                warn!(
                    "No close acknowledgment for {} within {:?}, force-clearing",
                    s.client_id(),
                    self.config.disconnect_timeout()
                );
                s.abort();
                true
            }
            other => {
                self.slot = other;
                false
            }
        }
    }

    /// Inbound messages are accepted while the session object exists
    pub fn accepts_messages(&self, epoch: u64) -> bool {
        matches!(
            &self.slot,
            SessionSlot::Open(s) if s.epoch() == epoch
        ) || matches!(
            &self.slot,
            SessionSlot::Closing(s) if s.epoch() == epoch
        )
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.slot.epoch() == Some(epoch)
    }
}

impl SessionOps for ConnectionSession {
    fn state(&self) -> ConnectionState {
        self.slot.state()
    }

    fn subscribe(&self, topic: &str) -> Result<(), SessionError> {
        let client = self.open_client().ok_or(SessionError::NotConnected)?;
        client.subscribe(topic)?;
        debug!("SUBSCRIBE {} (QoS 0)", topic);
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), SessionError> {
        let client = self.open_client().ok_or(SessionError::NotConnected)?;
        client.unsubscribe(topic)?;
        debug!("UNSUBSCRIBE {}", topic);
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError> {
        let client = self.open_client().ok_or(SessionError::NotConnected)?;
        let size = payload.len();
        client.publish(topic, payload)?;
        debug!("PUBLISH {} ({} bytes, QoS 0)", topic, size);
        Ok(())
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.take_slot().abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::testing::{Call, MockConnector};
    use crate::mqtt::transport::TransportEvent;

    fn session(connector: &MockConnector) -> (ConnectionSession, mpsc::UnboundedReceiver<SessionSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = ConnectionSession::new(MqttConfig::default(), Arc::new(connector.clone()), tx);
        (session, rx)
    }

    #[tokio::test]
    async fn connect_walks_through_connecting_to_connected() {
        let connector = MockConnector::default();
        let (mut session, _rx) = session(&connector);
        assert_eq!(session.state(), ConnectionState::Disconnected);

        let attempt = session.connect().unwrap();
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert!(attempt.client_id.starts_with("mqtt_client_"));
        assert!(!attempt.replaced);

        assert!(session.on_connack(attempt.epoch));
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.client_id(), Some(attempt.client_id.as_str()));
    }

    #[tokio::test]
    async fn client_ids_are_fresh_per_attempt() {
        let connector = MockConnector::default();
        let (mut session, _rx) = session(&connector);
        let first = session.connect().unwrap();
        session.on_connack(first.epoch);
        let second = session.connect().unwrap();

        assert_ne!(first.client_id, second.client_id);
        assert!(second.replaced);
        assert_eq!(connector.opened().len(), 2);
        assert_eq!(connector.calls_for(&first.client_id), vec![Call::Abort]);
    }

    #[tokio::test]
    async fn second_connect_while_connecting_is_rejected() {
        let connector = MockConnector::default();
        let (mut session, _rx) = session(&connector);
        session.connect().unwrap();
        assert_eq!(session.connect(), Err(SessionError::ConnectInProgress));
        assert_eq!(connector.opened().len(), 1);
    }

    #[tokio::test]
    async fn open_failure_leaves_state_disconnected() {
        let connector = MockConnector::default();
        connector.fail_next_open("unreachable");
        let (mut session, _rx) = session(&connector);

        assert!(matches!(session.connect(), Err(SessionError::Transport(_))));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn stale_events_are_ignored() {
        let connector = MockConnector::default();
        let (mut session, _rx) = session(&connector);
        let first = session.connect().unwrap();
        session.on_connack(first.epoch);
        let second = session.connect().unwrap();

        assert!(!session.on_connack(first.epoch));
        assert_eq!(session.on_closed(first.epoch), CloseKind::Stale);
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert!(session.on_connack(second.epoch));
    }

    #[tokio::test]
    async fn operations_require_connected() {
        let connector = MockConnector::default();
        let (mut session, _rx) = session(&connector);
        assert_eq!(session.subscribe("a/b/c"), Err(SessionError::NotConnected));
        assert_eq!(
            session.publish("a/b/c", b"x".to_vec()),
            Err(SessionError::NotConnected)
        );

        let attempt = session.connect().unwrap();
        assert_eq!(session.unsubscribe("a/b/c"), Err(SessionError::NotConnected));
        session.on_connack(attempt.epoch);
        assert_eq!(session.subscribe("a/b/c"), Ok(()));
        assert_eq!(
            connector.calls_for(&attempt.client_id),
            vec![Call::Subscribe("a/b/c".to_string())]
        );
    }

    #[tokio::test]
    async fn disconnect_paths() {
        let connector = MockConnector::default();
        connector.set_auto_ack_close(false);
        let (mut session, mut rx) = session(&connector);
        assert_eq!(session.disconnect(), DisconnectStart::AlreadyDisconnected);

        let attempt = session.connect().unwrap();
        assert_eq!(session.disconnect(), DisconnectStart::AwaitingConnect);
        session.on_connack(attempt.epoch);

        assert_eq!(session.disconnect(), DisconnectStart::Closing);
        assert_eq!(session.state(), ConnectionState::Disconnecting);
        assert_eq!(session.disconnect(), DisconnectStart::AlreadyClosing);

        // close is not acknowledged by the mock
        assert!(rx.try_recv().is_err());
        assert_eq!(session.on_closed(attempt.epoch), CloseKind::Requested);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn close_deadline_force_clears() {
        let connector = MockConnector::default();
        connector.set_auto_ack_close(false);
        let (mut session, _rx) = session(&connector);
        let attempt = session.connect().unwrap();
        session.on_connack(attempt.epoch);
        session.disconnect();

        assert!(session.on_close_deadline(attempt.epoch));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!session.on_close_deadline(attempt.epoch));
    }

    #[tokio::test]
    async fn failed_close_request_drops_session() {
        let connector = MockConnector::default();
        let (mut session, _rx) = session(&connector);
        let attempt = session.connect().unwrap();
        session.on_connack(attempt.epoch);
        connector.fail_requests(true);

        assert_eq!(session.disconnect(), DisconnectStart::Forced);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn unexpected_close_of_live_session() {
        let connector = MockConnector::default();
        let (mut session, _rx) = session(&connector);
        let attempt = session.connect().unwrap();
        session.on_connack(attempt.epoch);

        assert!(session.accepts_messages(attempt.epoch));
        assert_eq!(session.on_closed(attempt.epoch), CloseKind::Unexpected);
        assert!(!session.accepts_messages(attempt.epoch));
    }

    #[tokio::test]
    async fn transport_reports_through_the_sink() {
        let connector = MockConnector::default();
        let (mut session, mut rx) = session(&connector);
        let attempt = session.connect().unwrap();

        connector.emit(TransportEvent::ConnAck);
        assert_eq!(
            rx.recv().await,
            Some(SessionSignal::Transport {
                epoch: attempt.epoch,
                event: TransportEvent::ConnAck
            })
        );
    }
}
