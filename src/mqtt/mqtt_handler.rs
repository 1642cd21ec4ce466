//! MQTT Handler - single owner of the session, subscriptions and history
//!
//! Every mutation of the connection state, the subscription lists and the
//! message store happens on one task. Callers talk to it through the cloneable
//! [`MqttHandle`], which sends an [`MqttAction`] carrying a oneshot responder.
//! Transport events and timer deadlines arrive on a second channel as
//! [`SessionSignal`]s and are always drained before the next action, so a
//! `Connected` transition finishes flushing queued subscriptions before any
//! inbound message or command of that session is looked at.
//!
//! Notifications (connected, message, error, closed) are fanned out on a
//! broadcast channel of [`SessionEvent`]s.

use super::config::{DisplayConfig, MqttConfig};
use super::error::{PublishError, SessionError, TransportError};
use super::message_manager::{Message, MessageStore, SeriesPoint};
use super::publisher;
use super::session::{CloseKind, ConnectionSession, ConnectionState, DisconnectStart, SessionOps};
use super::subscriptions::{
    SubscribeReport, SubscriptionRegistry, SubscriptionSnapshot, Unsubscribe,
};
use super::transport::{BrokerConnector, SessionSignal, TransportEvent};
use crate::topics::Topic;
use chrono::{DateTime, Local, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const ACTION_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;
/// Error messages kept for the status view
const ERROR_LOG_LEN: usize = 20;

/// Notifications for whoever renders the session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected { client_id: String },
    Message { topic: Topic, message: Message },
    Error(String),
    /// The session is gone. `unexpected` marks a close nobody asked for.
    Closed { unexpected: bool },
}

/// How a disconnect request completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// The transport acknowledged the close
    Clean,
    /// There was nothing to close
    AlreadyDisconnected,
    /// No acknowledgment within the fallback timeout; state was force-reset
    ForcedAfterTimeout,
    /// The close request could not be issued; state was force-reset
    Forced,
}

/// Counters and recent errors of the handler
#[derive(Clone, Debug, Default)]
pub struct MqttStatus {
    pub connection_state: ConnectionState,
    pub client_id: Option<String>,
    pub subscribed: usize,
    pub queued: usize,
    /// Messages currently held by the store, all topics
    pub stored_messages: usize,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub error_messages: Vec<String>,
    pub last_activity: Option<DateTime<Local>>,
}

/// Completion handle of a connect attempt
#[derive(Debug)]
pub struct ConnectTicket {
    pub client_id: String,
    completion: oneshot::Receiver<Result<(), SessionError>>,
}

impl ConnectTicket {
    /// Resolves once the attempt succeeded, failed or timed out.
    pub async fn wait(self) -> Result<(), SessionError> {
        self.completion
            .await
            .unwrap_or(Err(SessionError::ManagerStopped))
    }
}

/// Commands understood by the handler task
#[derive(Debug)]
pub enum MqttAction {
    Connect {
        response_tx: oneshot::Sender<Result<ConnectTicket, SessionError>>,
    },
    Disconnect {
        response_tx: oneshot::Sender<DisconnectOutcome>,
    },
    Subscribe {
        topics: Vec<Topic>,
        response_tx: oneshot::Sender<SubscribeReport>,
    },
    Unsubscribe {
        topic: Topic,
        response_tx: oneshot::Sender<Unsubscribe>,
    },
    Publish {
        topic: Topic,
        payload: String,
        response_tx: oneshot::Sender<Result<String, PublishError>>,
    },
    State {
        response_tx: oneshot::Sender<ConnectionState>,
    },
    Subscriptions {
        response_tx: oneshot::Sender<SubscriptionSnapshot>,
    },
    Latest {
        topic: Topic,
        n: usize,
        response_tx: oneshot::Sender<Vec<Message>>,
    },
    Series {
        topic: Topic,
        n: usize,
        response_tx: oneshot::Sender<Vec<SeriesPoint>>,
    },
    SeriesTopic {
        response_tx: oneshot::Sender<Option<Topic>>,
    },
    Status {
        response_tx: oneshot::Sender<MqttStatus>,
    },
}

macro_rules! respond {
    ($response_tx:expr, $value:expr) => {
        if $response_tx.send($value).is_err() {
            debug!("Caller dropped the response channel");
        }
    };
}

pub struct MqttHandler {
    session: ConnectionSession,
    registry: SubscriptionRegistry,
    store: MessageStore,
    status: MqttStatus,
    events: broadcast::Sender<SessionEvent>,
    connect_timeout: std::time::Duration,
    pending_connect: Option<(u64, oneshot::Sender<Result<(), SessionError>>)>,
    /// Callers waiting for a disconnect. While `Connecting` these are
    /// deferred until the attempt resolves.
    disconnect_waiters: Vec<oneshot::Sender<DisconnectOutcome>>,
}

impl MqttHandler {
    /// Spawns the handler task and returns its handle.
    pub fn spawn(
        config: MqttConfig,
        display: DisplayConfig,
        connector: Arc<dyn BrokerConnector>,
    ) -> (MqttHandle, JoinHandle<()>) {
        let (action_tx, action_rx) = mpsc::channel(ACTION_CAPACITY);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shutdown = CancellationToken::new();

        let handler = MqttHandler {
            connect_timeout: config.connect_timeout(),
            session: ConnectionSession::new(config, connector, signal_tx),
            registry: SubscriptionRegistry::new(),
            store: MessageStore::new(&display),
            status: MqttStatus::default(),
            events: events.clone(),
            pending_connect: None,
            disconnect_waiters: Vec::new(),
        };

        let task = tokio::spawn(handler.run(action_rx, signal_rx, shutdown.clone()));
        let handle = MqttHandle {
            tx: action_tx,
            events,
            display,
            shutdown,
        };
        (handle, task)
    }

    async fn run(
        mut self,
        mut actions: mpsc::Receiver<MqttAction>,
        mut signals: mpsc::UnboundedReceiver<SessionSignal>,
        shutdown: CancellationToken,
    ) {
        info!("MQTT handler started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("MQTT handler shutting down");
                    break;
                }
                Some(signal) = signals.recv() => self.handle_signal(signal),
                action = actions.recv() => match action {
                    Some(action) => self.handle_action(action),
                    None => {
                        debug!("All handles dropped");
                        break;
                    }
                },
            }
        }
        // Dropping the session aborts any live transport
    }

    fn emit(&self, event: SessionEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    fn report_error(&mut self, message: String) {
        self.status.error_messages.push(message.clone());
        if self.status.error_messages.len() > ERROR_LOG_LEN {
            self.status.error_messages.remove(0);
        }
        self.emit(SessionEvent::Error(message));
    }

    fn touch(&mut self) {
        self.status.last_activity = Some(Local::now());
    }

    fn handle_action(&mut self, action: MqttAction) {
        match action {
            MqttAction::Connect { response_tx } => {
                respond!(response_tx, self.connect());
            }
            MqttAction::Disconnect { response_tx } => self.disconnect(response_tx),
            MqttAction::Subscribe {
                topics,
                response_tx,
            } => {
                let report = self.registry.request_subscribe(topics, &self.session);
                self.report_failures(&report);
                respond!(response_tx, report);
            }
            MqttAction::Unsubscribe { topic, response_tx } => {
                let outcome = self.registry.request_unsubscribe(&topic, &self.session);
                if let Unsubscribe::RemovedWithError(e) = &outcome {
                    self.report_error(format!("unsubscribe from {} failed: {}", topic, e));
                }
                respond!(response_tx, outcome);
            }
            MqttAction::Publish {
                topic,
                payload,
                response_tx,
            } => {
                let result =
                    publisher::publish(&self.session, &self.registry, &topic, &payload, Utc::now());
                match &result {
                    Ok(_) => {
                        self.status.messages_sent += 1;
                        self.touch();
                    }
                    Err(PublishError::Transport(e)) => {
                        self.report_error(format!("publish to {} failed: {}", topic, e));
                    }
                    Err(e) => debug!("Publish to {} rejected: {}", topic, e),
                }
                respond!(response_tx, result);
            }
            MqttAction::State { response_tx } => {
                respond!(response_tx, self.session.state());
            }
            MqttAction::Subscriptions { response_tx } => {
                respond!(response_tx, self.registry.snapshot());
            }
            MqttAction::Latest {
                topic,
                n,
                response_tx,
            } => {
                respond!(response_tx, self.store.latest(&topic, n));
            }
            MqttAction::Series {
                topic,
                n,
                response_tx,
            } => {
                respond!(response_tx, self.store.numeric_series(&topic, n));
            }
            MqttAction::SeriesTopic { response_tx } => {
                respond!(response_tx, self.store.series_topic().cloned());
            }
            MqttAction::Status { response_tx } => {
                let mut status = self.status.clone();
                status.connection_state = self.session.state();
                status.client_id = self.session.client_id().map(str::to_string);
                status.subscribed = self.registry.subscribed().len();
                status.queued = self.registry.queued().len();
                status.stored_messages = self.store.total_messages();
                respond!(response_tx, status);
            }
        }
    }

    fn report_failures(&mut self, report: &SubscribeReport) {
        for (topic, e) in &report.failed {
            self.report_error(format!("subscribe to {} failed: {}", topic, e));
        }
    }

    fn connect(&mut self) -> Result<ConnectTicket, SessionError> {
        let was_connected = self.session.state() == ConnectionState::Connected;
        let attempt = match self.session.connect() {
            Ok(attempt) => attempt,
            Err(e) => {
                if matches!(e, SessionError::Transport(_)) {
                    self.report_error(e.to_string());
                }
                if was_connected && self.session.state() == ConnectionState::Disconnected {
                    // The live session was torn down before the new transport failed to open
                    warn!("Replaced session is gone, re-queueing its subscriptions");
                    self.registry.requeue_all();
                    self.emit(SessionEvent::Closed { unexpected: false });
                }
                return Err(e);
            }
        };

        if attempt.replaced {
            // The old session's subscriptions died with it
            self.registry.requeue_all();
            self.emit(SessionEvent::Closed { unexpected: false });
        }

        let (completion_tx, completion) = oneshot::channel();
        self.pending_connect = Some((attempt.epoch, completion_tx));
        Ok(ConnectTicket {
            client_id: attempt.client_id,
            completion,
        })
    }

    fn resolve_connect(&mut self, epoch: u64, result: Result<(), SessionError>) {
        match self.pending_connect.take() {
            Some((pending, tx)) if pending == epoch => {
                respond!(tx, result);
            }
            other => self.pending_connect = other,
        }
    }

    fn disconnect(&mut self, response_tx: oneshot::Sender<DisconnectOutcome>) {
        self.disconnect_waiters.push(response_tx);
        match self.session.disconnect() {
            DisconnectStart::AlreadyDisconnected => {
                self.finish_disconnect(DisconnectOutcome::AlreadyDisconnected)
            }
            DisconnectStart::Closing => debug!("Waiting for close acknowledgment"),
            DisconnectStart::AlreadyClosing => debug!("Disconnect already pending"),
            DisconnectStart::AwaitingConnect => {
                info!("Disconnect requested while connecting, deferring")
            }
            DisconnectStart::Forced => self.finish_disconnect(DisconnectOutcome::Forced),
        }
    }

    /// Resets subscriptions and history and resolves every waiting caller.
    fn finish_disconnect(&mut self, outcome: DisconnectOutcome) {
        match outcome {
            DisconnectOutcome::ForcedAfterTimeout => {
                warn!("Disconnect completed without acknowledgment")
            }
            _ => info!("Disconnect completed: {:?}", outcome),
        }
        self.registry.clear();
        self.store.clear();
        for waiter in self.disconnect_waiters.drain(..) {
            respond!(waiter, outcome);
        }
        if outcome != DisconnectOutcome::AlreadyDisconnected {
            self.emit(SessionEvent::Closed { unexpected: false });
        }
    }

    /// A connect attempt ended without a session. Deferred disconnects
    /// complete here.
    fn connect_failed(&mut self, epoch: u64, err: SessionError) {
        self.report_error(err.to_string());
        self.resolve_connect(epoch, Err(err));
        if !self.disconnect_waiters.is_empty() {
            self.finish_disconnect(DisconnectOutcome::AlreadyDisconnected);
        }
    }

    fn handle_signal(&mut self, signal: SessionSignal) {
        match signal {
            SessionSignal::Transport { epoch, event } => self.handle_transport(epoch, event),
            SessionSignal::ConnectDeadline { epoch } => {
                if self.session.on_connect_failed(epoch) {
                    error!("Connect attempt timed out after {:?}", self.connect_timeout);
                    self.connect_failed(epoch, SessionError::ConnectTimeout(self.connect_timeout));
                }
            }
            SessionSignal::CloseDeadline { epoch } => {
                if self.session.on_close_deadline(epoch) {
                    self.finish_disconnect(DisconnectOutcome::ForcedAfterTimeout);
                }
            }
        }
    }

    fn handle_transport(&mut self, epoch: u64, event: TransportEvent) {
        match event {
            TransportEvent::ConnAck => {
                if !self.session.on_connack(epoch) {
                    debug!("Ignoring CONNACK of stale epoch {}", epoch);
                    return;
                }
                let client_id = self.session.client_id().unwrap_or_default().to_string();
                let deferred_close = !self.disconnect_waiters.is_empty();
                if !deferred_close {
                    let report = self.registry.flush_queued(&self.session);
                    self.report_failures(&report);
                }
                self.touch();
                self.emit(SessionEvent::Connected { client_id });
                self.resolve_connect(epoch, Ok(()));

                if deferred_close {
                    match self.session.disconnect() {
                        DisconnectStart::Forced => {
                            self.finish_disconnect(DisconnectOutcome::Forced)
                        }
                        start => debug!("Deferred disconnect: {:?}", start),
                    }
                }
            }
            TransportEvent::ConnectFailed(reason) => {
                if self.session.on_connect_failed(epoch) {
                    error!("Connect failed: {}", reason);
                    self.connect_failed(epoch, TransportError::Handshake(reason).into());
                }
            }
            TransportEvent::Message { topic, payload } => {
                if !self.session.accepts_messages(epoch) {
                    trace!("Dropping message on {} from epoch {}", topic, epoch);
                    return;
                }
                let topic = Topic::from(topic);
                let message = self.store.ingest(&topic, &payload);
                self.status.messages_received += 1;
                self.touch();
                self.emit(SessionEvent::Message { topic, message });
            }
            TransportEvent::Error(reason) => {
                if self.session.is_current(epoch) {
                    warn!("Transport error: {}", reason);
                    self.report_error(reason);
                }
            }
            TransportEvent::Closed => match self.session.on_closed(epoch) {
                CloseKind::Stale => debug!("Ignoring close of stale epoch {}", epoch),
                CloseKind::Requested => self.finish_disconnect(DisconnectOutcome::Clean),
                CloseKind::Unexpected => {
                    self.registry.requeue_all();
                    self.emit(SessionEvent::Closed { unexpected: true });
                }
                CloseKind::DuringConnect => {
                    self.connect_failed(epoch, TransportError::Closed.into());
                }
            },
        }
    }
}

/// Cloneable handle to the [`MqttHandler`] task
///
/// All operations are asynchronous requests to the handler. Queries never
/// block on the network; `connect` and `disconnect` return once the request
/// has been accepted and report completion separately ([`ConnectTicket`]) or
/// on resolution ([`DisconnectOutcome`]).
///
/// # Examples
///
/// ```no_run
/// use mqttdeck::mqtt::{MqttConfig, DisplayConfig, MqttHandler, WsConnector};
/// use mqttdeck::topics::Topic;
/// use std::sync::Arc;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let (handle, _task) = MqttHandler::spawn(
///     MqttConfig::default(),
///     DisplayConfig::default(),
///     Arc::new(WsConnector),
/// );
/// handle.subscribe(vec![Topic::from("g1/alice/EEG")]).await; // queued
/// handle.connect().await?.wait().await?;                      // flushed
/// handle.disconnect().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MqttHandle {
    tx: mpsc::Sender<MqttAction>,
    events: broadcast::Sender<SessionEvent>,
    display: DisplayConfig,
    shutdown: CancellationToken,
}

impl MqttHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> MqttAction,
    ) -> Option<T> {
        let (response_tx, response_rx) = oneshot::channel();
        if self.tx.send(make(response_tx)).await.is_err() {
            warn!("MQTT handler is not running");
            return None;
        }
        response_rx.await.ok()
    }

    /// Subscribes to session notifications from now on.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn display(&self) -> &DisplayConfig {
        &self.display
    }

    /// Starts a connect attempt with a fresh client identifier.
    ///
    /// A live session is torn down first. Rejected while another connect or a
    /// disconnect is pending.
    pub async fn connect(&self) -> Result<ConnectTicket, SessionError> {
        self.request(|response_tx| MqttAction::Connect { response_tx })
            .await
            .unwrap_or(Err(SessionError::ManagerStopped))
    }

    /// Closes the session. Resolves exactly once per call, also when there is
    /// nothing to close or a close is already pending.
    pub async fn disconnect(&self) -> DisconnectOutcome {
        self.request(|response_tx| MqttAction::Disconnect { response_tx })
            .await
            .unwrap_or(DisconnectOutcome::Forced)
    }

    /// Orderly teardown: unsubscribe every active topic, then disconnect.
    pub async fn disconnect_all(&self) -> DisconnectOutcome {
        if self.state().await == ConnectionState::Connected {
            let snapshot = self.subscriptions().await;
            for topic in snapshot.subscribed {
                self.unsubscribe(topic).await;
            }
        }
        self.disconnect().await
    }

    /// Subscribes now when connected, queues otherwise.
    pub async fn subscribe(&self, topics: Vec<Topic>) -> SubscribeReport {
        self.request(|response_tx| MqttAction::Subscribe {
            topics,
            response_tx,
        })
        .await
        .unwrap_or_default()
    }

    /// Returns whether the unsubscribe was accepted.
    pub async fn unsubscribe(&self, topic: Topic) -> bool {
        self.unsubscribe_detailed(topic)
            .await
            .is_some_and(|outcome| outcome.accepted())
    }

    pub async fn unsubscribe_detailed(&self, topic: Topic) -> Option<Unsubscribe> {
        self.request(|response_tx| MqttAction::Unsubscribe { topic, response_tx })
            .await
    }

    /// Publishes `payload` with a timestamp suffix. Returns the wire payload.
    pub async fn publish(&self, topic: Topic, payload: impl Into<String>) -> Result<String, PublishError> {
        let payload = payload.into();
        self.request(|response_tx| MqttAction::Publish {
            topic,
            payload,
            response_tx,
        })
        .await
        .unwrap_or(Err(PublishError::ManagerStopped))
    }

    /// `Disconnected` when the handler is gone
    pub async fn state(&self) -> ConnectionState {
        self.request(|response_tx| MqttAction::State { response_tx })
            .await
            .unwrap_or_default()
    }

    pub async fn subscriptions(&self) -> SubscriptionSnapshot {
        self.request(|response_tx| MqttAction::Subscriptions { response_tx })
            .await
            .unwrap_or_default()
    }

    pub async fn latest_messages(&self, topic: Topic, n: usize) -> Vec<Message> {
        self.request(|response_tx| MqttAction::Latest {
            topic,
            n,
            response_tx,
        })
        .await
        .unwrap_or_default()
    }

    pub async fn numeric_series(&self, topic: Topic, n: usize) -> Vec<SeriesPoint> {
        self.request(|response_tx| MqttAction::Series {
            topic,
            n,
            response_tx,
        })
        .await
        .unwrap_or_default()
    }

    /// First topic with history that carries the series suffix
    pub async fn series_topic(&self) -> Option<Topic> {
        self.request(|response_tx| MqttAction::SeriesTopic { response_tx })
            .await
            .flatten()
    }

    pub async fn status(&self) -> MqttStatus {
        self.request(|response_tx| MqttAction::Status { response_tx })
            .await
            .unwrap_or_default()
    }

    /// Stops the handler task; a live transport is aborted.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
