//! In-memory transport for tests: records every call and lets the test
//! inject broker events.

use super::error::TransportError;
use super::transport::{BrokerClient, BrokerConnector, ConnectOptions, EventSink, TransportEvent};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Subscribe(String),
    Unsubscribe(String),
    Publish(String, String),
    Close,
    Abort,
}

struct MockState {
    opened: Vec<ConnectOptions>,
    sinks: Vec<EventSink>,
    calls: Vec<(String, Call)>,
    fail_next_open: Option<String>,
    fail_requests: bool,
    auto_ack_close: bool,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            opened: Vec::new(),
            sinks: Vec::new(),
            calls: Vec::new(),
            fail_next_open: None,
            fail_requests: false,
            auto_ack_close: true,
        }
    }
}

#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn opened(&self) -> Vec<ConnectOptions> {
        self.state.lock().unwrap().opened.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        let state = self.state.lock().unwrap();
        state.calls.iter().map(|(_, call)| call.clone()).collect()
    }

    pub fn calls_for(&self, client_id: &str) -> Vec<Call> {
        let state = self.state.lock().unwrap();
        state
            .calls
            .iter()
            .filter(|(id, _)| id == client_id)
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn subscribe_count(&self, topic: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Subscribe(t) if t == topic))
            .count()
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Publish(topic, payload) => Some((topic, payload)),
                _ => None,
            })
            .collect()
    }

    /// Sends `event` through the sink of the most recent transport
    pub fn emit(&self, event: TransportEvent) -> bool {
        let sink = self.state.lock().unwrap().sinks.last().cloned();
        sink.is_some_and(|sink| sink.send(event))
    }

    /// Sends `event` through the sink of the `index`-th transport
    pub fn emit_to(&self, index: usize, event: TransportEvent) -> bool {
        let sink = self.state.lock().unwrap().sinks.get(index).cloned();
        sink.is_some_and(|sink| sink.send(event))
    }

    pub fn fail_next_open(&self, reason: &str) {
        self.state.lock().unwrap().fail_next_open = Some(reason.to_string());
    }

    pub fn fail_requests(&self, fail: bool) {
        self.state.lock().unwrap().fail_requests = fail;
    }

    pub fn set_auto_ack_close(&self, ack: bool) {
        self.state.lock().unwrap().auto_ack_close = ack;
    }
}

impl BrokerConnector for MockConnector {
    fn open(
        &self,
        options: &ConnectOptions,
        sink: EventSink,
    ) -> Result<Box<dyn BrokerClient>, TransportError> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = state.fail_next_open.take() {
            return Err(TransportError::Handshake(reason));
        }
        state.opened.push(options.clone());
        state.sinks.push(sink.clone());
        Ok(Box::new(MockClient {
            client_id: options.client_id.clone(),
            state: self.state.clone(),
            sink,
        }))
    }
}

struct MockClient {
    client_id: String,
    state: Arc<Mutex<MockState>>,
    sink: EventSink,
}

impl MockClient {
    fn record(&self, call: Call) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_requests && call != Call::Abort {
            return Err(TransportError::Request("queue closed".to_string()));
        }
        state.calls.push((self.client_id.clone(), call));
        Ok(())
    }
}

impl BrokerClient for MockClient {
    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.record(Call::Subscribe(topic.to_string()))
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.record(Call::Unsubscribe(topic.to_string()))
    }

    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let payload = String::from_utf8_lossy(&payload).into_owned();
        self.record(Call::Publish(topic.to_string(), payload))
    }

    fn close(&self) -> Result<(), TransportError> {
        self.record(Call::Close)?;
        let ack = self.state.lock().unwrap().auto_ack_close;
        if ack {
            self.sink.send(TransportEvent::Closed);
        }
        Ok(())
    }

    fn abort(&self) {
        let _ = self.record(Call::Abort);
    }
}
