//! Outgoing messages
//!
//! Payloads get a ` | <ISO-8601>` suffix before they go on the wire, so the
//! wire payload differs from what the caller handed in. Delivery is QoS 0:
//! `Ok` means the transport accepted the message for transmission.

use super::error::PublishError;
use super::session::{ConnectionState, SessionOps};
use super::subscriptions::SubscriptionRegistry;
use crate::topics::Topic;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, warn};

/// `"<payload> | <timestamp>"` with millisecond precision and `Z` suffix
pub fn stamp_payload(payload: &str, now: DateTime<Utc>) -> String {
    format!(
        "{} | {}",
        payload,
        now.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

/// Validates and sends `payload` to `topic`. Returns the wire payload.
///
/// # Errors
///
/// * [`PublishError::NotConnected`] unless the session is `Connected`
/// * [`PublishError::EmptyPayload`] for an empty or blank payload
/// * [`PublishError::UnknownTopic`] when `topic` is not subscribed
/// * [`PublishError::Transport`] when the client queue refused the message
pub fn publish<S: SessionOps + ?Sized>(
    session: &S,
    registry: &SubscriptionRegistry,
    topic: &Topic,
    payload: &str,
    now: DateTime<Utc>,
) -> Result<String, PublishError> {
    if session.state() != ConnectionState::Connected {
        warn!("Not connected, dropping publish to {}", topic);
        return Err(PublishError::NotConnected);
    }
    if payload.trim().is_empty() {
        return Err(PublishError::EmptyPayload);
    }
    if !registry.is_subscribed(topic) {
        warn!("Refusing to publish to unsubscribed topic {}", topic);
        return Err(PublishError::UnknownTopic(topic.clone()));
    }

    let wire = stamp_payload(payload, now);
    session.publish(topic.as_str(), wire.clone().into_bytes())?;
    debug!("Published to {}: {}", topic, wire);
    Ok(wire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::error::{SessionError, TransportError};
    use chrono::TimeZone;
    use std::cell::{Cell, RefCell};

    struct Recorder {
        state: Cell<ConnectionState>,
        sent: RefCell<Vec<(String, String)>>,
        refuse: Cell<bool>,
    }

    impl Recorder {
        fn new(state: ConnectionState) -> Self {
            Self {
                state: Cell::new(state),
                sent: RefCell::new(Vec::new()),
                refuse: Cell::new(false),
            }
        }
    }

    impl SessionOps for Recorder {
        fn state(&self) -> ConnectionState {
            self.state.get()
        }

        fn subscribe(&self, _topic: &str) -> Result<(), SessionError> {
            Ok(())
        }

        fn unsubscribe(&self, _topic: &str) -> Result<(), SessionError> {
            Ok(())
        }

        fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError> {
            if self.refuse.get() {
                return Err(TransportError::Request("queue full".to_string()).into());
            }
            let payload = String::from_utf8(payload).unwrap();
            self.sent.borrow_mut().push((topic.to_string(), payload));
            Ok(())
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap()
    }

    fn subscribed(session: &Recorder, topic: &Topic) -> SubscriptionRegistry {
        let mut registry = SubscriptionRegistry::new();
        registry.request_subscribe([topic.clone()], session);
        registry
    }

    #[test]
    fn stamp_appends_iso_timestamp() {
        assert_eq!(
            stamp_payload("hello", now()),
            "hello | 2024-03-01T12:30:05.000Z"
        );
    }

    #[test]
    fn publish_sends_stamped_payload() {
        let session = Recorder::new(ConnectionState::Connected);
        let topic = Topic::from("g1/alice/status");
        let registry = subscribed(&session, &topic);

        let wire = publish(&session, &registry, &topic, "hello", now()).unwrap();
        assert_eq!(wire, "hello | 2024-03-01T12:30:05.000Z");
        assert_eq!(
            *session.sent.borrow(),
            vec![("g1/alice/status".to_string(), wire)]
        );
    }

    #[test]
    fn publish_outside_connected_never_reaches_transport() {
        let session = Recorder::new(ConnectionState::Connected);
        let topic = Topic::from("g1/alice/status");
        let registry = subscribed(&session, &topic);

        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Disconnecting,
        ] {
            session.state.set(state);
            assert_eq!(
                publish(&session, &registry, &topic, "hello", now()),
                Err(PublishError::NotConnected)
            );
        }
        assert!(session.sent.borrow().is_empty());
    }

    #[test]
    fn input_validation() {
        let session = Recorder::new(ConnectionState::Connected);
        let topic = Topic::from("g1/alice/status");
        let registry = subscribed(&session, &topic);

        assert_eq!(
            publish(&session, &registry, &topic, "  ", now()),
            Err(PublishError::EmptyPayload)
        );
        let other = Topic::from("g1/bob/status");
        assert_eq!(
            publish(&session, &registry, &other, "hi", now()),
            Err(PublishError::UnknownTopic(other.clone()))
        );
        assert!(session.sent.borrow().is_empty());
    }

    #[test]
    fn transport_refusal_is_reported() {
        let session = Recorder::new(ConnectionState::Connected);
        let topic = Topic::from("g1/alice/command");
        let registry = subscribed(&session, &topic);
        session.refuse.set(true);

        assert!(matches!(
            publish(&session, &registry, &topic, "go", now()),
            Err(PublishError::Transport(TransportError::Request(_)))
        ));
    }
}
