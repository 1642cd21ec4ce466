//! Error types for the session manager
//!
//! Nothing here is fatal: every variant leaves the connection state machine
//! in a well-defined state and is returned or broadcast to the caller.

use crate::topics::Topic;
use std::time::Duration;
use thiserror::Error;

/// Failures reported by the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The broker URI could not be turned into transport options
    #[error("invalid broker endpoint: {0}")]
    InvalidEndpoint(String),

    /// Network unreachable, handshake rejected, CONNACK refused
    #[error("connect failed: {0}")]
    Handshake(String),

    /// The client request queue refused a subscribe/unsubscribe/publish/close
    #[error("request rejected by transport: {0}")]
    Request(String),

    #[error("transport closed")]
    Closed,
}

/// Errors of the connection session and the session manager
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("not connected")]
    NotConnected,

    #[error("a connect attempt is already in progress")]
    ConnectInProgress,

    #[error("a disconnect is in progress")]
    DisconnectInProgress,

    #[error("no CONNACK within {0:?}")]
    ConnectTimeout(Duration),

    /// The event loop owning the session has stopped
    #[error("session manager stopped")]
    ManagerStopped,
}

/// Rejections of the publish pipeline
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("not connected")]
    NotConnected,

    #[error("topic {0} is not subscribed")]
    UnknownTopic(Topic),

    #[error("payload is empty")]
    EmptyPayload,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("session manager stopped")]
    ManagerStopped,
}

impl From<SessionError> for PublishError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Transport(e) => PublishError::Transport(e),
            SessionError::ManagerStopped => PublishError::ManagerStopped,
            _ => PublishError::NotConnected,
        }
    }
}
