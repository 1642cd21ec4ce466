//! Subscription registry
//!
//! Tracks two disjoint topic lists: `subscribed` (issued against the live
//! session) and `queued` (requested while not connected, flushed on the
//! `Connected` edge). Insertion order is kept for listings.

use super::error::SessionError;
use super::session::{ConnectionState, SessionOps};
use crate::topics::Topic;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Copy of both lists for collaborators
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionSnapshot {
    pub subscribed: Vec<Topic>,
    pub queued: Vec<Topic>,
}

/// Outcome of a subscribe request or a queue flush, per topic
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeReport {
    /// Subscribe call issued, now in `subscribed`
    pub issued: Vec<Topic>,
    /// Deferred until the next `Connected` edge
    pub queued: Vec<Topic>,
    /// Already subscribed or already queued
    pub skipped: Vec<Topic>,
    pub failed: Vec<(Topic, SessionError)>,
}

/// Outcome of an unsubscribe request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unsubscribe {
    Removed,
    /// Removed locally although the unsubscribe call failed
    RemovedWithError(SessionError),
    NotSubscribed,
    NotConnected,
}

impl Unsubscribe {
    pub fn accepted(&self) -> bool {
        matches!(self, Unsubscribe::Removed | Unsubscribe::RemovedWithError(_))
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscribed: Vec<Topic>,
    queued: Vec<Topic>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_subscribed(&self, topic: &Topic) -> bool {
        self.subscribed.contains(topic)
    }

    pub fn is_queued(&self, topic: &Topic) -> bool {
        self.queued.contains(topic)
    }

    pub fn subscribed(&self) -> &[Topic] {
        &self.subscribed
    }

    pub fn queued(&self) -> &[Topic] {
        &self.queued
    }

    pub fn snapshot(&self) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            subscribed: self.subscribed.clone(),
            queued: self.queued.clone(),
        }
    }

    /// Subscribes right away when connected, queues otherwise.
    pub fn request_subscribe<S, I>(&mut self, topics: I, session: &S) -> SubscribeReport
    where
        S: SessionOps + ?Sized,
        I: IntoIterator<Item = Topic>,
    {
        let connected = session.state() == ConnectionState::Connected;
        let mut report = SubscribeReport::default();

        for topic in topics {
            if self.is_subscribed(&topic) || (!connected && self.is_queued(&topic)) {
                debug!("{} already requested", topic);
                report.skipped.push(topic);
                continue;
            }

            if connected {
                match session.subscribe(topic.as_str()) {
                    Ok(()) => {
                        self.queued.retain(|t| t != &topic);
                        self.subscribed.push(topic.clone());
                        report.issued.push(topic);
                    }
                    Err(e) => {
                        warn!("Failed to subscribe to {}: {}", topic, e);
                        report.failed.push((topic, e));
                    }
                }
            } else {
                debug!("Not connected, queueing {}", topic);
                self.queued.push(topic.clone());
                report.queued.push(topic);
            }
        }
        report
    }

    /// Issues every queued subscription. Topics whose subscribe call fails
    /// stay queued for the next `Connected` edge.
    pub fn flush_queued<S: SessionOps + ?Sized>(&mut self, session: &S) -> SubscribeReport {
        let mut report = SubscribeReport::default();
        let pending = std::mem::take(&mut self.queued);
        if !pending.is_empty() {
            info!("Flushing {} queued subscriptions", pending.len());
        }

        for topic in pending {
            if self.is_subscribed(&topic) {
                report.skipped.push(topic);
                continue;
            }
            match session.subscribe(topic.as_str()) {
                Ok(()) => {
                    self.subscribed.push(topic.clone());
                    report.issued.push(topic);
                }
                Err(e) => {
                    warn!("Queued subscription to {} failed: {}", topic, e);
                    self.queued.push(topic.clone());
                    report.failed.push((topic, e));
                }
            }
        }
        report
    }

    /// Optimistic unsubscribe: the topic leaves `subscribed` even when the
    /// unsubscribe call fails.
    pub fn request_unsubscribe<S: SessionOps + ?Sized>(
        &mut self,
        topic: &Topic,
        session: &S,
    ) -> Unsubscribe {
        if session.state() != ConnectionState::Connected {
            warn!("Not connected, cannot unsubscribe from {}", topic);
            return Unsubscribe::NotConnected;
        }
        if !self.is_subscribed(topic) {
            debug!("{} is not subscribed", topic);
            return Unsubscribe::NotSubscribed;
        }

        let result = session.unsubscribe(topic.as_str());
        self.subscribed.retain(|t| t != topic);
        match result {
            Ok(()) => {
                info!("Unsubscribed from {}", topic);
                Unsubscribe::Removed
            }
            Err(e) => {
                warn!("Unsubscribe from {} failed, removed locally: {}", topic, e);
                Unsubscribe::RemovedWithError(e)
            }
        }
    }

    /// Moves every active subscription back into the queue, ahead of what
    /// was already queued. Used when the session they were issued on is gone.
    pub fn requeue_all(&mut self) {
        if self.subscribed.is_empty() {
            return;
        }
        debug!("Re-queueing {} subscriptions", self.subscribed.len());
        let mut queued = std::mem::take(&mut self.subscribed);
        for topic in self.queued.drain(..) {
            if !queued.contains(&topic) {
                queued.push(topic);
            }
        }
        self.queued = queued;
    }

    pub fn clear(&mut self) {
        self.subscribed.clear();
        self.queued.clear();
    }
}
