//! Received messages and their per-topic history
//!
//! The store keeps every inbound message of the current session in arrival
//! order. Display bounds (latest 10, series 30) are read-time projections; the
//! underlying history is only shortened when a retention cap is configured.

use super::config::DisplayConfig;
use crate::topics::Topic;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::{debug, trace};

/// A received message, stamped on ingestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            content: content.into(),
            timestamp,
        }
    }

    /// ISO-8601 with millisecond precision and `Z` suffix
    pub fn timestamp_iso(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}  {}", self.timestamp_iso(), self.content)
    }
}

/// One point of the numeric series view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    /// Arrival index within the topic's history
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Parses the leading floating-point number of `text`, like a lenient
/// number parser would: `"12.5 | 2024-..."` yields `12.5`.
pub fn leading_float(text: &str) -> Option<f64> {
    let s = text.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;

    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end = 1;
    }
    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut digits = end - int_start;

    if end < bytes.len() && bytes[end] == b'.' {
        let frac_start = end + 1;
        let mut j = frac_start;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        digits += j - frac_start;
        if digits > 0 {
            end = j;
        }
    }
    if digits == 0 {
        return None;
    }

    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut j = end + 1;
        if j < bytes.len() && matches!(bytes[j], b'+' | b'-') {
            j += 1;
        }
        let exp_start = j;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        if j > exp_start {
            end = j;
        }
    }

    s[..end].parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Malformed samples degrade to zero
fn sample_value(content: &str) -> f64 {
    match leading_float(content) {
        Some(value) => value,
        None => {
            trace!("Non-numeric sample {:?}, using 0", content);
            0.0
        }
    }
}

#[derive(Debug, Default)]
struct TopicHistory {
    messages: VecDeque<Message>,
    /// Messages dropped by the retention cap, keeps indices monotonic
    evicted: usize,
}

impl TopicHistory {
    fn window(&self, n: usize) -> impl Iterator<Item = (usize, &Message)> {
        let skip = self.messages.len().saturating_sub(n);
        self.messages
            .iter()
            .enumerate()
            .skip(skip)
            .map(move |(pos, msg)| (self.evicted + pos, msg))
    }
}

/// Per-topic append-only message history
#[derive(Debug)]
pub struct MessageStore {
    histories: HashMap<Topic, TopicHistory>,
    /// Topics in order of their first message
    order: Vec<Topic>,
    retention_cap: Option<usize>,
    series_suffix: String,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new(&DisplayConfig::default())
    }
}

impl MessageStore {
    pub fn new(display: &DisplayConfig) -> Self {
        Self {
            histories: HashMap::new(),
            order: Vec::new(),
            retention_cap: display.retention_cap,
            series_suffix: display.series_suffix.clone(),
        }
    }

    /// Decodes the payload as UTF-8 (lossy), stamps it and appends it.
    pub fn ingest(&mut self, topic: &Topic, payload: &[u8]) -> Message {
        self.ingest_at(topic, payload, Utc::now())
    }

    pub fn ingest_at(&mut self, topic: &Topic, payload: &[u8], now: DateTime<Utc>) -> Message {
        let message = Message::new(String::from_utf8_lossy(payload), now);
        self.push(topic, message.clone());
        message
    }

    pub fn push(&mut self, topic: &Topic, message: Message) {
        if !self.histories.contains_key(topic) {
            self.order.push(topic.clone());
        }
        let history = self.histories.entry(topic.clone()).or_default();
        history.messages.push_back(message);

        if let Some(cap) = self.retention_cap {
            while history.messages.len() > cap {
                history.messages.pop_front();
                history.evicted += 1;
            }
        }
        trace!("{} now holds {} messages", topic, history.messages.len());
    }

    /// Last `n` messages of `topic`, oldest of the window first
    pub fn latest(&self, topic: &Topic, n: usize) -> Vec<Message> {
        self.histories
            .get(topic)
            .map(|history| history.window(n).map(|(_, msg)| msg.clone()).collect())
            .unwrap_or_default()
    }

    /// Numeric projection of the last `n` messages of `topic`
    pub fn numeric_series(&self, topic: &Topic, n: usize) -> Vec<SeriesPoint> {
        self.histories
            .get(topic)
            .map(|history| {
                history
                    .window(n)
                    .map(|(index, msg)| SeriesPoint {
                        index,
                        timestamp: msg.timestamp,
                        value: sample_value(&msg.content),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_series_topic(&self, topic: &Topic) -> bool {
        topic.has_suffix(&self.series_suffix)
    }

    /// First topic with history that carries the series suffix
    pub fn series_topic(&self) -> Option<&Topic> {
        self.order.iter().find(|t| self.is_series_topic(t))
    }

    pub fn topics(&self) -> &[Topic] {
        &self.order
    }

    pub fn len(&self, topic: &Topic) -> usize {
        self.histories
            .get(topic)
            .map_or(0, |history| history.messages.len())
    }

    pub fn total_messages(&self) -> usize {
        self.histories.values().map(|h| h.messages.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }

    pub fn clear(&mut self) {
        debug!("Clearing message history of {} topics", self.order.len());
        self.histories.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(sec: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + sec, 0).unwrap()
    }

    fn fill(store: &mut MessageStore, topic: &Topic, count: usize) {
        for i in 1..=count {
            store.ingest_at(topic, format!("m{}", i).as_bytes(), at(i as i64));
        }
    }

    #[test]
    fn latest_takes_the_tail_in_arrival_order() {
        let topic = Topic::from("g1/alice/status");
        let mut store = MessageStore::default();
        fill(&mut store, &topic, 15);

        let latest: Vec<String> = store
            .latest(&topic, 10)
            .into_iter()
            .map(|m| m.content)
            .collect();
        let expected: Vec<String> = (6..=15).map(|i| format!("m{}", i)).collect();
        assert_eq!(latest, expected);
        assert_eq!(store.len(&topic), 15, "read window must not evict");
    }

    #[test]
    fn latest_returns_everything_below_the_window() {
        let topic = Topic::from("g1/alice/status");
        let mut store = MessageStore::default();
        fill(&mut store, &topic, 3);
        assert_eq!(store.latest(&topic, 10).len(), 3);
        assert!(store.latest(&Topic::from("other"), 10).is_empty());
    }

    #[test]
    fn malformed_samples_become_zero() {
        let topic = Topic::from("g1/alice/EEG");
        let mut store = MessageStore::default();
        for payload in ["1.5", "abc", "-2e1 | 2024-01-01T00:00:00.000Z"] {
            store.ingest_at(&topic, payload.as_bytes(), at(0));
        }

        let values: Vec<f64> = store
            .numeric_series(&topic, 30)
            .iter()
            .map(|p| p.value)
            .collect();
        assert_eq!(values, vec![1.5, 0.0, -20.0]);
    }

    #[test]
    fn series_indices_follow_arrival_order() {
        let topic = Topic::from("g1/alice/EEG");
        let mut store = MessageStore::default();
        fill(&mut store, &topic, 40);

        let series = store.numeric_series(&topic, 30);
        assert_eq!(series.len(), 30);
        assert_eq!(series.first().map(|p| p.index), Some(10));
        assert_eq!(series.last().map(|p| p.index), Some(39));
    }

    #[test]
    fn retention_cap_evicts_oldest() {
        let display = DisplayConfig {
            retention_cap: Some(5),
            ..DisplayConfig::default()
        };
        let topic = Topic::from("g1/alice/EEG");
        let mut store = MessageStore::new(&display);
        fill(&mut store, &topic, 8);

        assert_eq!(store.len(&topic), 5);
        let series = store.numeric_series(&topic, 30);
        assert_eq!(series.first().map(|p| p.index), Some(3));
        assert_eq!(store.latest(&topic, 1)[0].content, "m8");
    }

    #[test]
    fn series_topic_is_first_matching_suffix() {
        let mut store = MessageStore::default();
        store.ingest_at(&Topic::from("g1/alice/status"), b"ok", at(0));
        store.ingest_at(&Topic::from("g1/alice/EEG"), b"1", at(1));
        store.ingest_at(&Topic::from("g1/bob/EEG"), b"2", at(2));

        assert_eq!(store.series_topic(), Some(&Topic::from("g1/alice/EEG")));
        assert_eq!(store.total_messages(), 3);

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.series_topic(), None);
    }

    #[test]
    fn payload_is_decoded_lossily() {
        let topic = Topic::from("t/p/raw");
        let mut store = MessageStore::default();
        let msg = store.ingest_at(&topic, &[0x68, 0x69, 0xff], at(0));
        assert_eq!(msg.content, "hi\u{fffd}");
    }

    #[test]
    fn leading_float_parsing() {
        assert_eq!(leading_float("  42"), Some(42.0));
        assert_eq!(leading_float(".5x"), Some(0.5));
        assert_eq!(leading_float("5."), Some(5.0));
        assert_eq!(leading_float("1e3 units"), Some(1000.0));
        assert_eq!(leading_float("1e"), Some(1.0));
        assert_eq!(leading_float("-"), None);
        assert_eq!(leading_float("."), None);
        assert_eq!(leading_float(""), None);
        assert_eq!(leading_float("1e999"), None);
    }

    #[test]
    fn iso_timestamp_has_millis_and_zulu() {
        let msg = Message::new("x", at(0));
        assert_eq!(msg.timestamp_iso(), "2023-11-14T22:13:20.000Z");
    }
}
