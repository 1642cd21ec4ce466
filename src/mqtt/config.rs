use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker and session settings for the single WebSocket connection.
///
/// QoS, clean session and retain are fixed by the session manager (QoS 0,
/// clean, no retain). Auto-reconnect is always off; every reconnect is an
/// explicit `connect` call.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    /// WebSocket endpoint, e.g. `ws://10.0.0.5:9001`
    pub url: String,
    /// Prefix for generated client identifiers
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    /// Fallback after which a pending disconnect is force-cleared
    pub disconnect_timeout_ms: u64,
    /// Capacity of the outgoing request queue of the transport client
    pub request_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9001".to_string(),
            client_id_prefix: "mqtt_client_".to_string(),
            keep_alive_secs: 60,
            connect_timeout_secs: 30,
            disconnect_timeout_ms: 2000,
            request_capacity: 100,
        }
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

/// Read-time windows for the message views and the optional retention cap.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DisplayConfig {
    /// Entries shown for a generic topic
    pub latest_window: usize,
    /// Points shown for the numeric series topic
    pub series_window: usize,
    /// Last topic segment that designates the numeric series topic
    pub series_suffix: String,
    /// Per-topic history cap; `None` keeps the full history of a session
    pub retention_cap: Option<usize>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            latest_window: 10,
            series_window: 30,
            series_suffix: "EEG".to_string(),
            retention_cap: None,
        }
    }
}
