//! Settings structures.
//!
//! Every struct is `#[serde(default)]` so a partial settings file only needs
//! the keys it changes.

use std::time::Duration;

use relaymux_core::constants;
use relaymux_logging::LogFormat;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Top-level relay agent settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Control-channel connection settings.
    pub gateway: GatewaySettings,
    /// Destination identity announced to the gateway. The relay only
    /// connects on start when this is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Per-stream buffering and socket settings.
    pub streams: StreamSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
    /// Metrics exporter settings.
    pub metrics: MetricsSettings,
}

impl RelaySettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let url = self.gateway.url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(SettingsError::InvalidValue(format!(
                "gateway.url must be a ws:// or wss:// URL, got '{url}'"
            )));
        }
        if self.gateway.connect_timeout_ms == 0 {
            return Err(invalid("gateway.connectTimeoutMs must be > 0"));
        }
        if self.gateway.reconnect_backoff_ms == 0 {
            return Err(invalid("gateway.reconnectBackoffMs must be > 0"));
        }
        if self.gateway.send_queue_capacity == 0 {
            return Err(invalid("gateway.sendQueueCapacity must be > 0"));
        }
        if self.streams.max_chunk_bytes == 0 {
            return Err(invalid("streams.maxChunkBytes must be > 0"));
        }
        if self.streams.low_water_mark_bytes >= self.streams.high_water_mark_bytes {
            return Err(invalid(
                "streams.lowWaterMarkBytes must be below streams.highWaterMarkBytes",
            ));
        }
        if self.streams.dial_timeout_ms == 0 || self.streams.drain_timeout_ms == 0 {
            return Err(invalid("stream timeouts must be > 0"));
        }
        if self.identity.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(invalid("identity must not be blank"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> SettingsError {
    SettingsError::InvalidValue(msg.to_string())
}

/// Control-channel connection settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// WebSocket URL of the relay gateway.
    pub url: String,
    /// Timeout for a single connect attempt in milliseconds.
    pub connect_timeout_ms: u64,
    /// Fixed delay before reconnecting after a failure, in milliseconds.
    pub reconnect_backoff_ms: u64,
    /// Outbound data frames that may wait to be written before socket
    /// reads stall.
    pub send_queue_capacity: usize,
}

impl GatewaySettings {
    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Reconnect backoff as a [`Duration`].
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            url: constants::DEFAULT_GATEWAY_URL.to_string(),
            connect_timeout_ms: millis(constants::DEFAULT_CONNECT_TIMEOUT),
            reconnect_backoff_ms: millis(constants::RECONNECT_BACKOFF),
            send_queue_capacity: constants::DEFAULT_SEND_QUEUE_CAPACITY,
        }
    }
}

/// Per-stream settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    /// Largest payload per outbound `data` frame.
    pub max_chunk_bytes: usize,
    /// Pending-write bytes that pause inbound data for a stream.
    pub high_water_mark_bytes: usize,
    /// Pending-write bytes at which a paused stream resumes.
    pub low_water_mark_bytes: usize,
    /// Outbound TCP connect timeout in milliseconds.
    pub dial_timeout_ms: u64,
    /// Flush deadline for closing streams in milliseconds.
    pub drain_timeout_ms: u64,
}

impl StreamSettings {
    /// Dial timeout as a [`Duration`].
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Drain timeout as a [`Duration`].
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_chunk_bytes: constants::DEFAULT_MAX_CHUNK_BYTES,
            high_water_mark_bytes: constants::DEFAULT_HIGH_WATER_MARK,
            low_water_mark_bytes: constants::DEFAULT_LOW_WATER_MARK,
            dial_timeout_ms: millis(constants::DEFAULT_DIAL_TIMEOUT),
            drain_timeout_ms: millis(constants::DEFAULT_DRAIN_TIMEOUT),
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

/// Metrics exporter settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsSettings {
    /// Address for the Prometheus listener; no exporter when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_addr: Option<String>,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults_are_valid() {
        RelaySettings::default().validate().unwrap();
    }

    #[test]
    fn default_backoff_is_five_seconds() {
        let s = RelaySettings::default();
        assert_eq!(s.gateway.reconnect_backoff(), Duration::from_secs(5));
        assert_eq!(s.streams.max_chunk_bytes, 4096);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(RelaySettings::default()).unwrap();
        assert!(json["gateway"]["reconnectBackoffMs"].is_u64());
        assert!(json["streams"]["highWaterMarkBytes"].is_u64());
        assert!(json.get("identity").is_none());
        assert_eq!(json["logging"]["format"], "json");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: RelaySettings =
            serde_json::from_str(r#"{"identity":"bc1q","streams":{"maxChunkBytes":1024}}"#)
                .unwrap();
        assert_eq!(s.identity.as_deref(), Some("bc1q"));
        assert_eq!(s.streams.max_chunk_bytes, 1024);
        assert_eq!(s.streams.high_water_mark_bytes, constants::DEFAULT_HIGH_WATER_MARK);
        assert_eq!(s.gateway.url, constants::DEFAULT_GATEWAY_URL);
    }

    #[test]
    fn rejects_http_url() {
        let mut s = RelaySettings::default();
        s.gateway.url = "http://example.com".into();
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(msg)) if msg.contains("ws://"));
    }

    #[test]
    fn accepts_wss_url() {
        let mut s = RelaySettings::default();
        s.gateway.url = "wss://relay.example.com/ws".into();
        s.validate().unwrap();
    }

    #[test]
    fn rejects_inverted_water_marks() {
        let mut s = RelaySettings::default();
        s.streams.low_water_mark_bytes = s.streams.high_water_mark_bytes;
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn rejects_zero_chunk() {
        let mut s = RelaySettings::default();
        s.streams.max_chunk_bytes = 0;
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn rejects_zero_backoff() {
        let mut s = RelaySettings::default();
        s.gateway.reconnect_backoff_ms = 0;
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn rejects_blank_identity() {
        let s = RelaySettings {
            identity: Some("  ".into()),
            ..RelaySettings::default()
        };
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(_)));
    }
}
