//! Control-channel frames.
//!
//! One frame per channel message, JSON encoded with a `type` discriminator:
//!
//! ```text
//! { "type": "connect",          "id": "s1", "host": "example.com", "port": 443, "data"?: "..." }
//! { "type": "connect_response", "id": "s1", "status": "success" | "failure", "error"?: "..." }
//! { "type": "data",             "id": "s1", "data": "<base64>" }
//! { "type": "close",            "id": "s1" }
//! { "type": "address",          "id": "<destination identity>" }
//! { "type": "ping" | "pong",    "id": "<token>" }
//! ```
//!
//! Unknown `type` values decode to [`Frame::Unknown`] so newer peers can add
//! frame types without breaking us.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::errors::{RelayError, Result};
use crate::ids::StreamId;

/// Outcome carried by a `connect_response` frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectStatus {
    /// The outbound socket is open.
    Success,
    /// The stream was not opened; `error` says why.
    Failure,
}

/// A discrete control-channel message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Request to open a stream to `host:port`.
    Connect {
        /// Stream id chosen by the requester.
        id: StreamId,
        /// Destination host. Anything but a string reads as absent.
        #[serde(
            default,
            deserialize_with = "lenient_host",
            skip_serializing_if = "Option::is_none"
        )]
        host: Option<String>,
        /// Destination port. Numeric strings are accepted; any other
        /// non-integer value reads as a port no destination accepts.
        #[serde(
            default,
            deserialize_with = "lenient_port",
            skip_serializing_if = "Option::is_none"
        )]
        port: Option<i64>,
        /// Base64 bytes to write as soon as the socket opens.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
    /// Answer to a `connect`.
    ConnectResponse {
        /// Stream id from the `connect`.
        id: StreamId,
        /// Whether the stream opened.
        status: ConnectStatus,
        /// Failure reason.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Base64 payload for a stream.
    Data {
        /// Stream id.
        id: StreamId,
        /// Base64 (standard alphabet, padded) bytes.
        data: String,
    },
    /// One side of a stream is done.
    Close {
        /// Stream id.
        id: StreamId,
    },
    /// Announces the destination identity of this relay.
    Address {
        /// Opaque identity value.
        id: String,
    },
    /// Liveness check from the counterparty.
    Ping {
        /// Token echoed back in the `pong`.
        id: String,
    },
    /// Answer to a `ping`.
    Pong {
        /// Token from the `ping`.
        id: String,
    },
    /// Any frame type this build does not understand.
    #[serde(other)]
    Unknown,
}

impl Frame {
    /// Parse one channel message.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| RelayError::Protocol(e.to_string()))
    }

    /// Serialize for the channel.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| RelayError::Protocol(e.to_string()))
    }

    /// `connect_response` with `status: success`.
    pub fn connect_success(id: StreamId) -> Self {
        Self::ConnectResponse {
            id,
            status: ConnectStatus::Success,
            error: None,
        }
    }

    /// `connect_response` with `status: failure` and a reason.
    pub fn connect_failure(id: StreamId, error: impl Into<String>) -> Self {
        Self::ConnectResponse {
            id,
            status: ConnectStatus::Failure,
            error: Some(error.into()),
        }
    }

    /// `data` frame carrying `bytes`.
    pub fn data(id: StreamId, bytes: &[u8]) -> Self {
        Self::Data {
            id,
            data: encode_payload(bytes),
        }
    }

    /// `close` frame.
    pub fn close(id: StreamId) -> Self {
        Self::Close { id }
    }

    /// `address` frame announcing `identity`.
    pub fn address(identity: impl Into<String>) -> Self {
        Self::Address { id: identity.into() }
    }

    /// `pong` answering a ping with `token`.
    pub fn pong(token: impl Into<String>) -> Self {
        Self::Pong { id: token.into() }
    }

    /// Stream the frame belongs to, for stream-scoped frame types.
    pub fn stream_id(&self) -> Option<&StreamId> {
        match self {
            Self::Connect { id, .. }
            | Self::ConnectResponse { id, .. }
            | Self::Data { id, .. }
            | Self::Close { id } => Some(id),
            Self::Address { .. } | Self::Ping { .. } | Self::Pong { .. } | Self::Unknown => None,
        }
    }

    /// Wire name of the frame type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::ConnectResponse { .. } => "connect_response",
            Self::Data { .. } => "data",
            Self::Close { .. } => "close",
            Self::Address { .. } => "address",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Unknown => "unknown",
        }
    }
}

/// Encode bytes for a `data` field.
pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a `data` field.
pub fn decode_payload(data: &str) -> Result<Bytes> {
    STANDARD
        .decode(data)
        .map(Bytes::from)
        .map_err(|e| RelayError::Protocol(format!("invalid base64 payload: {e}")))
}

/// Stands in for a port that is present but not an integer.
const UNUSABLE_PORT: i64 = -1;

// A mistyped field must not sink the whole frame: the requester still needs
// its failure `connect_response`.
fn lenient_host<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(host)) => Some(host),
        _ => None,
    })
}

fn lenient_port<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => Some(n.as_i64().unwrap_or(UNUSABLE_PORT)),
        Some(Value::String(s)) => Some(s.trim().parse().unwrap_or(UNUSABLE_PORT)),
        Some(_) => Some(UNUSABLE_PORT),
    })
}
