//! Transport error types.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors raised while establishing or using the control channel.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connector could not reach the gateway.
    #[error("connect failed: {0}")]
    Connect(String),
    /// The connect attempt did not finish in time.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    /// WebSocket protocol or I/O failure.
    #[error("websocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),
    /// The channel is closed.
    #[error("control channel closed")]
    Closed,
    /// The attempt was superseded by `disconnect()` or another attempt.
    #[error("connect attempt cancelled")]
    Cancelled,
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}
