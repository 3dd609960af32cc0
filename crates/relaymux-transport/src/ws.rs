//! WebSocket connector.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, future};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::channel::{ControlChannel, Connector};
use crate::errors::TransportError;

/// Connects to the gateway over a WebSocket.
///
/// Frames travel as text messages. Binary messages holding UTF-8 are
/// accepted as text; ping/pong control messages are answered by the
/// WebSocket library and never surface as frames.
#[derive(Clone, Debug)]
pub struct WsConnector {
    url: String,
    connect_timeout: Duration,
}

impl WsConnector {
    /// Connector for `url` with a per-attempt timeout.
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<ControlChannel, TransportError> {
        let (ws, response) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| TransportError::Timeout(self.connect_timeout))??;
        debug!(url = %self.url, status = %response.status(), "websocket handshake complete");

        let (sink, stream) = ws.split();
        let sink = sink.with(|text: String| future::ready(Ok::<_, TransportError>(Message::text(text))));
        let stream = stream.filter_map(|msg| future::ready(message_text(msg)));
        Ok(ControlChannel::new(sink, stream))
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

fn message_text(
    msg: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<String, TransportError>> {
    match msg {
        Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Some(Ok(text)),
            Err(_) => {
                debug!(len = bytes.len(), "ignoring non-UTF-8 binary message");
                None
            }
        },
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_)) => None,
        Err(err) => Some(Err(err.into())),
    }
}
