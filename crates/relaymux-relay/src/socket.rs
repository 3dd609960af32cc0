//! Outbound socket provider interface.
//!
//! The coordinator never dials anything itself. It asks a [`SocketProvider`]
//! for a byte stream to a destination and drives it through tokio's
//! `AsyncRead`/`AsyncWrite`: a pending write is the backpressure signal, a
//! zero-length read is the remote's close, and dropping the socket closes it.

use std::time::Duration;

use async_trait::async_trait;
use relaymux_core::constants::DEFAULT_DIAL_TIMEOUT;
use relaymux_core::{Destination, RelayError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// A bidirectional byte stream a relay stream can be bridged to.
pub trait RelaySocket: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> RelaySocket for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased socket handed out by providers.
pub type BoxedSocket = Box<dyn RelaySocket>;

/// Opens real outbound sockets.
#[async_trait]
pub trait SocketProvider: Send + Sync + 'static {
    /// Open a socket to `destination`. Failures become a `connect_response`
    /// with `status: failure` carrying the error text.
    async fn open(&self, destination: &Destination) -> Result<BoxedSocket, RelayError>;
}

/// Dials plain TCP with a connect timeout.
#[derive(Clone, Debug)]
pub struct TcpSocketProvider {
    dial_timeout: Duration,
}

impl TcpSocketProvider {
    /// Provider with the given connect timeout.
    pub fn new(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }
}

impl Default for TcpSocketProvider {
    fn default() -> Self {
        Self::new(DEFAULT_DIAL_TIMEOUT)
    }
}

#[async_trait]
impl SocketProvider for TcpSocketProvider {
    async fn open(&self, destination: &Destination) -> Result<BoxedSocket, RelayError> {
        let connect = TcpStream::connect((destination.host(), destination.port()));
        let stream = tokio::time::timeout(self.dial_timeout, connect)
            .await
            .map_err(|_| {
                RelayError::DestinationUnreachable(format!(
                    "connect to {destination} timed out after {:?}",
                    self.dial_timeout
                ))
            })?
            .map_err(|e| RelayError::DestinationUnreachable(e.to_string()))?;
        if let Err(error) = stream.set_nodelay(true) {
            debug!(%destination, %error, "failed to set TCP_NODELAY");
        }
        Ok(Box::new(stream))
    }
}
