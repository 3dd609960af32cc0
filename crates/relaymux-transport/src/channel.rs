//! Control-channel abstraction.
//!
//! A [`ControlChannel`] is an ordered, message-oriented duplex of JSON text
//! messages. The session only needs a sink and a stream, so tests can stand
//! one up from plain channels.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};

use crate::errors::TransportError;

/// Outbound half: one text message per frame.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half: one text message per frame; the stream ends on close.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An established control channel.
pub struct ControlChannel {
    /// Messages to the gateway.
    pub sink: FrameSink,
    /// Messages from the gateway.
    pub stream: FrameStream,
}

impl ControlChannel {
    /// Box a sink and stream pair.
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<String, Error = TransportError> + Send + 'static,
        R: Stream<Item = Result<String, TransportError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel").finish_non_exhaustive()
    }
}

/// Establishes control channels to the gateway.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new channel. Called once per connect attempt.
    async fn connect(&self) -> Result<ControlChannel, TransportError>;

    /// Human-readable target for logs.
    fn endpoint(&self) -> String;
}
