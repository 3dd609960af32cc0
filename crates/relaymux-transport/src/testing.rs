//! In-memory control channel for tests.
//!
//! [`MockConnector`] hands out a fresh channel pair per connect attempt and
//! passes the gateway's end to the test through a [`PeerQueue`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use relaymux_core::Frame;
use tokio::sync::mpsc;

use crate::channel::{ControlChannel, Connector};
use crate::errors::TransportError;

/// How long test helpers wait for traffic before giving up.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Gateway buffer used by [`MockConnector::new`]; large enough that the
/// gateway never pushes back in ordinary tests.
const ROOMY_GATEWAY: usize = 1 << 16;

/// Connector whose channels live entirely in memory.
#[derive(Debug)]
pub struct MockConnector {
    peers: mpsc::UnboundedSender<PeerEnd>,
    attempts: AtomicUsize,
    failures: AtomicUsize,
    gateway_capacity: usize,
}

impl MockConnector {
    /// A connector and the queue receiving the gateway end of each channel.
    pub fn new() -> (Arc<Self>, PeerQueue) {
        Self::with_gateway_capacity(ROOMY_GATEWAY)
    }

    /// Like [`new`](Self::new), but the gateway buffers at most `capacity`
    /// unread frames beyond the one in flight. Writes from the relay stall
    /// until the test reads, like a slow gateway.
    pub fn with_gateway_capacity(capacity: usize) -> (Arc<Self>, PeerQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            peers: tx,
            attempts: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            gateway_capacity: capacity,
        });
        (connector, PeerQueue { rx })
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Connect attempts made so far, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<ControlChannel, TransportError> {
        let _ = self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Connect("mock gateway refused".into()));
        }

        let (to_relay_tx, to_relay_rx) = fmpsc::unbounded::<Result<String, TransportError>>();
        let (from_relay_tx, from_relay_rx) = fmpsc::channel::<String>(self.gateway_capacity);
        let peer = PeerEnd {
            to_relay: to_relay_tx,
            from_relay: from_relay_rx,
        };
        self.peers
            .send(peer)
            .map_err(|_| TransportError::Connect("mock peer queue dropped".into()))?;

        let sink = from_relay_tx.sink_map_err(|_| TransportError::Closed);
        Ok(ControlChannel::new(sink, to_relay_rx))
    }

    fn endpoint(&self) -> String {
        "mock://gateway".to_string()
    }
}

/// Receives the gateway end of each successful connect.
#[derive(Debug)]
pub struct PeerQueue {
    rx: mpsc::UnboundedReceiver<PeerEnd>,
}

impl PeerQueue {
    /// Wait for the next connection.
    pub async fn next(&mut self) -> PeerEnd {
        tokio::time::timeout(RECV_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    /// The next connection if one is already waiting.
    pub fn try_next(&mut self) -> Option<PeerEnd> {
        self.rx.try_recv().ok()
    }
}

/// The gateway's side of one in-memory control channel.
#[derive(Debug)]
pub struct PeerEnd {
    to_relay: fmpsc::UnboundedSender<Result<String, TransportError>>,
    from_relay: fmpsc::Receiver<String>,
}

impl PeerEnd {
    /// Send a frame to the relay.
    pub fn send(&self, frame: &Frame) {
        self.send_text(&frame.encode().expect("frame encodes"));
    }

    /// Send a raw message to the relay.
    pub fn send_text(&self, text: &str) {
        self.to_relay
            .unbounded_send(Ok(text.to_string()))
            .expect("relay side dropped");
    }

    /// Inject a read error, which the relay treats as an abrupt close.
    pub fn fail(&self, error: TransportError) {
        let _ = self.to_relay.unbounded_send(Err(error));
    }

    /// Close the gateway's sending half, as if the gateway went away.
    pub fn hang_up(&self) {
        self.to_relay.close_channel();
    }

    /// Wait for the next frame from the relay.
    pub async fn recv(&mut self) -> Frame {
        self.try_recv_within(RECV_TIMEOUT)
            .await
            .expect("timed out waiting for a frame")
    }

    /// Next frame within `wait`, or `None` on timeout or once the relay
    /// closed its end.
    pub async fn try_recv_within(&mut self, wait: Duration) -> Option<Frame> {
        let text = tokio::time::timeout(wait, self.from_relay.next())
            .await
            .ok()??;
        Some(Frame::decode(&text).expect("relay sent a valid frame"))
    }

    /// Every frame the relay sends until it closes its end.
    pub async fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.try_recv_within(RECV_TIMEOUT).await {
            frames.push(frame);
        }
        frames
    }
}
