//! In-memory socket provider for tests.
//!
//! [`MockSocketProvider`] answers each open with one half of a
//! [`tokio::io::duplex`] pipe and passes the destination's half to the test
//! through a [`RemoteQueue`]. The pipe capacity bounds how much the relay can
//! write before the remote reads, which makes backpressure observable.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relaymux_core::{Destination, RelayError};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};

use crate::socket::{BoxedSocket, SocketProvider};

/// How long test helpers wait for traffic before giving up.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Socket provider whose sockets live entirely in memory.
#[derive(Debug)]
pub struct MockSocketProvider {
    remotes: mpsc::UnboundedSender<RemoteSocket>,
    capacity: usize,
    refused: Mutex<HashSet<String>>,
    opens: AtomicUsize,
    gate: watch::Sender<bool>,
}

impl MockSocketProvider {
    /// A provider with roomy pipes and the queue receiving each remote end.
    pub fn new() -> (Arc<Self>, RemoteQueue) {
        Self::with_capacity(DEFAULT_PIPE_CAPACITY)
    }

    /// A provider whose pipes buffer at most `capacity` bytes per direction.
    pub fn with_capacity(capacity: usize) -> (Arc<Self>, RemoteQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (gate, _) = watch::channel(true);
        let provider = Arc::new(Self {
            remotes: tx,
            capacity,
            refused: Mutex::new(HashSet::new()),
            opens: AtomicUsize::new(0),
            gate,
        });
        (provider, RemoteQueue { rx })
    }

    /// Fail every open to `host`.
    pub fn refuse(&self, host: impl Into<String>) {
        let _ = self.refused.lock().insert(host.into());
    }

    /// Make opens wait until [`release`](Self::release).
    pub fn hold(&self) {
        let _ = self.gate.send_replace(false);
    }

    /// Let held and future opens proceed.
    pub fn release(&self) {
        let _ = self.gate.send_replace(true);
    }

    /// Open calls made so far, including held and refused ones.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SocketProvider for MockSocketProvider {
    async fn open(&self, destination: &Destination) -> Result<BoxedSocket, RelayError> {
        let _ = self.opens.fetch_add(1, Ordering::SeqCst);

        let mut gate = self.gate.subscribe();
        loop {
            let open = *gate.borrow_and_update();
            if open {
                break;
            }
            if gate.changed().await.is_err() {
                return Err(RelayError::DestinationUnreachable("mock provider dropped".into()));
            }
        }

        if self.refused.lock().contains(destination.host()) {
            return Err(RelayError::DestinationUnreachable(format!(
                "connection refused: {destination}"
            )));
        }

        let (local, remote) = tokio::io::duplex(self.capacity);
        self.remotes
            .send(RemoteSocket {
                destination: destination.clone(),
                io: remote,
            })
            .map_err(|_| RelayError::DestinationUnreachable("mock remote queue dropped".into()))?;
        Ok(Box::new(local))
    }
}

/// Receives the destination end of each opened socket.
#[derive(Debug)]
pub struct RemoteQueue {
    rx: mpsc::UnboundedReceiver<RemoteSocket>,
}

impl RemoteQueue {
    /// Wait for the next opened socket.
    pub async fn next(&mut self) -> RemoteSocket {
        tokio::time::timeout(RECV_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for a socket")
            .expect("provider dropped")
    }

    /// The next socket if one is already waiting.
    pub fn try_next(&mut self) -> Option<RemoteSocket> {
        self.rx.try_recv().ok()
    }
}

/// The destination's side of one in-memory socket.
#[derive(Debug)]
pub struct RemoteSocket {
    destination: Destination,
    io: DuplexStream,
}

impl RemoteSocket {
    /// Where the relay thought it was connecting.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Read exactly `n` bytes written by the relay.
    pub async fn read_exact(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        let _ = tokio::time::timeout(RECV_TIMEOUT, self.io.read_exact(&mut buf))
            .await
            .expect("timed out reading from the relay")
            .expect("socket read failed");
        buf
    }

    /// Whatever is readable now, up to `max` bytes; empty once the relay
    /// closed or dropped its end.
    pub async fn read_some(&mut self, max: usize) -> Vec<u8> {
        let mut buf = vec![0u8; max];
        let n = tokio::time::timeout(RECV_TIMEOUT, self.io.read(&mut buf))
            .await
            .expect("timed out reading from the relay")
            .unwrap_or(0);
        buf.truncate(n);
        buf
    }

    /// Read until the relay closes or drops its end.
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        let mut buf = Vec::new();
        let _ = tokio::time::timeout(RECV_TIMEOUT, self.io.read_to_end(&mut buf))
            .await
            .expect("timed out waiting for the relay to close")
            .expect("socket read failed");
        buf
    }

    /// Send bytes toward the relay.
    pub async fn write(&mut self, bytes: &[u8]) {
        tokio::time::timeout(RECV_TIMEOUT, self.io.write_all(bytes))
            .await
            .expect("timed out writing to the relay")
            .expect("socket write failed");
    }

    /// Close the destination's sending half; the relay sees EOF.
    pub async fn shutdown(&mut self) {
        self.io.shutdown().await.expect("socket shutdown failed");
    }
}
