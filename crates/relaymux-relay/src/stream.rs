//! One multiplexed stream and its state machine.
//!
//! ```text
//!            socket opened               close frame / socket EOF
//! (none) ──► Pending ─────────────► Open ─────────────────────────► Closing
//!               │                                                     │
//!               │ open failed / bad destination / cancelled           │ drained
//!               ▼                                                     ▼
//!             Closed ◄──────────── transport lost (any state) ────── Closed
//! ```
//!
//! `Closed` is never stored: [`Stream::close`] consumes the stream, and the
//! coordinator removes it from the registry in the same step.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use relaymux_core::{Destination, RelayError, Result, StreamId};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::bridge::SocketBridge;

/// Lifecycle state of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Connect requested, outbound socket not yet open.
    Pending,
    /// Socket open, forwarding in both directions.
    Open,
    /// Close initiated by either side, draining pending writes.
    Closing,
    /// Terminal.
    Closed,
}

impl StreamState {
    /// Lowercase name for logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

/// How a stream reaches `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseMode {
    /// Writes are drained; shut the socket down cleanly.
    Graceful,
    /// Local failure; drop the socket now and tell the peer.
    Reset,
    /// The transport is gone; drop the socket and send nothing.
    Invalidate,
}

/// What is left of a stream after [`Stream::close`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClosedStream {
    /// Stream id.
    pub id: StreamId,
    /// State the stream was in when closed.
    pub from: StreamState,
    /// Whether a `close` frame should be sent for this id.
    pub notify_peer: bool,
    /// Whether the stream counted toward `activeConnections`.
    pub was_active: bool,
    /// Whether inbound frames for the id were paused.
    pub was_paused: bool,
    /// Bytes read from the socket.
    pub bytes_in: u64,
    /// Bytes written to the socket.
    pub bytes_out: u64,
    /// Time since the connect frame arrived.
    pub lifetime: Duration,
}

/// Bytes from the peer waiting to be written to the socket.
#[derive(Debug, Default)]
pub(crate) struct WriteQueue {
    chunks: VecDeque<Bytes>,
    queued_bytes: usize,
    in_flight: Option<usize>,
}

impl WriteQueue {
    pub(crate) fn push(&mut self, bytes: Bytes) {
        self.queued_bytes += bytes.len();
        self.chunks.push_back(bytes);
    }

    /// Next chunk to write, if nothing is in flight.
    pub(crate) fn take_next(&mut self) -> Option<Bytes> {
        if self.in_flight.is_some() {
            return None;
        }
        let chunk = self.chunks.pop_front()?;
        self.in_flight = Some(chunk.len());
        Some(chunk)
    }

    /// Returns the length of the completed write.
    pub(crate) fn complete(&mut self) -> usize {
        let len = self.in_flight.take().unwrap_or(0);
        self.queued_bytes = self.queued_bytes.saturating_sub(len);
        len
    }

    /// Bytes queued or in flight.
    pub(crate) fn pending_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.chunks.is_empty() && self.in_flight.is_none()
    }
}

/// One virtual connection, owned by the coordinator.
pub struct Stream {
    id: StreamId,
    serial: u64,
    state: StreamState,
    destination: Destination,
    created_at: Instant,
    socket: Option<SocketBridge>,
    opener: Option<AbortHandle>,
    drain_timer: Option<AbortHandle>,
    writes: WriteQueue,
    peer_closed: bool,
    paused: bool,
    bytes_in: u64,
    bytes_out: u64,
}

impl Stream {
    /// A new pending stream. `serial` distinguishes it from earlier streams
    /// that used the same id.
    pub fn new(id: StreamId, serial: u64, destination: Destination) -> Self {
        Self {
            id,
            serial,
            state: StreamState::Pending,
            destination,
            created_at: Instant::now(),
            socket: None,
            opener: None,
            drain_timer: None,
            writes: WriteQueue::default(),
            peer_closed: false,
            paused: false,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    /// Stream id.
    pub fn id(&self) -> &StreamId {
        &self.id
    }

    /// Coordinator-assigned serial.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Current state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Where the stream is bridged to.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// When the connect frame arrived.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Bytes from the peer not yet written to the socket.
    pub fn pending_bytes(&self) -> usize {
        self.writes.pending_bytes()
    }

    /// Whether the peer has sent `close` for this id.
    pub fn is_peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Whether inbound frames are paused for this id.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Whether the stream counts toward `activeConnections`.
    pub fn is_active(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::Closing)
    }

    pub(crate) fn set_opener(&mut self, opener: AbortHandle) {
        self.opener = Some(opener);
    }

    /// Whether the drain deadline is running.
    pub(crate) fn drain_armed(&self) -> bool {
        self.drain_timer.is_some()
    }

    /// Arm the drain deadline. The first deadline stands; a later timer is
    /// cancelled.
    pub(crate) fn set_drain_timer(&mut self, timer: AbortHandle) {
        if self.drain_timer.is_some() {
            timer.abort();
        } else {
            self.drain_timer = Some(timer);
        }
    }

    pub(crate) fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// `Pending → Open` once the socket is up.
    pub(crate) fn open(&mut self, socket: SocketBridge) -> Result<()> {
        if self.state != StreamState::Pending {
            socket.abort();
            return Err(self.refuse("open"));
        }
        self.opener = None;
        self.socket = Some(socket);
        self.state = StreamState::Open;
        Ok(())
    }

    /// Queue bytes from the peer. Allowed before the socket opens; refused
    /// once the stream is closing.
    pub fn enqueue(&mut self, bytes: Bytes) -> Result<()> {
        match self.state {
            StreamState::Pending | StreamState::Open => {
                self.writes.push(bytes);
                Ok(())
            }
            StreamState::Closing | StreamState::Closed => Err(self.refuse("accept data")),
        }
    }

    /// Start the next socket write if the socket is idle. Returns `false` if
    /// the socket's writer has gone away.
    pub(crate) fn pump(&mut self) -> bool {
        let Some(socket) = self.socket.as_ref() else {
            return true;
        };
        match self.writes.take_next() {
            Some(chunk) => socket.write(chunk),
            None => true,
        }
    }

    /// Record a finished socket write.
    pub(crate) fn write_completed(&mut self) -> usize {
        let len = self.writes.complete();
        self.bytes_out += len as u64;
        len
    }

    /// Record bytes read from the socket.
    pub(crate) fn record_read(&mut self, len: usize) {
        self.bytes_in += len as u64;
    }

    /// The peer sent `close`: nothing more is forwarded to it.
    pub(crate) fn mark_peer_closed(&mut self) {
        self.peer_closed = true;
        if let Some(socket) = self.socket.as_ref() {
            socket.stop_reading();
        }
    }

    /// `Open → Closing`. Idempotent while closing.
    pub(crate) fn begin_close(&mut self) -> Result<()> {
        match self.state {
            StreamState::Open => {
                self.state = StreamState::Closing;
                Ok(())
            }
            StreamState::Closing => Ok(()),
            StreamState::Pending | StreamState::Closed => Err(self.refuse("begin closing")),
        }
    }

    /// Nothing left to write.
    pub fn is_drained(&self) -> bool {
        self.writes.is_drained()
    }

    /// Transition to `Closed`, releasing the socket according to `mode`.
    pub fn close(mut self, mode: CloseMode) -> ClosedStream {
        if let Some(opener) = self.opener.take() {
            opener.abort();
        }
        if let Some(timer) = self.drain_timer.take() {
            timer.abort();
        }
        if let Some(socket) = self.socket.take() {
            match mode {
                CloseMode::Graceful => socket.close(),
                CloseMode::Reset | CloseMode::Invalidate => socket.abort(),
            }
        }
        let from = std::mem::replace(&mut self.state, StreamState::Closed);
        // A pending stream that never opened has nothing for the peer to
        // close; the failure answer (if any) is its connect_response.
        let notify_peer = mode != CloseMode::Invalidate && !self.peer_closed && from != StreamState::Pending;
        ClosedStream {
            id: self.id,
            from,
            notify_peer,
            was_active: matches!(from, StreamState::Open | StreamState::Closing),
            was_paused: self.paused,
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
            lifetime: self.created_at.elapsed(),
        }
    }

    fn refuse(&self, action: &'static str) -> RelayError {
        RelayError::InvalidState {
            id: self.id.clone(),
            state: self.state.as_str(),
            action,
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("serial", &self.serial)
            .field("state", &self.state)
            .field("destination", &self.destination)
            .field("pending_bytes", &self.pending_bytes())
            .field("peer_closed", &self.peer_closed)
            .finish_non_exhaustive()
    }
}
