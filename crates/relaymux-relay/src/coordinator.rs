//! Relay coordinator: the single owner of all stream state.
//!
//! Everything that can change a stream arrives as a [`RelayEvent`] on one
//! inbox: transport events, socket open results, socket reads, write
//! completions, EOFs and errors. [`RelayCoordinator::handle`] never awaits;
//! socket I/O runs in per-stream tasks that report back through the inbox, so
//! registry mutation and control frame order are serialized while sockets of
//! different streams proceed in parallel.
//!
//! Destination bytes are the one exception: each socket reader queues its own
//! `data` frames on the transport, waiting for credit, and reports the count
//! afterwards. A stream's `connect_response` is queued before its reader
//! starts and its `close` after the reader has stopped.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use relaymux_core::constants::{
    DEFAULT_DRAIN_TIMEOUT, DEFAULT_HIGH_WATER_MARK, DEFAULT_LOW_WATER_MARK,
    DEFAULT_MAX_CHUNK_BYTES,
};
use relaymux_core::frame::decode_payload;
use relaymux_core::metrics::{
    RELAY_BYTES_IN_TOTAL, RELAY_BYTES_OUT_TOTAL, RELAY_STREAMS_ACTIVE, RELAY_STREAMS_FAILED_TOTAL,
    RELAY_STREAMS_OPENED_TOTAL, RELAY_STREAMS_PAUSED_TOTAL,
};
use relaymux_core::{Destination, Frame, RelayError, StreamId};
use relaymux_transport::{TransportEvent, TransportSession};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

use crate::bridge::{SocketBridge, Uplink};
use crate::registry::StreamRegistry;
use crate::socket::{BoxedSocket, SocketProvider};
use crate::status::{RelayStatus, StatusPublisher};
use crate::stream::{CloseMode, Stream, StreamState};

/// Per-stream tuning.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Largest payload per outbound `data` frame; also the socket read size.
    pub max_chunk_bytes: usize,
    /// Pending-write bytes that pause inbound data for a stream.
    pub high_water_mark: usize,
    /// Pending-write bytes at which a paused stream resumes.
    pub low_water_mark: usize,
    /// Flush deadline for closing streams.
    pub drain_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            low_water_mark: DEFAULT_LOW_WATER_MARK,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Which half of a socket failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketSide {
    /// Reading from the destination.
    Read,
    /// Writing to the destination.
    Write,
}

/// Everything the coordinator reacts to.
///
/// Socket events carry the serial of the stream they belong to; events whose
/// serial does not match the live stream for that id are stale and ignored.
pub enum RelayEvent {
    /// From the transport session.
    Transport(TransportEvent),
    /// The socket provider opened a socket.
    SocketOpened {
        /// Stream id.
        id: StreamId,
        /// Stream serial.
        serial: u64,
        /// The new socket.
        socket: BoxedSocket,
    },
    /// The socket provider failed.
    SocketFailed {
        /// Stream id.
        id: StreamId,
        /// Stream serial.
        serial: u64,
        /// Why.
        error: RelayError,
    },
    /// Bytes read from a socket and queued for the gateway.
    SocketRead {
        /// Stream id.
        id: StreamId,
        /// Stream serial.
        serial: u64,
        /// Bytes forwarded.
        len: usize,
    },
    /// A write to a socket finished.
    SocketWritten {
        /// Stream id.
        id: StreamId,
        /// Stream serial.
        serial: u64,
        /// Bytes written.
        len: usize,
    },
    /// The destination closed its side.
    SocketEof {
        /// Stream id.
        id: StreamId,
        /// Stream serial.
        serial: u64,
    },
    /// A socket read or write failed.
    SocketError {
        /// Stream id.
        id: StreamId,
        /// Stream serial.
        serial: u64,
        /// Failed half.
        side: SocketSide,
        /// Error text.
        error: String,
    },
    /// A closing stream did not drain in time.
    DrainExpired {
        /// Stream id.
        id: StreamId,
        /// Stream serial.
        serial: u64,
    },
    /// New destination identity to announce.
    SetIdentity(Option<String>),
    /// Close every stream and stop the event loop.
    Shutdown,
}

impl RelayEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::SocketOpened { .. } => "socket_opened",
            Self::SocketFailed { .. } => "socket_failed",
            Self::SocketRead { .. } => "socket_read",
            Self::SocketWritten { .. } => "socket_written",
            Self::SocketEof { .. } => "socket_eof",
            Self::SocketError { .. } => "socket_error",
            Self::DrainExpired { .. } => "drain_expired",
            Self::SetIdentity(_) => "set_identity",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Debug for RelayEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Bridges transport frames to outbound sockets, one stream per id.
pub struct RelayCoordinator {
    config: CoordinatorConfig,
    transport: TransportSession,
    provider: Arc<dyn SocketProvider>,
    registry: StreamRegistry,
    events: mpsc::UnboundedSender<RelayEvent>,
    status: StatusPublisher,
    identity: Option<String>,
    connected: bool,
    active: usize,
    next_serial: u64,
}

impl RelayCoordinator {
    /// Create a coordinator and register it as the transport's handler.
    ///
    /// Returns the inbox to pass to [`run`](Self::run).
    pub fn new(
        transport: TransportSession,
        provider: Arc<dyn SocketProvider>,
        config: CoordinatorConfig,
        identity: Option<String>,
    ) -> (Self, mpsc::UnboundedReceiver<RelayEvent>) {
        let (events, inbox) = mpsc::unbounded_channel();
        let forward = events.clone();
        transport.on_frame(move |event| {
            let _ = forward.send(RelayEvent::Transport(event));
        });
        let coordinator = Self {
            config,
            transport,
            provider,
            registry: StreamRegistry::new(),
            events,
            status: StatusPublisher::new(),
            identity,
            connected: false,
            active: 0,
            next_serial: 0,
        };
        (coordinator, inbox)
    }

    /// Sender for feeding events into this coordinator.
    pub fn sender(&self) -> mpsc::UnboundedSender<RelayEvent> {
        self.events.clone()
    }

    /// Status publisher for observers.
    pub fn status(&self) -> &StatusPublisher {
        &self.status
    }

    /// Live streams.
    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    /// Streams that opened and have not closed.
    pub fn active_connections(&self) -> usize {
        self.active
    }

    /// Process events until [`RelayEvent::Shutdown`].
    #[instrument(name = "relay_coordinator", skip_all)]
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<RelayEvent>) {
        while let Some(event) = inbox.recv().await {
            if !self.handle(event) {
                break;
            }
        }
        debug!("relay coordinator stopped");
    }

    /// Apply one event. Returns `false` once the coordinator has shut down.
    pub fn handle(&mut self, event: RelayEvent) -> bool {
        trace!(event = event.name(), "relay event");
        match event {
            RelayEvent::Transport(TransportEvent::Connected) => self.on_connected(),
            RelayEvent::Transport(TransportEvent::Disconnected { reconnect_in }) => {
                self.on_disconnected(reconnect_in);
            }
            RelayEvent::Transport(TransportEvent::Frame(frame)) => self.on_frame(frame),
            RelayEvent::SocketOpened { id, serial, socket } => {
                self.on_socket_opened(&id, serial, socket);
            }
            RelayEvent::SocketFailed { id, serial, error } => {
                self.on_socket_failed(&id, serial, &error);
            }
            RelayEvent::SocketRead { id, serial, len } => self.on_socket_read(&id, serial, len),
            RelayEvent::SocketWritten { id, serial, len } => {
                self.on_socket_written(&id, serial, len);
            }
            RelayEvent::SocketEof { id, serial } => self.on_socket_eof(&id, serial),
            RelayEvent::SocketError {
                id,
                serial,
                side,
                error,
            } => {
                if self.live(&id, serial).is_some() {
                    debug!(stream_id = %id, ?side, %error, "socket failed");
                    self.close_stream(&id, CloseMode::Reset);
                }
            }
            RelayEvent::DrainExpired { id, serial } => {
                if self
                    .live(&id, serial)
                    .is_some_and(|s| s.state() == StreamState::Closing)
                {
                    warn!(stream_id = %id, "closing stream did not drain in time");
                    self.close_stream(&id, CloseMode::Reset);
                }
            }
            RelayEvent::SetIdentity(identity) => {
                self.identity = identity;
                self.announce_identity();
            }
            RelayEvent::Shutdown => {
                self.invalidate_all();
                return false;
            }
        }
        true
    }

    // ── Transport lifecycle ─────────────────────────────────────────

    fn on_connected(&mut self) {
        self.connected = true;
        // Streams never survive a disconnect; nothing to replay.
        self.announce_identity();
        self.publish_status();
    }

    fn on_disconnected(&mut self, reconnect_in: Option<Duration>) {
        self.connected = false;
        let closed = self.invalidate_all();
        info!(
            streams_closed = closed,
            ?reconnect_in,
            "transport down, all streams invalidated"
        );
        self.publish_status();
    }

    fn invalidate_all(&mut self) -> usize {
        let streams = self.registry.drain();
        let count = streams.len();
        for stream in streams {
            let closed = stream.close(CloseMode::Invalidate);
            trace!(stream_id = %closed.id, from = closed.from.as_str(), "stream invalidated");
        }
        self.active = 0;
        count
    }

    fn announce_identity(&self) {
        if !self.connected {
            return;
        }
        if let Some(identity) = &self.identity {
            if self.transport.send(&Frame::address(identity.clone())) {
                debug!("destination identity announced");
            }
        }
    }

    // ── Inbound frames ──────────────────────────────────────────────

    fn on_frame(&mut self, frame: Frame) {
        if !self.connected {
            trace!(kind = frame.kind(), "frame after disconnect, ignoring");
            return;
        }
        match frame {
            Frame::Connect {
                id,
                host,
                port,
                data,
            } => self.on_connect(id, host.as_deref(), port, data.as_deref()),
            Frame::Data { id, data } => self.on_data(&id, &data),
            Frame::Close { id } => self.on_close(&id),
            Frame::Ping { id } => {
                let _ = self.transport.send(&Frame::pong(id));
            }
            Frame::Pong { id } => trace!(token = %id, "pong received"),
            Frame::ConnectResponse { id, .. } => {
                debug!(stream_id = %id, "ignoring connect_response; streams are opened by the gateway");
            }
            Frame::Address { .. } | Frame::Unknown => {}
        }
    }

    fn on_connect(&mut self, id: StreamId, host: Option<&str>, port: Option<i64>, data: Option<&str>) {
        if self.registry.contains(&id) {
            warn!(stream_id = %id, "connect for a live id rejected");
            let error = RelayError::DuplicateId(id.clone());
            self.reject(id, &error);
            return;
        }
        let destination = match Destination::from_frame_fields(host, port) {
            Ok(destination) => destination,
            Err(error) => {
                debug!(stream_id = %id, ?host, ?port, %error, "connect without usable destination");
                self.reject(id, &error);
                return;
            }
        };
        let early = match data.map(decode_payload).transpose() {
            Ok(early) => early,
            Err(error) => {
                warn!(stream_id = %id, %error, "connect carried undecodable data");
                self.reject(id, &error);
                return;
            }
        };

        self.next_serial += 1;
        let serial = self.next_serial;
        let mut stream = Stream::new(id.clone(), serial, destination.clone());
        if let Some(bytes) = early.filter(|b| !b.is_empty()) {
            let _ = stream.enqueue(bytes);
        }

        let provider = Arc::clone(&self.provider);
        let events = self.events.clone();
        let open_id = id.clone();
        let opener = tokio::spawn(async move {
            let event = match provider.open(&destination).await {
                Ok(socket) => RelayEvent::SocketOpened {
                    id: open_id,
                    serial,
                    socket,
                },
                Err(error) => RelayEvent::SocketFailed {
                    id: open_id,
                    serial,
                    error,
                },
            };
            let _ = events.send(event);
        });
        stream.set_opener(opener.abort_handle());

        match self.registry.create(stream) {
            Ok(stream) => {
                debug!(stream_id = %id, serial, destination = %stream.destination(), "stream pending");
            }
            Err(error) => {
                opener.abort();
                self.reject(id, &error);
            }
        }
    }

    fn on_data(&mut self, id: &StreamId, payload: &str) {
        let Ok(stream) = self.registry.get_mut(id) else {
            debug!(stream_id = %id, "data for unknown stream discarded");
            return;
        };
        let bytes = match decode_payload(payload) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(stream_id = %id, %error, "data frame discarded");
                return;
            }
        };
        if bytes.is_empty() {
            return;
        }
        if let Err(error) = stream.enqueue(bytes) {
            debug!(stream_id = %id, %error, "data discarded");
            return;
        }
        if !stream.pump() {
            self.close_stream(id, CloseMode::Reset);
            return;
        }
        self.apply_backpressure(id);
    }

    fn on_close(&mut self, id: &StreamId) {
        let Ok(stream) = self.registry.get_mut(id) else {
            debug!(stream_id = %id, "close for unknown stream discarded");
            return;
        };
        stream.mark_peer_closed();
        match stream.state() {
            StreamState::Pending => {
                debug!(stream_id = %id, "connect cancelled by peer");
                self.close_stream(id, CloseMode::Invalidate);
            }
            StreamState::Open | StreamState::Closing => {
                let _ = stream.begin_close();
                self.finish_or_drain(id);
            }
            StreamState::Closed => {}
        }
    }

    // ── Socket events ───────────────────────────────────────────────

    fn on_socket_opened(&mut self, id: &StreamId, serial: u64, socket: BoxedSocket) {
        match self.live(id, serial).map(|stream| stream.state()) {
            Some(StreamState::Pending) => {}
            Some(state) => {
                warn!(stream_id = %id, state = state.as_str(), "unexpected socket open");
                return;
            }
            None => {
                debug!(stream_id = %id, serial, "socket opened for a reaped stream, dropping it");
                return;
            }
        }
        // Queued before the reader exists, so it precedes every data frame.
        let _ = self.transport.send(&Frame::connect_success(id.clone()));

        let uplink = Uplink {
            transport: self.transport.clone(),
            read_chunk: self.config.max_chunk_bytes,
            events: self.events.clone(),
        };
        let bridge = SocketBridge::spawn(id.clone(), serial, socket, uplink);
        let Some(stream) = self.live(id, serial) else {
            return;
        };
        if let Err(error) = stream.open(bridge) {
            warn!(stream_id = %id, %error, "unexpected socket open");
            return;
        }
        let flushed = stream.pump();

        self.active += 1;
        counter!(RELAY_STREAMS_OPENED_TOTAL).increment(1);
        debug!(stream_id = %id, serial, "stream open");
        self.publish_status();

        if flushed {
            self.apply_backpressure(id);
        } else {
            self.close_stream(id, CloseMode::Reset);
        }
    }

    fn on_socket_failed(&mut self, id: &StreamId, serial: u64, error: &RelayError) {
        if self.live(id, serial).is_none() {
            return;
        }
        debug!(stream_id = %id, %error, "outbound socket failed to open");
        // Lifts a pause taken while pending, so the id can be reused.
        self.close_stream(id, CloseMode::Invalidate);
        self.reject(id.clone(), error);
    }

    fn on_socket_read(&mut self, id: &StreamId, serial: u64, len: usize) {
        let Some(stream) = self.live(id, serial) else {
            return;
        };
        stream.record_read(len);
        counter!(RELAY_BYTES_IN_TOTAL).increment(len as u64);
    }

    fn on_socket_written(&mut self, id: &StreamId, serial: u64, _len: usize) {
        let low_water = self.config.low_water_mark;
        let Some(stream) = self.live(id, serial) else {
            return;
        };
        let written = stream.write_completed();
        counter!(RELAY_BYTES_OUT_TOTAL).increment(written as u64);

        if stream.is_paused() && stream.pending_bytes() <= low_water {
            stream.set_paused(false);
            self.transport.resume(id);
        }
        let Some(stream) = self.live(id, serial) else {
            return;
        };
        if !stream.pump() {
            self.close_stream(id, CloseMode::Reset);
            return;
        }
        if stream.state() == StreamState::Closing {
            self.finish_or_drain(id);
        }
    }

    fn on_socket_eof(&mut self, id: &StreamId, serial: u64) {
        let Some(stream) = self.live(id, serial) else {
            return;
        };
        debug!(stream_id = %id, "destination closed its side");
        if stream.begin_close().is_ok() {
            self.finish_or_drain(id);
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn live(&mut self, id: &StreamId, serial: u64) -> Option<&mut Stream> {
        self.registry
            .get_mut(id)
            .ok()
            .filter(|stream| stream.serial() == serial)
    }

    fn reject(&self, id: StreamId, error: &RelayError) {
        counter!(RELAY_STREAMS_FAILED_TOTAL, "error_kind" => error.error_kind()).increment(1);
        let _ = self
            .transport
            .send(&Frame::connect_failure(id, error.to_string()));
    }

    /// Pause inbound data for the stream once its buffer passes the high-water mark.
    fn apply_backpressure(&mut self, id: &StreamId) {
        let high_water = self.config.high_water_mark;
        let Ok(stream) = self.registry.get_mut(id) else {
            return;
        };
        if !stream.is_paused() && stream.pending_bytes() > high_water {
            stream.set_paused(true);
            counter!(RELAY_STREAMS_PAUSED_TOTAL).increment(1);
            debug!(stream_id = %id, pending = stream.pending_bytes(), "stream over high-water mark");
            self.transport.pause(id);
        }
    }

    /// Close a `Closing` stream if drained, otherwise make sure its drain
    /// deadline is running. The deadline counts from the first call.
    fn finish_or_drain(&mut self, id: &StreamId) {
        let drain_timeout = self.config.drain_timeout;
        let events = self.events.clone();
        let Ok(stream) = self.registry.get_mut(id) else {
            return;
        };
        if stream.is_drained() {
            self.close_stream(id, CloseMode::Graceful);
            return;
        }
        if stream.drain_armed() {
            return;
        }
        let serial = stream.serial();
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(drain_timeout).await;
            let _ = events.send(RelayEvent::DrainExpired {
                id: timer_id,
                serial,
            });
        });
        stream.set_drain_timer(timer.abort_handle());
    }

    fn close_stream(&mut self, id: &StreamId, mode: CloseMode) {
        let Some(stream) = self.registry.remove(id) else {
            return;
        };
        let closed = stream.close(mode);
        if closed.notify_peer {
            let _ = self.transport.send(&Frame::close(id.clone()));
        }
        if closed.was_paused {
            // Parked frames are re-delivered and discarded as unknown.
            self.transport.resume(id);
        }
        if closed.was_active {
            self.active = self.active.saturating_sub(1);
        }
        debug!(
            stream_id = %id,
            ?mode,
            from = closed.from.as_str(),
            bytes_in = closed.bytes_in,
            bytes_out = closed.bytes_out,
            lifetime = ?closed.lifetime,
            "stream closed"
        );
        self.publish_status();
    }

    fn publish_status(&self) {
        #[allow(clippy::cast_precision_loss)]
        let active = self.active as f64;
        gauge!(RELAY_STREAMS_ACTIVE).set(active);
        let _ = self.status.publish(RelayStatus {
            connected: self.connected,
            active_connections: self.active,
        });
    }
}

impl std::fmt::Debug for RelayCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayCoordinator")
            .field("connected", &self.connected)
            .field("active", &self.active)
            .field("streams", &self.registry.len())
            .finish_non_exhaustive()
    }
}
