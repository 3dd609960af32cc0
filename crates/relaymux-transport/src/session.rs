//! Transport session: the one control channel to the gateway.
//!
//! The session owns the connection state machine
//! (`disconnected → connecting → connected`), encodes outbound frames,
//! decodes inbound ones, and reconnects on its own after failures:
//!
//! - A failed connect or an abrupt loss of an established channel schedules
//!   exactly one reconnect after a fixed backoff.
//! - [`TransportSession::disconnect`] cancels any scheduled reconnect and
//!   never schedules a new one.
//!
//! Outbound frames share one FIFO queue per channel. Control frames
//! ([`TransportSession::send`]) are always accepted while connected; stream
//! data ([`TransportSession::send_data`]) first waits for one of
//! `send_queue_capacity` credits, which is returned once the frame has been
//! written to the gateway. A slow gateway therefore slows the socket readers
//! down instead of losing bytes.
//!
//! Every state change and inbound frame is delivered to a single handler as a
//! [`TransportEvent`]. Handlers run on transport tasks with the session lock
//! held, so they must hand events off (e.g. into a channel) and must not
//! call back into the session synchronously.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use relaymux_core::constants::{DEFAULT_SEND_QUEUE_CAPACITY, RECONNECT_BACKOFF};
use relaymux_core::metrics::{
    TRANSPORT_CONNECTS_TOTAL, TRANSPORT_DISCONNECTS_TOTAL, TRANSPORT_FRAMES_DROPPED_TOTAL,
    TRANSPORT_MALFORMED_FRAMES_TOTAL, TRANSPORT_RECONNECTS_SCHEDULED_TOTAL,
};
use relaymux_core::{Frame, StreamId};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

use crate::channel::{ControlChannel, Connector, FrameSink, FrameStream};
use crate::errors::TransportError;
use crate::flow::FlowControl;

/// Session tuning.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Delay between a failure and the next connect attempt.
    pub reconnect_backoff: Duration,
    /// Data frames that may be queued but not yet written; further data
    /// senders wait.
    pub send_queue_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff: RECONNECT_BACKOFF,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
        }
    }
}

/// Connection state of the control channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No channel and no attempt in progress.
    Disconnected,
    /// A connect attempt is in progress.
    Connecting,
    /// The channel is up.
    Connected,
}

/// Delivered to the registered handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// A channel was established. Precedes every frame of that channel.
    Connected,
    /// The channel went away (or a connect attempt failed).
    Disconnected {
        /// Delay until the scheduled reconnect; `None` after a manual disconnect.
        reconnect_in: Option<Duration>,
    },
    /// A decoded inbound frame.
    Frame(Frame),
}

type Handler = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Handle to the transport session. Clones share the same session.
#[derive(Clone)]
pub struct TransportSession {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    state: Mutex<SessionState>,
    handler: RwLock<Option<Handler>>,
    flow: Mutex<FlowControl>,
    dropped_frames: AtomicU64,
}

struct SessionState {
    connection: ConnectionState,
    /// Bumped on every connect attempt and manual disconnect; tasks and
    /// attempts from an older epoch are ignored.
    epoch: u64,
    /// Present iff `connection == Connected`.
    link: Option<Link>,
    reconnect: Option<ReconnectTimer>,
    next_timer_id: u64,
}

struct Link {
    outbound: mpsc::UnboundedSender<Outbound>,
    credit: Arc<Semaphore>,
    reader: Option<JoinHandle<()>>,
    writer: JoinHandle<()>,
}

impl Link {
    fn shut(self) {
        if let Some(reader) = self.reader {
            reader.abort();
        }
        // Wakes data senders still waiting for credit.
        self.credit.close();
        // Dropping `outbound` lets the writer flush what is queued and close the sink.
        drop(self.outbound);
        drop(self.writer);
    }
}

/// One queued message. Data frames hold their credit until written.
struct Outbound {
    text: String,
    credit: Option<OwnedSemaphorePermit>,
}

struct ReconnectTimer {
    id: u64,
    deadline: Instant,
    task: JoinHandle<()>,
}

impl TransportSession {
    /// Create a disconnected session.
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                state: Mutex::new(SessionState {
                    connection: ConnectionState::Disconnected,
                    epoch: 0,
                    link: None,
                    reconnect: None,
                    next_timer_id: 0,
                }),
                handler: RwLock::new(None),
                flow: Mutex::new(FlowControl::default()),
                dropped_frames: AtomicU64::new(0),
            }),
        }
    }

    /// Register the event handler, replacing any previous one.
    pub fn on_frame<F>(&self, handler: F)
    where
        F: Fn(TransportEvent) + Send + Sync + 'static,
    {
        *self.inner.handler.write() = Some(Arc::new(handler));
    }

    /// Remove the event handler; later events are discarded.
    pub fn clear_handler(&self) {
        *self.inner.handler.write() = None;
    }

    /// Establish the control channel.
    ///
    /// No-op while already connecting or connected. On failure the session
    /// is left disconnected with one reconnect scheduled, and the error is
    /// returned for logging.
    #[instrument(skip_all, fields(endpoint = %self.inner.connector.endpoint()))]
    pub async fn connect(&self) -> Result<(), TransportError> {
        let epoch = {
            let mut s = self.inner.state.lock();
            if s.connection != ConnectionState::Disconnected {
                debug!(state = ?s.connection, "connect ignored");
                return Ok(());
            }
            s.connection = ConnectionState::Connecting;
            s.epoch += 1;
            s.epoch
        };
        info!(epoch, "connecting control channel");

        let result = self.inner.connector.connect().await;

        let mut s = self.inner.state.lock();
        if s.epoch != epoch || s.connection != ConnectionState::Connecting {
            debug!(epoch, "connect attempt superseded");
            return Err(TransportError::Cancelled);
        }
        match result {
            Ok(channel) => {
                self.inner.establish(&mut s, epoch, channel);
                Ok(())
            }
            Err(error) => {
                warn!(epoch, %error, "control channel connect failed");
                s.connection = ConnectionState::Disconnected;
                let delay = self.inner.schedule_reconnect(&mut s);
                self.inner.emit(TransportEvent::Disconnected {
                    reconnect_in: Some(delay),
                });
                Err(error)
            }
        }
    }

    /// Tear the channel down without scheduling a reconnect.
    ///
    /// Returns immediately; queued outbound frames are flushed and the
    /// channel closed in the background.
    pub fn disconnect(&self) {
        let mut s = self.inner.state.lock();
        s.epoch += 1;
        if let Some(timer) = s.reconnect.take() {
            timer.task.abort();
            debug!("scheduled reconnect cancelled");
        }
        if let Some(link) = s.link.take() {
            link.shut();
        }
        let previous = std::mem::replace(&mut s.connection, ConnectionState::Disconnected);
        let _ = self.inner.flow.lock().clear();
        if previous != ConnectionState::Disconnected {
            counter!(TRANSPORT_DISCONNECTS_TOTAL, "reason" => "manual").increment(1);
            info!(?previous, "control channel disconnected");
            self.inner
                .emit(TransportEvent::Disconnected { reconnect_in: None });
        }
    }

    /// Queue a control frame for the gateway.
    ///
    /// Never waits and is never refused for capacity. Returns `false` and
    /// counts a drop when not connected.
    pub fn send(&self, frame: &Frame) -> bool {
        let Some(text) = self.inner.encode(frame) else {
            return false;
        };

        let s = self.inner.state.lock();
        let queued = s.link.as_ref().is_some_and(|link| {
            link.outbound
                .send(Outbound { text, credit: None })
                .is_ok()
        });
        drop(s);
        if queued {
            trace!(kind = frame.kind(), "frame queued");
        } else {
            trace!(kind = frame.kind(), "not connected, dropping frame");
            self.inner.record_drop("not_connected");
        }
        queued
    }

    /// Queue a stream's data frame, waiting for outbound credit first.
    ///
    /// The frame is skipped (returning `false`) if `live` is cleared while
    /// waiting; the check happens under the same lock as [`send`](Self::send),
    /// so a `close` queued after clearing `live` is never overtaken. Returns
    /// `false` and counts a drop if the channel goes away.
    pub async fn send_data(&self, frame: &Frame, live: &AtomicBool) -> bool {
        let Some(text) = self.inner.encode(frame) else {
            return false;
        };

        let waiting = {
            let s = self.inner.state.lock();
            s.link.as_ref().map(|link| (s.epoch, Arc::clone(&link.credit)))
        };
        let Some((epoch, credit)) = waiting else {
            self.inner.record_drop("not_connected");
            return false;
        };
        let Ok(permit) = credit.acquire_owned().await else {
            self.inner.record_drop("not_connected");
            return false;
        };

        let s = self.inner.state.lock();
        if !live.load(Ordering::Acquire) {
            trace!(kind = frame.kind(), "stream closed while waiting for credit");
            return false;
        }
        let queued = s.epoch == epoch
            && s.link.as_ref().is_some_and(|link| {
                link.outbound
                    .send(Outbound {
                        text,
                        credit: Some(permit),
                    })
                    .is_ok()
            });
        drop(s);
        if !queued {
            self.inner.record_drop("not_connected");
        }
        queued
    }

    /// Credits currently available to data senders; `0` when not connected.
    pub fn send_credit(&self) -> usize {
        self.inner
            .state
            .lock()
            .link
            .as_ref()
            .map_or(0, |link| link.credit.available_permits())
    }

    /// Park inbound frames for `id` until [`resume`](Self::resume).
    pub fn pause(&self, id: &StreamId) {
        if self.inner.flow.lock().pause(id.clone()) {
            debug!(stream_id = %id, "inbound frames paused");
        }
    }

    /// Deliver frames parked for `id`, in order, and stop parking.
    pub fn resume(&self, id: &StreamId) {
        let s = self.inner.state.lock();
        let parked = self.inner.flow.lock().resume(id);
        if s.connection != ConnectionState::Connected {
            return;
        }
        debug!(stream_id = %id, parked = parked.len(), "inbound frames resumed");
        for frame in parked {
            self.inner.emit(TransportEvent::Frame(frame));
        }
    }

    /// Whether inbound frames for `id` are currently parked.
    pub fn is_paused(&self, id: &StreamId) -> bool {
        self.inner.flow.lock().is_paused(id)
    }

    /// Number of frames parked for `id`.
    pub fn parked_frames(&self, id: &StreamId) -> usize {
        self.inner.flow.lock().parked(id)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().connection
    }

    /// When the scheduled reconnect fires, if one is scheduled.
    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.inner.state.lock().reconnect.as_ref().map(|t| t.deadline)
    }

    /// Outbound frames dropped since the session was created.
    pub fn dropped_frames(&self) -> u64 {
        self.inner.dropped_frames.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("state", &self.state())
            .field("dropped_frames", &self.dropped_frames())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn emit(&self, event: TransportEvent) {
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler(event),
            None => trace!(?event, "no handler registered, discarding event"),
        }
    }

    fn encode(&self, frame: &Frame) -> Option<String> {
        match frame.encode() {
            Ok(text) => Some(text),
            Err(error) => {
                warn!(%error, kind = frame.kind(), "failed to encode frame");
                self.record_drop("encode");
                None
            }
        }
    }

    fn record_drop(&self, reason: &'static str) {
        let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        counter!(TRANSPORT_FRAMES_DROPPED_TOTAL, "reason" => reason).increment(1);
    }

    /// Install a freshly connected channel. Called with the state lock held.
    fn establish(self: &Arc<Self>, s: &mut SessionState, epoch: u64, channel: ControlChannel) {
        let ControlChannel { sink, stream } = channel;
        let (outbound, rx) = mpsc::unbounded_channel();
        let credit = Arc::new(Semaphore::new(self.config.send_queue_capacity.max(1)));
        let writer = tokio::spawn(write_loop(Arc::clone(self), epoch, sink, rx));

        if let Some(timer) = s.reconnect.take() {
            timer.task.abort();
        }
        s.connection = ConnectionState::Connected;
        s.link = Some(Link {
            outbound,
            credit,
            reader: None,
            writer,
        });
        counter!(TRANSPORT_CONNECTS_TOTAL).increment(1);
        info!(epoch, "control channel connected");
        self.emit(TransportEvent::Connected);

        // The reader blocks on the state lock before its first dispatch, so
        // no frame can overtake the `Connected` event above.
        let reader = tokio::spawn(read_loop(Arc::clone(self), epoch, stream));
        if let Some(link) = s.link.as_mut() {
            link.reader = Some(reader);
        }
    }

    fn dispatch(&self, epoch: u64, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(error) => {
                counter!(TRANSPORT_MALFORMED_FRAMES_TOTAL).increment(1);
                warn!(%error, len = text.len(), "discarding malformed frame");
                return;
            }
        };
        if frame == Frame::Unknown {
            trace!("ignoring frame of unknown type");
            return;
        }

        let s = self.state.lock();
        if s.epoch != epoch || s.connection != ConnectionState::Connected {
            return;
        }
        let admitted = self.flow.lock().admit(frame);
        match admitted {
            Some(frame) => self.emit(TransportEvent::Frame(frame)),
            None => trace!("frame parked for paused stream"),
        }
    }

    fn connection_lost(self: &Arc<Self>, epoch: u64, reason: &'static str) {
        let mut s = self.state.lock();
        if s.epoch != epoch || s.connection != ConnectionState::Connected {
            return;
        }
        if let Some(link) = s.link.take() {
            link.shut();
        }
        s.connection = ConnectionState::Disconnected;
        let dropped = self.flow.lock().clear();
        counter!(TRANSPORT_DISCONNECTS_TOTAL, "reason" => reason).increment(1);
        warn!(epoch, reason, parked_dropped = dropped, "control channel lost");

        let delay = self.schedule_reconnect(&mut s);
        self.emit(TransportEvent::Disconnected {
            reconnect_in: Some(delay),
        });
    }

    /// Schedule the reconnect timer unless one is already pending. Returns the
    /// delay until it fires.
    fn schedule_reconnect(self: &Arc<Self>, s: &mut SessionState) -> Duration {
        if let Some(timer) = &s.reconnect {
            return timer.deadline.saturating_duration_since(Instant::now());
        }

        let delay = self.config.reconnect_backoff;
        let deadline = Instant::now() + delay;
        s.next_timer_id += 1;
        let timer_id = s.next_timer_id;
        let session = TransportSession {
            inner: Arc::clone(self),
        };
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            {
                let mut s = session.inner.state.lock();
                if !s.reconnect.as_ref().is_some_and(|t| t.id == timer_id) {
                    return;
                }
                s.reconnect = None;
            }
            debug!("reconnect timer fired");
            if let Err(error) = session.connect().await {
                debug!(%error, "reconnect attempt failed");
            }
        });
        s.reconnect = Some(ReconnectTimer {
            id: timer_id,
            deadline,
            task,
        });
        counter!(TRANSPORT_RECONNECTS_SCHEDULED_TOTAL).increment(1);
        info!(delay_ms = delay.as_millis(), "reconnect scheduled");
        delay
    }
}

async fn read_loop(inner: Arc<Inner>, epoch: u64, mut stream: FrameStream) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(text)) => inner.dispatch(epoch, &text),
            Some(Err(error)) => {
                warn!(epoch, %error, "control channel read failed");
                break "read_error";
            }
            None => break "closed",
        }
    };
    inner.connection_lost(epoch, reason);
}

async fn write_loop(
    inner: Arc<Inner>,
    epoch: u64,
    mut sink: FrameSink,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(Outbound { text, credit }) = rx.recv().await {
        if let Err(error) = sink.send(text).await {
            warn!(epoch, %error, "control channel write failed");
            inner.connection_lost(epoch, "write_error");
            return;
        }
        drop(credit);
    }
    if let Err(error) = sink.close().await {
        debug!(epoch, %error, "error closing control channel");
    }
}
