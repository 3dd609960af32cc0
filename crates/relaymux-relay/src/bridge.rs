//! Per-stream socket tasks.
//!
//! Each open stream gets a reader task and a writer task. Both report back to
//! the coordinator through its inbox, tagged with the stream's serial so
//! events from a reaped stream are recognisable.
//!
//! The reader forwards what it reads as `data` frames itself and waits for
//! transport credit before reading again, so the destination is only read as
//! fast as the gateway takes the bytes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use relaymux_core::{Frame, StreamId};
use relaymux_transport::TransportSession;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::coordinator::{RelayEvent, SocketSide};
use crate::socket::BoxedSocket;

/// The running reader/writer pair for one outbound socket.
pub(crate) struct SocketBridge {
    writes: mpsc::Sender<Bytes>,
    /// Cleared before the stream's `close` is queued; a reader waiting for
    /// credit then drops its frame instead of sending it late.
    forwarding: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// What the reader needs to forward bytes to the gateway.
pub(crate) struct Uplink {
    pub(crate) transport: TransportSession,
    pub(crate) read_chunk: usize,
    pub(crate) events: mpsc::UnboundedSender<RelayEvent>,
}

impl SocketBridge {
    pub(crate) fn spawn(id: StreamId, serial: u64, socket: BoxedSocket, uplink: Uplink) -> Self {
        let (read_half, write_half) = tokio::io::split(socket);
        // One write in flight at a time; the stream keeps the rest.
        let (writes, rx) = mpsc::channel(1);
        let forwarding = Arc::new(AtomicBool::new(true));
        let events = uplink.events.clone();
        let reader = tokio::spawn(read_loop(
            id.clone(),
            serial,
            read_half,
            Arc::clone(&forwarding),
            uplink,
        ));
        let writer = tokio::spawn(write_loop(id, serial, write_half, rx, events));
        Self {
            writes,
            forwarding,
            reader,
            writer,
        }
    }

    /// Hand one chunk to the writer. `false` means the writer is gone.
    pub(crate) fn write(&self, bytes: Bytes) -> bool {
        self.writes.try_send(bytes).is_ok()
    }

    /// Stop forwarding destination bytes; writes continue.
    pub(crate) fn stop_reading(&self) {
        self.forwarding.store(false, Ordering::Release);
        self.reader.abort();
    }

    /// Stop reading and shut the socket down once queued bytes are written.
    pub(crate) fn close(self) {
        self.stop_reading();
        drop(self.writes);
    }

    /// Drop the socket immediately.
    pub(crate) fn abort(self) {
        self.stop_reading();
        self.writer.abort();
    }
}

async fn read_loop(
    id: StreamId,
    serial: u64,
    mut socket: ReadHalf<BoxedSocket>,
    forwarding: Arc<AtomicBool>,
    uplink: Uplink,
) {
    let Uplink {
        transport,
        read_chunk,
        events,
    } = uplink;
    let mut buf = vec![0u8; read_chunk.max(1)];
    let event = loop {
        match socket.read(&mut buf).await {
            Ok(0) => break RelayEvent::SocketEof { id, serial },
            Ok(n) => {
                trace!(stream_id = %id, n, "socket read");
                let frame = Frame::data(id.clone(), &buf[..n]);
                if !transport.send_data(&frame, &forwarding).await {
                    // Closed locally, or the channel is gone and the
                    // coordinator invalidates the stream.
                    trace!(stream_id = %id, "forwarding stopped");
                    return;
                }
                if events
                    .send(RelayEvent::SocketRead {
                        id: id.clone(),
                        serial,
                        len: n,
                    })
                    .is_err()
                {
                    return;
                }
            }
            Err(error) => {
                break RelayEvent::SocketError {
                    id,
                    serial,
                    side: SocketSide::Read,
                    error: error.to_string(),
                };
            }
        }
    };
    let _ = events.send(event);
}

async fn write_loop(
    id: StreamId,
    serial: u64,
    mut socket: WriteHalf<BoxedSocket>,
    mut rx: mpsc::Receiver<Bytes>,
    events: mpsc::UnboundedSender<RelayEvent>,
) {
    while let Some(bytes) = rx.recv().await {
        let len = bytes.len();
        if let Err(error) = socket.write_all(&bytes).await {
            let _ = events.send(RelayEvent::SocketError {
                id,
                serial,
                side: SocketSide::Write,
                error: error.to_string(),
            });
            return;
        }
        if events
            .send(RelayEvent::SocketWritten {
                id: id.clone(),
                serial,
                len,
            })
            .is_err()
        {
            return;
        }
    }
    // Sender dropped: graceful close.
    let _ = socket.shutdown().await;
}
