//! End-to-end relay scenarios over an in-memory gateway and in-memory sockets.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use relaymux_core::constants::RECONNECT_BACKOFF;
use relaymux_core::{ConnectStatus, Frame, StreamId};
use relaymux_relay::testing::{MockSocketProvider, RemoteQueue, RemoteSocket};
use relaymux_relay::{CoordinatorConfig, Relay, RelayConfig, RelayStatus};
use relaymux_transport::testing::{MockConnector, PeerEnd, PeerQueue};
use relaymux_transport::{ConnectionState, TransportConfig};

const IDENTITY: &str = "dest-1";

struct Fixture {
    relay: Relay,
    connector: Arc<MockConnector>,
    peers: PeerQueue,
    provider: Arc<MockSocketProvider>,
    remotes: RemoteQueue,
}

fn fixture() -> Fixture {
    fixture_with(CoordinatorConfig::default(), 64 * 1024)
}

fn fixture_with(coordinator: CoordinatorConfig, pipe_capacity: usize) -> Fixture {
    let (connector, peers) = MockConnector::new();
    build(connector, peers, TransportConfig::default(), coordinator, pipe_capacity)
}

/// A gateway that takes frames only as fast as the test reads them.
fn slow_gateway_fixture(send_queue_capacity: usize) -> Fixture {
    let (connector, peers) = MockConnector::with_gateway_capacity(0);
    let transport = TransportConfig {
        send_queue_capacity,
        ..TransportConfig::default()
    };
    build(connector, peers, transport, CoordinatorConfig::default(), 64 * 1024)
}

fn build(
    connector: Arc<MockConnector>,
    peers: PeerQueue,
    transport: TransportConfig,
    coordinator: CoordinatorConfig,
    pipe_capacity: usize,
) -> Fixture {
    let (provider, remotes) = MockSocketProvider::with_capacity(pipe_capacity);
    let config = RelayConfig {
        transport,
        coordinator,
        identity: Some(IDENTITY.to_string()),
    };
    let relay = Relay::spawn(connector.clone(), provider.clone(), config);
    Fixture {
        relay,
        connector,
        peers,
        provider,
        remotes,
    }
}

impl Fixture {
    /// Start the relay and return the gateway end, past the identity announcement.
    async fn start(&mut self) -> PeerEnd {
        self.relay.start().await.unwrap();
        let mut peer = self.peers.next().await;
        assert_eq!(peer.recv().await, Frame::address(IDENTITY));
        peer
    }

    /// Open a stream and return the destination end.
    async fn open(&mut self, peer: &mut PeerEnd, id: &str) -> RemoteSocket {
        peer.send(&connect(id, "example.com", 80));
        let remote = self.remotes.next().await;
        assert_eq!(peer.recv().await, Frame::connect_success(StreamId::from(id)));
        remote
    }

    async fn wait_status(&self, want: RelayStatus) {
        let mut status = self.relay.subscribe_status();
        let waited = tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| *s == want)).await;
        assert!(waited.is_ok(), "status never became {want:?}, last {:?}", self.relay.status());
    }
}

fn connect(id: &str, host: &str, port: i64) -> Frame {
    Frame::Connect {
        id: StreamId::from(id),
        host: Some(host.to_string()),
        port: Some(port),
        data: None,
    }
}

fn status(connected: bool, active_connections: usize) -> RelayStatus {
    RelayStatus {
        connected,
        active_connections,
    }
}

/// Round-trip a ping so every earlier frame has been handled.
async fn sync(peer: &mut PeerEnd, token: &str) {
    peer.send(&Frame::Ping { id: token.to_string() });
    loop {
        if let Frame::Pong { id } = peer.recv().await {
            if id == token {
                return;
            }
        }
    }
}

/// Collect `len` bytes of `data` frames for `id`.
async fn recv_bytes(peer: &mut PeerEnd, id: &str, len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while out.len() < len {
        match peer.recv().await {
            Frame::Data { id: got, data } if got.as_str() == id => {
                out.extend_from_slice(&relaymux_core::frame::decode_payload(&data).unwrap());
            }
            other => panic!("expected data for {id}, got {other:?}"),
        }
    }
    out
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}

// ── Stream lifecycle ────────────────────────────────────────────────

#[tokio::test]
async fn stream_relays_bytes_both_ways() {
    let mut f = fixture();
    let mut peer = f.start().await;
    let mut remote = f.open(&mut peer, "s1").await;
    assert_eq!(remote.destination().host(), "example.com");
    assert_eq!(remote.destination().port(), 80);
    f.wait_status(status(true, 1)).await;

    peer.send(&Frame::data(StreamId::from("s1"), b"GET / HTTP/1.1\r\n\r\n"));
    assert_eq!(remote.read_exact(18).await, b"GET / HTTP/1.1\r\n\r\n");

    remote.write(b"HTTP/1.1 200 OK\r\n").await;
    assert_eq!(recv_bytes(&mut peer, "s1", 17).await, b"HTTP/1.1 200 OK\r\n");

    // Peer close: socket shut down, no close echoed back.
    peer.send(&Frame::close(StreamId::from("s1")));
    assert!(remote.read_to_end().await.is_empty());
    f.wait_status(status(true, 0)).await;
    sync(&mut peer, "after-close").await;
}

#[tokio::test]
async fn early_data_is_written_first() {
    let mut f = fixture();
    let mut peer = f.start().await;
    peer.send(&Frame::Connect {
        id: StreamId::from("s1"),
        host: Some("example.com".into()),
        port: Some(443),
        data: Some(relaymux_core::frame::encode_payload(b"hello")),
    });
    peer.send(&Frame::data(StreamId::from("s1"), b" world"));
    let mut remote = f.remotes.next().await;
    assert_eq!(peer.recv().await, Frame::connect_success(StreamId::from("s1")));
    assert_eq!(remote.read_exact(11).await, b"hello world");
}

#[tokio::test]
async fn destination_eof_sends_close() {
    let mut f = fixture();
    let mut peer = f.start().await;
    let mut remote = f.open(&mut peer, "s1").await;
    remote.write(b"bye").await;
    remote.shutdown().await;

    assert_eq!(recv_bytes(&mut peer, "s1", 3).await, b"bye");
    assert_eq!(peer.recv().await, Frame::close(StreamId::from("s1")));
    f.wait_status(status(true, 0)).await;
}

#[tokio::test]
async fn duplicate_id_is_rejected_without_touching_original() {
    let mut f = fixture();
    let mut peer = f.start().await;
    let mut remote = f.open(&mut peer, "s1").await;

    peer.send(&connect("s1", "other.example", 22));
    assert_eq!(
        peer.recv().await,
        Frame::connect_failure(StreamId::from("s1"), "duplicate id")
    );
    assert_eq!(f.provider.opens(), 1);

    peer.send(&Frame::data(StreamId::from("s1"), b"still here"));
    assert_eq!(remote.read_exact(10).await, b"still here");
    f.wait_status(status(true, 1)).await;
}

#[tokio::test]
async fn unreachable_destination_fails_the_connect() {
    let mut f = fixture();
    f.provider.refuse("down.example");
    let mut peer = f.start().await;

    peer.send(&connect("s1", "down.example", 80));
    match peer.recv().await {
        Frame::ConnectResponse { id, status, error } => {
            assert_eq!(id.as_str(), "s1");
            assert_eq!(status, ConnectStatus::Failure);
            assert!(error.unwrap().contains("connection refused"));
        }
        other => panic!("expected connect_response, got {other:?}"),
    }
    assert_eq!(f.relay.status(), status(true, 0));

    // The id is free again.
    let _remote = f.open(&mut peer, "s1").await;
}

#[tokio::test]
async fn bad_destinations_are_rejected() {
    let mut f = fixture();
    let mut peer = f.start().await;

    peer.send(&Frame::Connect {
        id: StreamId::from("a"),
        host: None,
        port: Some(80),
        data: None,
    });
    assert_eq!(
        peer.recv().await,
        Frame::connect_failure(StreamId::from("a"), "Missing host or port")
    );

    peer.send(&connect("b", "example.com", 70_000));
    assert_eq!(
        peer.recv().await,
        Frame::connect_failure(StreamId::from("b"), "invalid port")
    );
    assert_eq!(f.provider.opens(), 0);
}

#[tokio::test]
async fn mistyped_destination_fields_are_answered() {
    let mut f = fixture();
    let mut peer = f.start().await;

    peer.send_text(r#"{"type":"connect","id":"s1","host":"example.com","port":443.5}"#);
    assert_eq!(
        peer.recv().await,
        Frame::connect_failure(StreamId::from("s1"), "invalid port")
    );
    peer.send_text(r#"{"type":"connect","id":"s2","host":"example.com","port":true}"#);
    assert_eq!(
        peer.recv().await,
        Frame::connect_failure(StreamId::from("s2"), "invalid port")
    );
    peer.send_text(r#"{"type":"connect","id":"s3","host":42,"port":80}"#);
    assert_eq!(
        peer.recv().await,
        Frame::connect_failure(StreamId::from("s3"), "Missing host or port")
    );
    assert_eq!(f.provider.opens(), 0);
}

#[tokio::test]
async fn failed_open_releases_a_paused_id() {
    let config = CoordinatorConfig {
        high_water_mark: 16,
        low_water_mark: 4,
        ..CoordinatorConfig::default()
    };
    let mut f = fixture_with(config, 64 * 1024);
    f.provider.refuse("down.example");
    let mut peer = f.start().await;
    let id = StreamId::from("s1");

    // Buffered pre-open data pushes the pending stream over the mark.
    f.provider.hold();
    peer.send(&connect("s1", "down.example", 80));
    peer.send(&Frame::data(id.clone(), &[7u8; 64]));
    let transport = f.relay.transport().clone();
    let paused = id.clone();
    eventually(|| transport.is_paused(&paused)).await;

    f.provider.release();
    assert_matches::assert_matches!(
        peer.recv().await,
        Frame::ConnectResponse { status: ConnectStatus::Failure, .. }
    );
    assert!(!transport.is_paused(&id));

    // The id is usable again straight away.
    let mut remote = f.open(&mut peer, "s1").await;
    assert_eq!(remote.destination().host(), "example.com");
    peer.send(&Frame::data(id.clone(), b"fresh"));
    assert_eq!(remote.read_exact(5).await, b"fresh");
    assert_eq!(transport.parked_frames(&id), 0);
}

#[tokio::test]
async fn close_while_pending_cancels_silently() {
    let mut f = fixture();
    let mut peer = f.start().await;
    f.provider.hold();

    peer.send(&connect("s1", "example.com", 80));
    let provider = f.provider.clone();
    eventually(|| provider.opens() == 1).await;
    peer.send(&Frame::close(StreamId::from("s1")));
    sync(&mut peer, "cancelled").await;

    f.provider.release();
    assert_eq!(peer.try_recv_within(Duration::from_millis(200)).await, None);
    assert!(f.remotes.try_next().is_none());
    assert_eq!(f.relay.status(), status(true, 0));

    let _remote = f.open(&mut peer, "s1").await;
}

#[tokio::test]
async fn crossing_closes_count_once() {
    let mut f = fixture();
    let mut peer = f.start().await;
    let mut r1 = f.open(&mut peer, "s1").await;
    let _r2 = f.open(&mut peer, "s2").await;
    f.wait_status(status(true, 2)).await;

    r1.shutdown().await;
    assert_eq!(peer.recv().await, Frame::close(StreamId::from("s1")));
    peer.send(&Frame::close(StreamId::from("s1")));
    peer.send(&Frame::close(StreamId::from("s1")));
    sync(&mut peer, "closes").await;

    assert_eq!(f.relay.status(), status(true, 1));
}

#[tokio::test]
async fn frames_for_unknown_streams_are_ignored() {
    let mut f = fixture();
    let mut peer = f.start().await;
    peer.send(&Frame::data(StreamId::from("ghost"), b"boo"));
    peer.send(&Frame::close(StreamId::from("ghost")));
    peer.send_text("{not json");
    sync(&mut peer, "ghost").await;
    assert_eq!(f.relay.transport().state(), ConnectionState::Connected);
}

// ── Session-level frames ────────────────────────────────────────────

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let mut f = fixture();
    let mut peer = f.start().await;
    peer.send(&Frame::Ping { id: "hb-7".into() });
    assert_eq!(peer.recv().await, Frame::pong("hb-7"));
}

#[tokio::test]
async fn identity_change_is_announced() {
    let mut f = fixture();
    let mut peer = f.start().await;
    f.relay.set_destination_identity("dest-2");
    assert_eq!(peer.recv().await, Frame::address("dest-2"));
}

// ── Transport failure ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn transport_loss_invalidates_streams_and_reconnects() {
    let mut f = fixture();
    let mut peer = f.start().await;
    let mut r1 = f.open(&mut peer, "s1").await;
    let mut r2 = f.open(&mut peer, "s2").await;
    f.wait_status(status(true, 2)).await;

    peer.hang_up();
    f.wait_status(status(false, 0)).await;

    // Sockets are dropped and no close frames go out.
    assert!(r1.read_to_end().await.is_empty());
    assert!(r2.read_to_end().await.is_empty());
    let leftovers = peer.drain().await;
    assert!(
        !leftovers.iter().any(|frame| matches!(frame, Frame::Close { .. })),
        "close frames after transport loss: {leftovers:?}"
    );

    // Exactly one reconnect, after the backoff.
    assert!(f.relay.transport().reconnect_deadline().is_some());
    assert_eq!(f.connector.attempts(), 1);
    tokio::time::sleep(RECONNECT_BACKOFF).await;
    let mut peer = f.peers.next().await;
    assert_eq!(f.connector.attempts(), 2);
    assert_eq!(peer.recv().await, Frame::address(IDENTITY));
    f.wait_status(status(true, 0)).await;

    // Old ids are gone; the same id opens fresh.
    let _r1 = f.open(&mut peer, "s1").await;
    f.wait_status(status(true, 1)).await;
}

#[tokio::test]
async fn stop_closes_everything_without_reconnecting() {
    let mut f = fixture();
    let mut peer = f.start().await;
    let mut remote = f.open(&mut peer, "s1").await;

    f.relay.stop();
    f.wait_status(status(false, 0)).await;
    assert!(remote.read_to_end().await.is_empty());
    assert!(f.relay.transport().reconnect_deadline().is_none());
    assert_eq!(f.connector.attempts(), 1);
}

// ── Backpressure ────────────────────────────────────────────────────

#[tokio::test]
async fn slow_socket_pauses_only_its_own_stream() {
    let config = CoordinatorConfig {
        high_water_mark: 1024,
        low_water_mark: 256,
        ..CoordinatorConfig::default()
    };
    let mut f = fixture_with(config, 64);
    let mut peer = f.start().await;
    let mut slow = f.open(&mut peer, "slow").await;
    let mut fast = f.open(&mut peer, "fast").await;
    let slow_id = StreamId::from("slow");

    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    for chunk in payload.chunks(512) {
        peer.send(&Frame::data(slow_id.clone(), chunk));
    }
    let transport = f.relay.transport().clone();
    let id = slow_id.clone();
    eventually(|| transport.is_paused(&id)).await;

    // Frames for the paused id are parked, the other stream keeps flowing.
    peer.send(&Frame::data(slow_id.clone(), b"tail"));
    peer.send(&Frame::data(StreamId::from("fast"), b"ping!"));
    assert_eq!(fast.read_exact(5).await, b"ping!");
    assert!(f.relay.transport().parked_frames(&slow_id) >= 1);

    // Draining resumes the id and every byte arrives in order.
    let mut expected = payload.clone();
    expected.extend_from_slice(b"tail");
    assert_eq!(slow.read_exact(expected.len()).await, expected);
    let id = slow_id.clone();
    eventually(|| !transport.is_paused(&id)).await;
}

#[tokio::test]
async fn slow_gateway_receives_every_byte_and_the_close() {
    let mut f = slow_gateway_fixture(8);
    let mut peer = f.start().await;
    let mut remote = f.open(&mut peer, "s1").await;

    let payload: Vec<u8> = (0..60 * 1024u32).map(|i| (i % 253) as u8).collect();
    remote.write(&payload).await;
    remote.shutdown().await;

    let mut received = Vec::new();
    loop {
        tokio::time::sleep(Duration::from_millis(5)).await;
        match peer.recv().await {
            Frame::Data { id, data } if id.as_str() == "s1" => {
                received.extend_from_slice(&relaymux_core::frame::decode_payload(&data).unwrap());
            }
            Frame::Close { id } if id.as_str() == "s1" => break,
            other => panic!("unexpected frame {other:?}"),
        }
    }
    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload);
    assert_eq!(f.relay.transport().dropped_frames(), 0);
    f.wait_status(status(true, 0)).await;
}

#[tokio::test(start_paused = true)]
async fn drain_deadline_counts_from_the_close() {
    let config = CoordinatorConfig {
        drain_timeout: Duration::from_millis(500),
        ..CoordinatorConfig::default()
    };
    let mut f = fixture_with(config, 64);
    let mut peer = f.start().await;
    let mut remote = f.open(&mut peer, "s1").await;
    let id = StreamId::from("s1");

    for _ in 0..10 {
        peer.send(&Frame::data(id.clone(), &[1u8; 256]));
    }
    peer.send(&Frame::close(id.clone()));
    sync(&mut peer, "closing").await;
    let closed_at = tokio::time::Instant::now();

    // A destination that keeps reading, but too slowly to finish in time.
    let mut received = 0;
    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let chunk = remote.read_some(64).await;
        if chunk.is_empty() {
            break;
        }
        received += chunk.len();
    }
    assert!(received < 2560, "stream drained fully ({received} bytes)");
    assert!(
        closed_at.elapsed() < Duration::from_secs(1),
        "reset after {:?}",
        closed_at.elapsed()
    );
    f.wait_status(status(true, 0)).await;
    // The peer already closed; nothing is echoed.
    assert_eq!(peer.try_recv_within(Duration::from_millis(100)).await, None);
}

// ── Ordering ────────────────────────────────────────────────────────

fn interleaved_writes() -> impl Strategy<Value = Vec<(usize, Vec<u8>)>> {
    prop::collection::vec((0..3usize, prop::collection::vec(any::<u8>(), 1..48)), 1..24)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn per_stream_order_survives_interleaving(writes in interleaved_writes()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let mut f = fixture();
            let mut peer = f.start().await;
            let ids = ["a", "b", "c"];
            let mut remotes = Vec::new();
            for id in ids {
                remotes.push(f.open(&mut peer, id).await);
            }

            let mut expected = vec![Vec::new(); ids.len()];
            for (stream, bytes) in &writes {
                peer.send(&Frame::data(StreamId::from(ids[*stream]), bytes));
                expected[*stream].extend_from_slice(bytes);
            }
            for (remote, want) in remotes.iter_mut().zip(&expected) {
                assert_eq!(&remote.read_exact(want.len()).await, want);
            }
            f.relay.shutdown().await;
        });
    }
}
