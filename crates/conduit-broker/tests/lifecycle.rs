//! Frame-level lifecycle tests against a single running broker.
//!
//! The peer is simulated by hand: a producer on the broker's inbound region
//! and a consumer on its outbound one, so every ring frame the broker emits
//! or reacts to is visible to the test.

use std::{
    io::{Read, Write},
    os::unix::net::UnixStream,
    path::Path,
    time::{Duration, Instant},
};

use conduit_broker::{Broker, BrokerConfig};
use conduit_ring::{
    FRAME_LEN, Frame, FrameKind, RingConsumer, RingFrame, RingProducer, SharedRegion, SyncPolicy,
};

const REGION_LEN: u64 = 2 + 256 * 4096;

struct Harness {
    _dir: tempfile::TempDir,
    socket_path: std::path::PathBuf,
    /// Producer on the broker's inbound region: what the peer would send.
    peer_tx: RingProducer,
    /// Consumer on the broker's outbound region: what the peer would see.
    peer_rx: RingConsumer,
}

impl Harness {
    /// Boot a guest-role broker on fresh regions and attach the fake peer.
    fn boot() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BrokerConfig::from_env();
        config.is_guest = true;
        config.h2g_file = dir.path().join("h2g");
        config.g2h_file = dir.path().join("g2h");
        config.socket_path = dir.path().join("broker.sock");
        config.region_len = REGION_LEN;
        config.sync_policy = SyncPolicy::Fence;

        let broker = Broker::new(config.clone()).unwrap();
        broker.start().unwrap();

        // The host would produce into h2g and consume g2h.
        let peer_tx = RingProducer::new(region(&config.h2g_file));
        peer_tx.reset();
        let peer_rx = RingConsumer::new(region(&config.g2h_file));
        Self { _dir: dir, socket_path: config.socket_path, peer_tx, peer_rx }
    }

    fn client(&self) -> UnixStream {
        UnixStream::connect(&self.socket_path).unwrap()
    }

    /// Next outbound frame the fake peer observes, with payload.
    fn next_outbound(&mut self) -> (RingFrame, Vec<u8>) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(got) = self.peer_rx.try_pop(|frame, payload| (frame, payload.to_vec())) {
                return got;
            }
            assert!(Instant::now() < deadline, "broker never produced a frame");
            std::thread::yield_now();
        }
    }
}

fn region(path: &Path) -> SharedRegion {
    SharedRegion::open(path, REGION_LEN, SyncPolicy::Fence).unwrap()
}

fn send_frame(sock: &mut UnixStream, frame: Frame) {
    let mut buf = [0u8; FRAME_LEN];
    frame.encode(&mut buf);
    sock.write_all(&buf).unwrap();
}

fn recv_frame(sock: &mut UnixStream) -> Frame {
    let mut buf = [0u8; FRAME_LEN];
    sock.read_exact(&mut buf).unwrap();
    Frame::decode(&buf).unwrap()
}

#[test]
fn connect_confirms_before_any_data() {
    let mut h = Harness::boot();
    let mut client = h.client();

    send_frame(&mut client, Frame::new(FrameKind::Connect, 0, 0));
    let (frame, _) = h.next_outbound();
    assert_eq!(frame, RingFrame::new(1, FrameKind::Connect, 0));

    // Peer confirms and immediately floods data for the same stream.
    h.peer_tx.push(RingFrame::new(1, FrameKind::Confirm, 0));
    h.peer_tx.push(RingFrame::new(1, FrameKind::Write, 4));
    h.peer_tx.push_payload(1, &mut std::io::Cursor::new(b"data"), 4).unwrap();

    // The client must see the confirm first, then the write, never reordered.
    assert_eq!(recv_frame(&mut client).kind, FrameKind::Confirm);
    let write = recv_frame(&mut client);
    assert_eq!((write.kind, write.arg1), (FrameKind::Write, 4));
    let mut payload = [0u8; 4];
    client.read_exact(&mut payload).unwrap();
    assert_eq!(&payload, b"data");
}

#[test]
fn local_write_becomes_ring_frames() {
    let mut h = Harness::boot();
    let mut client = h.client();

    send_frame(&mut client, Frame::new(FrameKind::Connect, 0, 0));
    assert_eq!(h.next_outbound().0.kind, FrameKind::Connect);
    h.peer_tx.push(RingFrame::new(1, FrameKind::Confirm, 0));
    assert_eq!(recv_frame(&mut client).kind, FrameKind::Confirm);

    // 10k write spans three segments at this region size.
    let payload: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
    send_frame(&mut client, Frame::new(FrameKind::Write, payload.len() as u32, 0));
    client.write_all(&payload).unwrap();

    let (frame, _) = h.next_outbound();
    assert_eq!(frame, RingFrame::new(1, FrameKind::Write, 10_000));
    let mut assembled = Vec::new();
    let mut chunks = Vec::new();
    while assembled.len() < payload.len() {
        let (frame, bytes) = h.next_outbound();
        assert_eq!(frame.kind, FrameKind::Data);
        chunks.push(bytes.len());
        assembled.extend_from_slice(&bytes);
    }
    assert_eq!(chunks, [4084, 4084, 1832]);
    assert_eq!(assembled, payload);
}

#[test]
fn local_close_notifies_peer() {
    let mut h = Harness::boot();
    let mut client = h.client();

    send_frame(&mut client, Frame::new(FrameKind::Connect, 0, 0));
    assert_eq!(h.next_outbound().0.kind, FrameKind::Connect);
    h.peer_tx.push(RingFrame::new(1, FrameKind::Confirm, 0));
    assert_eq!(recv_frame(&mut client).kind, FrameKind::Confirm);

    drop(client);
    let (frame, _) = h.next_outbound();
    assert_eq!(frame, RingFrame::new(1, FrameKind::Disconnect, 0));
}

#[test]
fn peer_disconnect_is_not_echoed() {
    let mut h = Harness::boot();
    let mut client = h.client();

    send_frame(&mut client, Frame::new(FrameKind::Connect, 0, 0));
    assert_eq!(h.next_outbound().0.kind, FrameKind::Connect);
    h.peer_tx.push(RingFrame::new(1, FrameKind::Confirm, 0));
    assert_eq!(recv_frame(&mut client).kind, FrameKind::Confirm);

    h.peer_tx.push(RingFrame::new(1, FrameKind::Disconnect, 0));

    // The local socket dies...
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).unwrap_or(0), 0);

    // ...and the broker must not bounce the disconnect back at the peer.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(h.peer_rx.occupancy(), 0);
}

#[test]
fn second_stream_gets_fresh_odd_id() {
    let mut h = Harness::boot();

    let mut first = h.client();
    send_frame(&mut first, Frame::new(FrameKind::Connect, 0, 0));
    assert_eq!(h.next_outbound().0.stream_id, 1);

    let mut second = h.client();
    send_frame(&mut second, Frame::new(FrameKind::Connect, 2, 0));
    let (frame, _) = h.next_outbound();
    assert_eq!(frame, RingFrame::new(3, FrameKind::Connect, 2));
}
