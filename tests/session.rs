//! End-to-end session tests over in-process channel transports.

use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use tracklink_protocol::assembly::CompletedFrame;
use tracklink_protocol::clock::CalibrationConfig;
use tracklink_protocol::core::{unix_time_ms, TransportError, TransportResult};
use tracklink_protocol::packet::{
    encode_envelope, encode_fragment, FragmentHeader, PacketType, TrainId,
};
use tracklink_protocol::session::{PacketSink, SessionBuilder, SessionConfig, SessionHandle};
use tracklink_protocol::transport::{
    ChannelTransport, LinkPhase, ReconnectPolicy, Transport, TransportEvent, TransportKind,
};
use tracklink_protocol::SessionError;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum SinkEvent {
    Frame(CompletedFrame),
    Telemetry(Value, Option<i64>),
    Notification(Value),
    Link(&'static str, LinkPhase),
    Calibrated(i64),
}

struct RecordingSink(mpsc::UnboundedSender<SinkEvent>);

impl PacketSink for RecordingSink {
    fn on_frame(&mut self, frame: CompletedFrame) {
        let _ = self.0.send(SinkEvent::Frame(frame));
    }
    fn on_telemetry(&mut self, report: Value, latency_ms: Option<i64>) {
        let _ = self.0.send(SinkEvent::Telemetry(report, latency_ms));
    }
    fn on_notification(&mut self, notification: Value) {
        let _ = self.0.send(SinkEvent::Notification(notification));
    }
    fn on_link_status(&mut self, transport: &'static str, phase: LinkPhase) {
        let _ = self.0.send(SinkEvent::Link(transport, phase));
    }
    fn on_clock_calibrated(&mut self, offset_ms: i64) {
        let _ = self.0.send(SinkEvent::Calibrated(offset_ms));
    }
}

struct Peer {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

impl Peer {
    async fn recv(&mut self) -> Bytes {
        timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for outbound packet")
            .expect("peer channel closed")
    }

    /// Receive until a packet with the given tag byte arrives.
    async fn recv_tag(&mut self, tag: u8) -> Bytes {
        loop {
            let wire = self.recv().await;
            if wire[0] == tag {
                return wire;
            }
        }
    }

    async fn send(&self, wire: Vec<u8>) {
        self.tx.send(Bytes::from(wire)).await.expect("peer send");
    }
}

fn test_config() -> SessionConfig {
    SessionConfig {
        keepalive_interval: Duration::from_millis(50),
        calibration: CalibrationConfig {
            probe_count: 3,
            probe_interval: Duration::from_millis(10),
            processing_delay_ms: 30,
        },
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            max_attempts: 3,
        },
        sweep_interval: Duration::from_millis(100),
    }
}

/// Spawn a session with `n` channel transports; returns the handle, the
/// peer side of each transport, and the sink event stream.
fn spawn_session(
    n: usize,
) -> (
    SessionHandle,
    Vec<Peer>,
    mpsc::UnboundedReceiver<SinkEvent>,
) {
    let (sink_tx, sink_rx) = mpsc::unbounded_channel();
    let mut builder = SessionBuilder::new().config(test_config());
    let mut peers = Vec::new();
    for _ in 0..n {
        let (near, far) = ChannelTransport::pair();
        let (tx, rx) = far.into_raw();
        peers.push(Peer {
            tx,
            rx: rx.expect("unused end has its receiver"),
        });
        builder = builder.transport(Box::new(near));
    }
    let (session, handle) = builder.build(RecordingSink(sink_tx));
    tokio::spawn(session.run());
    (handle, peers, sink_rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<SinkEvent>) -> SinkEvent {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for sink event")
        .expect("sink channel closed")
}

/// Consume sink events until a link reports `Connected`.
async fn wait_for_connected(rx: &mut mpsc::UnboundedReceiver<SinkEvent>) {
    loop {
        if let SinkEvent::Link(_, LinkPhase::Connected) = next_event(rx).await {
            return;
        }
    }
}

/// A link that takes a long time to dial and then fails.
struct SlowTransport;

#[async_trait::async_trait]
impl Transport for SlowTransport {
    fn name(&self) -> &'static str {
        "slow"
    }
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }
    fn is_connected(&self) -> bool {
        false
    }
    async fn connect(&mut self, _events: mpsc::Sender<TransportEvent>) -> TransportResult<()> {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Err(TransportError::ConnectTimeout)
    }
    async fn send(&mut self, _data: &[u8]) -> TransportResult<()> {
        Err(TransportError::NotConnected)
    }
    async fn close(&mut self) {}
}

/// A link that connects fine but whose writer is dead.
struct FlakyTransport {
    connected: bool,
}

#[async_trait::async_trait]
impl Transport for FlakyTransport {
    fn name(&self) -> &'static str {
        "flaky"
    }
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }
    fn is_connected(&self) -> bool {
        self.connected
    }
    async fn connect(&mut self, _events: mpsc::Sender<TransportEvent>) -> TransportResult<()> {
        self.connected = true;
        Ok(())
    }
    async fn send(&mut self, _data: &[u8]) -> TransportResult<()> {
        Err(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "writer gone",
        )))
    }
    async fn close(&mut self) {
        self.connected = false;
    }
}

/// A link whose very first write fails; everything after goes through.
struct HiccupTransport {
    tx: mpsc::Sender<Bytes>,
    connected: bool,
    hiccupped: bool,
}

#[async_trait::async_trait]
impl Transport for HiccupTransport {
    fn name(&self) -> &'static str {
        "hiccup"
    }
    fn kind(&self) -> TransportKind {
        TransportKind::Channel
    }
    fn is_connected(&self) -> bool {
        self.connected
    }
    async fn connect(&mut self, _events: mpsc::Sender<TransportEvent>) -> TransportResult<()> {
        self.connected = true;
        Ok(())
    }
    async fn send(&mut self, data: &[u8]) -> TransportResult<()> {
        if !self.hiccupped {
            self.hiccupped = true;
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "writer hiccup",
            )));
        }
        self.tx
            .send(Bytes::copy_from_slice(data))
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }
    async fn close(&mut self) {
        self.connected = false;
    }
}

#[tokio::test]
async fn test_keepalive_sequence_is_monotonic() {
    let (_handle, mut peers, _sink) = spawn_session(1);
    let peer = &mut peers[0];

    let mut last = 0u64;
    for _ in 0..3 {
        let wire = peer.recv_tag(20).await;
        let body: Value = serde_json::from_slice(&wire[1..]).unwrap();
        assert_eq!(body["type"], "keepalive");
        assert_eq!(body["protocol"], "channel");
        assert_eq!(body["remoteControlId"].as_str().unwrap().len(), 36);
        let sequence = body["sequence"].as_u64().unwrap();
        assert!(sequence > last, "sequence {sequence} after {last}");
        last = sequence;
    }
}

#[tokio::test]
async fn test_select_train_assigns_and_calibrates() {
    let (handle, mut peers, mut sink) = spawn_session(1);
    wait_for_connected(&mut sink).await;

    handle
        .select_train(TrainId::new("train-alpha"))
        .await
        .unwrap();

    // Assignment goes out first, on the control channel.
    let wire = peers[0].recv_tag(15).await;
    let body: Value = serde_json::from_slice(&wire[1..]).unwrap();
    assert_eq!(body["type"], "map_connection");
    assert_eq!(body["trainId"], "train-alpha");

    // Echo every probe with a train clock 100 ms ahead of ours.
    for _ in 0..3 {
        let wire = peers[0].recv_tag(24).await;
        let probe: Value = serde_json::from_slice(&wire[1..]).unwrap();
        assert_eq!(probe["type"], "rtt");
        let sent = probe["remote_control_timestamp"].as_u64().unwrap();
        let echo = json!({
            "remote_control_timestamp": sent,
            "train_timestamp": sent + 100,
        });
        peers[0]
            .send(encode_envelope(
                PacketType::RttEcho,
                &serde_json::to_vec(&echo).unwrap(),
            ))
            .await;
    }

    // Offset = 100 + 30 processing allowance - rtt/2; in-process rtt is
    // small but nonzero.
    loop {
        match next_event(&mut sink).await {
            SinkEvent::Calibrated(offset) => {
                assert!((100..=130).contains(&offset), "offset {offset}");
                break;
            }
            SinkEvent::Link(..) => continue,
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_fragmented_frame_reaches_sink() {
    let (_handle, mut peers, mut sink) = spawn_session(1);
    let origin = unix_time_ms();

    let header = |index: u16| FragmentHeader {
        packet_type: PacketType::Video,
        frame_id: 42,
        fragment_count: 2,
        fragment_index: index,
        train_id: TrainId::new("train-alpha"),
        origin_timestamp_ms: origin,
    };

    // Out of order on purpose.
    peers[0].send(encode_fragment(&header(2), b"world")).await;
    peers[0].send(encode_fragment(&header(1), b"hello ")).await;

    loop {
        match next_event(&mut sink).await {
            SinkEvent::Frame(frame) => {
                assert_eq!(frame.frame_id, 42);
                assert_eq!(&frame.bytes[..], b"hello world");
                assert_eq!(frame.train_id.as_str(), "train-alpha");
                // Uncalibrated clock: latency is raw and near zero.
                assert!(frame.latency_ms.abs() < 2_000);
                break;
            }
            SinkEvent::Link(..) => continue,
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_telemetry_and_notification_routing() {
    let (_handle, mut peers, mut sink) = spawn_session(1);

    let report = json!({"speed": 3, "battery": 87, "timestamp": unix_time_ms()});
    peers[0]
        .send(encode_envelope(
            PacketType::Telemetry,
            &serde_json::to_vec(&report).unwrap(),
        ))
        .await;
    peers[0]
        .send(encode_envelope(
            PacketType::Notification,
            br#"{"message":"low battery"}"#,
        ))
        .await;

    let mut saw_telemetry = false;
    loop {
        match next_event(&mut sink).await {
            SinkEvent::Telemetry(value, latency) => {
                assert_eq!(value["speed"], 3);
                let latency = latency.expect("report carried a timestamp");
                assert!(latency.abs() < 2_000);
                saw_telemetry = true;
            }
            SinkEvent::Notification(value) => {
                assert_eq!(value["message"], "low battery");
                assert!(saw_telemetry, "telemetry should arrive first");
                break;
            }
            SinkEvent::Link(..) => continue,
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_command_fails_over_to_secondary() {
    let (handle, mut peers, mut sink) = spawn_session(2);
    wait_for_connected(&mut sink).await;
    wait_for_connected(&mut sink).await;
    let secondary = peers.pop().unwrap();
    let primary = peers.pop().unwrap();

    // Take the primary down and wait for the session to notice.
    drop(primary);
    loop {
        if let SinkEvent::Link(_, LinkPhase::Disconnected | LinkPhase::Exhausted) =
            next_event(&mut sink).await
        {
            break;
        }
    }

    handle.send_command(json!({"action": "stop"})).await.unwrap();

    let mut secondary = secondary;
    let wire = secondary.recv_tag(16).await;
    let body: Value = serde_json::from_slice(&wire[1..]).unwrap();
    assert_eq!(body["action"], "stop");
}

#[tokio::test]
async fn test_command_with_all_links_down_errors() {
    let (handle, mut peers, mut sink) = spawn_session(1);
    drop(peers.pop());

    loop {
        if let SinkEvent::Link(_, LinkPhase::Disconnected | LinkPhase::Exhausted) =
            next_event(&mut sink).await
        {
            break;
        }
    }

    let err = handle
        .send_command(json!({"action": "stop"}))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NoConnectedTransport));
}

#[tokio::test]
async fn test_malformed_packets_do_not_kill_session() {
    let (_handle, mut peers, mut sink) = spawn_session(1);

    // Unknown tag, truncated fragment, invalid JSON body.
    peers[0].send(vec![0x07, 0x01, 0x02]).await;
    peers[0].send(vec![13, 0, 0]).await;
    peers[0]
        .send(encode_envelope(PacketType::Telemetry, b"not json"))
        .await;

    // A valid packet after the garbage still gets through.
    peers[0]
        .send(encode_envelope(PacketType::Notification, br#"{"ok":true}"#))
        .await;

    loop {
        match next_event(&mut sink).await {
            SinkEvent::Notification(value) => {
                assert_eq!(value["ok"], true);
                break;
            }
            SinkEvent::Link(..) => continue,
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_slow_connect_does_not_stall_packet_delivery() {
    let (sink_tx, mut sink) = mpsc::unbounded_channel();
    let (near, far) = ChannelTransport::pair();
    let (peer_tx, _peer_rx) = far.into_raw();
    let (session, _handle) = SessionBuilder::new()
        .config(test_config())
        .transport(Box::new(SlowTransport))
        .transport(Box::new(near))
        .build(RecordingSink(sink_tx));
    tokio::spawn(session.run());

    // The healthy link comes up while the slow one is still dialing
    // (and keeps re-dialing for 1 s at a time).
    wait_for_connected(&mut sink).await;

    let started = std::time::Instant::now();
    peer_tx
        .send(Bytes::from(encode_envelope(
            PacketType::Notification,
            br#"{"ok":true}"#,
        )))
        .await
        .unwrap();
    loop {
        match next_event(&mut sink).await {
            SinkEvent::Notification(_) => break,
            SinkEvent::Link(..) => continue,
            other => panic!("unexpected event {other:?}"),
        }
    }
    let elapsed = started.elapsed();
    assert!(
        elapsed < Duration::from_millis(500),
        "delivery stalled behind the dialing link: {elapsed:?}"
    );
}

#[tokio::test]
async fn test_send_failures_do_not_burn_reconnect_budget() {
    let (sink_tx, mut sink) = mpsc::unbounded_channel();
    let (near, far) = ChannelTransport::pair();
    let (tx, rx) = far.into_raw();
    let mut peer = Peer {
        tx,
        rx: rx.expect("unused end has its receiver"),
    };
    let (session, handle) = SessionBuilder::new()
        .config(test_config())
        .transport(Box::new(FlakyTransport { connected: false }))
        .transport(Box::new(near))
        .build(RecordingSink(sink_tx));
    tokio::spawn(session.run());
    wait_for_connected(&mut sink).await;
    wait_for_connected(&mut sink).await;

    // Every command hits the flaky writer first and falls over to the
    // healthy link.
    for i in 0..6 {
        handle.send_command(json!({"seq": i})).await.unwrap();
        let wire = peer.recv_tag(16).await;
        let body: Value = serde_json::from_slice(&wire[1..]).unwrap();
        assert_eq!(body["seq"], i);
    }

    // Failed sends count as one disconnect, not one attempt each: with a
    // 3-attempt budget, six rapid commands must not exhaust the link.
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = sink.try_recv() {
        if let SinkEvent::Link(name, LinkPhase::Exhausted) = event {
            panic!("link {name} exhausted after send failures");
        }
    }
}

#[tokio::test]
async fn test_calibration_starts_even_when_assign_send_fails() {
    let (sink_tx, mut sink) = mpsc::unbounded_channel();
    let (out_tx, mut out_rx) = mpsc::channel(64);
    let mut config = test_config();
    config.calibration.probe_interval = Duration::from_millis(50);
    let (session, handle) = SessionBuilder::new()
        .config(config)
        .transport(Box::new(HiccupTransport {
            tx: out_tx,
            connected: false,
            hiccupped: false,
        }))
        .build(RecordingSink(sink_tx));
    tokio::spawn(session.run());
    wait_for_connected(&mut sink).await;

    // The assign message hits the one-off write failure.
    let err = handle
        .select_train(TrainId::new("train-alpha"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NoConnectedTransport));

    // Calibration belongs to the selection: once the link recovers,
    // probes go out without a manual restart.
    loop {
        let wire = timeout(WAIT, out_rx.recv())
            .await
            .expect("timed out waiting for rtt probe")
            .expect("transport closed");
        if wire[0] == 24 {
            break;
        }
    }
}

#[tokio::test]
async fn test_shutdown_stops_the_loop() {
    let (handle, _peers, _sink) = spawn_session(1);
    handle.shutdown().await.unwrap();

    // Further commands find the loop gone.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let err = handle
        .send_command(json!({"action": "stop"}))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Closed));
}
