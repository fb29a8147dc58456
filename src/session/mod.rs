//! Session dispatcher: transport routing, keepalive, calibration, failover.
//!
//! A [`TrainSession`] owns every protocol component and runs them from a
//! single task. All inbound packets from every transport funnel into one
//! event channel, so reassembly and calibration state never need locks;
//! outbound traffic prefers the first registered transport (the
//! low-latency link) and falls back down the priority order when it is
//! down. Callers drive the session through a cloneable [`SessionHandle`].

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::assembly::{CompletedFrame, FrameReassembler};
use crate::clock::{Calibration, CalibrationConfig, CalibrationStep, ClockSync, RttEcho};
use crate::core::constants::KEEPALIVE_INTERVAL;
use crate::core::{unix_time_ms, unix_time_secs_f64, SessionError, SessionResult, TransportResult};
use crate::packet::{self, Packet, PacketType, TrainId};
use crate::transport::{LinkPhase, LinkState, ReconnectPolicy, Transport, TransportEvent};

/// Inbound event queue depth shared by all transports.
const EVENT_QUEUE_DEPTH: usize = 1024;

/// How often stalled frame assemblies are swept.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Callbacks for decoded traffic and link status changes.
///
/// Invoked from the session task; implementations should hand work off
/// rather than block.
pub trait PacketSink: Send {
    /// A media frame finished reassembly. `latency_ms` inside the frame
    /// is already clock-offset corrected.
    fn on_frame(&mut self, frame: CompletedFrame) {
        let _ = frame;
    }

    /// A telemetry-class report (telemetry, IMU, LiDAR, control) arrived.
    /// `latency_ms` is present when the body carried an origin timestamp
    /// and is clock-offset corrected.
    fn on_telemetry(&mut self, report: Value, latency_ms: Option<i64>) {
        let _ = (report, latency_ms);
    }

    /// A server-side notification arrived.
    fn on_notification(&mut self, notification: Value) {
        let _ = notification;
    }

    /// A transport link changed lifecycle phase.
    fn on_link_status(&mut self, transport: &'static str, phase: LinkPhase) {
        let _ = (transport, phase);
    }

    /// A calibration burst completed with the given offset.
    fn on_clock_calibrated(&mut self, offset_ms: i64) {
        let _ = offset_ms;
    }
}

/// Random identifier for this controller instance, sent in keepalives
/// and train assignments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerId(String);

impl ControllerId {
    /// Generate a fresh random identifier (UUID-shaped).
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        let mut hex = String::with_capacity(36);
        for (i, b) in bytes.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                hex.push('-');
            }
            let b = match i {
                // Version and variant nibbles of the RFC 4122 layout.
                6 => (b & 0x0F) | 0x40,
                8 => (b & 0x3F) | 0x80,
                _ => *b,
            };
            hex.push_str(&format!("{b:02x}"));
        }
        Self(hex)
    }

    /// The identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ControllerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Keepalive body, field names fixed by the train-side firmware.
#[derive(Debug, Clone, Serialize)]
pub struct KeepaliveMessage {
    /// Message discriminator, always `"keepalive"`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Name of the transport this keepalive travelled over.
    pub protocol: &'static str,
    /// Controller instance identifier.
    #[serde(rename = "remoteControlId")]
    pub remote_control_id: String,
    /// Controller wall clock, fractional seconds since epoch.
    pub timestamp: f64,
    /// Monotonic per-session counter.
    pub sequence: u64,
}

/// Train-assignment body sent when the operator selects a train.
#[derive(Debug, Clone, Serialize)]
struct TrainAssignment<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(rename = "trainId")]
    train_id: String,
    #[serde(rename = "remoteControlId")]
    remote_control_id: &'a str,
}

/// Session tunables.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Keepalive send period.
    pub keepalive_interval: Duration,
    /// Clock calibration burst parameters.
    pub calibration: CalibrationConfig,
    /// Reconnect backoff applied to every link.
    pub reconnect: ReconnectPolicy,
    /// Period of the stalled-assembly sweep.
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: KEEPALIVE_INTERVAL,
            calibration: CalibrationConfig::default(),
            reconnect: ReconnectPolicy::default(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

enum SessionCommand {
    SelectTrain {
        train_id: TrainId,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    Command {
        body: Value,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    Calibrate,
    Shutdown,
}

/// Cloneable control handle for a running [`TrainSession`].
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Assign the controller to `train_id`: in-flight state is dropped
    /// and a fresh clock calibration starts.
    pub async fn select_train(&self, train_id: TrainId) -> SessionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::SelectTrain { train_id, reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Send an operator command, preferring the low-latency transport.
    pub async fn send_command(&self, body: Value) -> SessionResult<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Command { body, reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Start a fresh calibration burst against the selected train.
    pub async fn calibrate(&self) -> SessionResult<()> {
        self.commands
            .send(SessionCommand::Calibrate)
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Stop the session task.
    pub async fn shutdown(&self) -> SessionResult<()> {
        self.commands
            .send(SessionCommand::Shutdown)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

struct Link {
    /// `None` while a connect attempt is in flight on a spawned task.
    transport: Option<Box<dyn Transport>>,
    state: LinkState,
    name: &'static str,
    retry_at: Option<Instant>,
}

impl Link {
    fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_connected())
    }
}

/// Result of a spawned connect attempt, reported back to the event loop.
struct ConnectOutcome {
    index: usize,
    transport: Box<dyn Transport>,
    result: TransportResult<()>,
}

/// Builder registering transports in failover priority order.
///
/// The first registered transport is the primary (low-latency) link.
#[derive(Default)]
pub struct SessionBuilder {
    transports: Vec<Box<dyn Transport>>,
    config: SessionConfig,
}

impl SessionBuilder {
    /// Start an empty builder with default tunables.
    pub fn new() -> Self {
        Self {
            transports: Vec::new(),
            config: SessionConfig::default(),
        }
    }

    /// Register a transport. Registration order is failover priority.
    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Override the session tunables.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the session around `sink`, returning it with its control
    /// handle. Call [`TrainSession::run`] to start processing.
    pub fn build<S: PacketSink>(self, sink: S) -> (TrainSession<S>, SessionHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let links = self
            .transports
            .into_iter()
            .map(|transport| {
                let name = transport.name();
                Link {
                    transport: Some(transport),
                    state: LinkState::new(self.config.reconnect),
                    name,
                    retry_at: None,
                }
            })
            .collect();
        let session = TrainSession {
            config: self.config,
            controller_id: ControllerId::generate(),
            links,
            reassembler: FrameReassembler::new(),
            clock: ClockSync::new(),
            calibration: None,
            probe_at: None,
            selected: None,
            keepalive_sequence: 0,
            sink,
            commands: commands_rx,
        };
        let handle = SessionHandle {
            commands: commands_tx,
        };
        (session, handle)
    }
}

/// The protocol session: one task owning all connection and decode state.
pub struct TrainSession<S: PacketSink> {
    config: SessionConfig,
    controller_id: ControllerId,
    links: Vec<Link>,
    reassembler: FrameReassembler,
    clock: ClockSync,
    calibration: Option<Calibration>,
    probe_at: Option<Instant>,
    selected: Option<TrainId>,
    keepalive_sequence: u64,
    sink: S,
    commands: mpsc::Receiver<SessionCommand>,
}

impl<S: PacketSink> TrainSession<S> {
    /// This controller's instance identifier.
    pub fn controller_id(&self) -> &ControllerId {
        &self.controller_id
    }

    /// Run the session event loop until shutdown.
    ///
    /// Starts a connect attempt for every registered transport, then
    /// serializes all inbound packets, timers, and control commands
    /// through one `select!` loop. Connect attempts run on spawned tasks
    /// and report back through the loop, so a slow dial on one link never
    /// stalls traffic on the others.
    pub async fn run(mut self) -> SessionResult<()> {
        let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (connects_tx, mut connects_rx) = mpsc::channel(self.links.len().max(1));

        for i in 0..self.links.len() {
            self.try_connect(i, &events_tx, &connects_tx);
        }

        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; skip it so keepalives are periodic.
        keepalive.tick().await;

        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;

        loop {
            let probe_at = self.probe_at;
            let retry_at = self.next_retry_at();

            tokio::select! {
                event = events_rx.recv() => {
                    // Never None: we hold a sender for reconnects.
                    if let Some(event) = event {
                        self.handle_event(event).await;
                    }
                }
                outcome = connects_rx.recv() => {
                    if let Some(outcome) = outcome {
                        self.finish_connect(outcome);
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(SessionCommand::SelectTrain { train_id, reply }) => {
                            let result = self.select_train(train_id).await;
                            let _ = reply.send(result);
                        }
                        Some(SessionCommand::Command { body, reply }) => {
                            let result = self.send_command(&body).await;
                            let _ = reply.send(result);
                        }
                        Some(SessionCommand::Calibrate) => self.start_calibration(),
                        Some(SessionCommand::Shutdown) | None => break,
                    }
                }
                _ = keepalive.tick() => self.send_keepalive().await,
                _ = sweep.tick() => {
                    self.reassembler.evict_stale(unix_time_ms());
                }
                _ = sleep_until(probe_at.unwrap_or_else(Instant::now)),
                    if probe_at.is_some() =>
                {
                    self.send_probe().await;
                }
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)),
                    if retry_at.is_some() =>
                {
                    self.retry_due_links(&events_tx, &connects_tx);
                }
            }
        }

        for link in &mut self.links {
            if let Some(transport) = link.transport.as_mut() {
                transport.close().await;
            }
        }
        info!("session shut down");
        Ok(())
    }

    /// Start a connect attempt on a spawned task. The outcome comes back
    /// through the loop; the transport is parked out of the link until
    /// then so nothing else touches it mid-dial.
    fn try_connect(
        &mut self,
        index: usize,
        events: &mpsc::Sender<TransportEvent>,
        connects: &mpsc::Sender<ConnectOutcome>,
    ) {
        let link = &mut self.links[index];
        let Some(mut transport) = link.transport.take() else {
            // Connect already in flight.
            return;
        };
        link.retry_at = None;
        link.state.on_connecting();
        let events = events.clone();
        let connects = connects.clone();
        tokio::spawn(async move {
            let result = transport.connect(events).await;
            let _ = connects
                .send(ConnectOutcome {
                    index,
                    transport,
                    result,
                })
                .await;
        });
    }

    fn finish_connect(&mut self, outcome: ConnectOutcome) {
        let link = &mut self.links[outcome.index];
        link.transport = Some(outcome.transport);
        match outcome.result {
            Ok(()) => {
                link.state.on_connected();
                info!(transport = link.name, "link connected");
                let (name, phase) = (link.name, link.state.phase());
                self.sink.on_link_status(name, phase);
            }
            Err(e) => {
                warn!(transport = link.name, error = %e, "connect failed");
                self.schedule_retry(outcome.index);
            }
        }
    }

    /// Count one failure against the link's retry budget and schedule the
    /// backoff. The budget counts connect attempts: a link that is
    /// already down or already has a retry pending is not counted again
    /// for pile-on failures (e.g. several commands hitting a dead writer).
    fn schedule_retry(&mut self, index: usize) {
        let link = &mut self.links[index];
        if link.retry_at.is_some()
            || matches!(
                link.state.phase(),
                LinkPhase::Disconnected | LinkPhase::Exhausted
            )
        {
            return;
        }
        match link.state.on_disconnected() {
            Some(delay) => {
                debug!(
                    transport = link.name,
                    delay_ms = delay.as_millis() as u64,
                    attempt = link.state.attempts(),
                    "scheduling reconnect"
                );
                link.retry_at = Some(Instant::now() + delay);
                let (name, phase) = (link.name, link.state.phase());
                self.sink.on_link_status(name, phase);
            }
            None => {
                warn!(transport = link.name, "reconnect budget exhausted");
                link.retry_at = None;
                let (name, phase) = (link.name, link.state.phase());
                self.sink.on_link_status(name, phase);
            }
        }
    }

    fn next_retry_at(&self) -> Option<Instant> {
        self.links.iter().filter_map(|l| l.retry_at).min()
    }

    fn retry_due_links(
        &mut self,
        events: &mpsc::Sender<TransportEvent>,
        connects: &mpsc::Sender<ConnectOutcome>,
    ) {
        let now = Instant::now();
        for i in 0..self.links.len() {
            if self.links[i].retry_at.is_some_and(|at| at <= now) {
                self.try_connect(i, events, connects);
            }
        }
    }

    /// A send failed on a link that claimed to be connected: tear the
    /// channel down so it is not re-picked, and charge one reconnect.
    async fn on_send_failure(&mut self, index: usize) {
        if let Some(transport) = self.links[index].transport.as_mut() {
            transport.close().await;
        }
        self.schedule_retry(index);
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Packet { transport, payload } => {
                match packet::decode(&payload) {
                    Ok(packet) => self.handle_packet(packet).await,
                    Err(e) => {
                        warn!(transport, error = %e, len = payload.len(), "dropping malformed packet");
                    }
                }
            }
            TransportEvent::Closed { transport } => {
                info!(transport, "link closed");
                // A stale Closed from an already-handled failure (or from
                // a reader torn down mid-reconnect) must not double-count.
                if let Some(index) = self
                    .links
                    .iter()
                    .position(|l| l.name == transport && l.state.phase() == LinkPhase::Connected)
                {
                    self.schedule_retry(index);
                }
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::Fragment { header, payload } => {
                match self
                    .reassembler
                    .process_fragment(&header, payload, unix_time_ms())
                {
                    Ok(Some(mut frame)) => {
                        frame.latency_ms = self.clock.adjust(frame.latency_ms);
                        self.sink.on_frame(frame);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "dropping fragment"),
                }
            }
            Packet::Envelope { tag, body } => match tag {
                PacketType::RttEcho => match serde_json::from_slice::<RttEcho>(&body) {
                    Ok(echo) => self.handle_echo(&echo),
                    Err(e) => warn!(error = %e, "dropping malformed rtt echo"),
                },
                PacketType::Telemetry
                | PacketType::Imu
                | PacketType::Lidar
                | PacketType::Control => match serde_json::from_slice::<Value>(&body) {
                    Ok(report) => {
                        let latency = report
                            .get("timestamp")
                            .and_then(Value::as_u64)
                            .map(|origin| self.clock.latency_for(origin, unix_time_ms()));
                        self.sink.on_telemetry(report, latency);
                    }
                    Err(e) => warn!(error = %e, "dropping malformed report"),
                },
                PacketType::Notification => match serde_json::from_slice::<Value>(&body) {
                    Ok(notification) => self.sink.on_notification(notification),
                    Err(e) => warn!(error = %e, "dropping malformed notification"),
                },
                PacketType::MapAck => {
                    info!(train = ?self.selected, "train assignment acknowledged");
                }
                other => {
                    debug!(tag = other.as_byte(), "ignoring envelope");
                }
            },
        }
    }

    fn handle_echo(&mut self, echo: &RttEcho) {
        let Some(calibration) = self.calibration.as_mut() else {
            debug!("rtt echo with no calibration in progress");
            return;
        };
        match calibration.on_echo(echo, unix_time_ms()) {
            CalibrationStep::Complete(offset) => {
                self.clock.set_offset(offset);
                self.calibration = None;
                self.probe_at = None;
                self.sink.on_clock_calibrated(offset);
            }
            CalibrationStep::Sampled { .. } => {}
        }
    }

    fn start_calibration(&mut self) {
        let Some(train_id) = self.selected else {
            warn!("calibration requested with no train selected");
            return;
        };
        self.calibration = Some(Calibration::new(self.config.calibration, train_id));
        self.probe_at = Some(Instant::now());
    }

    async fn send_probe(&mut self) {
        self.probe_at = None;
        let Some(calibration) = self.calibration.as_mut() else {
            return;
        };
        let Some(probe) = calibration.next_probe(unix_time_ms()) else {
            return;
        };
        let interval = calibration.probe_interval();
        let pending = calibration.has_pending_probes();
        match serde_json::to_vec(&probe) {
            Ok(body) => {
                let wire = packet::encode_envelope(PacketType::RttProbe, &body);
                if let Err(e) = self.send_prioritized(&wire).await {
                    warn!(error = %e, "rtt probe send failed");
                }
            }
            Err(e) => warn!(error = %e, "rtt probe encode failed"),
        }
        if pending {
            self.probe_at = Some(Instant::now() + interval);
        }
    }

    async fn send_keepalive(&mut self) {
        let Some(index) = self.links.iter().position(Link::is_connected) else {
            debug!("keepalive skipped, no connected link");
            return;
        };
        self.keepalive_sequence += 1;
        let message = KeepaliveMessage {
            kind: "keepalive",
            protocol: self.links[index].name,
            remote_control_id: self.controller_id.0.clone(),
            timestamp: unix_time_secs_f64(),
            sequence: self.keepalive_sequence,
        };
        match serde_json::to_vec(&message) {
            Ok(body) => {
                let wire = packet::encode_envelope(PacketType::Keepalive, &body);
                let Some(transport) = self.links[index].transport.as_mut() else {
                    return;
                };
                if let Err(e) = transport.send(&wire).await {
                    warn!(transport = self.links[index].name, error = %e, "keepalive failed");
                    self.on_send_failure(index).await;
                }
            }
            Err(e) => warn!(error = %e, "keepalive encode failed"),
        }
    }

    async fn send_command(&mut self, body: &Value) -> SessionResult<()> {
        let body = serde_json::to_vec(body)?;
        let wire = packet::encode_envelope(PacketType::Command, &body);
        self.send_prioritized(&wire).await
    }

    /// Send on the first connected link in priority order; fall through
    /// to the next on failure.
    async fn send_prioritized(&mut self, wire: &[u8]) -> SessionResult<()> {
        for index in 0..self.links.len() {
            if !self.links[index].is_connected() {
                continue;
            }
            let Some(transport) = self.links[index].transport.as_mut() else {
                continue;
            };
            match transport.send(wire).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        transport = self.links[index].name,
                        error = %e,
                        "send failed, trying next link"
                    );
                    self.on_send_failure(index).await;
                }
            }
        }
        Err(SessionError::NoConnectedTransport)
    }

    async fn select_train(&mut self, train_id: TrainId) -> SessionResult<()> {
        info!(train = %train_id, "selecting train");
        // Frames and calibration state from the previous train must not
        // bleed into the new assignment.
        self.reassembler.clear();
        self.clock.reset();
        self.selected = Some(train_id);
        // Calibration belongs to the selection, not to the assign
        // message's delivery: it must start even when the send below
        // fails and the caller retries the assignment later.
        self.start_calibration();

        let assignment = TrainAssignment {
            kind: "map_connection",
            train_id: train_id.as_str().into_owned(),
            remote_control_id: self.controller_id.as_str(),
        };
        let body = serde_json::to_vec(&assignment)?;
        let wire = packet::encode_envelope(PacketType::Control, &body);
        self.send_prioritized(&wire).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_id_shape() {
        let id = ControllerId::generate();
        let text = id.as_str();
        assert_eq!(text.len(), 36);
        let parts: Vec<&str> = text.split('-').collect();
        assert_eq!(
            parts.iter().map(|p| p.len()).collect::<Vec<_>>(),
            vec![8, 4, 4, 4, 12]
        );
        assert!(text.chars().all(|c| c == '-' || c.is_ascii_hexdigit()));
        // Version nibble is 4, variant high bits are 10.
        assert_eq!(&parts[2][..1], "4");
        assert!(matches!(&parts[3][..1], "8" | "9" | "a" | "b"));
    }

    #[test]
    fn test_controller_ids_are_unique() {
        let a = ControllerId::generate();
        let b = ControllerId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_keepalive_body_shape() {
        let message = KeepaliveMessage {
            kind: "keepalive",
            protocol: "datagram",
            remote_control_id: "abc".to_string(),
            timestamp: 1_700_000_000.25,
            sequence: 7,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "keepalive");
        assert_eq!(json["protocol"], "datagram");
        assert_eq!(json["remoteControlId"], "abc");
        assert_eq!(json["timestamp"], 1_700_000_000.25);
        assert_eq!(json["sequence"], 7);
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.keepalive_interval, KEEPALIVE_INTERVAL);
        assert_eq!(config.calibration.probe_count, 10);
        assert_eq!(config.reconnect.max_attempts, 10);
    }
}
