//! Round-trip clock-offset calibration.
//!
//! The train and the controller run independent real-time clocks, so a
//! train-origin timestamp cannot be compared against the controller clock
//! directly. The controller sends a burst of RTT probes; the train echoes
//! each one back stamped with its own clock, and the averaged per-sample
//! offsets become a single additive correction ([`ClockSync`]) applied to
//! every latency computation until the next calibration.
//!
//! [`Calibration`] itself is a passive state machine. The session drives
//! it from a timer and feeds it echoes; cancelling a calibration (for
//! example when the operator switches trains mid-burst) is just dropping
//! the value, so partial samples from two trains can never mix.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::constants::{
    DEFAULT_PROCESSING_DELAY_MS, DEFAULT_RTT_PROBE_COUNT, DEFAULT_RTT_PROBE_INTERVAL,
};
use crate::packet::TrainId;

/// Outbound RTT probe body, serialized as the firmware expects it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RttProbe {
    /// Message discriminator, always `"rtt"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Controller clock at probe send, ms since epoch.
    pub remote_control_timestamp: u64,
    /// Zero on the outbound leg; the train fills it in.
    pub train_timestamp: u64,
}

impl RttProbe {
    /// Build a probe stamped with the controller clock.
    pub fn new(now_ms: u64) -> Self {
        Self {
            kind: "rtt".to_string(),
            remote_control_timestamp: now_ms,
            train_timestamp: 0,
        }
    }
}

/// Inbound RTT echo body.
///
/// The train echoes `remote_control_timestamp` unchanged and stamps
/// `train_timestamp` with its own clock at processing time. Any extra
/// fields the firmware adds are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct RttEcho {
    /// Echoed controller timestamp from the probe.
    pub remote_control_timestamp: u64,
    /// Train clock at echo time, ms since epoch.
    pub train_timestamp: u64,
}

/// One probe/echo measurement and its derived quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttSample {
    /// Controller clock when the probe was sent.
    pub sent_ms: u64,
    /// Train clock when the probe was processed.
    pub train_ms: u64,
    /// Controller clock when the echo arrived.
    pub received_ms: u64,
}

impl RttSample {
    /// Full round-trip time in milliseconds.
    pub fn round_trip_ms(&self) -> i64 {
        self.received_ms as i64 - self.sent_ms as i64
    }

    /// One-way latency estimate: half the round trip.
    pub fn one_way_ms(&self) -> f64 {
        self.round_trip_ms() as f64 / 2.0
    }

    /// Clock offset estimate for this sample.
    ///
    /// The probe is assumed to have reached the train at
    /// `sent + round_trip / 2` on the controller clock; the difference
    /// between the train's stamp and that expectation, plus a fixed
    /// allowance for train-side handling, is the offset.
    pub fn offset_ms(&self, processing_delay_ms: i64) -> f64 {
        let expected_receive = self.sent_ms as f64 + self.one_way_ms();
        self.train_ms as f64 - expected_receive + processing_delay_ms as f64
    }
}

/// Tunables for one calibration burst.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationConfig {
    /// Number of probe/echo cycles.
    pub probe_count: usize,
    /// Spacing between probes, to avoid saturating the link.
    pub probe_interval: Duration,
    /// Fixed train-side handling allowance, ms.
    pub processing_delay_ms: i64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            probe_count: DEFAULT_RTT_PROBE_COUNT,
            probe_interval: DEFAULT_RTT_PROBE_INTERVAL,
            processing_delay_ms: DEFAULT_PROCESSING_DELAY_MS,
        }
    }
}

/// Result of feeding an echo into a calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationStep {
    /// Sample recorded; more echoes expected.
    Sampled {
        /// Samples collected so far.
        collected: usize,
    },
    /// Burst finished; the averaged offset in milliseconds.
    Complete(i64),
}

/// One bounded probe/echo burst against a single train.
#[derive(Debug)]
pub struct Calibration {
    config: CalibrationConfig,
    train_id: TrainId,
    probes_sent: usize,
    offsets: Vec<f64>,
}

impl Calibration {
    /// Start a calibration against `train_id`.
    pub fn new(config: CalibrationConfig, train_id: TrainId) -> Self {
        Self {
            config,
            train_id,
            probes_sent: 0,
            offsets: Vec::with_capacity(config.probe_count),
        }
    }

    /// The train this burst is measuring.
    pub fn train_id(&self) -> &TrainId {
        &self.train_id
    }

    /// Whether more probes remain to be sent.
    pub fn has_pending_probes(&self) -> bool {
        self.probes_sent < self.config.probe_count
    }

    /// Delay to wait before the next probe.
    pub fn probe_interval(&self) -> Duration {
        self.config.probe_interval
    }

    /// Probes sent so far.
    pub fn probes_sent(&self) -> usize {
        self.probes_sent
    }

    /// Samples collected so far.
    pub fn samples_collected(&self) -> usize {
        self.offsets.len()
    }

    /// Produce the next probe body, stamped with the controller clock.
    ///
    /// Returns `None` once the burst's probe budget is spent.
    pub fn next_probe(&mut self, now_ms: u64) -> Option<RttProbe> {
        if !self.has_pending_probes() {
            return None;
        }
        self.probes_sent += 1;
        debug!(
            probe = self.probes_sent,
            of = self.config.probe_count,
            "sending rtt probe"
        );
        Some(RttProbe::new(now_ms))
    }

    /// Feed an echo received at `received_ms` (controller clock).
    ///
    /// Echoes without an outstanding probe (duplicates from a flaky link,
    /// or unsolicited traffic) are ignored, so the burst never completes
    /// from fewer real probes than configured. No outlier rejection: a
    /// congested network degrades the average gracefully instead of
    /// failing the burst.
    pub fn on_echo(&mut self, echo: &RttEcho, received_ms: u64) -> CalibrationStep {
        if self.offsets.len() >= self.probes_sent {
            debug!("ignoring rtt echo with no outstanding probe");
            return CalibrationStep::Sampled {
                collected: self.offsets.len(),
            };
        }
        let sample = RttSample {
            sent_ms: echo.remote_control_timestamp,
            train_ms: echo.train_timestamp,
            received_ms,
        };
        let offset = sample.offset_ms(self.config.processing_delay_ms);
        self.offsets.push(offset);
        debug!(
            rtt_ms = sample.round_trip_ms(),
            offset_ms = offset,
            collected = self.offsets.len(),
            of = self.config.probe_count,
            "rtt echo"
        );

        if self.offsets.len() >= self.config.probe_count {
            let mean = self.offsets.iter().sum::<f64>() / self.offsets.len() as f64;
            let offset = mean.round() as i64;
            info!(
                train = %self.train_id,
                offset_ms = offset,
                samples = self.offsets.len(),
                "clock offset calibrated"
            );
            CalibrationStep::Complete(offset)
        } else {
            CalibrationStep::Sampled {
                collected: self.offsets.len(),
            }
        }
    }
}

/// Process-wide clock correction between the controller and the selected
/// train.
///
/// Recomputed at every train (re)selection; read by every latency
/// computation until the next calibration completes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockSync {
    offset_ms: i64,
    calibrated: bool,
}

impl ClockSync {
    /// A sync with no correction (offset zero, uncalibrated).
    pub fn new() -> Self {
        Self::default()
    }

    /// The current signed offset in milliseconds.
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }

    /// Whether a calibration has completed since the last reset.
    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    /// Install a freshly calibrated offset.
    pub fn set_offset(&mut self, offset_ms: i64) {
        self.offset_ms = offset_ms;
        self.calibrated = true;
    }

    /// Drop the correction (train deselected or reassigned).
    pub fn reset(&mut self) {
        self.offset_ms = 0;
        self.calibrated = false;
    }

    /// Apply the correction additively to a raw latency.
    pub fn adjust(&self, raw_latency_ms: i64) -> i64 {
        raw_latency_ms + self.offset_ms
    }

    /// Corrected latency for a remote-origin timestamp observed now.
    pub fn latency_for(&self, origin_ts_ms: u64, now_ms: u64) -> i64 {
        self.adjust(now_ms as i64 - origin_ts_ms as i64)
    }
}
