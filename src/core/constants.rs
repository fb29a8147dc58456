//! Protocol constants shared with the train-side firmware.
//!
//! The packet tag values are fixed by the deployed firmware and MUST NOT
//! be changed.

use std::time::Duration;

// =============================================================================
// PACKET TYPE TAGS
// =============================================================================

/// Fragmented video payload.
pub const PACKET_TYPE_VIDEO: u8 = 13;

/// Fragmented audio payload.
pub const PACKET_TYPE_AUDIO: u8 = 14;

/// Control channel message (JSON).
pub const PACKET_TYPE_CONTROL: u8 = 15;

/// Operator command to the train (JSON).
pub const PACKET_TYPE_COMMAND: u8 = 16;

/// Telemetry report from the train (JSON).
pub const PACKET_TYPE_TELEMETRY: u8 = 17;

/// Inertial measurement report (JSON).
pub const PACKET_TYPE_IMU: u8 = 18;

/// LiDAR scan report (JSON).
pub const PACKET_TYPE_LIDAR: u8 = 19;

/// Keepalive no-op (JSON).
pub const PACKET_TYPE_KEEPALIVE: u8 = 20;

/// Server-side notification (JSON).
pub const PACKET_TYPE_NOTIFICATION: u8 = 21;

// Extension tags occupy the values after the fixed table, in the order the
// firmware references them.

/// Download progress marker (JSON).
pub const PACKET_TYPE_DOWNLOAD_PROGRESS: u8 = 22;

/// Upload progress marker (JSON).
pub const PACKET_TYPE_UPLOAD_PROGRESS: u8 = 23;

/// Round-trip-time probe, controller to train (JSON).
pub const PACKET_TYPE_RTT_PROBE: u8 = 24;

/// Round-trip-time echo, train to controller (JSON).
pub const PACKET_TYPE_RTT_ECHO: u8 = 25;

/// Train-assignment acknowledgement (JSON).
pub const PACKET_TYPE_MAP_ACK: u8 = 26;

// =============================================================================
// FRAGMENT WIRE LAYOUT
// =============================================================================

/// Train identifier field width (NUL-padded text).
pub const TRAIN_ID_SIZE: usize = 36;

/// Fragment header size: tag + frame id + count + index + train id + timestamp.
pub const FRAGMENT_HEADER_SIZE: usize = 1 + 4 + 2 + 2 + TRAIN_ID_SIZE + 8;

/// Minimum size of a non-fragmented packet (tag byte, possibly empty body).
pub const MIN_ENVELOPE_SIZE: usize = 1;

// =============================================================================
// REASSEMBLY
// =============================================================================

/// Maximum number of in-flight frame assemblies (ring buffer capacity).
pub const DEFAULT_RING_CAPACITY: usize = 30;

/// Upper bound on the fragment count a single frame may declare.
///
/// Counts above this are treated as corrupt headers rather than allocated.
pub const MAX_FRAGMENTS_PER_FRAME: u16 = 1024;

/// Drop an incomplete assembly that has not completed within this window.
pub const DEFAULT_STALE_FRAME_AGE: Duration = Duration::from_secs(5);

// =============================================================================
// CLOCK CALIBRATION
// =============================================================================

/// Number of RTT probe/echo cycles per calibration.
pub const DEFAULT_RTT_PROBE_COUNT: usize = 10;

/// Delay between consecutive RTT probes.
pub const DEFAULT_RTT_PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Fixed allowance for train-side handling delay, in milliseconds.
pub const DEFAULT_PROCESSING_DELAY_MS: i64 = 30;

// =============================================================================
// DISPATCHER TIMING
// =============================================================================

/// Keepalive emission interval over the primary link.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Initial reconnect backoff delay.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on the reconnect backoff delay.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Reconnect attempts before a link is declared persistently down.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 10;

/// Per-adapter connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
