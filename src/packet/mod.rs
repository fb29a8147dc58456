//! Wire packet encoding and decoding.
//!
//! Every transport carries the same tagged byte format. Fragment-bearing
//! packets (video, audio) use a fixed 53-byte header:
//!
//! ```text
//! +------+----------+-------+-------+---------------+------------+---------+
//! | Tag  | Frame id | Count | Index | Train id      | Timestamp  | Payload |
//! | 1 B  | 4 B BE   | 2 B BE| 2 B BE| 36 B NUL-pad  | 8 B BE ms  | ...     |
//! +------+----------+-------+-------+---------------+------------+---------+
//! ```
//!
//! Every other packet type is `[tag][UTF-8 JSON body]`.

use bytes::Bytes;

use crate::core::constants::{
    FRAGMENT_HEADER_SIZE, MIN_ENVELOPE_SIZE, PACKET_TYPE_AUDIO, PACKET_TYPE_COMMAND,
    PACKET_TYPE_CONTROL, PACKET_TYPE_DOWNLOAD_PROGRESS, PACKET_TYPE_IMU, PACKET_TYPE_KEEPALIVE,
    PACKET_TYPE_LIDAR, PACKET_TYPE_MAP_ACK, PACKET_TYPE_NOTIFICATION, PACKET_TYPE_RTT_ECHO,
    PACKET_TYPE_RTT_PROBE, PACKET_TYPE_TELEMETRY, PACKET_TYPE_UPLOAD_PROGRESS, PACKET_TYPE_VIDEO,
    TRAIN_ID_SIZE,
};
use crate::core::PacketError;

/// Packet type tag.
///
/// Integer values are fixed by the train-side firmware; see
/// [`crate::core::constants`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Fragmented video payload.
    Video = PACKET_TYPE_VIDEO,
    /// Fragmented audio payload.
    Audio = PACKET_TYPE_AUDIO,
    /// Control channel message.
    Control = PACKET_TYPE_CONTROL,
    /// Operator command.
    Command = PACKET_TYPE_COMMAND,
    /// Telemetry report.
    Telemetry = PACKET_TYPE_TELEMETRY,
    /// Inertial measurement report.
    Imu = PACKET_TYPE_IMU,
    /// LiDAR scan report.
    Lidar = PACKET_TYPE_LIDAR,
    /// Keepalive no-op.
    Keepalive = PACKET_TYPE_KEEPALIVE,
    /// Server-side notification.
    Notification = PACKET_TYPE_NOTIFICATION,
    /// Download progress marker.
    DownloadProgress = PACKET_TYPE_DOWNLOAD_PROGRESS,
    /// Upload progress marker.
    UploadProgress = PACKET_TYPE_UPLOAD_PROGRESS,
    /// Round-trip-time probe (controller to train).
    RttProbe = PACKET_TYPE_RTT_PROBE,
    /// Round-trip-time echo (train to controller).
    RttEcho = PACKET_TYPE_RTT_ECHO,
    /// Train-assignment acknowledgement.
    MapAck = PACKET_TYPE_MAP_ACK,
}

impl PacketType {
    /// Parse a packet type from its tag byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            PACKET_TYPE_VIDEO => Some(Self::Video),
            PACKET_TYPE_AUDIO => Some(Self::Audio),
            PACKET_TYPE_CONTROL => Some(Self::Control),
            PACKET_TYPE_COMMAND => Some(Self::Command),
            PACKET_TYPE_TELEMETRY => Some(Self::Telemetry),
            PACKET_TYPE_IMU => Some(Self::Imu),
            PACKET_TYPE_LIDAR => Some(Self::Lidar),
            PACKET_TYPE_KEEPALIVE => Some(Self::Keepalive),
            PACKET_TYPE_NOTIFICATION => Some(Self::Notification),
            PACKET_TYPE_DOWNLOAD_PROGRESS => Some(Self::DownloadProgress),
            PACKET_TYPE_UPLOAD_PROGRESS => Some(Self::UploadProgress),
            PACKET_TYPE_RTT_PROBE => Some(Self::RttProbe),
            PACKET_TYPE_RTT_ECHO => Some(Self::RttEcho),
            PACKET_TYPE_MAP_ACK => Some(Self::MapAck),
            _ => None,
        }
    }

    /// Convert the packet type to its tag byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Whether packets of this type carry the fragment header.
    ///
    /// Video and audio are fragmented media; everything else is a JSON
    /// envelope.
    pub fn is_fragmented(self) -> bool {
        matches!(self, Self::Video | Self::Audio)
    }
}

/// Fixed-width NUL-padded train identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrainId([u8; TRAIN_ID_SIZE]);

impl TrainId {
    /// Build a train id from text, truncating to the field width and
    /// padding with NUL bytes.
    pub fn new(id: &str) -> Self {
        let mut buf = [0u8; TRAIN_ID_SIZE];
        let take = id.len().min(TRAIN_ID_SIZE);
        buf[..take].copy_from_slice(&id.as_bytes()[..take]);
        Self(buf)
    }

    /// Build a train id from raw wire bytes.
    pub fn from_bytes(bytes: [u8; TRAIN_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw padded bytes as laid out on the wire.
    pub fn as_bytes(&self) -> &[u8; TRAIN_ID_SIZE] {
        &self.0
    }

    /// Identifier text with trailing padding trimmed.
    ///
    /// Bytes up to the first NUL (or the full field) are interpreted as
    /// UTF-8; invalid sequences are replaced rather than rejected, since
    /// the id is informational.
    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(TRAIN_ID_SIZE);
        String::from_utf8_lossy(&self.0[..end])
    }

    /// An all-NUL train id (no train).
    pub fn empty() -> Self {
        Self([0u8; TRAIN_ID_SIZE])
    }
}

impl std::fmt::Debug for TrainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TrainId({:?})", self.as_str())
    }
}

impl std::fmt::Display for TrainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Header of a fragment-bearing packet (53 bytes on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Packet type (must be a fragmented type).
    pub packet_type: PacketType,
    /// Frame this fragment belongs to.
    pub frame_id: u32,
    /// Total number of fragments in the frame.
    pub fragment_count: u16,
    /// 1-based index of this fragment within the frame.
    pub fragment_index: u16,
    /// Originating train.
    pub train_id: TrainId,
    /// Train-clock timestamp when the frame left the encoder, ms since epoch.
    pub origin_timestamp_ms: u64,
}

impl FragmentHeader {
    /// Serialize the header to wire bytes (big-endian throughout).
    pub fn to_bytes(&self) -> [u8; FRAGMENT_HEADER_SIZE] {
        let mut buf = [0u8; FRAGMENT_HEADER_SIZE];
        buf[0] = self.packet_type.as_byte();
        buf[1..5].copy_from_slice(&self.frame_id.to_be_bytes());
        buf[5..7].copy_from_slice(&self.fragment_count.to_be_bytes());
        buf[7..9].copy_from_slice(&self.fragment_index.to_be_bytes());
        buf[9..45].copy_from_slice(self.train_id.as_bytes());
        buf[45..53].copy_from_slice(&self.origin_timestamp_ms.to_be_bytes());
        buf
    }

    /// Parse a header from wire bytes.
    ///
    /// Rejects buffers shorter than the fragment header without touching
    /// out-of-bounds memory.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < FRAGMENT_HEADER_SIZE {
            return Err(PacketError::TooShort {
                expected: FRAGMENT_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let packet_type =
            PacketType::from_byte(bytes[0]).ok_or(PacketError::UnknownType(bytes[0]))?;

        let frame_id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let fragment_count = u16::from_be_bytes([bytes[5], bytes[6]]);
        let fragment_index = u16::from_be_bytes([bytes[7], bytes[8]]);

        let mut id_bytes = [0u8; TRAIN_ID_SIZE];
        id_bytes.copy_from_slice(&bytes[9..45]);
        let train_id = TrainId::from_bytes(id_bytes);

        let mut ts_bytes = [0u8; 8];
        ts_bytes.copy_from_slice(&bytes[45..53]);
        let origin_timestamp_ms = u64::from_be_bytes(ts_bytes);

        Ok(Self {
            packet_type,
            frame_id,
            fragment_count,
            fragment_index,
            train_id,
            origin_timestamp_ms,
        })
    }
}

/// A decoded inbound packet.
#[derive(Debug, Clone)]
pub enum Packet {
    /// A fragment of a larger media frame.
    Fragment {
        /// Parsed fragment header.
        header: FragmentHeader,
        /// Fragment payload bytes (everything after the header).
        payload: Bytes,
    },
    /// A non-fragmented packet: type tag plus a UTF-8 JSON body.
    Envelope {
        /// Packet type tag.
        tag: PacketType,
        /// Raw JSON body bytes.
        body: Bytes,
    },
}

impl Packet {
    /// The type tag of this packet.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Fragment { header, .. } => header.packet_type,
            Packet::Envelope { tag, .. } => *tag,
        }
    }
}

/// Decode a raw inbound buffer into a [`Packet`].
///
/// Fragmented types must carry at least the full fragment header;
/// envelope types need only the tag byte. Payload/body slices share the
/// input buffer, no copies.
pub fn decode(data: &Bytes) -> Result<Packet, PacketError> {
    if data.len() < MIN_ENVELOPE_SIZE {
        return Err(PacketError::TooShort {
            expected: MIN_ENVELOPE_SIZE,
            actual: data.len(),
        });
    }

    let tag = PacketType::from_byte(data[0]).ok_or(PacketError::UnknownType(data[0]))?;

    if tag.is_fragmented() {
        let header = FragmentHeader::from_bytes(data)?;
        Ok(Packet::Fragment {
            header,
            payload: data.slice(FRAGMENT_HEADER_SIZE..),
        })
    } else {
        Ok(Packet::Envelope {
            tag,
            body: data.slice(1..),
        })
    }
}

/// Encode a fragment-bearing packet.
pub fn encode_fragment(header: &FragmentHeader, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAGMENT_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Encode a non-fragmented packet: tag byte followed by a JSON body.
pub fn encode_envelope(tag: PacketType, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + body.len());
    buf.push(tag.as_byte());
    buf.extend_from_slice(body);
    buf
}
