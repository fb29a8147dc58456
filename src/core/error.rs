//! Error types for the TRACKLINK protocol core.

use thiserror::Error;

/// Errors raised while parsing or building wire packets.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer is shorter than the minimum size for its packet type.
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Type tag does not match any known packet type.
    #[error("unknown packet type tag: {0}")]
    UnknownType(u8),

    /// Train identifier is not valid UTF-8 after trimming padding.
    #[error("train id is not valid UTF-8")]
    InvalidTrainId,
}

/// Errors raised by the frame reassembler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    /// Wire-level parse failure.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Declared fragment count is zero or implausibly large.
    #[error("implausible fragment count {count} for frame {frame_id}")]
    ImplausibleCount {
        /// Frame the header claimed to belong to.
        frame_id: u32,
        /// Declared total fragment count.
        count: u16,
    },

    /// Fragment index is zero or exceeds the declared count.
    #[error("fragment index {index} out of range 1..={count} for frame {frame_id}")]
    IndexOutOfRange {
        /// Frame the header claimed to belong to.
        frame_id: u32,
        /// 1-based fragment index from the header.
        index: u16,
        /// Declared total fragment count.
        count: u16,
    },

    /// Fragment count in a later fragment disagrees with the first one seen.
    #[error("fragment count mismatch for frame {frame_id}: assembly expects {expected}, header says {actual}")]
    CountMismatch {
        /// Frame the header claimed to belong to.
        frame_id: u32,
        /// Count recorded when the assembly was created.
        expected: u16,
        /// Count in the offending header.
        actual: u16,
    },
}

/// Errors raised by transport adapters.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying socket or channel I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Connect attempt did not complete within the adapter timeout.
    #[error("connect timed out")]
    ConnectTimeout,

    /// Operation requires a connected adapter.
    #[error("transport is not connected")]
    NotConnected,

    /// The peer or broker closed the channel.
    #[error("channel closed by peer")]
    ChannelClosed,
}

/// Errors surfaced by the session dispatcher.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Outbound send attempted with every configured adapter disconnected.
    #[error("no connected transport available for send")]
    NoConnectedTransport,

    /// A link exhausted its reconnect budget.
    #[error("transport '{0}' exhausted its reconnect budget")]
    LinkExhausted(&'static str),

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Failed to serialize an outbound JSON body.
    #[error("json encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// The session event loop has shut down.
    #[error("session closed")]
    Closed,
}

/// Top-level TRACKLINK errors.
#[derive(Debug, Error)]
pub enum TracklinkError {
    /// Wire protocol error.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Reassembly error.
    #[error("assembly error: {0}")]
    Assembly(#[from] AssemblyError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Session error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_error_display() {
        let err = PacketError::TooShort {
            expected: 53,
            actual: 12,
        };
        assert_eq!(
            err.to_string(),
            "packet too short: expected at least 53 bytes, got 12"
        );
    }

    #[test]
    fn test_error_conversion_chain() {
        let packet = PacketError::UnknownType(0xFF);
        let assembly: AssemblyError = packet.into();
        let top: TracklinkError = assembly.into();
        assert!(matches!(top, TracklinkError::Assembly(_)));
    }
}
