//! Transport adapters and per-link connection state.
//!
//! Every physical channel (datagram socket, framed byte stream, peer
//! channel pair, topic pub/sub) is wrapped in an adapter exposing the
//! same contract: connect, send, close, connected flag. Inbound data is
//! normalized into [`TransportEvent`]s on a single mpsc channel owned by
//! the session, which serializes all handling — adapters never touch
//! protocol state themselves.
//!
//! The session observes each adapter's lifecycle through a [`LinkState`]
//! machine with bounded exponential-backoff reconnection.

mod channel;
mod datagram;
mod link;
mod pubsub;
mod stream;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::core::TransportResult;

pub use channel::ChannelTransport;
pub use datagram::DatagramTransport;
pub use link::{LinkPhase, LinkState, ReconnectPolicy};
pub use pubsub::{PubSubBroker, PubSubTransport};
pub use stream::StreamTransport;

/// Channel semantics a transport provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Message-oriented datagram socket (no ordering, no delivery).
    Datagram,
    /// Byte stream with message framing layered on top.
    Stream,
    /// Peer-to-peer data channel pair.
    Channel,
    /// Topic-based publish/subscribe broker.
    PubSub,
}

/// Event emitted by an adapter's reader task.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A complete inbound message, still in wire format.
    Packet {
        /// Name of the adapter that received it.
        transport: &'static str,
        /// Raw tagged packet bytes.
        payload: Bytes,
    },
    /// The adapter's channel closed or failed.
    Closed {
        /// Name of the adapter that went down.
        transport: &'static str,
    },
}

/// Uniform adapter contract over one physical channel.
///
/// `connect` takes the session's event sender; the adapter spawns its own
/// reader task and pushes every inbound message (and a final `Closed`)
/// through it. Adapters apply their own connect timeout.
#[async_trait]
pub trait Transport: Send {
    /// Stable adapter name, used in keepalives and status reporting.
    fn name(&self) -> &'static str;

    /// The channel semantics this adapter provides.
    fn kind(&self) -> TransportKind;

    /// Whether the underlying channel is currently usable.
    fn is_connected(&self) -> bool;

    /// Establish the channel and start the reader task.
    async fn connect(&mut self, events: mpsc::Sender<TransportEvent>) -> TransportResult<()>;

    /// Send one wire packet.
    async fn send(&mut self, data: &[u8]) -> TransportResult<()>;

    /// Tear the channel down and stop the reader task.
    async fn close(&mut self);
}
