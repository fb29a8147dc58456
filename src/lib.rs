//! TRACKLINK remote-control protocol core.
//!
//! Protocol engine for driving a model train over unreliable links: a
//! tagged binary wire format, out-of-order frame reassembly, RTT-based
//! clock-offset calibration, and a multi-transport session dispatcher
//! with failover, keepalive, and bounded reconnection.
//!
//! The crate is transport-agnostic at its core. [`packet`], [`assembly`],
//! and [`clock`] are pure state machines driven by explicit timestamps;
//! [`transport`] adapts concrete channels (UDP, TCP, in-process pairs,
//! pub/sub topics) to one async contract; [`session`] ties everything
//! together in a single-task event loop.
//!
//! # Example
//!
//! ```no_run
//! use tracklink_protocol::packet::TrainId;
//! use tracklink_protocol::session::{PacketSink, SessionBuilder};
//! use tracklink_protocol::transport::DatagramTransport;
//!
//! struct Printer;
//!
//! impl PacketSink for Printer {
//!     fn on_frame(&mut self, frame: tracklink_protocol::assembly::CompletedFrame) {
//!         println!("frame {} ({} bytes)", frame.frame_id, frame.bytes.len());
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let (session, handle) = SessionBuilder::new()
//!     .transport(Box::new(DatagramTransport::new("10.0.0.7:4810".parse()?)))
//!     .build(Printer);
//!
//! tokio::spawn(session.run());
//! handle.select_train(TrainId::new("train-alpha")).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod assembly;
pub mod clock;
pub mod core;
pub mod packet;
pub mod session;
pub mod transport;

pub use crate::core::{SessionError, TracklinkError, TransportError};
pub use session::{PacketSink, SessionBuilder, SessionHandle, TrainSession};

/// Convenience re-exports of the types most integrations need.
pub mod prelude {
    pub use crate::assembly::{CompletedFrame, FrameReassembler};
    pub use crate::clock::{Calibration, CalibrationConfig, ClockSync};
    pub use crate::core::{SessionResult, TracklinkError, TransportResult};
    pub use crate::packet::{FragmentHeader, Packet, PacketType, TrainId};
    pub use crate::session::{
        ControllerId, PacketSink, SessionBuilder, SessionConfig, SessionHandle, TrainSession,
    };
    pub use crate::transport::{
        ChannelTransport, DatagramTransport, LinkPhase, PubSubBroker, PubSubTransport,
        ReconnectPolicy, StreamTransport, Transport, TransportEvent, TransportKind,
    };
}
