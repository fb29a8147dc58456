//! Core constants, error types, and clock helpers (always included).

pub mod constants;
mod error;
mod time;

pub use error::{
    AssemblyError, PacketError, SessionError, SessionResult, TracklinkError, TransportError,
    TransportResult,
};
pub use time::{unix_time_ms, unix_time_secs_f64};
