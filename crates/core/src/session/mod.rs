//! Session admission and per-connection state.
//!
//! AirPlay-1 has exactly one active playback session at a time: [`admission`]
//! is a single contested slot rather than a map of concurrent sessions, and
//! [`connection`] is per-TCP-connection state that exists whether or not the
//! connection currently owns the player.

pub mod admission;
pub mod connection;

pub use admission::{PortPool, RtpPortTriple, SessionAdmission};
pub use connection::ConnectionState;
