//! # raop_core — RTSP control plane for an AirPlay-1 audio receiver
//!
//! A Rust library implementing the RAOP (Remote Audio Output Protocol)
//! control plane: the RTSP request/response handling, SDP/DMAP parsing,
//! digest auth, RSA handshake, and session admission an AirPlay-1 audio
//! receiver needs, with actual audio decoding, RTP packet delivery, and
//! mDNS advertisement left to pluggable collaborators.
//!
//! ## Protocol references
//!
//! | Topic | How this crate uses it |
//! |-------|-------------------------|
//! | RTSP/1.0 | Request/response framing, method dispatch, session lifecycle |
//! | SDP | `ANNOUNCE` body: codec, `fmtp`, encryption parameters |
//! | DMAP | `SET_PARAMETER` tagged binary metadata (`application/x-dmap-tagged`) |
//! | HTTP Digest | `Authorization`/`WWW-Authenticate` handshake (RFC 2617, MD5) |
//! | RSA | AES session key recovery (OAEP) and Apple-Challenge signing (raw PKCS#1 v1.5) |
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  server   — public API, orchestrator      │
//! ├──────────────────────────────────────────┤
//! │  listener — accept loop, worker, watchdog │
//! │  handlers — method dispatch               │
//! ├──────────────────────────────────────────┤
//! │  protocol — RTSP framing                  │
//! │  sdp, dmap, auth, crypto — wire formats   │
//! │  session  — admission slot, connection    │
//! ├──────────────────────────────────────────┤
//! │  metadata — sink fan-out (pipe/mcast/hub) │
//! │  collaborators — player/RTP/discovery     │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use raop_core::{RaopConfig, RaopServer};
//!
//! let server = RaopServer::new(RaopConfig::default()).unwrap();
//! server.start().unwrap();
//! // ... a real deployment would supply PlayerControl/RtpTransport/
//! // ServiceDiscovery implementations via RaopServer::builder.
//! server.stop().unwrap();
//! ```
//!
//! ## Crate layout
//!
//! - [`server`] — High-level [`RaopServer`] orchestrator and its builder.
//! - [`listener`] — TCP accept loop, per-connection worker and watchdog.
//! - [`handlers`] — Per-method RTSP handling and the Apple challenge/response.
//! - [`protocol`] — RTSP request/response framing over a blocking stream.
//! - [`sdp`] — `ANNOUNCE` SDP body parsing.
//! - [`dmap`] — DMAP tagged binary tuple decoding.
//! - [`auth`] — HTTP Digest authentication.
//! - [`crypto`] — RSA/base64 primitives for the AirPlay-1 handshake.
//! - [`message`] — [`RtspMessage`] request/response representation.
//! - [`session`] — Admission slot and per-connection state.
//! - [`metadata`] — Metadata sink fan-out (pipe, multicast, hub, MQTT-style).
//! - [`collaborators`] — `PlayerControl`/`RtpTransport`/`ServiceDiscovery` traits.
//! - [`config`] — [`RaopConfig`] TOML configuration.
//! - [`queue`] — [`queue::BoundedQueue`] bounded producer/consumer queue.
//! - [`error`] — [`RtspError`] enum and [`Result`] alias.

pub mod auth;
pub mod collaborators;
pub mod config;
pub mod crypto;
pub mod dmap;
pub mod error;
pub mod handlers;
pub mod listener;
pub mod message;
pub mod metadata;
pub mod protocol;
pub mod queue;
pub mod sdp;
pub mod server;
pub mod session;

pub use collaborators::{NullDiscovery, NullPlayer, PlayerControl, RtpTransport, ServiceDiscovery};
pub use config::RaopConfig;
pub use crypto::DeviceKey;
pub use error::{Result, RtspError};
pub use message::RtspMessage;
pub use server::{RaopServer, RaopServerBuilder};
pub use session::{ConnectionState, PortPool, RtpPortTriple, SessionAdmission};
