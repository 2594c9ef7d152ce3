//! Receiver configuration.
//!
//! Loaded by `crates/cli` from a TOML file via `serde`; library consumers
//! that embed `raop-core` directly can just build a [`RaopConfig`] in
//! code. Defaults mirror the design's stated defaults (port pool, stall
//! threshold, inter-chunk sleep, session admission budget).

use serde::Deserialize;

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_allow_session_interruption() -> bool {
    true
}

fn default_unfixable_command() -> Option<String> {
    None
}

fn default_get_coverart() -> bool {
    true
}

/// Idle seconds before the watchdog barks and forces a connection closed.
fn default_idle_timeout_secs() -> u64 {
    30
}

/// Matches [`crate::protocol::INTER_CHUNK_SLEEP`].
fn default_inter_chunk_sleep_millis() -> u64 {
    80
}

/// Matches [`crate::protocol::STALL_THRESHOLD`].
fn default_stall_threshold_secs() -> u64 {
    15
}

/// Top-level configuration for a [`crate::server::RaopServer`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RaopConfig {
    /// Address the RTSP listener binds to.
    pub bind_address: String,
    /// TCP port the RTSP listener binds to.
    pub port: u16,
    /// Digest auth password; `None` disables authentication entirely.
    pub password: Option<String>,
    /// Whether a new SETUP may preempt the current session holder.
    pub allow_session_interruption: bool,
    /// Enable the pipe metadata sink and its path.
    pub metadata_pipe_path: Option<String>,
    /// Enable the multicast metadata sink and its target address
    /// (`host:port`).
    pub metadata_multicast_address: Option<String>,
    /// A shell command to run when an unrecoverable worker error occurs,
    /// mirroring the `run_this_before_play`-style escape hatch some
    /// deployments want; `None` disables it.
    pub unfixable_command: Option<String>,
    /// Whether SET_PARAMETER `image/*` (album art) bodies are forwarded to
    /// the metadata sinks at all.
    pub get_coverart: bool,
    /// Idle seconds before the per-connection watchdog barks and forces
    /// the connection closed.
    pub idle_timeout_secs: u64,
    /// Sleep between unproductive body/header reads, in milliseconds. See
    /// [`crate::protocol::ReadTiming`].
    pub inter_chunk_sleep_millis: u64,
    /// Seconds a read may stall before a `ssnc/stal` event fires. See
    /// [`crate::protocol::ReadTiming`].
    pub stall_threshold_secs: u64,
}

impl Default for RaopConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            password: None,
            allow_session_interruption: default_allow_session_interruption(),
            metadata_pipe_path: None,
            metadata_multicast_address: None,
            unfixable_command: default_unfixable_command(),
            get_coverart: default_get_coverart(),
            idle_timeout_secs: default_idle_timeout_secs(),
            inter_chunk_sleep_millis: default_inter_chunk_sleep_millis(),
            stall_threshold_secs: default_stall_threshold_secs(),
        }
    }
}

impl RaopConfig {
    /// Parse a `RaopConfig` from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Build the [`crate::protocol::ReadTiming`] this config describes.
    pub fn read_timing(&self) -> crate::protocol::ReadTiming {
        crate::protocol::ReadTiming {
            inter_chunk_sleep: std::time::Duration::from_millis(self.inter_chunk_sleep_millis),
            stall_threshold: std::time::Duration::from_secs(self.stall_threshold_secs),
        }
    }
}
