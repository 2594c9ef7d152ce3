//! Per-connection state.
//!
//! Mutable fields that are not read on a hot path (codec parameters, DACP
//! identity, allocated ports, last-activity timestamp) live behind one
//! `parking_lot::Mutex`-guarded block. Flags checked on every
//! request/watchdog tick are individual `AtomicBool`s so reading them never
//! contends with the mutex.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::sdp::StreamDescription;
use crate::session::admission::RtpPortTriple;

struct Mutable {
    stream: Option<StreamDescription>,
    ports: Option<RtpPortTriple>,
    client_control_port: Option<u16>,
    client_timing_port: Option<u16>,
    dacp_active_remote: Option<String>,
    dacp_device_id: Option<String>,
    aes_key: Option<Vec<u8>>,
    client_name: Option<String>,
    user_agent: Option<String>,
    airplay_version: Option<u32>,
}

/// Per-connection state shared between the worker thread handling requests
/// and its watchdog thread.
pub struct ConnectionState {
    pub connection_number: u64,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub nonce: String,

    /// Set once a valid `Authorization` response has been seen; sticky for
    /// the remainder of the connection.
    pub authorized: AtomicBool,
    /// Set when this connection holds the session admission slot.
    pub owns_player: AtomicBool,
    /// Set once RECORD has started RTP delivery.
    pub rtp_running: AtomicBool,
    /// Set by the worker or watchdog to request the read loop unwind at
    /// its next suspension point.
    pub stop: AtomicBool,
    /// Set by [`crate::session::admission::SessionAdmission`] while this
    /// connection is being preempted by a newer ANNOUNCE, so its own
    /// unwind can be told apart from an ordinary error.
    pub interrupting: AtomicBool,

    /// Unix-epoch milliseconds of the last successfully framed request,
    /// used by the watchdog to decide when to bark.
    last_activity_millis: AtomicI64,

    mutable: Mutex<Mutable>,
}

impl ConnectionState {
    pub fn new(connection_number: u64, peer_addr: SocketAddr, local_addr: SocketAddr, nonce: String) -> Arc<Self> {
        Arc::new(Self {
            connection_number,
            peer_addr,
            local_addr,
            nonce,
            authorized: AtomicBool::new(false),
            owns_player: AtomicBool::new(false),
            rtp_running: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            interrupting: AtomicBool::new(false),
            last_activity_millis: AtomicI64::new(now_millis()),
            mutable: Mutex::new(Mutable {
                stream: None,
                ports: None,
                client_control_port: None,
                client_timing_port: None,
                dacp_active_remote: None,
                dacp_device_id: None,
                aes_key: None,
                client_name: None,
                user_agent: None,
                airplay_version: None,
            }),
        })
    }

    pub fn mark_activity(&self) {
        self.last_activity_millis.store(now_millis(), Ordering::Release);
    }

    /// How long since the last successfully framed request.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_millis.load(Ordering::Acquire);
        let elapsed_millis = (now_millis() - last).max(0);
        Duration::from_millis(elapsed_millis as u64)
    }

    pub fn set_stream_description(&self, stream: StreamDescription) {
        self.mutable.lock().stream = Some(stream);
    }

    pub fn stream_description(&self) -> Option<StreamDescription> {
        self.mutable.lock().stream.clone()
    }

    pub fn set_ports(&self, ports: RtpPortTriple) {
        self.mutable.lock().ports = Some(ports);
    }

    pub fn ports(&self) -> Option<RtpPortTriple> {
        self.mutable.lock().ports
    }

    pub fn set_client_transport_ports(&self, control: u16, timing: u16) {
        let mut guard = self.mutable.lock();
        guard.client_control_port = Some(control);
        guard.client_timing_port = Some(timing);
    }

    pub fn client_transport_ports(&self) -> Option<(u16, u16)> {
        let guard = self.mutable.lock();
        Some((guard.client_control_port?, guard.client_timing_port?))
    }

    pub fn set_dacp_identity(&self, active_remote: Option<String>, device_id: Option<String>) {
        let mut guard = self.mutable.lock();
        if active_remote.is_some() {
            guard.dacp_active_remote = active_remote;
        }
        if device_id.is_some() {
            guard.dacp_device_id = device_id;
        }
    }

    pub fn dacp_active_remote(&self) -> Option<String> {
        self.mutable.lock().dacp_active_remote.clone()
    }

    pub fn dacp_device_id(&self) -> Option<String> {
        self.mutable.lock().dacp_device_id.clone()
    }

    pub fn set_aes_key(&self, key: Vec<u8>) {
        self.mutable.lock().aes_key = Some(key);
    }

    pub fn aes_key(&self) -> Option<Vec<u8>> {
        self.mutable.lock().aes_key.clone()
    }

    /// Record the sender's `X-Apple-Client-Name`.
    pub fn set_client_name(&self, name: String) {
        self.mutable.lock().client_name = Some(name);
    }

    pub fn client_name(&self) -> Option<String> {
        self.mutable.lock().client_name.clone()
    }

    /// Record the sender's `User-Agent` and the `AirPlay/<n>` version
    /// parsed out of it, if present.
    pub fn set_user_agent(&self, user_agent: String, airplay_version: Option<u32>) {
        let mut guard = self.mutable.lock();
        guard.user_agent = Some(user_agent);
        if airplay_version.is_some() {
            guard.airplay_version = airplay_version;
        }
    }

    pub fn user_agent(&self) -> Option<String> {
        self.mutable.lock().user_agent.clone()
    }

    pub fn airplay_version(&self) -> Option<u32> {
        self.mutable.lock().airplay_version
    }
}

fn now_millis() -> i64 {
    // Connection-relative clock: measured from an arbitrary fixed epoch
    // via `Instant`, not wall-clock time, since this core has no reason to
    // depend on `SystemTime` for a liveness timer.
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    start.elapsed().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000)
    }

    #[test]
    fn fresh_connection_has_near_zero_idle_time() {
        let conn = ConnectionState::new(1, addr(), addr(), "nonce".into());
        assert!(conn.idle_for() < Duration::from_secs(1));
    }

    #[test]
    fn mark_activity_resets_idle_timer() {
        let conn = ConnectionState::new(1, addr(), addr(), "nonce".into());
        std::thread::sleep(Duration::from_millis(30));
        conn.mark_activity();
        assert!(conn.idle_for() < Duration::from_millis(30));
    }

    #[test]
    fn ports_round_trip() {
        let conn = ConnectionState::new(1, addr(), addr(), "nonce".into());
        assert!(conn.ports().is_none());
        let triple = RtpPortTriple { audio: 6000, control: 6001, timing: 6002 };
        conn.set_ports(triple);
        assert_eq!(conn.ports().unwrap().audio, 6000);
    }

    #[test]
    fn dacp_identity_partial_updates_keep_existing_fields() {
        let conn = ConnectionState::new(1, addr(), addr(), "nonce".into());
        conn.set_dacp_identity(Some("AAAA".into()), Some("BBBB".into()));
        conn.set_dacp_identity(Some("CCCC".into()), None);
        assert_eq!(conn.dacp_active_remote().as_deref(), Some("CCCC"));
        assert_eq!(conn.dacp_device_id().as_deref(), Some("BBBB"));
    }
}
