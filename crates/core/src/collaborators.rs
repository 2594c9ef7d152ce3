//! External-collaborator trait boundaries.
//!
//! Audio decoding/playback, the real RTP audio transport, and mDNS/Bonjour
//! advertisement are explicitly out of scope for this control-plane core;
//! these traits are the seam a real receiver plugs them in at. Each has a
//! `Null*`/`Loopback*` default so the core is fully exercisable — SETUP,
//! RECORD, TEARDOWN and friends all drive real code paths — without any
//! of that external machinery present.

use std::net::UdpSocket;
use std::sync::Mutex;

use crate::error::Result;
use crate::session::admission::{PortPool, RtpPortTriple};
use crate::session::connection::ConnectionState;

/// Controls actual audio playback. Decoding and rendering the RTP stream
/// is a different subsystem's job.
pub trait PlayerControl: Send + Sync {
    fn play(&self, connection: &ConnectionState) -> Result<()>;
    fn flush(&self, rtptime: Option<u32>, connection: &ConnectionState) -> Result<()>;
    fn stop(&self, connection: &ConnectionState) -> Result<()>;
    fn set_volume(&self, volume: f32) -> Result<()>;
    /// Current volume in AirPlay's `-30.0..=0.0` dB scale.
    fn volume(&self) -> Result<f32>;
}

/// No-op player used by default and in tests.
#[derive(Default)]
pub struct NullPlayer;

impl PlayerControl for NullPlayer {
    fn play(&self, connection: &ConnectionState) -> Result<()> {
        tracing::debug!(connection = connection.connection_number, "NullPlayer::play");
        Ok(())
    }

    fn flush(&self, rtptime: Option<u32>, connection: &ConnectionState) -> Result<()> {
        tracing::debug!(connection = connection.connection_number, ?rtptime, "NullPlayer::flush");
        Ok(())
    }

    fn stop(&self, connection: &ConnectionState) -> Result<()> {
        tracing::debug!(connection = connection.connection_number, "NullPlayer::stop");
        Ok(())
    }

    fn set_volume(&self, volume: f32) -> Result<()> {
        tracing::debug!(volume, "NullPlayer::set_volume");
        Ok(())
    }

    fn volume(&self) -> Result<f32> {
        Ok(-15.0)
    }
}

/// Sets up and tears down the RTP audio/control/timing companion ports
/// for a connection. Real audio transport internals are out of scope here —
/// this is purely the handshake-visible side effect (port allocation) SETUP
/// and TEARDOWN need to exercise.
pub trait RtpTransport: Send + Sync {
    fn setup(&self, connection: &ConnectionState) -> Result<RtpPortTriple>;
    fn initialise(&self, connection: &ConnectionState) -> Result<()>;
    fn terminate(&self, connection: &ConnectionState) -> Result<()>;
}

/// Allocates local UDP ports without actually carrying audio, so SETUP and
/// TEARDOWN are fully exercisable in tests without a real decoder.
pub struct LoopbackRtpTransport {
    ports: PortPool,
    sockets: Mutex<Vec<UdpSocket>>,
}

impl LoopbackRtpTransport {
    pub fn new() -> Self {
        Self { ports: PortPool::new(), sockets: Mutex::new(Vec::new()) }
    }
}

impl Default for LoopbackRtpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RtpTransport for LoopbackRtpTransport {
    fn setup(&self, connection: &ConnectionState) -> Result<RtpPortTriple> {
        let triple = self.ports.allocate_triple();
        // Actually bind loopback sockets so the allocated ports are real
        // and held for the connection's lifetime, without wiring them to
        // any audio path.
        let mut sockets = self.sockets.lock().unwrap();
        for port in [triple.audio, triple.control, triple.timing] {
            if let Ok(socket) = UdpSocket::bind(("127.0.0.1", port)) {
                sockets.push(socket);
            }
        }
        tracing::debug!(connection = connection.connection_number, ?triple, "loopback RTP transport set up");
        Ok(triple)
    }

    fn initialise(&self, connection: &ConnectionState) -> Result<()> {
        tracing::debug!(connection = connection.connection_number, "loopback RTP transport initialised");
        Ok(())
    }

    fn terminate(&self, connection: &ConnectionState) -> Result<()> {
        self.sockets.lock().unwrap().clear();
        tracing::debug!(connection = connection.connection_number, "loopback RTP transport terminated");
        Ok(())
    }
}

/// Advertises (and withdraws) the receiver on the local network. mDNS
/// itself is out of scope here.
pub trait ServiceDiscovery: Send + Sync {
    fn register(&self, port: u16) -> Result<()>;
    fn unregister(&self) -> Result<()>;
}

/// No-op discovery used by default and in tests.
#[derive(Default)]
pub struct NullDiscovery;

impl ServiceDiscovery for NullDiscovery {
    fn register(&self, port: u16) -> Result<()> {
        tracing::debug!(port, "NullDiscovery::register");
        Ok(())
    }

    fn unregister(&self) -> Result<()> {
        tracing::debug!("NullDiscovery::unregister");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn conn() -> std::sync::Arc<ConnectionState> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000);
        ConnectionState::new(1, addr, addr, "nonce".into())
    }

    #[test]
    fn null_player_accepts_full_lifecycle() {
        let player = NullPlayer;
        let c = conn();
        player.play(&c).unwrap();
        player.flush(Some(12345), &c).unwrap();
        player.set_volume(-15.0).unwrap();
        player.stop(&c).unwrap();
    }

    #[test]
    fn loopback_transport_allocates_distinct_ports() {
        let transport = LoopbackRtpTransport::new();
        let c = conn();
        let triple = transport.setup(&c).unwrap();
        assert_ne!(triple.audio, triple.control);
        transport.terminate(&c).unwrap();
    }

    #[test]
    fn null_discovery_register_unregister_round_trip() {
        let discovery = NullDiscovery;
        discovery.register(5000).unwrap();
        discovery.unregister().unwrap();
    }
}
