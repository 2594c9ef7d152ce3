//! Top-level server orchestrator, wiring configuration and collaborators
//! to the [`listener`] accept loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crate::collaborators::{NullDiscovery, NullPlayer, PlayerControl, RtpTransport, ServiceDiscovery};
use crate::collaborators::LoopbackRtpTransport;
use crate::config::RaopConfig;
use crate::crypto::DeviceKey;
use crate::error::{Result, RtspError};
use crate::listener::{self, ListenerDeps};
use crate::metadata::MetadataSink;
use crate::metadata::hub::HubSink;
use crate::metadata::multicast::MulticastSink;
use crate::metadata::pipe::PipeSink;
use crate::session::admission::SessionAdmission;

/// Builds a [`RaopServer`], letting a caller override the default
/// (no-op) collaborators before starting it.
pub struct RaopServerBuilder {
    config: RaopConfig,
    player: Arc<dyn PlayerControl>,
    rtp_transport: Arc<dyn RtpTransport>,
    discovery: Arc<dyn ServiceDiscovery>,
    extra_sinks: Vec<Arc<dyn MetadataSink>>,
}

impl RaopServerBuilder {
    pub fn new(config: RaopConfig) -> Self {
        Self {
            config,
            player: Arc::new(NullPlayer),
            rtp_transport: Arc::new(LoopbackRtpTransport::new()),
            discovery: Arc::new(NullDiscovery),
            extra_sinks: Vec::new(),
        }
    }

    #[must_use]
    pub fn player(mut self, player: Arc<dyn PlayerControl>) -> Self {
        self.player = player;
        self
    }

    #[must_use]
    pub fn rtp_transport(mut self, rtp_transport: Arc<dyn RtpTransport>) -> Self {
        self.rtp_transport = rtp_transport;
        self
    }

    #[must_use]
    pub fn discovery(mut self, discovery: Arc<dyn ServiceDiscovery>) -> Self {
        self.discovery = discovery;
        self
    }

    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn MetadataSink>) -> Self {
        self.extra_sinks.push(sink);
        self
    }

    pub fn build(self) -> Result<RaopServer> {
        let hub = Arc::new(HubSink::new());
        let mut sinks: Vec<Arc<dyn MetadataSink>> = self.extra_sinks;
        sinks.push(hub.clone());
        if let Some(path) = self.config.metadata_pipe_path.clone() {
            sinks.push(Arc::new(PipeSink::new(path)?) as Arc<dyn MetadataSink>);
        }
        if let Some(address) = self.config.metadata_multicast_address.clone() {
            let target: std::net::SocketAddr = address
                .parse()
                .map_err(|_| RtspError::ResourceExhausted(format!("invalid multicast address {address}")))?;
            sinks.push(Arc::new(MulticastSink::new(target)?) as Arc<dyn MetadataSink>);
        }

        Ok(RaopServer {
            config: Arc::new(self.config),
            running: Arc::new(AtomicBool::new(false)),
            admission: Arc::new(SessionAdmission::new()),
            sinks,
            hub,
            player: self.player,
            rtp_transport: self.rtp_transport,
            discovery: self.discovery,
            device_key: Arc::new(DeviceKey::load()?),
        })
    }
}

/// The running receiver: owns the admission slot, metadata sinks, and the
/// collaborator handles, and drives the accept loop on a background
/// thread once [`RaopServer::start`] is called.
pub struct RaopServer {
    config: Arc<RaopConfig>,
    running: Arc<AtomicBool>,
    admission: Arc<SessionAdmission>,
    sinks: Vec<Arc<dyn MetadataSink>>,
    hub: Arc<HubSink>,
    player: Arc<dyn PlayerControl>,
    rtp_transport: Arc<dyn RtpTransport>,
    discovery: Arc<dyn ServiceDiscovery>,
    device_key: Arc<DeviceKey>,
}

impl RaopServer {
    pub fn new(config: RaopConfig) -> Result<Self> {
        RaopServerBuilder::new(config).build()
    }

    pub fn builder(config: RaopConfig) -> RaopServerBuilder {
        RaopServerBuilder::new(config)
    }

    /// Bind the listening socket and spawn the accept loop thread.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RtspError::AlreadyRunning);
        }

        let tcp_listener = listener::bind(&self.config.bind_address, self.config.port)?;
        self.discovery.register(self.config.port)?;

        tracing::info!(bind = %self.config.bind_address, port = self.config.port, "RAOP RTSP listener started");

        let deps = Arc::new(ListenerDeps {
            admission: self.admission.clone(),
            sinks: self.sinks.clone(),
            player: self.player.clone(),
            rtp_transport: self.rtp_transport.clone(),
            device_key: self.device_key.clone(),
            config: self.config.clone(),
        });
        let running = self.running.clone();

        thread::spawn(move || listener::accept_loop(tcp_listener, deps, running));

        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(RtspError::NotStarted);
        }
        let _ = self.discovery.unregister();
        tracing::info!("RAOP RTSP listener stopping");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &RaopConfig {
        &self.config
    }

    /// Attach a hub subscriber, for an in-process consumer (tests, the
    /// CLI's own stdout logger) to receive every metadata event.
    pub fn subscribe_metadata(&self) -> Arc<crate::queue::BoundedQueue<crate::metadata::MetadataPackage>> {
        self.hub.subscribe()
    }
}
