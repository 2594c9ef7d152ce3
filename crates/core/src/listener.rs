//! TCP listener, per-connection worker, and watchdog.
//!
//! One thread runs the accept loop; each accepted connection gets its own
//! worker thread (`Reading -> Handling -> Writing`, looping) and its own
//! watchdog thread that barks when the connection goes quiet and forces a
//! disconnect if it never recovers. All I/O is blocking, bounded by socket
//! timeouts set through `socket2` — `std::net` does not expose `SO_LINGER`
//! or `IPV6_V6ONLY` directly.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use socket2::{Domain, Socket, Type};

use crate::config::RaopConfig;
use crate::error::{Result, RtspError};
use crate::handlers::{self, HandlerContext};
use crate::metadata::{self, MetadataPackage};
use crate::protocol;
use crate::session::admission::SessionAdmission;
use crate::session::connection::ConnectionState;

const ACCEPT_BACKLOG: i32 = 5;
const ACCEPT_POLL: Duration = Duration::from_millis(50);
/// Socket read timeout: bounds how long a blocking read can hold the
/// worker thread before it re-checks `stop`, independent of the stall
/// notification threshold carried in [`protocol::ReadTiming`] (config
/// `stall_threshold_secs`).
const SOCKET_READ_TIMEOUT: Duration = Duration::from_millis(250);
const SOCKET_WRITE_TIMEOUT: Duration = Duration::from_secs(3);

const WATCHDOG_TICK: Duration = Duration::from_secs(2);
/// Sleep before the single retry attempt after a read error or a bad
/// packet (design §4.9: "a bounded retry counter (1 attempt)").
const READ_RETRY_SLEEP: Duration = Duration::from_millis(20);

/// Bind a listening socket the way the accept loop expects: address reuse
/// so a restart does not trip over a lingering `TIME_WAIT` socket, and a
/// small backlog since exactly one session can ever be active anyway.
pub fn bind(bind_address: &str, port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = format!("{bind_address}:{port}")
        .parse()
        .map_err(|_| RtspError::ResourceExhausted(format!("invalid bind address {bind_address}:{port}")))?;

    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    if domain == Domain::IPV6 {
        // One listener serves both v4 and v6 peers.
        socket.set_only_v6(false)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(ACCEPT_BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Collaborators every accepted connection's worker needs. Bundled so
/// `accept_loop`'s signature doesn't grow a parameter per collaborator.
pub struct ListenerDeps {
    pub admission: Arc<SessionAdmission>,
    pub sinks: Vec<Arc<dyn metadata::MetadataSink>>,
    pub player: Arc<dyn crate::collaborators::PlayerControl>,
    pub rtp_transport: Arc<dyn crate::collaborators::RtpTransport>,
    pub device_key: Arc<crate::crypto::DeviceKey>,
    pub config: Arc<RaopConfig>,
}

/// Accept connections until `running` is cleared, spawning one worker and
/// one watchdog thread per connection.
pub fn accept_loop(listener: TcpListener, deps: Arc<ListenerDeps>, running: Arc<AtomicBool>) {
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                let deps = deps.clone();
                thread::spawn(move || serve_connection(stream, peer_addr, deps));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                tracing::warn!(error = %e, "TCP accept error");
            }
        }
    }
    tracing::debug!("accept loop exited");
}

fn configure_stream(stream: &TcpStream) -> Result<()> {
    stream.set_read_timeout(Some(SOCKET_READ_TIMEOUT))?;
    stream.set_write_timeout(Some(SOCKET_WRITE_TIMEOUT))?;
    Ok(())
}

fn set_linger_zero(stream: &TcpStream) {
    let socket = socket2::SockRef::from(stream);
    if let Err(e) = socket.set_linger(Some(Duration::ZERO)) {
        tracing::debug!(error = %e, "failed to set zero linger on terminal error path");
    }
}

fn serve_connection(stream: TcpStream, peer_addr: SocketAddr, deps: Arc<ListenerDeps>) {
    let local_addr = match stream.local_addr() {
        Ok(addr) => addr,
        Err(_) => return,
    };
    if configure_stream(&stream).is_err() {
        return;
    }

    let connection_number = crate::session::admission::next_connection_number();
    let nonce = crate::auth::generate_nonce();
    let connection = ConnectionState::new(connection_number, peer_addr, local_addr, nonce);

    tracing::info!(%peer_addr, connection_number, "client connected");

    let idle_timeout = Duration::from_secs(deps.config.idle_timeout_secs);
    let watchdog_stop = Arc::new(AtomicBool::new(false));
    let watchdog = {
        let connection = connection.clone();
        let watchdog_stop = watchdog_stop.clone();
        let unfixable_command = deps.config.unfixable_command.clone();
        thread::spawn(move || run_watchdog(connection, watchdog_stop, idle_timeout, unfixable_command))
    };

    let reason = run_worker(stream, &connection, &deps);

    watchdog_stop.store(true, Ordering::Release);
    let _ = watchdog.join();

    if connection.owns_player.load(Ordering::Acquire) {
        let _ = deps.player.stop(&connection);
        let _ = deps.rtp_transport.terminate(&connection);
        deps.admission.release(connection.connection_number);
    }

    tracing::info!(%peer_addr, connection_number, reason, "client disconnected");
}

/// Reading -> Handling -> Writing, looped until the connection ends.
/// A write failure is retried once before the connection is torn down
/// with a zero-linger close.
fn run_worker(stream: TcpStream, connection: &Arc<ConnectionState>, deps: &ListenerDeps) -> &'static str {
    let mut reader = match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return "failed to clone socket",
    };
    let mut writer = stream;

    let ctx = HandlerContext {
        admission: deps.admission.as_ref(),
        sinks: &deps.sinks,
        player: deps.player.as_ref(),
        rtp_transport: deps.rtp_transport.as_ref(),
        device_key: deps.device_key.as_ref(),
        config: deps.config.as_ref(),
    };

    let timing = deps.config.read_timing();
    let mut retried = false;
    let mut carry: Vec<u8> = Vec::new();
    loop {
        let sinks = &deps.sinks;
        let request = protocol::read_request(&mut reader, &mut carry, &connection.stop, timing, || {
            let pkg = MetadataPackage::ssnc(metadata::event::STALLED, &[][..]);
            metadata::send_metadata(sinks, &pkg);
        });

        let request = match request {
            Ok(Some(request)) => {
                retried = false;
                request
            }
            Ok(None) => return "connection closed by peer",
            Err(RtspError::ImmediateShutdown) => return "shutdown requested",
            Err(RtspError::ChannelClosed) => return "connection closed by peer",
            Err(e @ (RtspError::Io(_) | RtspError::Parse { .. })) if !retried => {
                retried = true;
                tracing::warn!(peer = %connection.peer_addr, error = %e, "read error, retrying once");
                thread::sleep(READ_RETRY_SLEEP);
                continue;
            }
            Err(e) => {
                tracing::warn!(peer = %connection.peer_addr, error = %e, "read error, giving up");
                set_linger_zero(&writer);
                return "read error";
            }
        };

        connection.mark_activity();
        let response = handlers::dispatch(&request, connection, &ctx);

        if protocol::write_response(&mut writer, &response).is_err() {
            // retry once
            if protocol::write_response(&mut writer, &response).is_err() {
                set_linger_zero(&writer);
                return "write error";
            }
        }

        if connection.stop.load(Ordering::Acquire) {
            return "stop requested";
        }
    }
}

/// Ticks every [`WATCHDOG_TICK`]; once a connection has been idle past
/// `idle_timeout` it barks (a warning log), runs the configured
/// `unfixable_command` if any, and forces the connection closed on that
/// same bark. A zero `idle_timeout` disables the watchdog entirely.
fn run_watchdog(
    connection: Arc<ConnectionState>,
    stop: Arc<AtomicBool>,
    idle_timeout: Duration,
    unfixable_command: Option<String>,
) {
    if idle_timeout.is_zero() {
        return;
    }
    while !stop.load(Ordering::Acquire) {
        thread::sleep(WATCHDOG_TICK);
        let idle = connection.idle_for();
        if idle >= idle_timeout {
            tracing::warn!(peer = %connection.peer_addr, ?idle, "watchdog: connection idle past timeout, forcing close");
            if let Some(command) = &unfixable_command {
                run_unfixable_command(command);
            }
            connection.stop.store(true, Ordering::Release);
            return;
        }
    }
}

fn run_unfixable_command(command: &str) {
    match std::process::Command::new("sh").arg("-c").arg(command).status() {
        Ok(status) if !status.success() => {
            tracing::warn!(command, ?status, "unfixable-connection command exited non-zero");
        }
        Err(e) => tracing::warn!(command, error = %e, "failed to spawn unfixable-connection command"),
        Ok(_) => {}
    }
}
