//! Method handlers and the Apple challenge/response
//! handshake.
//!
//! `dispatch` is the single entry point the per-connection worker calls
//! for every framed request: it runs the auth gate, then
//! routes to the per-method handler, and always returns a fully built
//! [`RtspMessage`] response — handler errors are turned into the matching
//! status code rather than propagated, since a malformed or unauthorized
//! request must not tear down the connection.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::auth::{self, AuthOutcome};
use crate::collaborators::{PlayerControl, RtpTransport};
use crate::config::RaopConfig;
use crate::crypto::{self, DeviceKey};
use crate::dmap;
use crate::error::{Result, RtspError};
use crate::message::RtspMessage;
use crate::metadata::{self, MetadataPackage, MetadataSink};
use crate::sdp::{self, CodecType};
use crate::session::admission::SessionAdmission;
use crate::session::connection::ConnectionState;

/// Placeholder MAC address used in the Apple-Response buffer, standing in
/// for a real network interface identity the same way [`DeviceKey`]'s
/// embedded key stands in for Apple's.
const DEVICE_MAC: [u8; 6] = [0x00, 0x51, 0x52, 0x53, 0x54, 0x55];

/// Everything a handler needs beyond the request and the connection.
pub struct HandlerContext<'a> {
    pub admission: &'a SessionAdmission,
    pub sinks: &'a [Arc<dyn MetadataSink>],
    pub player: &'a dyn PlayerControl,
    pub rtp_transport: &'a dyn RtpTransport,
    pub device_key: &'a DeviceKey,
    pub config: &'a RaopConfig,
}

/// Handle one request end to end, producing the response to write back.
///
/// Every response, regardless of which handler built it, gets the
/// `Server` header and — per design §4.8 — an `Apple-Response` whenever
/// the request carried an `Apple-Challenge` and the handler didn't
/// already answer one itself.
pub fn dispatch(request: &RtspMessage, connection: &Arc<ConnectionState>, ctx: &HandlerContext) -> RtspMessage {
    let response = dispatch_inner(request, connection, ctx);
    finalize_response(response, request, connection, ctx.device_key)
}

fn dispatch_inner(request: &RtspMessage, connection: &Arc<ConnectionState>, ctx: &HandlerContext) -> RtspMessage {
    match auth::check(
        ctx.config.password.as_deref(),
        connection.authorized.load(Ordering::Acquire),
        &connection.nonce,
        request,
    ) {
        AuthOutcome::NotRequired | AuthOutcome::AlreadyAuthorized => {}
        AuthOutcome::Granted => connection.authorized.store(true, Ordering::Release),
        AuthOutcome::Challenge => {
            tracing::debug!(method = ?request.method(), error = %RtspError::AuthRequired, "unauthenticated request");
            return unauthorized_response(request, &connection.nonce);
        }
        AuthOutcome::Denied => {
            tracing::warn!(method = ?request.method(), error = %RtspError::AuthFailed, "digest response did not match");
            return unauthorized_response(request, &connection.nonce);
        }
    }

    let method = request.method().unwrap_or("");
    let outcome = match method {
        "OPTIONS" => handle_options(request, connection, ctx),
        "ANNOUNCE" => handle_announce(request, connection, ctx),
        "SETUP" => handle_setup(request, connection, ctx),
        "RECORD" => handle_record(request, connection, ctx),
        "FLUSH" => handle_flush(request, connection, ctx),
        "TEARDOWN" => handle_teardown(request, connection, ctx),
        "PAUSE" => handle_pause(request, connection),
        "GET_PARAMETER" => handle_get_parameter(request, connection, ctx),
        "SET_PARAMETER" => handle_set_parameter(request, connection, ctx),
        other => {
            tracing::warn!(method = other, "unsupported RTSP method");
            Err(RtspError::ResourceExhausted(format!("unsupported method {other}")))
        }
    };

    match outcome {
        Ok(response) => response,
        Err(err) => error_response(request, &err),
    }
}

/// Server header on every response (design §6); Apple-Response is added
/// here rather than in each handler so a request that reaches any
/// method (or fails auth, or errors out) still gets one if it carried a
/// challenge.
fn finalize_response(
    response: RtspMessage,
    request: &RtspMessage,
    connection: &ConnectionState,
    device_key: &DeviceKey,
) -> RtspMessage {
    let mut builder = RtspMessage::new_response(
        response.respcode().unwrap_or(200),
        response.status_text().unwrap_or("OK").to_string(),
    );
    for (name, value) in response.headers() {
        builder = builder.header(name.clone(), value.clone());
    }
    builder = builder.header("Server", "AirTunes/105.1");

    if response.header("Apple-Response").is_none() {
        if let Some(challenge) = request.header("Apple-Challenge") {
            match apple_response(challenge, connection, device_key) {
                Ok(value) => builder = builder.header("Apple-Response", value),
                Err(err) => tracing::debug!(error = %err, "failed to compute Apple-Response"),
            }
        }
    }

    builder.content(response.content().to_vec()).build()
}

fn ok_response(request: &RtspMessage) -> RtspMessage {
    let mut builder = RtspMessage::new_response(200, "OK");
    if let Some(cseq) = request.cseq() {
        builder = builder.header("CSeq", cseq);
    }
    builder.build()
}

fn unauthorized_response(request: &RtspMessage, nonce: &str) -> RtspMessage {
    let mut builder = RtspMessage::new_response(401, "Unauthorized")
        .header("WWW-Authenticate", auth::challenge_header(nonce));
    if let Some(cseq) = request.cseq() {
        builder = builder.header("CSeq", cseq);
    }
    builder.build()
}

fn error_response(request: &RtspMessage, err: &RtspError) -> RtspMessage {
    let code = match err {
        RtspError::NoPlayer => 451,
        RtspError::SessionBusy => 453,
        RtspError::UnknownCodec => 456,
        RtspError::Parse { .. } => 400,
        _ => 500,
    };
    tracing::warn!(method = ?request.method(), code, error = %err, "request failed");
    let mut builder = RtspMessage::new_response(code, "Error");
    if let Some(cseq) = request.cseq() {
        builder = builder.header("CSeq", cseq);
    }
    builder.build()
}

fn handle_options(request: &RtspMessage, _connection: &Arc<ConnectionState>, _ctx: &HandlerContext) -> Result<RtspMessage> {
    let mut builder = RtspMessage::new_response(200, "OK").header(
        "Public",
        "ANNOUNCE, SETUP, RECORD, PAUSE, FLUSH, TEARDOWN, OPTIONS, GET_PARAMETER, SET_PARAMETER",
    );
    if let Some(cseq) = request.cseq() {
        builder = builder.header("CSeq", cseq);
    }
    Ok(builder.build())
}

/// Minimum buffer length fed to the RSA_MODE_AUTH signature (design §4.8
/// step 3); shorter buffers are zero-padded up to this length.
const APPLE_RESPONSE_MIN_BUFFER: usize = 32;
/// An Apple-Challenge longer than this (base64-decoded) is rejected —
/// real senders always send 16 raw bytes; a longer value is treated as
/// malformed rather than fed to RSA (design §8 scenario 4).
const APPLE_CHALLENGE_MAX_BYTES: usize = 16;

/// Build the Apple-Response header value for an Apple-Challenge (design
/// §4.8): RSA_MODE_AUTH-sign `challenge || server_ip || mac`, zero-padded
/// to at least 32 bytes, then base64 without padding.
fn apple_response(challenge_b64: &str, connection: &ConnectionState, device_key: &DeviceKey) -> Result<String> {
    let challenge = crypto::base64_decode(challenge_b64)?;
    if challenge.len() > APPLE_CHALLENGE_MAX_BYTES {
        return Err(RtspError::Crypto(format!(
            "Apple-Challenge too long: {} bytes",
            challenge.len()
        )));
    }
    let mut buffer = challenge;
    match connection.local_addr.ip() {
        std::net::IpAddr::V4(v4) => buffer.extend_from_slice(&v4.octets()),
        std::net::IpAddr::V6(v6) => buffer.extend_from_slice(&v6.octets()),
    }
    buffer.extend_from_slice(&DEVICE_MAC);
    if buffer.len() < APPLE_RESPONSE_MIN_BUFFER {
        buffer.resize(APPLE_RESPONSE_MIN_BUFFER, 0);
    }
    let signature = device_key.sign_challenge(&buffer)?;
    Ok(crypto::base64_encode_unpadded(&signature))
}

/// ANNOUNCE is where a connection becomes the session holder (design
/// §4.6): acquire (or preempt for) the single admission slot first, then
/// parse the SDP body, releasing the slot again if anything after that
/// point fails so a rejected ANNOUNCE never leaves the slot stuck on a
/// connection that isn't actually playing.
fn handle_announce(request: &RtspMessage, connection: &Arc<ConnectionState>, ctx: &HandlerContext) -> Result<RtspMessage> {
    acquire_slot_for_announce(connection, ctx)?;

    if let Err(err) = parse_and_store_announce(request, connection, ctx) {
        ctx.admission.release(connection.connection_number);
        connection.owns_player.store(false, Ordering::Release);
        return Err(err);
    }

    connection.owns_player.store(true, Ordering::Release);
    connection.interrupting.store(false, Ordering::Release);
    capture_client_identity(request, connection, ctx);

    Ok(ok_response(request))
}

fn parse_and_store_announce(request: &RtspMessage, connection: &Arc<ConnectionState>, ctx: &HandlerContext) -> Result<()> {
    let body = std::str::from_utf8(request.content())
        .map_err(|_| RtspError::Parse { kind: crate::error::ParseErrorKind::InvalidSdp })?;
    let description = sdp::parse_announce(body)?;

    if description.codec == CodecType::Unknown {
        return Err(RtspError::UnknownCodec);
    }

    if description.encrypted {
        if let Some(ciphertext) = &description.aes_key_ciphertext {
            let aes_key = ctx.device_key.decrypt_aes_key(ciphertext)?;
            connection.set_aes_key(aes_key);
        }
    }

    connection.set_stream_description(description);
    Ok(())
}

/// Step through the acquisition policy: reuse an existing hold, take a free
/// slot outright, or poll for up to
/// [`crate::session::admission::PREEMPT_BUDGET`] before giving up with `453
/// SessionBusy`. A holder already unwinding on its own (`stop`-flagged, e.g.
/// mid-TEARDOWN) is always waited out; actively marking it `interrupting`
/// and signalling it to stop only happens when `allow_session_interruption`
/// is configured.
fn acquire_slot_for_announce(connection: &Arc<ConnectionState>, ctx: &HandlerContext) -> Result<()> {
    if ctx.admission.is_holder(connection.connection_number) {
        return Ok(());
    }
    let deadline = Instant::now() + crate::session::admission::PREEMPT_BUDGET;
    if ctx.config.allow_session_interruption {
        ctx.admission.acquire_with_preempt(connection, deadline)
    } else {
        ctx.admission.acquire_waiting_for_departing_holder(connection, deadline)
    }
}

/// Capture the sender's identity headers and emit the matching `ssnc`
/// events.
fn capture_client_identity(request: &RtspMessage, connection: &Arc<ConnectionState>, ctx: &HandlerContext) {
    if let Some(client_name) = request.header("X-Apple-Client-Name") {
        connection.set_client_name(client_name.to_string());
        let pkg = MetadataPackage::ssnc(metadata::event::SENDER_NAME, client_name.as_bytes())
            .with_carrier(request.retain());
        metadata::send_metadata(ctx.sinks, &pkg);
    }
    if let Some(user_agent) = request.header("User-Agent") {
        let airplay_version = user_agent.strip_prefix("AirPlay/").and_then(|v| v.parse::<u32>().ok());
        connection.set_user_agent(user_agent.to_string(), airplay_version);
        let pkg = MetadataPackage::ssnc(metadata::event::SENDER_AGENT, user_agent.as_bytes())
            .with_carrier(request.retain());
        metadata::send_metadata(ctx.sinks, &pkg);
    }
}

/// SETUP requires an already-admitted connection (ANNOUNCE acquires the
/// slot); it allocates the RTP transport once and, on a repeated SETUP for
/// the same connection, reuses the existing ports rather than
/// renegotiating. A repeated SETUP whose
/// client ports differ from the first is logged and otherwise ignored —
/// loud while streaming, quiet otherwise — since the transport is already
/// committed.
fn handle_setup(request: &RtspMessage, connection: &Arc<ConnectionState>, ctx: &HandlerContext) -> Result<RtspMessage> {
    require_ownership(connection)?;

    let requested_ports = request.header("Transport").map(parse_transport_fields).and_then(|fields| {
        let control = fields.get("control_port").and_then(|v| v.parse().ok())?;
        let timing = fields.get("timing_port").and_then(|v| v.parse().ok())?;
        Some((control, timing))
    });

    let triple = match connection.ports() {
        Some(existing) => {
            if let Some((control, timing)) = requested_ports {
                if connection.client_transport_ports() != Some((control, timing)) {
                    tracing::warn!(
                        connection = connection.connection_number,
                        streaming = connection.rtp_running.load(Ordering::Acquire),
                        "repeated SETUP requested different transport ports, keeping original"
                    );
                } else {
                    tracing::debug!(connection = connection.connection_number, "repeated SETUP with identical ports");
                }
            }
            existing
        }
        None => {
            if let Some((control, timing)) = requested_ports {
                connection.set_client_transport_ports(control, timing);
            }
            let triple = ctx.rtp_transport.setup(connection)?;
            connection.set_ports(triple);
            triple
        }
    };

    capture_active_remote_identity(request, connection, ctx);

    let transport_value = format!(
        "RTP/AVP/UDP;unicast;interleaved=0-1;mode=record;control_port={};timing_port={};server_port={}",
        triple.control, triple.timing, triple.audio
    );

    Ok(RtspMessage::new_response(200, "OK")
        .maybe_header("CSeq", request.cseq())
        .header("Session", "1")
        .header("Transport", transport_value)
        .build())
}

/// Capture `Active-Remote`/`DACP-ID` at SETUP and emit the matching `ssnc`
/// events.
fn capture_active_remote_identity(request: &RtspMessage, connection: &Arc<ConnectionState>, ctx: &HandlerContext) {
    if let Some(active_remote) = request.header("Active-Remote") {
        connection.set_dacp_identity(Some(active_remote.to_string()), None);
        let pkg = MetadataPackage::ssnc(metadata::event::ACTIVE_REMOTE, active_remote.as_bytes())
            .with_carrier(request.retain());
        metadata::send_metadata(ctx.sinks, &pkg);
    }
    if let Some(dacp_id) = request.header("DACP-ID") {
        connection.set_dacp_identity(None, Some(dacp_id.to_string()));
        let pkg = MetadataPackage::ssnc(metadata::event::DEVICE_ID, dacp_id.as_bytes())
            .with_carrier(request.retain());
        metadata::send_metadata(ctx.sinks, &pkg);
    }
}

fn require_ownership(connection: &ConnectionState) -> Result<()> {
    if connection.owns_player.load(Ordering::Acquire) {
        Ok(())
    } else {
        Err(RtspError::NoPlayer)
    }
}

/// `rtptime` out of an `RTP-Info` header, if present.
fn parse_rtptime(request: &RtspMessage) -> Option<u32> {
    request
        .header("RTP-Info")
        .and_then(|value| value.split("rtptime=").nth(1))
        .and_then(|v| v.parse().ok())
}

/// RECORD starts delivery. When the request carries an `RTP-Info`
/// `rtptime`, it flushes up to that point first, the same as an explicit
/// FLUSH would, before play starts. `Audio-Latency`
/// is the fixed `11025` value real senders expect, not a computed one.
fn handle_record(request: &RtspMessage, connection: &Arc<ConnectionState>, ctx: &HandlerContext) -> Result<RtspMessage> {
    require_ownership(connection)?;
    ctx.rtp_transport.initialise(connection)?;
    if let Some(rtptime) = parse_rtptime(request) {
        ctx.player.flush(Some(rtptime), connection)?;
    }
    ctx.player.play(connection)?;
    connection.rtp_running.store(true, Ordering::Release);
    send_lifecycle_event(ctx, metadata::event::METADATA_START);

    Ok(RtspMessage::new_response(200, "OK")
        .maybe_header("CSeq", request.cseq())
        .header("Audio-Latency", "11025")
        .build())
}

fn handle_flush(request: &RtspMessage, connection: &Arc<ConnectionState>, ctx: &HandlerContext) -> Result<RtspMessage> {
    require_ownership(connection)?;
    let rtptime = parse_rtptime(request).unwrap_or(0);
    ctx.player.flush(Some(rtptime), connection)?;
    Ok(ok_response(request))
}

/// TEARDOWN always answers `Connection: close`, even when
/// this connection did not actually hold the player, and sets `stop` so
/// the worker's read loop unwinds right after writing the response
/// instead of blocking on a read the sender has no reason to follow up
/// with.
fn handle_teardown(request: &RtspMessage, connection: &Arc<ConnectionState>, ctx: &HandlerContext) -> Result<RtspMessage> {
    if connection.owns_player.load(Ordering::Acquire) {
        let _ = ctx.player.stop(connection);
        let _ = ctx.rtp_transport.terminate(connection);
        ctx.admission.release(connection.connection_number);
        connection.owns_player.store(false, Ordering::Release);
        connection.rtp_running.store(false, Ordering::Release);
        send_lifecycle_event(ctx, metadata::event::METADATA_END);
    }
    connection.stop.store(true, Ordering::Release);
    Ok(RtspMessage::new_response(200, "OK")
        .maybe_header("CSeq", request.cseq())
        .header("Connection", "close")
        .build())
}

/// PAUSE is advisory only: senders use it between tracks, but this core
/// has no separate paused state to enter, so it just confirms ownership
/// and answers 200 without touching the player or the RTP transport.
fn handle_pause(request: &RtspMessage, connection: &Arc<ConnectionState>) -> Result<RtspMessage> {
    require_ownership(connection)?;
    Ok(ok_response(request))
}

/// GET_PARAMETER doubles as a keepalive and, for the one body real senders
/// actually query, a volume readback.
fn handle_get_parameter(request: &RtspMessage, connection: &Arc<ConnectionState>, ctx: &HandlerContext) -> Result<RtspMessage> {
    require_ownership(connection)?;
    connection.mark_activity();

    if request.content() == b"volume\r\n" {
        let volume = ctx.player.volume()?;
        let body = format!("\r\nvolume: {volume}\r\n");
        return Ok(RtspMessage::new_response(200, "OK")
            .maybe_header("CSeq", request.cseq())
            .header("Content-Type", "text/parameters")
            .content(body.into_bytes())
            .build());
    }

    Ok(ok_response(request))
}

fn handle_set_parameter(request: &RtspMessage, connection: &Arc<ConnectionState>, ctx: &HandlerContext) -> Result<RtspMessage> {
    require_ownership(connection)?;
    let content_type = request.header("Content-Type").unwrap_or("");

    match content_type {
        "text/parameters" => handle_text_parameters(request, ctx),
        "application/x-dmap-tagged" => handle_dmap_parameters(request, ctx),
        ct if ct.starts_with("image/") && ctx.config.get_coverart => handle_picture_parameter(request, ctx),
        _ => {}
    }

    Ok(ok_response(request))
}

fn handle_text_parameters(request: &RtspMessage, ctx: &HandlerContext) {
    let Ok(text) = std::str::from_utf8(request.content()) else { return };
    for line in text.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            let value = value.trim();
            if key.eq_ignore_ascii_case("volume") {
                if let Ok(volume) = value.parse::<f32>() {
                    let _ = ctx.player.set_volume(volume);
                }
            }
            if key.eq_ignore_ascii_case("progress") {
                let pkg = MetadataPackage::ssnc(metadata::event::PROGRESS, value.as_bytes());
                metadata::send_metadata(ctx.sinks, &pkg);
            }
        }
    }
}

/// Every DMAP tuple is bracketed with `mdst`/`mden`, carrying the
/// `RTP-Info` rtptime if the sender supplied one, and forwarded verbatim
/// under the `core` type.
fn handle_dmap_parameters(request: &RtspMessage, ctx: &HandlerContext) {
    let rtptime = parse_rtptime(request);
    let bracket_payload: Arc<[u8]> = match rtptime {
        Some(rtptime) => Arc::from(rtptime.to_string().into_bytes()),
        None => Arc::from(&[][..]),
    };

    let start = MetadataPackage::ssnc(metadata::event::METADATA_START, bracket_payload.clone()).with_carrier(request.retain());
    metadata::send_metadata(ctx.sinks, &start);
    for tuple in dmap::decode(request.content()) {
        let pkg = MetadataPackage::core(tuple.tag, tuple.value).with_carrier(request.retain());
        metadata::send_metadata(ctx.sinks, &pkg);
    }
    let end = MetadataPackage::ssnc(metadata::event::METADATA_END, bracket_payload).with_carrier(request.retain());
    metadata::send_metadata(ctx.sinks, &end);
}

fn handle_picture_parameter(request: &RtspMessage, ctx: &HandlerContext) {
    send_lifecycle_event(ctx, metadata::event::PICTURE_START);
    let pkg = MetadataPackage::ssnc(metadata::event::PICTURE, request.content()).with_carrier(request.retain());
    metadata::send_metadata(ctx.sinks, &pkg);
    send_lifecycle_event(ctx, metadata::event::PICTURE_END);
}

fn send_lifecycle_event(ctx: &HandlerContext, code: metadata::EventCode) {
    let pkg = MetadataPackage::ssnc(code, &[][..]);
    metadata::send_metadata(ctx.sinks, &pkg);
}

/// Parse `key=value` pairs out of a `;`-separated `Transport:` header
/// value; flag-only segments like `unicast` are ignored.
fn parse_transport_fields(value: &str) -> std::collections::HashMap<String, String> {
    value
        .split(';')
        .filter_map(|segment| segment.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{LoopbackRtpTransport, NullPlayer};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn ctx<'a>(
        admission: &'a SessionAdmission,
        sinks: &'a [Arc<dyn MetadataSink>],
        player: &'a NullPlayer,
        transport: &'a LoopbackRtpTransport,
        device_key: &'a DeviceKey,
        config: &'a RaopConfig,
    ) -> HandlerContext<'a> {
        HandlerContext { admission, sinks, player, rtp_transport: transport, device_key, config }
    }

    fn connection() -> Arc<ConnectionState> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000);
        ConnectionState::new(1, addr, addr, "test-nonce".into())
    }

    #[test]
    fn options_without_challenge_has_no_apple_response() {
        let admission = SessionAdmission::new();
        let sinks: Vec<Arc<dyn MetadataSink>> = Vec::new();
        let player = NullPlayer;
        let transport = LoopbackRtpTransport::new();
        let device_key = DeviceKey::load().unwrap();
        let config = RaopConfig::default();
        let context = ctx(&admission, &sinks, &player, &transport, &device_key, &config);

        let conn = connection();
        let req = RtspMessage::new_request("OPTIONS", "*").header("CSeq", "1").build();
        let resp = dispatch(&req, &conn, &context);
        assert_eq!(resp.respcode(), Some(200));
        assert!(resp.header("Apple-Response").is_none());
    }

    #[test]
    fn options_with_challenge_produces_apple_response() {
        let admission = SessionAdmission::new();
        let sinks: Vec<Arc<dyn MetadataSink>> = Vec::new();
        let player = NullPlayer;
        let transport = LoopbackRtpTransport::new();
        let device_key = DeviceKey::load().unwrap();
        let config = RaopConfig::default();
        let context = ctx(&admission, &sinks, &player, &transport, &device_key, &config);

        let conn = connection();
        let challenge = crypto::base64_encode(&[7u8; 16]);
        let req = RtspMessage::new_request("OPTIONS", "*")
            .header("CSeq", "1")
            .header("Apple-Challenge", challenge)
            .build();
        let resp = dispatch(&req, &conn, &context);
        assert!(resp.header("Apple-Response").is_some());
    }

    #[test]
    fn announce_with_unknown_codec_is_rejected() {
        let admission = SessionAdmission::new();
        let sinks: Vec<Arc<dyn MetadataSink>> = Vec::new();
        let player = NullPlayer;
        let transport = LoopbackRtpTransport::new();
        let device_key = DeviceKey::load().unwrap();
        let config = RaopConfig::default();
        let context = ctx(&admission, &sinks, &player, &transport, &device_key, &config);

        let conn = connection();
        let req = RtspMessage::new_request("ANNOUNCE", "rtsp://x/")
            .header("CSeq", "2")
            .content(b"v=0\r\n".to_vec())
            .build();
        let resp = dispatch(&req, &conn, &context);
        assert_eq!(resp.respcode(), Some(456));
    }

    #[test]
    fn setup_before_announce_is_rejected() {
        let admission = SessionAdmission::new();
        let sinks: Vec<Arc<dyn MetadataSink>> = Vec::new();
        let player = NullPlayer;
        let transport = LoopbackRtpTransport::new();
        let device_key = DeviceKey::load().unwrap();
        let config = RaopConfig::default();
        let context = ctx(&admission, &sinks, &player, &transport, &device_key, &config);

        let conn = connection();
        let req = RtspMessage::new_request("SETUP", "rtsp://x/")
            .header("CSeq", "3")
            .header("Transport", "RTP/AVP/UDP;unicast;control_port=7000;timing_port=7001")
            .build();
        let resp = dispatch(&req, &conn, &context);
        assert_eq!(resp.respcode(), Some(451));
        assert!(!conn.owns_player.load(Ordering::Acquire));
    }

    #[test]
    fn announce_acquires_slot_then_setup_allocates_ports() {
        let admission = SessionAdmission::new();
        let sinks: Vec<Arc<dyn MetadataSink>> = Vec::new();
        let player = NullPlayer;
        let transport = LoopbackRtpTransport::new();
        let device_key = DeviceKey::load().unwrap();
        let config = RaopConfig::default();
        let context = ctx(&admission, &sinks, &player, &transport, &device_key, &config);

        let conn = connection();
        let announce = RtspMessage::new_request("ANNOUNCE", "rtsp://x/")
            .header("CSeq", "1")
            .content(b"v=0\r\no=iTunes 1 0 IN IP4 10.0.0.1\r\ns=iTunes\r\nc=IN IP4 10.0.0.2\r\nt=0 0\r\nm=audio 0 RTP/AVP 96\r\na=rtpmap:96 L16/44100/2\r\n".to_vec())
            .build();
        let announce_resp = dispatch(&announce, &conn, &context);
        assert_eq!(announce_resp.respcode(), Some(200));
        assert!(conn.owns_player.load(Ordering::Acquire));
        assert!(admission.is_holder(conn.connection_number));

        let setup = RtspMessage::new_request("SETUP", "rtsp://x/")
            .header("CSeq", "2")
            .header("Transport", "RTP/AVP/UDP;unicast;control_port=7000;timing_port=7001")
            .build();
        let setup_resp = dispatch(&setup, &conn, &context);
        assert_eq!(setup_resp.respcode(), Some(200));
        assert!(setup_resp.header("Transport").unwrap().contains("server_port="));
    }

    #[test]
    fn repeated_setup_with_identical_ports_reuses_original_transport() {
        let admission = SessionAdmission::new();
        let sinks: Vec<Arc<dyn MetadataSink>> = Vec::new();
        let player = NullPlayer;
        let transport = LoopbackRtpTransport::new();
        let device_key = DeviceKey::load().unwrap();
        let config = RaopConfig::default();
        let context = ctx(&admission, &sinks, &player, &transport, &device_key, &config);

        let conn = connection();
        admission.try_acquire(&conn).unwrap();
        conn.owns_player.store(true, Ordering::Release);

        let setup = || {
            RtspMessage::new_request("SETUP", "rtsp://x/")
                .header("CSeq", "2")
                .header("Transport", "RTP/AVP/UDP;unicast;control_port=7000;timing_port=7001")
                .build()
        };
        let first = dispatch(&setup(), &conn, &context);
        let second = dispatch(&setup(), &conn, &context);
        assert_eq!(first.header("Transport"), second.header("Transport"));
    }

    #[test]
    fn second_announce_is_busy_without_interruption() {
        let admission = SessionAdmission::new();
        let sinks: Vec<Arc<dyn MetadataSink>> = Vec::new();
        let player = NullPlayer;
        let transport = LoopbackRtpTransport::new();
        let device_key = DeviceKey::load().unwrap();
        let mut config = RaopConfig::default();
        config.allow_session_interruption = false;
        let context = ctx(&admission, &sinks, &player, &transport, &device_key, &config);

        let first = connection();
        admission.try_acquire(&first).unwrap();
        first.owns_player.store(true, Ordering::Release);

        let second = ConnectionState::new(2, first.peer_addr, first.local_addr, "other-nonce".into());
        let announce = RtspMessage::new_request("ANNOUNCE", "rtsp://x/")
            .header("CSeq", "1")
            .content(b"v=0\r\no=iTunes 1 0 IN IP4 10.0.0.1\r\ns=iTunes\r\nc=IN IP4 10.0.0.2\r\nt=0 0\r\nm=audio 0 RTP/AVP 96\r\na=rtpmap:96 L16/44100/2\r\n".to_vec())
            .build();
        let resp = dispatch(&announce, &second, &context);
        assert_eq!(resp.respcode(), Some(453));
    }

    #[test]
    fn pause_does_not_stop_the_player() {
        let admission = SessionAdmission::new();
        let sinks: Vec<Arc<dyn MetadataSink>> = Vec::new();
        let player = NullPlayer;
        let transport = LoopbackRtpTransport::new();
        let device_key = DeviceKey::load().unwrap();
        let config = RaopConfig::default();
        let context = ctx(&admission, &sinks, &player, &transport, &device_key, &config);

        let conn = connection();
        conn.owns_player.store(true, Ordering::Release);
        conn.rtp_running.store(true, Ordering::Release);

        let req = RtspMessage::new_request("PAUSE", "rtsp://x/").header("CSeq", "9").build();
        let resp = dispatch(&req, &conn, &context);
        assert_eq!(resp.respcode(), Some(200));
        assert!(conn.rtp_running.load(Ordering::Acquire));
    }

    #[test]
    fn get_parameter_volume_body_reports_player_volume() {
        let admission = SessionAdmission::new();
        let sinks: Vec<Arc<dyn MetadataSink>> = Vec::new();
        let player = NullPlayer;
        let transport = LoopbackRtpTransport::new();
        let device_key = DeviceKey::load().unwrap();
        let config = RaopConfig::default();
        let context = ctx(&admission, &sinks, &player, &transport, &device_key, &config);

        let conn = connection();
        conn.owns_player.store(true, Ordering::Release);

        let req = RtspMessage::new_request("GET_PARAMETER", "rtsp://x/")
            .header("CSeq", "10")
            .content(b"volume\r\n".to_vec())
            .build();
        let resp = dispatch(&req, &conn, &context);
        assert_eq!(resp.respcode(), Some(200));
        assert!(std::str::from_utf8(resp.content()).unwrap().contains("volume:"));
    }

    #[test]
    fn record_without_setup_is_no_player() {
        let admission = SessionAdmission::new();
        let sinks: Vec<Arc<dyn MetadataSink>> = Vec::new();
        let player = NullPlayer;
        let transport = LoopbackRtpTransport::new();
        let device_key = DeviceKey::load().unwrap();
        let config = RaopConfig::default();
        let context = ctx(&admission, &sinks, &player, &transport, &device_key, &config);

        let conn = connection();
        let req = RtspMessage::new_request("RECORD", "rtsp://x/").header("CSeq", "4").build();
        let resp = dispatch(&req, &conn, &context);
        assert_eq!(resp.respcode(), Some(451));
    }

    #[test]
    fn teardown_releases_admission_slot() {
        let admission = SessionAdmission::new();
        let sinks: Vec<Arc<dyn MetadataSink>> = Vec::new();
        let player = NullPlayer;
        let transport = LoopbackRtpTransport::new();
        let device_key = DeviceKey::load().unwrap();
        let config = RaopConfig::default();
        let context = ctx(&admission, &sinks, &player, &transport, &device_key, &config);

        let conn = connection();
        admission.try_acquire(&conn).unwrap();
        conn.owns_player.store(true, Ordering::Release);

        let req = RtspMessage::new_request("TEARDOWN", "rtsp://x/").header("CSeq", "5").build();
        let resp = dispatch(&req, &conn, &context);
        assert_eq!(resp.respcode(), Some(200));
        assert_eq!(resp.header("Connection"), Some("close"));
        assert!(!conn.owns_player.load(Ordering::Acquire));
        assert!(conn.stop.load(Ordering::Acquire));

        let other = ConnectionState::new(999, conn.peer_addr, conn.local_addr, "nonce".into());
        assert!(admission.try_acquire(&other).is_ok());
    }

    #[test]
    fn oversize_apple_challenge_is_ignored_without_breaking_the_response() {
        let admission = SessionAdmission::new();
        let sinks: Vec<Arc<dyn MetadataSink>> = Vec::new();
        let player = NullPlayer;
        let transport = LoopbackRtpTransport::new();
        let device_key = DeviceKey::load().unwrap();
        let config = RaopConfig::default();
        let context = ctx(&admission, &sinks, &player, &transport, &device_key, &config);

        let conn = connection();
        let challenge = crypto::base64_encode(&[9u8; 17]);
        let req = RtspMessage::new_request("OPTIONS", "*")
            .header("CSeq", "1")
            .header("Apple-Challenge", challenge)
            .build();
        let resp = dispatch(&req, &conn, &context);
        assert_eq!(resp.respcode(), Some(200));
        assert!(resp.header("Apple-Response").is_none());
    }

    #[test]
    fn every_response_carries_the_server_header() {
        let admission = SessionAdmission::new();
        let sinks: Vec<Arc<dyn MetadataSink>> = Vec::new();
        let player = NullPlayer;
        let transport = LoopbackRtpTransport::new();
        let device_key = DeviceKey::load().unwrap();
        let config = RaopConfig::default();
        let context = ctx(&admission, &sinks, &player, &transport, &device_key, &config);

        let conn = connection();
        let req = RtspMessage::new_request("OPTIONS", "*").header("CSeq", "1").build();
        let resp = dispatch(&req, &conn, &context);
        assert_eq!(resp.header("Server"), Some("AirTunes/105.1"));
    }

    #[test]
    fn wrong_password_yields_401() {
        let admission = SessionAdmission::new();
        let sinks: Vec<Arc<dyn MetadataSink>> = Vec::new();
        let player = NullPlayer;
        let transport = LoopbackRtpTransport::new();
        let device_key = DeviceKey::load().unwrap();
        let mut config = RaopConfig::default();
        config.password = Some("secret".to_string());
        let context = ctx(&admission, &sinks, &player, &transport, &device_key, &config);

        let conn = connection();
        let req = RtspMessage::new_request("OPTIONS", "*").header("CSeq", "1").build();
        let resp = dispatch(&req, &conn, &context);
        assert_eq!(resp.respcode(), Some(401));
        assert!(resp.header("WWW-Authenticate").is_some());
    }
}
