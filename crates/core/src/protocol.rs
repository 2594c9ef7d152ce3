//! RTSP wire framing.
//!
//! Real AirPlay-1 senders always attach a `Content-Length`-delimited body
//! to ANNOUNCE and SET_PARAMETER, so this reader frames the header block
//! and then the body as two phases over a
//! chunked, non-blocking-tolerant read loop: a read that would block is
//! treated as "no data yet" rather than an error, polled at
//! [`INTER_CHUNK_SLEEP`] intervals, with a single stall notification fired
//! once the gap since the last byte exceeds [`STALL_THRESHOLD`].

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{ParseErrorKind, Result, RtspError};
use crate::message::RtspMessage;

/// Sleep between unproductive read attempts, so a connection with no data
/// pending does not spin the worker thread. Default for [`ReadTiming`];
/// overridable via [`crate::config::RaopConfig`].
pub const INTER_CHUNK_SLEEP: Duration = Duration::from_millis(80);
/// How long a read may go without producing a byte before a single
/// `ssnc/stal` metadata event is raised for it. Default for
/// [`ReadTiming`]; overridable via [`crate::config::RaopConfig`].
pub const STALL_THRESHOLD: Duration = Duration::from_secs(15);

/// The two tunables design note §9 calls out as "looks like defensive
/// pacing for small devices; preserve it but make it configurable":
/// the inter-chunk sleep in the body read loop and the stall-notification
/// threshold. Read off [`crate::config::RaopConfig`] by the listener and
/// passed down to [`read_request`] so every connection uses the same,
/// operator-tunable pacing rather than a baked-in constant.
#[derive(Debug, Clone, Copy)]
pub struct ReadTiming {
    pub inter_chunk_sleep: Duration,
    pub stall_threshold: Duration,
}

impl Default for ReadTiming {
    fn default() -> Self {
        Self { inter_chunk_sleep: INTER_CHUNK_SLEEP, stall_threshold: STALL_THRESHOLD }
    }
}
/// Upper bound on the header block, matching the header-count cap in
/// [`crate::message::MAX_HEADERS`] against pathological clients.
const MAX_HEADER_BYTES: usize = 16 * 1024;
/// Body chunk size once `Content-Length` is known.
const BODY_CHUNK: usize = 64 * 1024;
const READ_CHUNK: usize = 4096;

fn would_block(err: &std::io::Error) -> bool {
    matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
}

/// Read one RTSP request off `reader`.
///
/// `reader` is expected to have a short read timeout configured at the
/// socket level so a blocking read returns promptly and this
/// loop can re-check `stop` and the stall threshold. Returns `Ok(None)` on
/// a clean EOF (peer closed the connection after finishing its last
/// request) and [`RtspError::ImmediateShutdown`] if `stop` is observed.
///
/// `carry` holds bytes read past the boundary of the previous frame (a
/// single `read()` off a TCP socket routinely returns a header block and
/// the start of its body together, since senders write both in one
/// `write()`); it is drained before pulling more bytes off `reader` and
/// topped back up with whatever this call reads past its own frame, so
/// nothing pulled off the wire is ever discarded.
pub fn read_request<R: Read>(
    reader: &mut R,
    carry: &mut Vec<u8>,
    stop: &AtomicBool,
    timing: ReadTiming,
    mut on_stall: impl FnMut(),
) -> Result<Option<RtspMessage>> {
    let (header_bytes, mut leftover) = match read_until_blank_line(reader, carry, stop, timing, &mut on_stall)? {
        Some(parts) => parts,
        None => return Ok(None),
    };

    let header_text = String::from_utf8_lossy(&header_bytes);
    let (method, uri, version, headers) = parse_header_block(&header_text)?;

    let content_length = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let content = if content_length > 0 {
        if leftover.len() >= content_length {
            *carry = leftover.split_off(content_length);
            leftover
        } else {
            let remaining = content_length - leftover.len();
            leftover.extend(read_exact_tolerant(reader, remaining, stop, timing, &mut on_stall)?);
            *carry = Vec::new();
            leftover
        }
    } else {
        *carry = leftover;
        Vec::new()
    };

    let mut builder = RtspMessage::new_request(method, uri);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    let message = builder.content(content).build();
    // version is informational only.
    tracing::trace!(version, cseq = ?message.cseq(), "request framed");
    Ok(Some(message))
}

/// Write a response to `writer`.
pub fn write_response<W: Write>(writer: &mut W, response: &RtspMessage) -> Result<()> {
    writer.write_all(&response.serialize_response())?;
    writer.flush()?;
    Ok(())
}

/// Reads (more of) the header block, starting from whatever `carry` left
/// over from the previous frame. On success, returns the header bytes up
/// to and including the blank-line terminator, and separately whatever
/// trailing bytes were read past that terminator (the start of the body,
/// possibly all of it, possibly more than one frame's worth).
fn read_until_blank_line<R: Read>(
    reader: &mut R,
    carry: &mut Vec<u8>,
    stop: &AtomicBool,
    timing: ReadTiming,
    on_stall: &mut impl FnMut(),
) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let mut buf = std::mem::take(carry);
    let mut chunk = [0u8; READ_CHUNK];
    let mut last_progress = Instant::now();
    let mut stalled_once = false;

    loop {
        if let Some(end) = find_header_terminator(&buf) {
            let leftover = buf.split_off(end);
            return Ok(Some((buf, leftover)));
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(RtspError::Parse { kind: ParseErrorKind::InvalidHeader });
        }

        match reader.read(&mut chunk) {
            Ok(0) if buf.is_empty() => return Ok(None),
            Ok(0) => return Err(RtspError::ChannelClosed),
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                last_progress = Instant::now();
                stalled_once = false;
            }
            Err(e) if would_block(&e) => {
                if stop.load(Ordering::Acquire) {
                    return Err(RtspError::ImmediateShutdown);
                }
                if !stalled_once && last_progress.elapsed() > timing.stall_threshold {
                    on_stall();
                    stalled_once = true;
                }
                std::thread::sleep(timing.inter_chunk_sleep);
            }
            Err(e) => return Err(RtspError::Io(e)),
        }
    }
}

/// Line-terminator-tolerant search for the header/body boundary: a real
/// RTSP blank line is `\r\n\r\n`, but some senders drop the leading `\r`
/// on one side or the other.
fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    for pattern in [&b"\r\n\r\n"[..], b"\n\r\n", b"\r\n\n", b"\n\n"] {
        if let Some(pos) = find_subslice(buf, pattern) {
            return Some(pos + pattern.len());
        }
    }
    None
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn read_exact_tolerant<R: Read>(
    reader: &mut R,
    total: usize,
    stop: &AtomicBool,
    timing: ReadTiming,
    on_stall: &mut impl FnMut(),
) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(total.min(4 * BODY_CHUNK));
    let mut last_progress = Instant::now();
    let mut stalled_once = false;

    while body.len() < total {
        let remaining = total - body.len();
        let mut chunk = vec![0u8; remaining.min(BODY_CHUNK)];
        match reader.read(&mut chunk) {
            Ok(0) => return Err(RtspError::ChannelClosed),
            Ok(n) => {
                body.extend_from_slice(&chunk[..n]);
                last_progress = Instant::now();
                stalled_once = false;
            }
            Err(e) if would_block(&e) => {
                if stop.load(Ordering::Acquire) {
                    return Err(RtspError::ImmediateShutdown);
                }
                if !stalled_once && last_progress.elapsed() > timing.stall_threshold {
                    on_stall();
                    stalled_once = true;
                }
                std::thread::sleep(timing.inter_chunk_sleep);
            }
            Err(e) => return Err(RtspError::Io(e)),
        }
    }
    Ok(body)
}

type ParsedHeaderBlock<'a> = (String, String, String, Vec<(String, String)>);

fn parse_header_block(text: &str) -> Result<ParsedHeaderBlock<'_>> {
    let mut lines = text.lines();
    let request_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or(RtspError::Parse { kind: ParseErrorKind::EmptyRequest })?;

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(RtspError::Parse { kind: ParseErrorKind::InvalidRequestLine });
    }
    let method = parts[0].to_string();
    let uri = parts[1].to_string();
    let version = parts[2].to_string();
    if version != "RTSP/1.0" {
        return Err(RtspError::Parse { kind: ParseErrorKind::UnsupportedVersion });
    }

    let mut headers = Vec::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let colon = line.find(": ").ok_or(RtspError::Parse { kind: ParseErrorKind::InvalidHeader })?;
        let name = line[..colon].trim().to_string();
        let value = line[colon + 2..].trim().to_string();
        if headers.len() >= crate::message::MAX_HEADERS {
            break;
        }
        headers.push((name, value));
    }

    Ok((method, uri, version, headers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reads_request_with_no_body() {
        let raw = b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n".to_vec();
        let mut reader = Cursor::new(raw);
        let stop = AtomicBool::new(false);
        let mut carry = Vec::new();
        let msg = read_request(&mut reader, &mut carry, &stop, ReadTiming::default(), || {}).unwrap().unwrap();
        assert_eq!(msg.method(), Some("OPTIONS"));
        assert_eq!(msg.cseq(), Some("1"));
        assert!(msg.content().is_empty());
        assert!(carry.is_empty());
    }

    /// A single `read()` off the wire routinely returns the header block
    /// and the whole body together (both were written in one `write()` by
    /// the sender); the reader must not discard the part of that read that
    /// falls past the header/body boundary.
    #[test]
    fn reads_request_with_content_length_body_delivered_in_one_read() {
        let body = b"v=0\r\no=iTunes 1 0 IN IP4 1.2.3.4\r\n";
        let raw = format!(
            "ANNOUNCE rtsp://1.2.3.4/ RTSP/1.0\r\nCSeq: 2\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let mut full = raw.into_bytes();
        full.extend_from_slice(body);
        let mut reader = Cursor::new(full);
        let stop = AtomicBool::new(false);
        let mut carry = Vec::new();
        let msg = read_request(&mut reader, &mut carry, &stop, ReadTiming::default(), || {}).unwrap().unwrap();
        assert_eq!(msg.content(), body);
        assert!(carry.is_empty());
    }

    #[test]
    fn pipelined_bytes_past_the_body_are_carried_to_the_next_request() {
        let body = b"v=0\r\n";
        let first = format!(
            "ANNOUNCE rtsp://1.2.3.4/ RTSP/1.0\r\nCSeq: 2\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let second = b"OPTIONS * RTSP/1.0\r\nCSeq: 3\r\n\r\n";
        let mut full = first.into_bytes();
        full.extend_from_slice(body);
        full.extend_from_slice(second);
        let mut reader = Cursor::new(full);
        let stop = AtomicBool::new(false);
        let mut carry = Vec::new();

        let first_msg = read_request(&mut reader, &mut carry, &stop, ReadTiming::default(), || {}).unwrap().unwrap();
        assert_eq!(first_msg.content(), body);
        assert_eq!(carry, second);

        let second_msg = read_request(&mut reader, &mut carry, &stop, ReadTiming::default(), || {}).unwrap().unwrap();
        assert_eq!(second_msg.cseq(), Some("3"));
        assert!(carry.is_empty());
    }

    #[test]
    fn clean_eof_before_any_bytes_is_none() {
        let mut reader = Cursor::new(Vec::<u8>::new());
        let stop = AtomicBool::new(false);
        let mut carry = Vec::new();
        assert!(read_request(&mut reader, &mut carry, &stop, ReadTiming::default(), || {}).unwrap().is_none());
    }

    #[test]
    fn bare_lf_blank_line_is_tolerated() {
        let raw = b"OPTIONS * RTSP/1.0\nCSeq: 5\n\n".to_vec();
        let mut reader = Cursor::new(raw);
        let stop = AtomicBool::new(false);
        let mut carry = Vec::new();
        let msg = read_request(&mut reader, &mut carry, &stop, ReadTiming::default(), || {}).unwrap().unwrap();
        assert_eq!(msg.cseq(), Some("5"));
    }

    #[test]
    fn header_missing_the_colon_space_separator_is_rejected() {
        let raw = b"OPTIONS * RTSP/1.0\r\nCSeq:1\r\n\r\n".to_vec();
        let mut reader = Cursor::new(raw);
        let stop = AtomicBool::new(false);
        let mut carry = Vec::new();
        let err = read_request(&mut reader, &mut carry, &stop, ReadTiming::default(), || {}).unwrap_err();
        assert!(matches!(err, RtspError::Parse { kind: ParseErrorKind::InvalidHeader }));
    }

    #[test]
    fn non_rtsp_version_is_rejected() {
        let raw = b"OPTIONS * HTTP/1.1\r\n\r\n".to_vec();
        let mut reader = Cursor::new(raw);
        let stop = AtomicBool::new(false);
        let mut carry = Vec::new();
        let err = read_request(&mut reader, &mut carry, &stop, ReadTiming::default(), || {}).unwrap_err();
        assert!(matches!(err, RtspError::Parse { kind: ParseErrorKind::UnsupportedVersion }));
    }

    #[test]
    fn write_response_round_trips_through_serialize() {
        let response = RtspMessage::new_response(200, "OK").header("CSeq", "1").build();
        let mut out = Vec::new();
        write_response(&mut out, &response).unwrap();
        assert_eq!(out, response.serialize_response());
    }
}
