//! Reference-counted RTSP message object.
//!
//! A single type represents both requests and responses: `method` is set
//! for requests, `respcode` for responses. Once built, a message is
//! immutable — matching the data-model invariant that a published message
//! is never mutated, only retained and released.
//!
//! `retain`/`release` are modeled as `Clone`/`Drop` on an `Arc`: cloning
//! bumps the strong count (retain), dropping decrements it (release), and
//! the inner data is freed when the count reaches zero. This keeps the
//! "every retain paired with a release" invariant structural rather than
//! something callers have to get right by hand.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of headers a single message may carry.
pub const MAX_HEADERS: usize = 16;

static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
struct Inner {
    index_number: u64,
    method: Option<String>,
    uri: Option<String>,
    version: String,
    respcode: Option<u16>,
    status_text: Option<String>,
    headers: Vec<(String, String)>,
    content: Vec<u8>,
}

/// A parsed RTSP request or a built RTSP response, shared by reference
/// count across the connection worker and any metadata consumers that
/// retain it as a carrier.
#[derive(Debug, Clone)]
pub struct RtspMessage(Arc<Inner>);

impl RtspMessage {
    /// Build a request message.
    pub fn new_request(method: impl Into<String>, uri: impl Into<String>) -> RtspMessageBuilder {
        RtspMessageBuilder {
            method: Some(method.into()),
            uri: Some(uri.into()),
            version: "RTSP/1.0".to_string(),
            respcode: None,
            status_text: None,
            headers: Vec::new(),
            content: Vec::new(),
        }
    }

    /// Build a response message.
    pub fn new_response(code: u16, status_text: impl Into<String>) -> RtspMessageBuilder {
        RtspMessageBuilder {
            method: None,
            uri: None,
            version: "RTSP/1.0".to_string(),
            respcode: Some(code),
            status_text: Some(status_text.into()),
            headers: Vec::new(),
            content: Vec::new(),
        }
    }

    /// Monotonically increasing identifier assigned at construction, used
    /// for diagnostics.
    pub fn index_number(&self) -> u64 {
        self.0.index_number
    }

    /// Request method, if this message is a request.
    pub fn method(&self) -> Option<&str> {
        self.0.method.as_deref()
    }

    /// Request URI, if this message is a request.
    pub fn uri(&self) -> Option<&str> {
        self.0.uri.as_deref()
    }

    /// Response status code, if this message is a response.
    pub fn respcode(&self) -> Option<u16> {
        self.0.respcode
    }

    /// The status text the handler requested (informational only — the
    /// wire format always emits the literal `OK`/`Unauthorized` pair
    /// regardless of this value).
    pub fn status_text(&self) -> Option<&str> {
        self.0.status_text.as_deref()
    }

    /// RTSP protocol version string (`RTSP/1.0`).
    pub fn version(&self) -> &str {
        &self.0.version
    }

    /// Header lookup, case-insensitive on the name per RFC 2326 §4.2.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.0
            .headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// All headers, in receipt/insertion order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.0.headers
    }

    /// The opaque content buffer (request/response body).
    pub fn content(&self) -> &[u8] {
        &self.0.content
    }

    /// `Content-Length`, derived from the body size.
    pub fn content_length(&self) -> usize {
        self.0.content.len()
    }

    /// `CSeq` header, present on (almost) every real request.
    pub fn cseq(&self) -> Option<&str> {
        self.header("CSeq")
    }

    /// Number of outstanding holders of this message (retain count).
    ///
    /// Exposed for the testable property that retains and releases
    /// balance: `Arc::strong_count` is exactly that counter.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Explicit retain, for call sites that want the vocabulary from the
    /// design rather than a bare `.clone()`.
    #[must_use]
    pub fn retain(&self) -> RtspMessage {
        self.clone()
    }

    /// Serialize as an RTSP response.
    ///
    /// Status line ends with the literal word `OK` for 200 and
    /// `Unauthorized` for everything else — this matches sender
    /// expectations and is not a typo.
    pub fn serialize_response(&self) -> Vec<u8> {
        let code = self.0.respcode.unwrap_or(200);
        let status_text = if code == 200 { "OK" } else { "Unauthorized" };
        let mut out = format!("RTSP/1.0 {code} {status_text}\r\n").into_bytes();

        for (name, value) in &self.0.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }

        if !self.0.content.is_empty() {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.0.content.len()).as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&self.0.content);
        } else {
            out.extend_from_slice(b"\r\n");
        }
        out
    }
}

/// Builder for [`RtspMessage`]. Headers are capped at [`MAX_HEADERS`];
/// exceeding the cap is a programming error in the handler, not a
/// recoverable runtime condition, so it panics rather than threading a
/// `Result` through every call site — matching how the rest of the
/// handler-building code is written.
pub struct RtspMessageBuilder {
    method: Option<String>,
    uri: Option<String>,
    version: String,
    respcode: Option<u16>,
    status_text: Option<String>,
    headers: Vec<(String, String)>,
    content: Vec<u8>,
}

impl RtspMessageBuilder {
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        assert!(
            self.headers.len() < MAX_HEADERS,
            "RTSP message header count exceeds design cap of {MAX_HEADERS}"
        );
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn maybe_header(self, name: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.header(name, v),
            None => self,
        }
    }

    #[must_use]
    pub fn content(mut self, content: Vec<u8>) -> Self {
        self.content = content;
        self
    }

    pub fn build(self) -> RtspMessage {
        let index_number = MESSAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
        RtspMessage(Arc::new(Inner {
            index_number,
            method: self.method,
            uri: self.uri,
            version: self.version,
            respcode: self.respcode,
            status_text: self.status_text,
            headers: self.headers,
            content: self.content,
        }))
    }
}
