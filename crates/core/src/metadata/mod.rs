//! Metadata fan-out to sink queues.
//!
//! A single [`MetadataPackage`] produced by a handler (DMAP `SET_PARAMETER`
//! body, artwork, or an internally generated progress/session event) is
//! handed to [`send_metadata`], which offers a copy to every registered
//! sink without blocking the request path: a sink with a full queue simply
//! drops the item.

pub mod hub;
pub mod mqtt;
pub mod multicast;
pub mod pipe;

use std::sync::Arc;

use crate::message::RtspMessage;

/// Four-character event code or type tag, e.g. `*b"prgr"` for progress,
/// `*b"asal"` for an album-name DMAP tag forwarded as-is, or `*b"ssnc"`/
/// `*b"core"` as the package `type`.
pub type EventCode = [u8; 4];

/// The `type` field of a [`MetadataPackage`]: `ssnc` for
/// events this core synthesizes itself, `core` for DMAP tuples forwarded
/// verbatim from a `SET_PARAMETER` body.
pub mod msg_type {
    use super::EventCode;

    pub const SSNC: EventCode = *b"ssnc";
    pub const CORE: EventCode = *b"core";
}

/// `ssnc`-namespaced synthetic event codes this core emits itself, rather
/// than forwarding verbatim from a DMAP tuple.
pub mod event {
    use super::EventCode;

    /// Stream stalled.
    pub const STALLED: EventCode = *b"stal";
    /// Playback progress (`RTP-Info`-derived current/start/end).
    pub const PROGRESS: EventCode = *b"prgr";
    /// Active remote (DACP) identity established.
    pub const ACTIVE_REMOTE: EventCode = *b"acre";
    /// DACP device id.
    pub const DEVICE_ID: EventCode = *b"daid";
    /// Sender's friendly name.
    pub const SENDER_NAME: EventCode = *b"snam";
    /// Sender's user agent.
    pub const SENDER_AGENT: EventCode = *b"snua";
    /// Metadata stream start.
    pub const METADATA_START: EventCode = *b"mdst";
    /// Metadata stream end.
    pub const METADATA_END: EventCode = *b"mden";
    /// Picture (album art) start.
    pub const PICTURE_START: EventCode = *b"pcst";
    /// Picture (album art) end.
    pub const PICTURE_END: EventCode = *b"pcen";
    /// Raw picture bytes.
    pub const PICTURE: EventCode = *b"PICT";
}

/// One unit of metadata travelling from a handler to the configured sinks.
///
/// Retained/released the same way as [`crate::message::RtspMessage`]: it
/// is reference-counted so several sinks can hold the same payload without
/// copying it, via [`Clone`] on the `Arc`-backed `payload`.
///
/// `carrier` is the request this package was produced from, when one
/// exists. Attaching it via [`MetadataPackage::with_carrier`] retains the
/// source message (a plain `RtspMessage::retain`) for as long as the
/// package itself is held; every sink that receives a clone, and the
/// fan-out loop in [`send_metadata`], releases its share on drop, failed
/// enqueue included. No sink currently reads `carrier` back out — it
/// exists to keep the source message alive and exercise the retain/release
/// discipline spec'd for this type.
#[derive(Debug, Clone)]
pub struct MetadataPackage {
    pub msg_type: EventCode,
    pub code: EventCode,
    pub payload: Arc<[u8]>,
    pub carrier: Option<RtspMessage>,
}

impl MetadataPackage {
    pub fn new(msg_type: EventCode, code: EventCode, payload: impl Into<Arc<[u8]>>) -> Self {
        Self { msg_type, code, payload: payload.into(), carrier: None }
    }

    /// Convenience constructor for the `ssnc`-namespaced events this core
    /// synthesizes itself.
    pub fn ssnc(code: EventCode, payload: impl Into<Arc<[u8]>>) -> Self {
        Self::new(msg_type::SSNC, code, payload)
    }

    /// Convenience constructor for a DMAP tuple forwarded under the `core`
    /// type.
    pub fn core(code: EventCode, payload: impl Into<Arc<[u8]>>) -> Self {
        Self::new(msg_type::CORE, code, payload)
    }

    /// Retain `carrier` for the lifetime of this package.
    #[must_use]
    pub fn with_carrier(mut self, carrier: RtspMessage) -> Self {
        self.carrier = Some(carrier);
        self
    }
}

/// A destination for metadata events. Implementations must not block the
/// caller of [`send_metadata`]: a full internal queue should fail the
/// enqueue, returning the package back to the caller, rather than wait.
pub trait MetadataSink: Send + Sync {
    /// Attempt to enqueue `pkg`. On failure (queue full, sink detached),
    /// returns it back to the caller so the fan-out loop can log and move
    /// on to the next sink.
    fn try_enqueue(&self, pkg: MetadataPackage) -> Result<(), MetadataPackage>;
}

/// Offer `pkg` to every sink in `sinks`, dropping it (with a debug log) for
/// any sink whose queue is full. This is the only place a full sink queue
/// is allowed to lose data: the request/handler path must
/// never stall waiting on a slow metadata consumer.
pub fn send_metadata(sinks: &[Arc<dyn MetadataSink>], pkg: &MetadataPackage) {
    for sink in sinks {
        if let Err(dropped) = sink.try_enqueue(pkg.clone()) {
            tracing::debug!(code = ?String::from_utf8_lossy(&dropped.code), "metadata sink queue full, dropping item");
        }
    }
}
