//! Error types for the RTSP control-plane core.

use std::fmt;

/// Errors that can occur while running the RAOP control plane.
///
/// Variants map to the failure taxonomy of the design:
///
/// - **Protocol**: [`Parse`](Self::Parse) — malformed RTSP or SDP.
/// - **Auth**: [`AuthRequired`](Self::AuthRequired), [`AuthFailed`](Self::AuthFailed).
/// - **Session**: [`NoPlayer`](Self::NoPlayer), [`SessionBusy`](Self::SessionBusy),
///   [`UnknownCodec`](Self::UnknownCodec).
/// - **Transport**: [`Io`](Self::Io), [`ChannelClosed`](Self::ChannelClosed),
///   [`ImmediateShutdown`](Self::ImmediateShutdown).
/// - **Resource**: [`ResourceExhausted`](Self::ResourceExhausted).
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse an RTSP request message.
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// Request requires authentication that has not yet succeeded (401).
    #[error("authentication required")]
    AuthRequired,

    /// Digest response did not match the expected value (401).
    #[error("authentication failed")]
    AuthFailed,

    /// A session-scoped method was received before this connection owned
    /// the player (451).
    #[error("connection does not own the player")]
    NoPlayer,

    /// The session slot is held by another connection and could not be
    /// acquired within the admission budget (453).
    #[error("session slot busy")]
    SessionBusy,

    /// ANNOUNCE described a codec this receiver does not understand (456).
    #[error("unsupported codec in SDP")]
    UnknownCodec,

    /// The peer closed the connection (zero-byte read).
    #[error("channel closed by peer")]
    ChannelClosed,

    /// The connection's `stop` flag was observed mid-read.
    #[error("immediate shutdown requested")]
    ImmediateShutdown,

    /// A read or write failed for a reason other than shutdown or closure.
    #[error("transport read/write error: {0}")]
    ReadError(String),

    /// Allocation or queue-capacity failure. For metadata enqueue this is
    /// handled by silently dropping the item; elsewhere it is fatal.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A cryptographic operation (RSA decrypt/sign, base64) failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// `RaopServer::start` called on a server that is already listening.
    #[error("server is already running")]
    AlreadyRunning,

    /// An operation that requires a running listener was called before
    /// `start` (or after `stop`).
    #[error("server is not running")]
    NotStarted,
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// RTSP version was not `RTSP/1.0`.
    UnsupportedVersion,
    /// A header line lacked a `": "` separator.
    InvalidHeader,
    /// SDP body could not be interpreted.
    InvalidSdp,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::UnsupportedVersion => write!(f, "unsupported RTSP version"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidSdp => write!(f, "invalid SDP body"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
