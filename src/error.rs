//! Error types for the WebSocket engine

use std::fmt;
use std::io;

use thiserror::Error;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
    /// The peer violated the protocol
    #[error("protocol violation: {0}")]
    Violation(Violation),
    /// Invalid HTTP request or response head
    #[error("invalid HTTP: {0}")]
    InvalidHttp(&'static str),
    /// Client-side handshake failed
    #[error("handshake failed: {0}")]
    HandshakeFailed(&'static str),
    /// Server-side upgrade rejected with a non-101 response
    #[error("upgrade rejected ({status}): {reason}")]
    Rejected {
        /// HTTP status sent to the peer
        status: u16,
        /// Why the request was rejected
        reason: &'static str,
    },
    /// Close code that may not be sent on the wire
    #[error("invalid close code: {0}")]
    InvalidCloseCode(u16),
    /// Control frame payload (ping, pong, close reason) over 125 bytes
    #[error("control frame payload too large")]
    ControlFrameTooLarge,
    /// Connection closed
    #[error("connection closed")]
    ConnectionClosed,
    /// Connection reset by peer
    #[error("connection reset by peer")]
    ConnectionReset,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset => Error::ConnectionReset,
            io::ErrorKind::BrokenPipe => Error::ConnectionClosed,
            io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}

impl From<Violation> for Error {
    fn from(v: Violation) -> Self {
        Error::Violation(v)
    }
}

/// Subtypes of a protocol error; all close with 1002
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Generic structural violation
    Common(&'static str),
    /// Control frame payload longer than 125 bytes
    ControlTooLong,
    /// Server received an unmasked frame
    Unmasked,
    /// Client received a masked frame
    Masked,
}

/// A protocol violation detected while reading from the peer
///
/// Every violation maps to exactly one close code and reason through
/// [`Violation::close_code`] and [`Violation::reason`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// Malformed framing or state (1002)
    Protocol(ProtocolError),
    /// Invalid UTF-8 in a text message or close reason (1007)
    InvalidPayload,
    /// Frame length, buffer or message exceeds what we accept (1009)
    MessageTooBig,
}

impl Violation {
    /// Shorthand for `Violation::Protocol(ProtocolError::Common(msg))`
    #[inline]
    pub const fn common(msg: &'static str) -> Self {
        Violation::Protocol(ProtocolError::Common(msg))
    }

    /// Close code sent to the peer for this violation
    pub fn close_code(&self) -> u16 {
        match self {
            Violation::Protocol(_) => CloseReason::PROTOCOL_ERROR,
            Violation::InvalidPayload => CloseReason::INVALID_PAYLOAD,
            Violation::MessageTooBig => CloseReason::TOO_BIG,
        }
    }

    /// Close reason sent to the peer for this violation
    pub fn reason(&self) -> &'static str {
        match self {
            Violation::Protocol(ProtocolError::Common(msg)) => msg,
            Violation::Protocol(ProtocolError::ControlTooLong) => "control frame payload too long",
            Violation::Protocol(ProtocolError::Unmasked) => "received unmasked frame",
            Violation::Protocol(ProtocolError::Masked) => "received masked frame",
            Violation::InvalidPayload => "invalid UTF-8 payload",
            Violation::MessageTooBig => "message too big",
        }
    }

    /// The close frame contents for this violation
    pub fn close_reason(&self) -> CloseReason {
        CloseReason::new(self.close_code(), self.reason())
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason(), self.close_code())
    }
}

/// Close frame reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// No status received; never sent on the wire
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure; never sent on the wire
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension
    pub const EXTENSION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check if the close code may appear in a Close frame per RFC 6455
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}
