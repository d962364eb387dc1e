//! # ws-wire: wire-level WebSocket engine
//!
//! An RFC 6455 protocol engine for Tokio: a resumable frame parser, a
//! per-connection state machine (fragmentation, control-frame interleaving,
//! masking, close handshake), the HTTP/1.1 upgrade handshake and a server-wide
//! liveness heartbeat.
//!
//! ## Layers
//!
//! - [`frame`] / [`parser`]: single frames on the wire, with no stream state
//! - [`utf8`]: whole-buffer and incremental UTF-8 validation
//! - [`protocol`]: the sans-I/O connection state machine
//! - [`connection`]: the async driver that owns a socket and its timers
//! - [`handshake`], [`server`], [`client`]: the upgrade and connection setup
//!
//! ## Example
//!
//! ```ignore
//! use tokio::net::TcpListener;
//! use ws_wire::{Config, Event, WebSocketServer};
//!
//! let listener = TcpListener::bind("127.0.0.1:9001").await?;
//! let server = WebSocketServer::new(Config::default());
//!
//! server.serve(listener, |conn, mut events| async move {
//!     while let Some(event) = events.recv().await {
//!         if let Event::Message(msg) = event {
//!             let _ = conn.send_message(&msg).await;
//!         }
//!     }
//! }).await?;
//! ```

use std::time::Duration;

pub mod client;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod parser;
pub mod protocol;
pub mod server;
pub mod utf8;

pub use connection::{Connection, Event, Events};
pub use error::{CloseReason, Error, ProtocolError, Result, Violation};
pub use frame::{Frame, OpCode};
pub use handshake::{Rejection, UpgradeRequest};
pub use protocol::{Message, Role};
pub use server::WebSocketServer;

/// Default receive buffer size (64KB for high throughput)
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Largest payload encoded directly in the 7-bit length field
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Largest payload encoded with the 16-bit extended length
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// Maximum payload of a control frame
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// FIN bit of the first header byte
pub const FIN_BIT: u8 = 0x80;

/// RSV1-3 bits of the first header byte
pub const RSV_BITS: u8 = 0x70;

/// Opcode nibble of the first header byte
pub const OPCODE_BITS: u8 = 0x0F;

/// MASK bit of the second header byte
pub const MASK_BIT: u8 = 0x80;

/// 7-bit length field of the second header byte
pub const LEN_BITS: u8 = 0x7F;

/// Length marker announcing a 16-bit extended length
pub const LEN_MARKER_16: u8 = 126;

/// Length marker announcing a 64-bit extended length
pub const LEN_MARKER_64: u8 = 127;

/// Bits of the upper 32 bits of a 64-bit length that must stay clear.
///
/// Keeps every accepted length below 2^53, so it is exact even when handled
/// as a double by a peer or a collaborator.
pub const UNSAFE_LENGTH_HIGH_BITS: u32 = 0xFFE0_0000;

/// Configuration for WebSocket connections and the server that owns them
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use ws_wire::Config;
///
/// let config = Config::builder()
///     .max_buffer(1024 * 1024)
///     .close_timeout(Duration::from_millis(500))
///     .heartbeat_interval(Duration::from_secs(10))
///     .build();
/// assert_eq!(config.max_buffer, 1024 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of unparsed bytes held in the receive buffer (default: 64MB)
    pub max_buffer: usize,
    /// Maximum size of a reassembled fragmented message (default: 64MB)
    pub max_message_size: usize,
    /// Time after sending a Close frame before the socket is ended (default: 1s)
    pub close_timeout: Duration,
    /// Time between ending and destroying the socket (default: 100ms)
    pub close_grace: Duration,
    /// Heartbeat ping interval of the server (default: 30s)
    pub heartbeat_interval: Duration,
    /// Maximum size of an HTTP upgrade request or response head (default: 8KB)
    pub max_handshake_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_buffer: 64 * 1024 * 1024,
            max_message_size: 64 * 1024 * 1024,
            close_timeout: Duration::from_secs(1),
            close_grace: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(30),
            max_handshake_size: 8192,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for [`Config`]
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the receive buffer cap
    pub fn max_buffer(mut self, size: usize) -> Self {
        self.config.max_buffer = size;
        self
    }

    /// Set the reassembled message cap
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set how long to wait for the peer after sending a Close frame
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    /// Set the grace period between ending and destroying the socket
    pub fn close_grace(mut self, grace: Duration) -> Self {
        self.config.close_grace = grace;
        self
    }

    /// Set the server heartbeat interval
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Set the maximum HTTP head size accepted during the handshake
    pub fn max_handshake_size(mut self, size: usize) -> Self {
        self.config.max_handshake_size = size;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::Config;
    pub use crate::connection::{Connection, Event, Events};
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::frame::{Frame, OpCode};
    pub use crate::protocol::{Message, Role};
    pub use crate::server::WebSocketServer;
}
