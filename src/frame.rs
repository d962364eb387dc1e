//! WebSocket frame representation and serialization
//!
//! A [`Frame`] is one unit on the wire. It knows nothing about streams,
//! fragmentation or which side of the connection it belongs to; masking is
//! whatever key the caller puts on it. Parsing lives in [`crate::parser`].

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CloseReason;
use crate::mask::apply_mask;
use crate::{
    FIN_BIT, LEN_MARKER_16, LEN_MARKER_64, MASK_BIT, MEDIUM_MESSAGE_THRESHOLD,
    SMALL_MESSAGE_THRESHOLD,
};

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from the low nibble of the first header byte.
    ///
    /// Returns `None` for the reserved values 0x3-0x7 and 0xB-0xF.
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// A complete WebSocket frame
///
/// `payload` always holds the logical (unmasked) bytes. When `mask` is set
/// the payload is XORed with it on [`encode`](Frame::encode), and a parsed
/// frame keeps the key it arrived with so callers can tell whether the peer
/// masked it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag
    pub fin: bool,
    /// RSV1-3 as a 3-bit value
    pub rsv: u8,
    /// Frame opcode
    pub opcode: OpCode,
    /// Masking key, present iff the MASK bit is set
    pub mask: Option<[u8; 4]>,
    /// Frame payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a new unmasked frame
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>, fin: bool) -> Self {
        Self {
            fin,
            rsv: 0,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Create a text frame
    #[inline]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, data, true)
    }

    /// Create a binary frame
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data, true)
    }

    /// Create a ping frame
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data, true)
    }

    /// Create a pong frame
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data, true)
    }

    /// Create a close frame
    #[inline]
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Self::new(OpCode::Close, payload.freeze(), true)
    }

    /// Create an empty close frame
    #[inline]
    pub fn close_empty() -> Self {
        Self::new(OpCode::Close, Bytes::new(), true)
    }

    /// Set the masking key
    #[inline]
    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Whether the MASK bit is set
    #[inline]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// Number of bytes this frame occupies on the wire
    #[inline]
    pub fn encoded_len(&self) -> usize {
        header_size(self.payload.len(), self.mask.is_some()) + self.payload.len()
    }

    /// Serialize the frame, masking the payload if a key is set
    pub fn encode(&self, buf: &mut BytesMut) {
        encode_frame_with_rsv(buf, self.opcode, &self.payload, self.fin, self.mask, self.rsv);
    }

    /// Serialize the frame into a fresh buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Parse a close frame payload.
    ///
    /// Returns `None` when the payload carries no status code. Run
    /// [`crate::parser::check_control_frame`] first; this does not validate.
    pub fn parse_close(&self) -> Option<CloseReason> {
        if self.payload.len() < 2 {
            return None;
        }
        let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        let reason = String::from_utf8_lossy(&self.payload[2..]).into_owned();
        Some(CloseReason::new(code, reason))
    }
}

/// Header size for a payload of `payload_len` bytes
#[inline]
pub fn header_size(payload_len: usize, masked: bool) -> usize {
    let len_size = if payload_len > MEDIUM_MESSAGE_THRESHOLD {
        8
    } else if payload_len > SMALL_MESSAGE_THRESHOLD {
        2
    } else {
        0
    };
    2 + len_size + if masked { 4 } else { 0 }
}

/// Encode a frame into a buffer
///
/// This is the fast path for frame encoding. For masked frames (client mode),
/// the payload will be copied and masked.
#[inline]
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    encode_frame_with_rsv(buf, opcode, payload, fin, mask, 0)
}

fn encode_frame_with_rsv(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
    rsv: u8,
) {
    let payload_len = payload.len();
    buf.reserve(header_size(payload_len, mask.is_some()) + payload_len);

    let mut b0 = opcode as u8 | ((rsv & 0x07) << 4);
    if fin {
        b0 |= FIN_BIT;
    }
    buf.put_u8(b0);

    let mask_bit = if mask.is_some() { MASK_BIT } else { 0x00 };

    if payload_len <= SMALL_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= MEDIUM_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | LEN_MARKER_16);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | LEN_MARKER_64);
        buf.put_u64(payload_len as u64);
    }

    if let Some(m) = mask {
        buf.put_slice(&m);

        let start = buf.len();
        buf.put_slice(payload);
        apply_mask(&mut buf[start..], m);
    } else {
        buf.put_slice(payload);
    }
}
