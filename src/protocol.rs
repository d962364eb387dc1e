//! WebSocket protocol implementation
//!
//! This module is the sans-I/O half of a connection. [`Protocol`] is fed raw
//! socket bytes and answers with a list of [`Action`]s (bytes to write,
//! messages to surface, timers to arm) which the async
//! [`Connection`](crate::Connection) carries out in order. It handles:
//! - Message fragmentation and reassembly
//! - Control frames interleaved mid-fragment (ping/pong/close)
//! - Role masking rules
//! - The close handshake

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::error::{CloseReason, ProtocolError, Violation};
use crate::frame::{Frame, OpCode, encode_frame};
use crate::mask::generate_mask;
use crate::parser::{check_control_frame, check_data_frame, parse};
use crate::utf8::Utf8Validator;

/// WebSocket endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client (must mask frames)
    Client,
    /// Server (must not mask frames)
    Server,
}

/// WebSocket message (complete, possibly assembled from fragments)
///
/// Inbound text is UTF-8 validated before it is surfaced, so
/// [`as_text`](Message::as_text) only returns `None` for binary messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Text message
    Text(Bytes),
    /// Binary message
    Binary(Bytes),
}

impl Message {
    /// Create a text message from a string
    #[inline]
    pub fn text(s: impl Into<String>) -> Self {
        Message::Text(Bytes::from(s.into()))
    }

    /// Create a binary message
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Message::Binary(data.into())
    }

    /// Check if this is a text message
    #[inline]
    pub fn is_text(&self) -> bool {
        matches!(self, Message::Text(_))
    }

    /// Check if this is a binary message
    #[inline]
    pub fn is_binary(&self) -> bool {
        matches!(self, Message::Binary(_))
    }

    /// Get message as text (returns None for non-text messages)
    #[inline]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(b) => std::str::from_utf8(b).ok(),
            Message::Binary(_) => None,
        }
    }

    /// Get message as bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(b) | Message::Binary(b) => b,
        }
    }

    /// Convert to the underlying bytes
    pub fn into_bytes(self) -> Bytes {
        match self {
            Message::Text(b) | Message::Binary(b) => b,
        }
    }

    /// Opcode used to send this message
    #[inline]
    pub fn opcode(&self) -> OpCode {
        match self {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
        }
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::Text(Bytes::from(s))
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::Text(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Message::Binary(Bytes::from(v))
    }
}

impl From<Bytes> for Message {
    fn from(b: Bytes) -> Self {
        Message::Binary(b)
    }
}

/// Something the I/O driver must do on behalf of the protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write these bytes to the socket as one batch
    Write(Bytes),
    /// Surface a complete application message
    Message(Message),
    /// A pong arrived (liveness signal)
    Pong(Bytes),
    /// A Close frame is about to be sent; start the close timer
    ArmCloseTimer,
    /// Both Close frames have been exchanged; destroy the socket now
    Terminate,
    /// The peer broke the protocol; the Close frame for it is already queued
    Violation(Violation),
}

/// An open fragmented message
#[derive(Debug)]
struct Fragment {
    opcode: OpCode,
    buf: BytesMut,
}

/// WebSocket protocol handler
///
/// Owns the receive buffer and everything that survives between reads:
/// the open fragment, the UTF-8 validator and the close handshake flags.
#[derive(Debug)]
pub struct Protocol {
    role: Role,
    recv_buf: BytesMut,
    fragment: Option<Fragment>,
    utf8: Utf8Validator,
    closing: bool,
    close_sent: bool,
    close_received: bool,
    /// Set after a violation; only the peer's Close is still read
    failed: bool,
    /// Set when frame boundaries are lost; all inbound bytes are ignored
    desynced: bool,
    received_close: Option<CloseReason>,
    max_buffer: usize,
    max_message_size: usize,
}

impl Protocol {
    /// Create a new protocol handler
    pub fn new(role: Role, max_buffer: usize, max_message_size: usize) -> Self {
        Self {
            role,
            recv_buf: BytesMut::new(),
            fragment: None,
            utf8: Utf8Validator::new(),
            closing: false,
            close_sent: false,
            close_received: false,
            failed: false,
            desynced: false,
            received_close: None,
            max_buffer,
            max_message_size,
        }
    }

    /// Endpoint role
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the close handshake has started (no more sends)
    #[inline]
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Whether we have written a Close frame
    #[inline]
    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    /// Whether the peer's Close frame has arrived
    #[inline]
    pub fn close_received(&self) -> bool {
        self.close_received
    }

    /// The close code and reason sent by the peer, if any
    ///
    /// An empty Close payload is reported as 1005.
    #[inline]
    pub fn received_close(&self) -> Option<&CloseReason> {
        self.received_close.as_ref()
    }

    /// Bytes received but not yet parsed into a frame
    #[inline]
    pub fn buffered(&self) -> usize {
        self.recv_buf.len()
    }

    /// Feed bytes read from the socket.
    ///
    /// Every frame that completes is handled in order, and the resulting
    /// actions are appended to `actions`. Partial frames stay buffered until
    /// the next call.
    pub fn receive(&mut self, data: &[u8], actions: &mut Vec<Action>) {
        if self.desynced || (self.closing && self.close_received) {
            return;
        }

        self.recv_buf.extend_from_slice(data);
        if self.recv_buf.len() > self.max_buffer {
            self.desync(Violation::MessageTooBig, actions);
            return;
        }

        loop {
            let (frame, used) = match parse(&self.recv_buf) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => break,
                Err(v) => {
                    self.desync(v, actions);
                    return;
                }
            };
            self.recv_buf.advance(used);

            if self.failed {
                self.on_frame_after_failure(frame, actions);
            } else if let Err(v) = self.on_frame(frame, actions) {
                self.fail(v, actions);
            }

            if self.closing && self.close_received {
                break;
            }
        }
    }

    fn on_frame(&mut self, frame: Frame, actions: &mut Vec<Action>) -> Result<(), Violation> {
        match (self.role, frame.is_masked()) {
            (Role::Server, false) => return Err(Violation::Protocol(ProtocolError::Unmasked)),
            (Role::Client, true) => return Err(Violation::Protocol(ProtocolError::Masked)),
            _ => {}
        }

        if frame.is_control() {
            self.on_control(frame, actions)
        } else {
            self.on_data(frame, actions)
        }
    }

    /// Our Close for a violation is out; wait for the peer's answer and
    /// drop everything else.
    fn on_frame_after_failure(&mut self, frame: Frame, actions: &mut Vec<Action>) {
        let masking_ok = frame.is_masked() == (self.role == Role::Server);
        if frame.opcode != OpCode::Close || !masking_ok || check_control_frame(&frame).is_err() {
            return;
        }

        let reason = frame
            .parse_close()
            .unwrap_or_else(|| CloseReason::new(CloseReason::NO_STATUS, ""));
        debug!(role = ?self.role, %reason, "close reply after violation");
        self.close_received = true;
        self.received_close = Some(reason);
        actions.push(Action::Terminate);
    }

    fn on_control(&mut self, frame: Frame, actions: &mut Vec<Action>) -> Result<(), Violation> {
        check_control_frame(&frame)?;

        match frame.opcode {
            OpCode::Ping => {
                if let Some(pong) = self.encode(OpCode::Pong, &frame.payload) {
                    actions.push(Action::Write(pong));
                }
            }
            OpCode::Pong => actions.push(Action::Pong(frame.payload)),
            OpCode::Close => {
                let reason = frame.parse_close();
                debug!(role = ?self.role, ?reason, "close frame received");
                self.close_received = true;
                self.received_close = Some(
                    reason
                        .clone()
                        .unwrap_or_else(|| CloseReason::new(CloseReason::NO_STATUS, "")),
                );

                if self.close_sent {
                    actions.push(Action::Terminate);
                } else {
                    self.close(reason, actions);
                }
            }
            OpCode::Continuation | OpCode::Text | OpCode::Binary => {
                return Err(Violation::common("expected a control frame"));
            }
        }
        Ok(())
    }

    fn on_data(&mut self, frame: Frame, actions: &mut Vec<Action>) -> Result<(), Violation> {
        check_data_frame(&frame)?;

        if self.fragment.is_none() {
            return match frame.opcode {
                OpCode::Continuation => Err(Violation::common("unexpected continuation frame")),
                opcode if frame.fin => {
                    actions.push(Action::Message(Self::message(opcode, frame.payload)));
                    Ok(())
                }
                opcode => self.start_fragment(opcode, frame.payload),
            };
        }

        if frame.opcode != OpCode::Continuation {
            return Err(Violation::common("expected continuation frame"));
        }
        let Some(fragment) = self.fragment.as_mut() else {
            return Ok(());
        };

        if fragment.buf.len() + frame.payload.len() > self.max_message_size {
            return Err(Violation::MessageTooBig);
        }
        if fragment.opcode == OpCode::Text && !self.utf8.push(&frame.payload, frame.fin) {
            return Err(Violation::InvalidPayload);
        }
        fragment.buf.extend_from_slice(&frame.payload);

        if frame.fin {
            if let Some(done) = self.fragment.take() {
                self.utf8.reset();
                actions.push(Action::Message(Self::message(
                    done.opcode,
                    done.buf.freeze(),
                )));
            }
        }
        Ok(())
    }

    fn start_fragment(&mut self, opcode: OpCode, payload: Bytes) -> Result<(), Violation> {
        if payload.len() > self.max_message_size {
            return Err(Violation::MessageTooBig);
        }
        if opcode == OpCode::Text && !self.utf8.push(&payload, false) {
            return Err(Violation::InvalidPayload);
        }
        self.fragment = Some(Fragment {
            opcode,
            buf: BytesMut::from(&payload[..]),
        });
        Ok(())
    }

    fn message(opcode: OpCode, payload: Bytes) -> Message {
        match opcode {
            OpCode::Text => Message::Text(payload),
            _ => Message::Binary(payload),
        }
    }

    /// Drop partial state and start the close handshake for a violation
    fn fail(&mut self, violation: Violation, actions: &mut Vec<Action>) {
        warn!(role = ?self.role, %violation, "protocol violation");
        self.failed = true;
        self.fragment = None;
        self.utf8.reset();
        self.close(Some(violation.close_reason()), actions);
        actions.push(Action::Violation(violation));
    }

    /// A violation after which frame boundaries can no longer be trusted
    fn desync(&mut self, violation: Violation, actions: &mut Vec<Action>) {
        self.desynced = true;
        self.recv_buf.clear();
        self.fail(violation, actions);
    }

    /// Stop all sending; the socket is being destroyed
    pub fn abort(&mut self) {
        self.closing = true;
    }

    /// Start (or answer) the close handshake.
    ///
    /// `None` sends an empty Close payload. Does nothing and returns `false`
    /// once a Close frame has already been sent.
    pub fn close(&mut self, reason: Option<CloseReason>, actions: &mut Vec<Action>) -> bool {
        if self.close_sent {
            return false;
        }
        self.closing = true;
        self.close_sent = true;

        let frame = match &reason {
            Some(r) => Frame::close(r.code, &r.reason),
            None => Frame::close_empty(),
        };
        debug!(role = ?self.role, ?reason, "sending close frame");

        let mut buf = BytesMut::with_capacity(frame.encoded_len() + 4);
        encode_frame(&mut buf, OpCode::Close, &frame.payload, true, self.mask());
        // The timer must run even if the peer never drains the Close
        actions.push(Action::ArmCloseTimer);
        actions.push(Action::Write(buf.freeze()));
        true
    }

    /// Encode a single final frame for sending.
    ///
    /// Returns `None` once closing; the frame is masked iff we are a client.
    pub fn encode(&self, opcode: OpCode, payload: &[u8]) -> Option<Bytes> {
        if self.closing {
            return None;
        }
        let mut buf = BytesMut::with_capacity(payload.len() + crate::MAX_FRAME_HEADER_SIZE);
        encode_frame(&mut buf, opcode, payload, true, self.mask());
        Some(buf.freeze())
    }

    #[inline]
    fn mask(&self) -> Option<[u8; 4]> {
        match self.role {
            Role::Client => Some(generate_mask()),
            Role::Server => None,
        }
    }
}
