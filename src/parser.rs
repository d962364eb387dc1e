//! Resumable frame parser and per-frame structural checks
//!
//! [`parse`] looks at a prefix of the receive buffer and either returns one
//! frame plus the number of bytes it used, asks for more data, or reports a
//! violation. It never consumes anything itself: on `Ok(None)` the caller
//! simply appends the next read and calls it again, so arbitrarily chunked
//! input can never desynchronize the stream.

use bytes::Bytes;

use crate::error::{CloseReason, ProtocolError, Violation};
use crate::frame::{Frame, OpCode};
use crate::mask::apply_mask;
use crate::utf8::validate_utf8;
use crate::{
    FIN_BIT, LEN_BITS, LEN_MARKER_16, LEN_MARKER_64, MASK_BIT, MAX_CONTROL_PAYLOAD, OPCODE_BITS,
    RSV_BITS, UNSAFE_LENGTH_HIGH_BITS,
};

/// Outcome of a successful parse call: the frame and the bytes it occupied
pub type Parsed = (Frame, usize);

/// Parse one frame from the front of `buf`.
///
/// Returns:
/// - `Ok(Some((frame, used)))` when a complete frame is available; the
///   payload is already unmasked
/// - `Ok(None)` if more data is needed
/// - `Err(violation)` for reserved bits, reserved opcodes and unsafe lengths
pub fn parse(buf: &[u8]) -> Result<Option<Parsed>, Violation> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let b0 = buf[0];
    let b1 = buf[1];

    let rsv = (b0 & RSV_BITS) >> 4;
    if rsv != 0 {
        return Err(Violation::common("RSV bits must be 0"));
    }

    let opcode = OpCode::from_u8(b0 & OPCODE_BITS).ok_or(Violation::common("reserved opcode"))?;
    let fin = b0 & FIN_BIT != 0;
    let masked = b1 & MASK_BIT != 0;

    let (payload_len, mut offset) = match b1 & LEN_BITS {
        LEN_MARKER_16 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
        }
        LEN_MARKER_64 => {
            // Judge the upper word as soon as it is present
            if buf.len() < 6 {
                return Ok(None);
            }
            let high = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
            if high & UNSAFE_LENGTH_HIGH_BITS != 0 {
                return Err(Violation::MessageTooBig);
            }
            if buf.len() < 10 {
                return Ok(None);
            }
            let low = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
            (((high as u64) << 32) | low as u64, 10)
        }
        len => (len as u64, 2),
    };

    let mask = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let payload_len = usize::try_from(payload_len).map_err(|_| Violation::MessageTooBig)?;
    let total = offset
        .checked_add(payload_len)
        .ok_or(Violation::MessageTooBig)?;
    if buf.len() < total {
        return Ok(None);
    }

    let mut payload = buf[offset..total].to_vec();
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    let frame = Frame {
        fin,
        rsv,
        opcode,
        mask,
        payload: Bytes::from(payload),
    };
    Ok(Some((frame, total)))
}

/// Structural rules for Close, Ping and Pong frames
pub fn check_control_frame(frame: &Frame) -> Result<(), Violation> {
    if !frame.opcode.is_control() || !frame.fin {
        return Err(Violation::common("control frames must not be fragmented"));
    }
    if frame.payload.len() > MAX_CONTROL_PAYLOAD {
        return Err(Violation::Protocol(ProtocolError::ControlTooLong));
    }

    if frame.opcode == OpCode::Close {
        match frame.payload.len() {
            0 => {}
            1 => return Err(Violation::common("close payload must carry a 2-byte code")),
            _ => {
                let code = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
                if !CloseReason::is_valid_code(code) {
                    return Err(Violation::common("invalid close code"));
                }
                if !validate_utf8(&frame.payload[2..]) {
                    return Err(Violation::InvalidPayload);
                }
            }
        }
    }
    Ok(())
}

/// Structural rules for Text, Binary and Continuation frames.
///
/// Only unfragmented text is checked for UTF-8 here; fragmented text is
/// validated incrementally by the connection.
pub fn check_data_frame(frame: &Frame) -> Result<(), Violation> {
    if !frame.opcode.is_data() {
        return Err(Violation::common("expected a data frame"));
    }
    if frame.opcode == OpCode::Text && frame.fin && !validate_utf8(&frame.payload) {
        return Err(Violation::InvalidPayload);
    }
    Ok(())
}
