//! UTF-8 validation
//!
//! Two flavours are needed by the protocol:
//!
//! - [`validate_utf8`] checks a complete buffer (unfragmented text frames,
//!   close reasons) using `simdutf8`.
//! - [`Utf8Validator`] checks a message that arrives in fragments, one chunk
//!   at a time, without keeping any of the bytes it has already accepted.

/// Validate that the input is valid UTF-8
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

/// Streaming UTF-8 validator for fragmented text messages
///
/// Holds only the number of continuation bytes still expected and an
/// optional range for the next one. The range is what rejects overlong
/// forms (`E0`, `F0`), UTF-16 surrogates (`ED`) and code points above
/// U+10FFFF (`F4`).
///
/// A failure is sticky: every later [`push`](Self::push) returns `false`
/// until [`reset`](Self::reset) is called.
#[derive(Debug, Clone, Default)]
pub struct Utf8Validator {
    /// Continuation bytes still expected
    need: u8,
    /// Allowed range for the next continuation byte
    bound: Option<(u8, u8)>,
    failed: bool,
}

impl Utf8Validator {
    /// Create a validator in its initial state
    pub const fn new() -> Self {
        Self {
            need: 0,
            bound: None,
            failed: false,
        }
    }

    /// Feed the next chunk of the message.
    ///
    /// Pass `is_final = true` with the last chunk; a multi-byte sequence
    /// left open at that point is a failure.
    pub fn push(&mut self, chunk: &[u8], is_final: bool) -> bool {
        if self.failed {
            return false;
        }

        let mut rest = chunk;
        while let Some((&byte, tail)) = rest.split_first() {
            if self.need == 0 && byte.is_ascii() {
                let run = rest.iter().take_while(|b| b.is_ascii()).count();
                rest = &rest[run..];
                continue;
            }
            if !self.step(byte) {
                self.failed = true;
                return false;
            }
            rest = tail;
        }

        if is_final && self.need != 0 {
            self.failed = true;
            return false;
        }
        true
    }

    /// Clear all state for the next message
    #[inline]
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    #[cfg(test)]
    pub(crate) fn is_failed(&self) -> bool {
        self.failed
    }

    /// Whether the bytes seen so far end on a character boundary
    #[cfg(test)]
    pub(crate) fn is_complete(&self) -> bool {
        !self.failed && self.need == 0
    }

    #[inline]
    fn step(&mut self, byte: u8) -> bool {
        if self.need > 0 {
            if !(0x80..=0xBF).contains(&byte) {
                return false;
            }
            if let Some((lo, hi)) = self.bound.take() {
                if byte < lo || byte > hi {
                    return false;
                }
            }
            self.need -= 1;
            return true;
        }

        let (need, bound) = match byte {
            0x00..=0x7F => return true,
            0xC2..=0xDF => (1, None),
            0xE0 => (2, Some((0xA0, 0xBF))),
            0xE1..=0xEC | 0xEE..=0xEF => (2, None),
            0xED => (2, Some((0x80, 0x9F))),
            0xF0 => (3, Some((0x90, 0xBF))),
            0xF1..=0xF3 => (3, None),
            0xF4 => (3, Some((0x80, 0x8F))),
            // Not a valid lead byte
            _ => return false,
        };
        self.need = need;
        self.bound = bound;
        true
    }
}
