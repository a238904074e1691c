//! UTF-8 validation for text messages and close reasons
//!
//! Complete buffers go through `simdutf8`'s fast path. Fragmented text
//! messages are checked with [`Utf8Validator`], which carries an incomplete
//! trailing sequence across chunk boundaries so a message can be rejected as
//! soon as the offending fragment arrives.

use simdutf8::compat;

/// Validate that the input is valid UTF-8
///
/// Rejects overlong encodings, surrogate halves and code points above
/// U+10FFFF.
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

/// Number of bytes in the sequence introduced by `lead`
#[inline]
fn sequence_len(lead: u8) -> usize {
    match lead {
        0xC2..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF4 => 4,
        _ => 1,
    }
}

/// Incremental UTF-8 checker usable on partial buffers
#[derive(Debug, Default, Clone)]
pub struct Utf8Validator {
    pending: [u8; 4],
    pending_len: usize,
}

impl Utf8Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk of the stream.
    ///
    /// Returns false as soon as an invalid sequence is seen. A sequence cut
    /// off at the end of `chunk` is held back until the next call.
    pub fn feed(&mut self, mut chunk: &[u8]) -> bool {
        if self.pending_len > 0 {
            let need = sequence_len(self.pending[0]) - self.pending_len;
            let take = need.min(chunk.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&chunk[..take]);
            self.pending_len += take;
            chunk = &chunk[take..];

            match compat::from_utf8(&self.pending[..self.pending_len]) {
                Ok(_) => self.pending_len = 0,
                Err(e) if e.error_len().is_none() => return true,
                Err(_) => return false,
            }
        }

        match compat::from_utf8(chunk) {
            Ok(_) => true,
            Err(e) => match e.error_len() {
                Some(_) => false,
                None => {
                    let tail = &chunk[e.valid_up_to()..];
                    self.pending[..tail.len()].copy_from_slice(tail);
                    self.pending_len = tail.len();
                    true
                }
            },
        }
    }

    /// True if the stream so far ended on a character boundary
    pub fn finish(&self) -> bool {
        self.pending_len == 0
    }

    pub fn reset(&mut self) {
        self.pending_len = 0;
    }
}
