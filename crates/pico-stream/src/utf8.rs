//! Accumulates incomplete UTF-8 sequences across serial read boundaries.
//!
//! Serial reads can split a multi-byte character between two chunks. Decoding
//! each chunk on its own would turn both halves into U+FFFD, so the trailing
//! incomplete bytes are held back and prepended to the next chunk.

use alloc::borrow::Cow;
use alloc::string::String;
use alloc::vec::Vec;

/// Buffers incomplete trailing UTF-8 bytes across successive `decode` calls.
#[derive(Debug, Default)]
pub struct Utf8Accumulator {
    partial: Vec<u8>,
}

impl Utf8Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a chunk, holding back an incomplete trailing sequence.
    ///
    /// Invalid bytes are replaced with U+FFFD. Borrows the input when it is
    /// already complete, valid UTF-8.
    pub fn decode<'a>(&mut self, data: &'a [u8]) -> Cow<'a, str> {
        if self.partial.is_empty() {
            if let Ok(s) = core::str::from_utf8(data) {
                return Cow::Borrowed(s);
            }
        }

        let mut combined = core::mem::take(&mut self.partial);
        combined.extend_from_slice(data);

        let mut out = String::with_capacity(combined.len());
        let mut rest: &[u8] = &combined;
        loop {
            match core::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(core::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            // truncated sequence at the end of the chunk
                            self.partial = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        Cow::Owned(out)
    }

    /// Flush held-back bytes as replacement characters.
    pub fn flush(&mut self) -> String {
        let partial = core::mem::take(&mut self.partial);
        String::from_utf8_lossy(&partial).into_owned()
    }

    /// Hand back the held-back bytes undecoded.
    pub fn take_partial(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.partial)
    }

    /// Number of bytes currently held back.
    pub fn pending_len(&self) -> usize {
        self.partial.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_fast_path_borrows() {
        let mut acc = Utf8Accumulator::new();
        let result = acc.decode(b">>> ");
        assert!(matches!(result, Cow::Borrowed(_)));
        assert_eq!(&*result, ">>> ");
    }

    #[test]
    fn split_multibyte_is_reassembled() {
        // "あ" = E3 81 82
        let mut acc = Utf8Accumulator::new();
        assert_eq!(&*acc.decode(b"x\xE3\x81"), "x");
        assert_eq!(acc.pending_len(), 2);
        assert_eq!(&*acc.decode(b"\x82y"), "\u{3042}y");
        assert_eq!(acc.pending_len(), 0);
    }

    #[test]
    fn invalid_bytes_become_replacement() {
        let mut acc = Utf8Accumulator::new();
        assert_eq!(&*acc.decode(b"a\xFFb"), "a\u{FFFD}b");
        assert_eq!(acc.pending_len(), 0);
    }

    #[test]
    fn flush_emits_replacement_for_dangling_bytes() {
        let mut acc = Utf8Accumulator::new();
        assert_eq!(&*acc.decode(b"\xE3"), "");
        assert_eq!(acc.flush(), "\u{FFFD}");
        assert_eq!(acc.pending_len(), 0);
    }

    #[test]
    fn take_partial_returns_raw_bytes() {
        let mut acc = Utf8Accumulator::new();
        assert_eq!(&*acc.decode(b"ok\xE3\x81"), "ok");
        assert_eq!(acc.take_partial(), b"\xE3\x81".to_vec());
        assert_eq!(acc.pending_len(), 0);
    }
}
