//! UTF-8 boundary handling for byte streams sent as JSON strings.
//!
//! A pty read can end in the middle of a multibyte character. Sending that
//! chunk as-is would turn both halves into replacement characters, so the
//! incomplete tail is held back and prepended to the next chunk.

/// Splits a byte stream on UTF-8 character boundaries.
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    /// Creates an empty chunker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns the bytes that are safe to emit now.
    ///
    /// The result may be empty when the whole input is the start of a
    /// character that has not been completed yet.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);
        let keep = incomplete_tail_len(&buf);
        self.pending = buf.split_off(buf.len() - keep);
        buf
    }

    /// Returns whatever is still held back. Call once the stream has ended.
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    /// Number of bytes currently held back.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Length of a trailing lead byte plus continuations that do not yet form a
/// full character. Invalid sequences report 0 and are passed through.
fn incomplete_tail_len(buf: &[u8]) -> usize {
    let len = buf.len();
    for back in 1..=len.min(3) {
        let byte = buf[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            b if b & 0x80 == 0x00 => 1,
            b if b & 0xE0 == 0xC0 => 2,
            b if b & 0xF0 == 0xE0 => 3,
            b if b & 0xF8 == 0xF0 => 4,
            _ => return 0,
        };
        return if needed > back { back } else { 0 };
    }
    0
}
