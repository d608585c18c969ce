//! UTF-8 marshaling across the guest boundary.
//!
//! Host text enters the guest as a byte allocation with alignment 1 and is
//! read back with strict decoding. No replacement characters are ever
//! substituted: malformed input is an [`HighlightError::InvalidUtf8`].

use crate::alloc::{Allocation, AllocatorBridge};
use crate::error::{HighlightError, Result};
use crate::memory::MemoryView;
use wasmtime::{AsContext, AsContextMut};

/// Copy `text` into a fresh guest allocation.
pub fn to_guest<S: AsContextMut>(
    allocator: &mut AllocatorBridge,
    store: &mut S,
    text: &str,
) -> Result<Allocation> {
    bytes_to_guest(allocator, store, text.as_bytes())
}

/// Copy raw `bytes` into a fresh guest allocation.
///
/// The bytes are not validated; the guest reports malformed text itself.
pub fn bytes_to_guest<S: AsContextMut>(
    allocator: &mut AllocatorBridge,
    store: &mut S,
    bytes: &[u8],
) -> Result<Allocation> {
    let size = u32::try_from(bytes.len()).map_err(|_| HighlightError::OutOfGuestMemory {
        requested: u32::MAX,
        alignment: 1,
    })?;

    let allocation = allocator.allocate(store, size, 1)?;
    if let Err(err) = allocator.write_bytes(store, &allocation, bytes) {
        if let Err(release) = allocator.free(store, allocation) {
            tracing::error!(error = %release, "Failed to release input buffer");
        }
        return Err(err);
    }
    Ok(allocation)
}

/// Decode `length` bytes at `address` as UTF-8.
pub fn from_guest<S: AsContext>(
    memory: &MemoryView,
    store: &S,
    address: u32,
    length: u32,
) -> Result<String> {
    let bytes = memory.read(store, address, length)?;
    String::from_utf8(bytes).map_err(|e| HighlightError::InvalidUtf8 {
        cause: e.utf8_error().to_string(),
    })
}

/// Incremental strict UTF-8 decoder for streamed output.
///
/// The guest flushes its text buffer whenever it fills up, which may split
/// a multi-byte sequence across two chunks. The incomplete tail of one
/// chunk is held back and prefixed to the next.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
    output: String,
}

impl Utf8StreamDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Result<()> {
        let joined;
        let input: &[u8] = if self.pending.is_empty() {
            chunk
        } else {
            let mut buffer = std::mem::take(&mut self.pending);
            buffer.extend_from_slice(chunk);
            joined = buffer;
            &joined
        };

        match std::str::from_utf8(input) {
            Ok(text) => self.output.push_str(text),
            Err(e) if e.error_len().is_none() => {
                let (complete, tail) = input.split_at(e.valid_up_to());
                let text = std::str::from_utf8(complete).map_err(invalid)?;
                self.output.push_str(text);
                self.pending = tail.to_vec();
            }
            Err(e) => return Err(invalid(e)),
        }
        Ok(())
    }

    /// Number of bytes held back waiting for the rest of a sequence.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of decoded bytes so far.
    pub fn len(&self) -> usize {
        self.output.len()
    }

    /// Check if nothing has been decoded yet.
    pub fn is_empty(&self) -> bool {
        self.output.is_empty()
    }

    /// Finish decoding, rejecting a dangling partial sequence.
    pub fn finish(self) -> Result<String> {
        if !self.pending.is_empty() {
            return Err(HighlightError::InvalidUtf8 {
                cause: format!(
                    "stream ended inside a multi-byte sequence ({} trailing bytes)",
                    self.pending.len()
                ),
            });
        }
        Ok(self.output)
    }
}

fn invalid(e: std::str::Utf8Error) -> HighlightError {
    HighlightError::InvalidUtf8 {
        cause: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::{Memory, MemoryType, Store};

    #[test]
    fn whole_chunks_pass_through() {
        let mut decoder = Utf8StreamDecoder::new();
        decoder.push(b"hello, ").unwrap();
        decoder.push(b"world").unwrap();
        assert_eq!(decoder.len(), 12);
        assert_eq!(decoder.finish().unwrap(), "hello, world");
    }

    #[test]
    fn split_sequences_are_carried_over() {
        let text = "a\u{00e9}\u{20ac}\u{1f600}z";
        let bytes = text.as_bytes();

        let mut decoder = Utf8StreamDecoder::new();
        for byte in bytes {
            decoder.push(std::slice::from_ref(byte)).unwrap();
        }
        assert_eq!(decoder.pending_len(), 0);
        assert_eq!(decoder.finish().unwrap(), text);

        // Cut after the first byte of the two-byte sequence.
        let mut decoder = Utf8StreamDecoder::new();
        decoder.push(&bytes[..2]).unwrap();
        assert_eq!(decoder.pending_len(), 1);
        assert_eq!(decoder.len(), 1);
        decoder.push(&bytes[2..]).unwrap();
        assert_eq!(decoder.pending_len(), 0);
        assert_eq!(decoder.finish().unwrap(), text);

        // Cut two bytes into the four-byte sequence.
        let emoji = text.find('\u{1f600}').unwrap();
        let mut decoder = Utf8StreamDecoder::new();
        decoder.push(&bytes[..emoji + 2]).unwrap();
        assert_eq!(decoder.pending_len(), 2);
        decoder.push(&bytes[emoji + 2..emoji + 3]).unwrap();
        assert_eq!(decoder.pending_len(), 3);
        decoder.push(&bytes[emoji + 3..]).unwrap();
        assert_eq!(decoder.finish().unwrap(), text);
    }

    #[test]
    fn invalid_bytes_are_rejected() {
        let mut decoder = Utf8StreamDecoder::new();
        let err = decoder.push(&[b'a', 0xFF, b'b']).unwrap_err();
        assert!(matches!(err, HighlightError::InvalidUtf8 { .. }));

        let mut decoder = Utf8StreamDecoder::new();
        decoder.push(&[0xE2, 0x82]).unwrap();
        assert!(decoder.push(b"x").is_err());
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let mut decoder = Utf8StreamDecoder::new();
        decoder.push(&[b'a', 0xF0, 0x9F]).unwrap();
        let err = decoder.finish().unwrap_err();
        assert_eq!(err.code(), "E301");
    }

    #[test]
    fn from_guest_is_strict() {
        let mut store = Store::<()>::default();
        let memory = Memory::new(&mut store, MemoryType::new(1, None)).expect("memory");
        let view = MemoryView::new(memory);

        view.write(&mut store, 64, "caf\u{00e9}".as_bytes()).unwrap();
        assert_eq!(from_guest(&view, &store, 64, 5).unwrap(), "caf\u{00e9}");
        assert_eq!(from_guest(&view, &store, 64, 0).unwrap(), "");

        let err = from_guest(&view, &store, 64, 4).unwrap_err();
        assert!(matches!(err, HighlightError::InvalidUtf8 { .. }));
    }
}
