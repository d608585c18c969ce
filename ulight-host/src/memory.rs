//! Views over the guest's linear memory.
//!
//! Linear memory can move whenever the guest grows it, which can happen
//! during any guest call. Views are therefore only handed out inside a
//! closure and are rebuilt from the store on every access.

use crate::abi::{WORD_SIZE, decode_word, encode_word};
use crate::error::{HighlightError, Result};
use std::ops::Range;
use wasmtime::{AsContext, AsContextMut, Memory};

/// Word-granular view over guest memory.
///
/// Indices count 4-byte words from address 0, so word `i` lives at byte
/// address `4 * i`.
#[derive(Clone, Copy)]
pub struct Words<'a> {
    bytes: &'a [u8],
}

impl Words<'_> {
    /// Read the word at `index`.
    pub fn get(&self, index: u32) -> Option<u32> {
        let start = (index as usize).checked_mul(WORD_SIZE as usize)?;
        let chunk = self.bytes.get(start..start + WORD_SIZE as usize)?;
        Some(decode_word(chunk.try_into().ok()?))
    }

    /// Number of whole words in the view.
    pub fn len(&self) -> usize {
        self.bytes.len() / WORD_SIZE as usize
    }

    /// Check if the view holds no whole word.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Zero-ownership accessor for the guest's linear memory.
#[derive(Debug, Clone, Copy)]
pub struct MemoryView {
    memory: Memory,
}

impl MemoryView {
    /// Create a view accessor for `memory`.
    pub fn new(memory: Memory) -> Self {
        Self { memory }
    }

    /// Get the underlying memory handle.
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Run `f` over the current bytes of linear memory.
    pub fn with_bytes<S: AsContext, R>(&self, store: &S, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.memory.data(store))
    }

    /// Run `f` over the current bytes of linear memory, mutably.
    pub fn with_bytes_mut<S: AsContextMut, R>(
        &self,
        store: &mut S,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> R {
        f(self.memory.data_mut(store))
    }

    /// Run `f` over a word-granular view of linear memory.
    pub fn with_words<S: AsContext, R>(&self, store: &S, f: impl FnOnce(Words<'_>) -> R) -> R {
        self.with_bytes(store, |bytes| f(Words { bytes }))
    }

    /// Current size of linear memory in bytes.
    pub fn size<S: AsContext>(&self, store: &S) -> usize {
        self.memory.data_size(store)
    }

    /// Copy `length` bytes starting at `address` out of guest memory.
    pub fn read<S: AsContext>(&self, store: &S, address: u32, length: u32) -> Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        self.with_bytes(store, |bytes| {
            byte_range(address, length)
                .and_then(|range| bytes.get(range))
                .map(<[u8]>::to_vec)
                .ok_or(HighlightError::OutOfBounds {
                    address,
                    length,
                    memory_size: bytes.len(),
                })
        })
    }

    /// Read the little-endian word at byte `address`.
    pub fn read_word<S: AsContext>(&self, store: &S, address: u32) -> Result<u32> {
        if address % WORD_SIZE == 0 {
            if let Some(word) = self.with_words(store, |words| words.get(address / WORD_SIZE)) {
                return Ok(word);
            }
        }
        let bytes = self.read(store, address, WORD_SIZE)?;
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes);
        Ok(decode_word(word))
    }

    /// Copy `data` into guest memory at `address`.
    pub fn write<S: AsContextMut>(&self, store: &mut S, address: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let length = u32::try_from(data.len()).map_err(|_| HighlightError::OutOfBounds {
            address,
            length: u32::MAX,
            memory_size: self.size(store),
        })?;
        self.with_bytes_mut(store, |bytes| {
            let memory_size = bytes.len();
            let dest = byte_range(address, length)
                .and_then(|range| bytes.get_mut(range))
                .ok_or(HighlightError::OutOfBounds {
                    address,
                    length,
                    memory_size,
                })?;
            dest.copy_from_slice(data);
            Ok(())
        })
    }

    /// Write a little-endian word at byte `address`.
    pub fn write_word<S: AsContextMut>(&self, store: &mut S, address: u32, value: u32) -> Result<()> {
        self.write(store, address, &encode_word(value))
    }
}

fn byte_range(address: u32, length: u32) -> Option<Range<usize>> {
    let start = address as usize;
    let end = start.checked_add(length as usize)?;
    Some(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::{MemoryType, Store};

    fn memory_with_pages(pages: u32) -> (Store<()>, MemoryView) {
        let mut store = Store::<()>::default();
        let memory = Memory::new(&mut store, MemoryType::new(pages, None)).expect("memory");
        (store, MemoryView::new(memory))
    }

    #[test]
    fn write_then_read_bytes() {
        let (mut store, view) = memory_with_pages(1);
        view.write(&mut store, 100, b"hello").unwrap();
        assert_eq!(view.read(&store, 100, 5).unwrap(), b"hello");
        assert_eq!(view.read(&store, 100, 0).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn words_are_little_endian() {
        let (mut store, view) = memory_with_pages(1);
        view.write_word(&mut store, 8, 0xDEAD_BEEF).unwrap();
        assert_eq!(view.read(&store, 8, 4).unwrap(), [0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(view.read_word(&store, 8).unwrap(), 0xDEAD_BEEF);
        assert_eq!(view.with_words(&store, |words| words.get(2)), Some(0xDEAD_BEEF));
    }

    #[test]
    fn unaligned_word_reads_fall_back_to_bytes() {
        let (mut store, view) = memory_with_pages(1);
        view.write_word(&mut store, 13, 42).unwrap();
        assert_eq!(view.read_word(&store, 13).unwrap(), 42);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let (mut store, view) = memory_with_pages(1);
        let size = view.size(&store) as u32;

        let err = view.read(&store, size - 2, 4).unwrap_err();
        assert!(matches!(err, HighlightError::OutOfBounds { length: 4, .. }));

        let err = view.write(&mut store, u32::MAX, b"ab").unwrap_err();
        assert!(matches!(err, HighlightError::OutOfBounds { .. }));

        assert!(view.read_word(&store, size).is_err());
    }

    #[test]
    fn views_follow_memory_growth() {
        let (mut store, view) = memory_with_pages(1);
        let before = view.with_words(&store, |words| words.len());
        view.memory().grow(&mut store, 1).unwrap();
        let after = view.with_words(&store, |words| words.len());
        assert_eq!(after, before * 2);

        let address = 65536 + 16;
        view.write(&mut store, address, b"grown").unwrap();
        assert_eq!(view.read(&store, address, 5).unwrap(), b"grown");
    }
}
