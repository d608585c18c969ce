//! Binary contract with the ulight guest module.
//!
//! The guest is compiled for wasm32, so every pointer and `size_t` is a
//! little-endian 4-byte word. Layouts here mirror the C declarations in
//! `ulight.h` and are checked at compile time.

use crate::error::{HighlightError, Result};
use serde::Serialize;
use std::fmt;
use std::mem::{offset_of, size_of};

/// Guest export names.
pub mod exports {
    /// Linear memory.
    pub const MEMORY: &str = "memory";
    /// Indirect function table that callbacks are installed into.
    pub const FUNCTION_TABLE: &str = "__indirect_function_table";
    /// Optional reactor initialization entry point.
    pub const INITIALIZE: &str = "_initialize";
    /// `void* ulight_alloc(size_t size, size_t alignment)`.
    pub const ALLOC: &str = "ulight_alloc";
    /// `void ulight_free(void* pointer, size_t size, size_t alignment)`.
    pub const FREE: &str = "ulight_free";
    /// `ulight_state* ulight_new(void)`.
    pub const NEW_STATE: &str = "ulight_new";
    /// `void ulight_delete(ulight_state*)`.
    pub const DELETE_STATE: &str = "ulight_delete";
    /// `ulight_status ulight_source_to_html(ulight_state*)`.
    pub const SOURCE_TO_HTML: &str = "ulight_source_to_html";
    /// `ulight_status ulight_source_to_tokens(ulight_state*)`.
    pub const SOURCE_TO_TOKENS: &str = "ulight_source_to_tokens";
    /// `ulight_lang ulight_get_lang(const char*, size_t)`.
    pub const GET_LANG: &str = "ulight_get_lang";
    /// `ulight_lang ulight_lang_from_path(const char*, size_t)`.
    pub const LANG_FROM_PATH: &str = "ulight_lang_from_path";
    /// Global holding the address of the language list.
    pub const LANG_LIST: &str = "ulight_lang_list";
    /// Global holding the address of the language list length.
    pub const LANG_LIST_LENGTH: &str = "ulight_lang_list_length";
    /// Global holding the address of the display-name table.
    pub const LANG_DISPLAY_NAMES: &str = "ulight_lang_display_names";
}

/// Imports the guest may declare that the host answers with real behavior.
pub mod imports {
    /// Emscripten allocator notification, sent after `memory.grow`.
    pub const NOTIFY_MEMORY_GROWTH: (&str, &str) = ("env", "emscripten_notify_memory_growth");
}

/// Size of one guest word in bytes.
pub const WORD_SIZE: u32 = 4;

/// In-memory layout of `ulight_state` on wasm32.
///
/// The struct is never instantiated on the host; it exists so the field
/// offsets used when writing the record are derived from one declaration.
#[repr(C)]
#[allow(dead_code)]
pub struct RequestState {
    source: u32,
    source_length: u32,
    lang: u32,
    flags: u32,
    token_buffer: u32,
    token_buffer_length: u32,
    flush_tokens_data: u32,
    flush_tokens: u32,
    html_tag_name: u32,
    html_tag_name_length: u32,
    html_attr_name: u32,
    html_attr_name_length: u32,
    text_buffer: u32,
    text_buffer_length: u32,
    flush_text_data: u32,
    flush_text: u32,
    error: u32,
    error_length: u32,
}

impl RequestState {
    /// Size of the record in bytes.
    pub const SIZE: u32 = size_of::<RequestState>() as u32;
    /// Alignment of the record.
    pub const ALIGN: u32 = WORD_SIZE;

    /// Byte offset of the source pointer.
    pub const SOURCE: u32 = offset_of!(RequestState, source) as u32;
    /// Byte offset of the source length.
    pub const SOURCE_LENGTH: u32 = offset_of!(RequestState, source_length) as u32;
    /// Byte offset of the language id.
    pub const LANG: u32 = offset_of!(RequestState, lang) as u32;
    /// Byte offset of the flag bits.
    pub const FLAGS: u32 = offset_of!(RequestState, flags) as u32;
    /// Byte offset of the token buffer pointer.
    pub const TOKEN_BUFFER: u32 = offset_of!(RequestState, token_buffer) as u32;
    /// Byte offset of the token buffer length (in tokens).
    pub const TOKEN_BUFFER_LENGTH: u32 = offset_of!(RequestState, token_buffer_length) as u32;
    /// Byte offset of the context passed to the token flush callback.
    pub const FLUSH_TOKENS_DATA: u32 = offset_of!(RequestState, flush_tokens_data) as u32;
    /// Byte offset of the token flush callback slot.
    pub const FLUSH_TOKENS: u32 = offset_of!(RequestState, flush_tokens) as u32;
    /// Byte offset of the text buffer pointer.
    pub const TEXT_BUFFER: u32 = offset_of!(RequestState, text_buffer) as u32;
    /// Byte offset of the text buffer length.
    pub const TEXT_BUFFER_LENGTH: u32 = offset_of!(RequestState, text_buffer_length) as u32;
    /// Byte offset of the text flush callback slot.
    pub const FLUSH_TEXT: u32 = offset_of!(RequestState, flush_text) as u32;
    /// Byte offset of the error message pointer.
    pub const ERROR: u32 = offset_of!(RequestState, error) as u32;
    /// Byte offset of the error message length.
    pub const ERROR_LENGTH: u32 = offset_of!(RequestState, error_length) as u32;
}

const _: () = {
    assert!(RequestState::SIZE == 18 * WORD_SIZE);
    assert!(RequestState::SOURCE == 0);
    assert!(RequestState::SOURCE_LENGTH == WORD_SIZE);
    assert!(RequestState::LANG == 2 * WORD_SIZE);
    assert!(RequestState::FLAGS == 3 * WORD_SIZE);
    assert!(RequestState::TOKEN_BUFFER == 4 * WORD_SIZE);
    assert!(RequestState::TOKEN_BUFFER_LENGTH == 5 * WORD_SIZE);
    assert!(RequestState::FLUSH_TOKENS_DATA == 6 * WORD_SIZE);
    assert!(RequestState::FLUSH_TOKENS == 7 * WORD_SIZE);
    assert!(RequestState::TEXT_BUFFER == 12 * WORD_SIZE);
    assert!(RequestState::TEXT_BUFFER_LENGTH == 13 * WORD_SIZE);
    assert!(RequestState::FLUSH_TEXT == 15 * WORD_SIZE);
    assert!(RequestState::ERROR == 16 * WORD_SIZE);
    assert!(RequestState::ERROR_LENGTH == 17 * WORD_SIZE);
};

/// One `ulight_lang_entry`: name pointer, name length, language id.
pub const LANG_ENTRY_SIZE: u32 = 3 * WORD_SIZE;

/// One `ulight_string_view` in the display-name table: pointer, length.
pub const DISPLAY_NAME_ENTRY_SIZE: u32 = 2 * WORD_SIZE;

/// One `ulight_token`: begin, length, type byte, padding.
pub const TOKEN_SIZE: u32 = 3 * WORD_SIZE;

/// Alignment of `ulight_token`.
pub const TOKEN_ALIGN: u32 = WORD_SIZE;

/// One highlighted span produced by `ulight_source_to_tokens`.
///
/// `begin` and `length` are byte offsets into the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Token {
    /// Offset of the first byte of the span.
    pub begin: u32,
    /// Length of the span in bytes.
    pub length: u32,
    /// Guest highlight type (`ulight_highlight_type`).
    pub kind: u8,
}

impl Token {
    /// Decode a token from its 12-byte guest record.
    pub fn from_record(record: &[u8; TOKEN_SIZE as usize]) -> Self {
        Self {
            begin: decode_word([record[0], record[1], record[2], record[3]]),
            length: decode_word([record[4], record[5], record[6], record[7]]),
            kind: record[8],
        }
    }

    /// Byte range of the span within the source.
    pub fn range(&self) -> Result<std::ops::Range<usize>> {
        let overflow = || HighlightError::TokenOverflow {
            begin: self.begin,
            length: self.length,
        };
        let begin = usize::try_from(self.begin).map_err(|_| overflow())?;
        let length = usize::try_from(self.length).map_err(|_| overflow())?;
        let end = begin.checked_add(length).ok_or_else(overflow)?;
        Ok(begin..end)
    }
}

/// Numeric language identifier used by the guest.
///
/// `0` is the sentinel meaning "no language".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct LanguageId(u32);

impl LanguageId {
    /// The sentinel "no language" id.
    pub const NONE: Self = Self(0);

    /// Wrap a raw id.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Wrap a raw id, mapping the sentinel to `None`.
    pub const fn known(raw: u32) -> Option<Self> {
        if raw == 0 { None } else { Some(Self(raw)) }
    }

    /// Get the raw id.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Check if this is the sentinel.
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for LanguageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<LanguageId> for u32 {
    fn from(id: LanguageId) -> Self {
        id.0
    }
}

/// Status codes returned by the guest's highlighting entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestStatus {
    /// Highlighting completed.
    Ok,
    /// An output buffer was not set up properly.
    BadBuffer,
    /// The language id is invalid.
    BadLang,
    /// The source is not valid UTF-8.
    BadText,
    /// Some other part of the state is invalid.
    BadState,
    /// The code is malformed.
    BadCode,
    /// The guest ran out of memory while highlighting.
    BadAlloc,
    /// Anything else.
    InternalError,
    /// A code this binding does not know.
    Unknown(u32),
}

impl From<u32> for GuestStatus {
    fn from(code: u32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::BadBuffer,
            2 => Self::BadLang,
            3 => Self::BadText,
            4 => Self::BadState,
            5 => Self::BadCode,
            6 => Self::BadAlloc,
            7 => Self::InternalError,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for GuestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::BadBuffer => f.write_str("bad buffer"),
            Self::BadLang => f.write_str("bad language"),
            Self::BadText => f.write_str("bad text"),
            Self::BadState => f.write_str("bad state"),
            Self::BadCode => f.write_str("bad code"),
            Self::BadAlloc => f.write_str("bad alloc"),
            Self::InternalError => f.write_str("internal error"),
            Self::Unknown(code) => write!(f, "unknown status {code}"),
        }
    }
}

/// Decode a little-endian guest word.
#[inline]
pub fn decode_word(bytes: [u8; 4]) -> u32 {
    u32::from_le_bytes(bytes)
}

/// Encode a guest word.
#[inline]
pub fn encode_word(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_layout_matches_header() {
        assert_eq!(RequestState::SIZE, 72);
        assert_eq!(RequestState::TEXT_BUFFER, 48);
        assert_eq!(RequestState::FLUSH_TEXT, 60);
        assert_eq!(RequestState::ERROR_LENGTH, 68);
    }

    #[test]
    fn language_id_sentinel() {
        assert_eq!(LanguageId::known(0), None);
        assert_eq!(LanguageId::known(4), Some(LanguageId::new(4)));
        assert!(LanguageId::NONE.is_none());
        assert_eq!(LanguageId::new(7).to_string(), "7");
    }

    #[test]
    fn status_conversion() {
        assert_eq!(GuestStatus::from(0), GuestStatus::Ok);
        assert_eq!(GuestStatus::from(2), GuestStatus::BadLang);
        assert_eq!(GuestStatus::from(7), GuestStatus::InternalError);
        assert_eq!(GuestStatus::from(42), GuestStatus::Unknown(42));
        assert_eq!(GuestStatus::BadAlloc.to_string(), "bad alloc");
    }

    #[test]
    fn token_record_decoding() {
        let mut record = [0u8; 12];
        record[..4].copy_from_slice(&encode_word(5));
        record[4..8].copy_from_slice(&encode_word(3));
        record[8] = 0x11;
        record[9] = 0xAA;

        let token = Token::from_record(&record);
        assert_eq!(
            token,
            Token {
                begin: 5,
                length: 3,
                kind: 0x11
            }
        );
        assert_eq!(token.range().unwrap(), 5..8);
    }

    #[cfg(target_pointer_width = "32")]
    #[test]
    fn token_range_overflow_is_an_error() {
        let token = Token {
            begin: u32::MAX,
            length: 1,
            kind: 1,
        };
        let err = token.range().unwrap_err();
        assert_eq!(err.code(), "E303");
    }

    #[test]
    fn token_range_at_word_limit() {
        let token = Token {
            begin: u32::MAX - 1,
            length: 1,
            kind: 1,
        };
        let range = token.range().unwrap();
        assert_eq!(range.end - range.start, 1);
    }

    #[test]
    fn language_id_honours_width() {
        assert_eq!(format!("[{:>4}]", LanguageId::new(7)), "[   7]");
        assert_eq!(format!("[{:<3}]", LanguageId::new(42)), "[42 ]");
    }

    #[test]
    fn word_encoding_is_little_endian() {
        assert_eq!(encode_word(0x0102_0304), [4, 3, 2, 1]);
        assert_eq!(decode_word([4, 3, 2, 1]), 0x0102_0304);
    }
}
