//! Per-instance binding configuration.

use crate::abi::TOKEN_SIZE;
use crate::error::{HighlightError, Result};
use std::env;

/// Default size of the text and token buffers (64 KiB).
pub const DEFAULT_BUFFER_SIZE: u32 = 64 * 1024;

/// Default maximum memory pages (64 KiB per page).
pub const DEFAULT_MAX_MEMORY_PAGES: u32 = 1024; // 64 MiB

/// Configuration for one bound guest instance.
///
/// Buffer sizes bound the size of each streamed chunk, not the size of the
/// output: the guest flushes whenever a buffer fills up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingConfig {
    /// Size in bytes of the HTML output buffer.
    pub text_buffer_size: u32,
    /// Size in bytes of the token scratch buffer.
    pub token_buffer_size: u32,
    /// Maximum linear memory the guest may grow to, in pages.
    pub max_memory_pages: u32,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            text_buffer_size: DEFAULT_BUFFER_SIZE,
            token_buffer_size: DEFAULT_BUFFER_SIZE,
            max_memory_pages: DEFAULT_MAX_MEMORY_PAGES,
        }
    }
}

impl BindingConfig {
    /// Set the text buffer size.
    pub fn with_text_buffer_size(mut self, bytes: u32) -> Self {
        self.text_buffer_size = bytes;
        self
    }

    /// Set the token buffer size.
    pub fn with_token_buffer_size(mut self, bytes: u32) -> Self {
        self.token_buffer_size = bytes;
        self
    }

    /// Set maximum memory pages.
    pub fn with_max_memory_pages(mut self, pages: u32) -> Self {
        self.max_memory_pages = pages;
        self
    }

    /// Create configuration from environment variables.
    ///
    /// Environment variables:
    /// - `ULIGHT_TEXT_BUFFER_SIZE`: text buffer size in bytes
    /// - `ULIGHT_TOKEN_BUFFER_SIZE`: token buffer size in bytes
    /// - `ULIGHT_MAX_MEMORY_PAGES`: linear memory limit in 64 KiB pages
    ///
    /// Unset variables keep their defaults; unparsable ones are an error.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            text_buffer_size: env_u32("ULIGHT_TEXT_BUFFER_SIZE")?
                .unwrap_or(defaults.text_buffer_size),
            token_buffer_size: env_u32("ULIGHT_TOKEN_BUFFER_SIZE")?
                .unwrap_or(defaults.token_buffer_size),
            max_memory_pages: env_u32("ULIGHT_MAX_MEMORY_PAGES")?
                .unwrap_or(defaults.max_memory_pages),
        })
    }

    /// Check the configuration before it is used to load a module.
    pub fn validate(&self) -> Result<()> {
        if self.text_buffer_size == 0 {
            return Err(HighlightError::InvalidConfig {
                cause: "text_buffer_size must be nonzero".to_string(),
            });
        }
        if self.token_buffer_size < TOKEN_SIZE {
            return Err(HighlightError::InvalidConfig {
                cause: format!(
                    "token_buffer_size must hold at least one token ({TOKEN_SIZE} bytes), got {}",
                    self.token_buffer_size
                ),
            });
        }
        if self.max_memory_pages == 0 {
            return Err(HighlightError::InvalidConfig {
                cause: "max_memory_pages must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Number of tokens the token buffer holds.
    pub fn token_capacity(&self) -> u32 {
        self.token_buffer_size / TOKEN_SIZE
    }
}

fn env_u32(name: &str) -> Result<Option<u32>> {
    match env::var(name) {
        Ok(value) => parse_u32(name, &value).map(Some),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(HighlightError::InvalidConfig {
            cause: format!("{name}: {e}"),
        }),
    }
}

fn parse_u32(name: &str, value: &str) -> Result<u32> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|e| HighlightError::InvalidConfig {
            cause: format!("{name}={value:?}: {e}"),
        })
}
