//! ulight host - bindings for the ulight WebAssembly syntax highlighter.
//!
//! The highlighter ships as an ABI-only WebAssembly module that knows
//! nothing about host types. This crate provides:
//! - Memory views that never outlive a guest call
//! - An allocator bridge that frees every block with its original layout
//! - Strict UTF-8 marshaling, including streamed output
//! - Host callbacks installed into the guest's function table
//! - Request state construction and end-to-end invocation
//! - Decoding of the guest's language tables
//! - Module loading with a compiled-module cache
//!
//! ```no_run
//! use ulight_host::{BindingConfig, load_file};
//!
//! let mut highlighter = load_file("ulight.wasm", BindingConfig::default())?;
//! let html = highlighter.highlight("int main() {}", "cpp")?;
//! # Ok::<(), ulight_host::HighlightError>(())
//! ```

#![warn(missing_docs)]

pub mod abi;
pub mod alloc;
pub mod callback;
pub mod config;
pub mod error;
pub mod host;
pub mod invoke;
pub mod loader;
pub mod marshal;
pub mod memory;
pub mod registry;
pub mod runtime;
pub mod shared;
pub mod state;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use abi::{GuestStatus, LanguageId, Token};
pub use config::BindingConfig;
pub use error::{HighlightError, Result};
pub use invoke::Language;
pub use loader::{BoundInstance, load, load_file};
pub use registry::LanguageEntry;
pub use runtime::{CompiledModule, GuestRuntime, RuntimeConfig};
pub use shared::SharedHighlighter;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::abi::{GuestStatus, LanguageId, Token};
    pub use crate::config::BindingConfig;
    pub use crate::error::{HighlightError, Result};
    pub use crate::invoke::Language;
    pub use crate::loader::{BoundInstance, load, load_file};
    pub use crate::registry::LanguageEntry;
    pub use crate::runtime::{GuestRuntime, RuntimeConfig};
    pub use crate::shared::SharedHighlighter;
}
