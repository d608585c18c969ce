//! Error types for the ulight host bindings.
//!
//! Every error carries a stable code so that front ends can report failures
//! consistently. Only [`HighlightError::GuestFault`] invalidates a loaded
//! instance; everything else leaves it ready for the next call.

use crate::abi::GuestStatus;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HighlightError>;

/// The main error type for binding operations.
#[derive(Error, Debug)]
pub enum HighlightError {
    // =========================================================================
    // Loading Errors (E101-E199)
    // =========================================================================
    /// The engine rejected the module bytes.
    #[error("E101: Failed to compile guest module '{module}': {cause}")]
    Compile {
        /// Name of the module being compiled.
        module: String,
        /// Reason for the failure.
        cause: String,
    },

    /// Linking or instantiation failed.
    #[error("E102: Failed to instantiate guest module: {cause}")]
    Instantiate {
        /// Reason for the failure.
        cause: String,
    },

    /// A required export is absent or has the wrong type.
    #[error("E103: Guest module does not export '{name}': {cause}")]
    MissingExport {
        /// Name of the export.
        name: String,
        /// Why the lookup failed.
        cause: String,
    },

    /// Configuration was rejected before loading.
    #[error("E104: Invalid configuration: {cause}")]
    InvalidConfig {
        /// Description of the problem.
        cause: String,
    },

    /// The module file could not be read.
    #[error("E105: Failed to read guest module at {path}: {cause}")]
    Io {
        /// Path of the module file.
        path: PathBuf,
        /// Reason for the failure.
        cause: String,
    },

    // =========================================================================
    // Guest Memory Errors (E201-E299)
    // =========================================================================
    /// The guest allocator returned a null address.
    #[error("E201: Guest allocator failed: requested {requested} bytes aligned to {alignment}")]
    OutOfGuestMemory {
        /// Number of bytes requested.
        requested: u32,
        /// Requested alignment.
        alignment: u32,
    },

    /// A write did not fit into its allocation.
    #[error("E202: Allocation of {capacity} bytes is too small for {requested} bytes")]
    AllocationTooSmall {
        /// Size of the allocation.
        capacity: u32,
        /// Number of bytes that were to be written.
        requested: usize,
    },

    /// An address range lies outside the guest's linear memory.
    #[error(
        "E203: Guest memory access out of bounds: address={address}, length={length}, memory size={memory_size}"
    )]
    OutOfBounds {
        /// Start of the accessed range.
        address: u32,
        /// Length of the accessed range.
        length: u32,
        /// Current size of linear memory in bytes.
        memory_size: usize,
    },

    // =========================================================================
    // Text Errors (E301-E399)
    // =========================================================================
    /// Bytes crossing the boundary are not valid UTF-8.
    #[error("E301: Invalid UTF-8 crossing the guest boundary: {cause}")]
    InvalidUtf8 {
        /// Description of the malformed sequence.
        cause: String,
    },

    /// The guest does not know the requested language.
    #[error("E302: Unknown language '{name}'")]
    UnknownLanguage {
        /// The name that failed to resolve.
        name: String,
    },

    /// A token span does not fit the host's address space.
    #[error("E303: Token span overflows: begin={begin}, length={length}")]
    TokenOverflow {
        /// Offset of the first byte.
        begin: u32,
        /// Length in bytes.
        length: u32,
    },

    // =========================================================================
    // Invocation Errors (E401-E499)
    // =========================================================================
    /// The highlighting entry point returned a nonzero status.
    #[error("E401: Guest reported status {code}: {message}")]
    GuestReportedError {
        /// Raw status code.
        code: u32,
        /// Diagnostic text supplied by the guest.
        message: String,
    },

    /// An invocation was started while another one was in flight.
    #[error("E402: An invocation is already in flight on this instance")]
    Reentrant,

    // =========================================================================
    // Fatal Errors (E901-E999)
    // =========================================================================
    /// The guest trapped. The instance must be reloaded before further use.
    #[error("E901: Guest module faulted: {cause}")]
    GuestFault {
        /// Rendered trap or host-call failure.
        cause: String,
    },
}

impl HighlightError {
    /// Get the error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Compile { .. } => "E101",
            Self::Instantiate { .. } => "E102",
            Self::MissingExport { .. } => "E103",
            Self::InvalidConfig { .. } => "E104",
            Self::Io { .. } => "E105",
            Self::OutOfGuestMemory { .. } => "E201",
            Self::AllocationTooSmall { .. } => "E202",
            Self::OutOfBounds { .. } => "E203",
            Self::InvalidUtf8 { .. } => "E301",
            Self::UnknownLanguage { .. } => "E302",
            Self::TokenOverflow { .. } => "E303",
            Self::GuestReportedError { .. } => "E401",
            Self::Reentrant => "E402",
            Self::GuestFault { .. } => "E901",
        }
    }

    /// Check if this error invalidated the instance.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::GuestFault { .. })
    }

    /// Check if this error happened while loading a module.
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            Self::Compile { .. }
                | Self::Instantiate { .. }
                | Self::MissingExport { .. }
                | Self::InvalidConfig { .. }
                | Self::Io { .. }
        )
    }

    /// Decode the guest status of a [`HighlightError::GuestReportedError`].
    pub fn guest_status(&self) -> Option<GuestStatus> {
        match self {
            Self::GuestReportedError { code, .. } => Some(GuestStatus::from(*code)),
            _ => None,
        }
    }

    /// Wrap an error raised by a guest call.
    pub(crate) fn fault(err: impl std::fmt::Display) -> Self {
        Self::GuestFault {
            cause: format!("{err:#}"),
        }
    }
}
