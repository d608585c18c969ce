//! Construction of the `ulight_state` request record.

use crate::abi::{GuestStatus, LanguageId, RequestState, TOKEN_SIZE};
use crate::alloc::{Allocation, AllocatorBridge};
use crate::callback::CallbackSlot;
use crate::error::{HighlightError, Result};
use crate::marshal;
use crate::memory::MemoryView;
use wasmtime::{AsContext, AsContextMut, TypedFunc};

/// The guest's own constructor and destructor for the request record.
#[derive(Clone)]
pub struct GuestStateFns {
    /// `ulight_new() -> ulight_state*`.
    pub new_state: TypedFunc<(), u32>,
    /// `ulight_delete(ulight_state*)`.
    pub delete_state: TypedFunc<u32, ()>,
}

/// Host-owned fields of one request.
pub struct Request<'a> {
    /// UTF-8 source text.
    pub source: &'a Allocation,
    /// Language of the source.
    pub language: LanguageId,
    /// Scratch buffer for tokens.
    pub token_buffer: &'a Allocation,
    /// Trampoline receiving full token buffers, for token requests.
    pub flush_tokens: Option<CallbackSlot>,
    /// Output buffer for HTML, for HTML requests.
    pub text_buffer: Option<&'a Allocation>,
    /// Trampoline receiving full text buffers, for HTML requests.
    pub flush_text: Option<CallbackSlot>,
}

/// A `ulight_state` record living in guest memory.
#[derive(Debug)]
#[must_use = "request records must be released"]
pub enum StateRecord {
    /// Created by the guest's `ulight_new`, which also set the defaults.
    Guest {
        /// Address of the record.
        address: u32,
    },
    /// Allocated and zeroed by the host.
    Host(Allocation),
}

impl StateRecord {
    /// Obtain a fresh record.
    ///
    /// Uses `ulight_new` when the guest exports it, otherwise allocates
    /// the record through the allocator and zero-fills it.
    pub fn create<S: AsContextMut>(
        store: &mut S,
        allocator: &mut AllocatorBridge,
        fns: Option<&GuestStateFns>,
    ) -> Result<Self> {
        if let Some(fns) = fns {
            let address = fns
                .new_state
                .call(&mut *store, ())
                .map_err(HighlightError::fault)?;
            if address == 0 {
                return Err(HighlightError::OutOfGuestMemory {
                    requested: RequestState::SIZE,
                    alignment: RequestState::ALIGN,
                });
            }
            return Ok(Self::Guest { address });
        }

        let allocation = allocator.allocate(store, RequestState::SIZE, RequestState::ALIGN)?;
        if let Err(err) = allocator.zero(store, &allocation) {
            if let Err(release) = allocator.free(store, allocation) {
                tracing::error!(error = %release, "Failed to release request state");
            }
            return Err(err);
        }
        Ok(Self::Host(allocation))
    }

    /// Guest address of the record.
    pub fn address(&self) -> u32 {
        match self {
            Self::Guest { address } => *address,
            Self::Host(allocation) => allocation.address(),
        }
    }

    /// Write the host-owned fields of `request`.
    ///
    /// The HTML tag and attribute name fields are left untouched.
    pub fn write<S: AsContextMut>(
        &self,
        store: &mut S,
        memory: &MemoryView,
        request: &Request<'_>,
    ) -> Result<()> {
        let base = self.address();
        let slot = |slot: Option<CallbackSlot>| slot.map_or(0, CallbackSlot::index);
        let (text_address, text_length) = request
            .text_buffer
            .map_or((0, 0), |buffer| (buffer.address(), buffer.size()));

        let fields = [
            (RequestState::SOURCE, request.source.address()),
            (RequestState::SOURCE_LENGTH, request.source.size()),
            (RequestState::LANG, request.language.get()),
            (RequestState::FLAGS, 0),
            (RequestState::TOKEN_BUFFER, request.token_buffer.address()),
            (
                RequestState::TOKEN_BUFFER_LENGTH,
                request.token_buffer.size() / TOKEN_SIZE,
            ),
            (RequestState::TEXT_BUFFER, text_address),
            (RequestState::TEXT_BUFFER_LENGTH, text_length),
            (RequestState::FLUSH_TEXT, slot(request.flush_text)),
        ];
        for (offset, value) in fields {
            memory.write_word(store, base + offset, value)?;
        }

        // Words 6 and 7 stay guest-owned unless tokens are requested.
        if let Some(flush_tokens) = request.flush_tokens {
            memory.write_word(store, base + RequestState::FLUSH_TOKENS_DATA, 0)?;
            memory.write_word(store, base + RequestState::FLUSH_TOKENS, flush_tokens.index())?;
        }
        Ok(())
    }

    /// Build the error for a nonzero `status` from the record's error fields.
    pub fn guest_error<S: AsContext>(
        &self,
        store: &S,
        memory: &MemoryView,
        status: u32,
    ) -> HighlightError {
        let message = self
            .error_message(store, memory)
            .unwrap_or_else(|err| {
                tracing::debug!(error = %err, "Unreadable guest error message");
                None
            })
            .unwrap_or_else(|| GuestStatus::from(status).to_string());
        HighlightError::GuestReportedError {
            code: status,
            message,
        }
    }

    /// Read the error message the guest left in the record, if any.
    pub fn error_message<S: AsContext>(
        &self,
        store: &S,
        memory: &MemoryView,
    ) -> Result<Option<String>> {
        let base = self.address();
        let address = memory.read_word(store, base + RequestState::ERROR)?;
        let length = memory.read_word(store, base + RequestState::ERROR_LENGTH)?;
        if address == 0 || length == 0 {
            return Ok(None);
        }
        marshal::from_guest(memory, store, address, length).map(Some)
    }

    /// Return the record to whoever created it.
    pub fn release<S: AsContextMut>(
        self,
        store: &mut S,
        allocator: &mut AllocatorBridge,
        fns: Option<&GuestStateFns>,
    ) -> Result<()> {
        match self {
            Self::Guest { address } => {
                let fns = fns.ok_or_else(|| HighlightError::GuestFault {
                    cause: "request state created by the guest but ulight_delete is missing"
                        .to_string(),
                })?;
                fns.delete_state
                    .call(&mut *store, address)
                    .map_err(HighlightError::fault)
            }
            Self::Host(allocation) => allocator.free(store, allocation),
        }
    }
}
