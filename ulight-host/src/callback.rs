//! Host trampolines installed into the guest's indirect function table.
//!
//! The guest streams output by calling a function pointer stored in the
//! request state. On wasm32 a function pointer is an index into
//! `__indirect_function_table`, so the host grows that table, places its
//! trampolines in the new slots and writes the slot numbers into each
//! request.

use crate::abi::{TOKEN_SIZE, Token};
use crate::error::{HighlightError, Result};
use crate::host::HostState;
use crate::memory::MemoryView;
use wasmtime::{Caller, Func, Store, Table, Val};

/// Index of a host trampoline in the guest's function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackSlot(u32);

impl CallbackSlot {
    /// Get the table index, which is the guest-side function pointer.
    pub const fn index(self) -> u32 {
        self.0
    }
}

/// Slots of the installed trampolines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Callbacks {
    /// Receives chunks of the text buffer.
    pub flush_text: CallbackSlot,
    /// Receives chunks of the token buffer.
    pub flush_tokens: CallbackSlot,
}

/// Number of table slots claimed by [`install`].
pub const SLOT_COUNT: u32 = 2;

/// Grow `table` and install the flush trampolines.
pub fn install(store: &mut Store<HostState>, table: &Table, memory: MemoryView) -> Result<Callbacks> {
    let flush_text = flush_text_trampoline(store, memory);
    let flush_tokens = flush_tokens_trampoline(store, memory);

    let base = table
        .grow(&mut *store, SLOT_COUNT, Val::FuncRef(None))
        .map_err(|e| HighlightError::Instantiate {
            cause: format!("failed to grow the function table: {e}"),
        })?;

    for (offset, func) in [flush_text, flush_tokens].into_iter().enumerate() {
        let index = base + offset as u32;
        table
            .set(&mut *store, index, Val::FuncRef(Some(func)))
            .map_err(|e| HighlightError::Instantiate {
                cause: format!("failed to install callback at slot {index}: {e}"),
            })?;
    }

    let callbacks = Callbacks {
        flush_text: CallbackSlot(base),
        flush_tokens: CallbackSlot(base + 1),
    };
    tracing::debug!(
        flush_text = callbacks.flush_text.index(),
        flush_tokens = callbacks.flush_tokens.index(),
        "Installed flush callbacks"
    );
    Ok(callbacks)
}

// flush_text(context: u32, address: u32, length: u32)
// `length` counts bytes of UTF-8 text.
fn flush_text_trampoline(store: &mut Store<HostState>, memory: MemoryView) -> Func {
    Func::wrap(
        &mut *store,
        move |mut caller: Caller<'_, HostState>,
              _context: u32,
              address: u32,
              length: u32|
              -> wasmtime::Result<()> {
            let chunk = memory.read(&caller, address, length)?;
            tracing::trace!(address, length, "[WASM] flush text");
            caller.data_mut().push_text(&chunk)?;
            Ok(())
        },
    )
}

// flush_tokens(context: u32, address: u32, length: u32)
// `length` counts 12-byte token records.
fn flush_tokens_trampoline(store: &mut Store<HostState>, memory: MemoryView) -> Func {
    Func::wrap(
        &mut *store,
        move |mut caller: Caller<'_, HostState>,
              _context: u32,
              address: u32,
              length: u32|
              -> wasmtime::Result<()> {
            let byte_length =
                length
                    .checked_mul(TOKEN_SIZE)
                    .ok_or(HighlightError::OutOfBounds {
                        address,
                        length: u32::MAX,
                        memory_size: memory.size(&caller),
                    })?;
            let records = memory.read(&caller, address, byte_length)?;
            tracing::trace!(address, count = length, "[WASM] flush tokens");

            let tokens = records.chunks_exact(TOKEN_SIZE as usize).filter_map(|record| {
                <&[u8; TOKEN_SIZE as usize]>::try_from(record)
                    .ok()
                    .map(Token::from_record)
            });
            caller.data_mut().push_tokens(tokens)?;
            Ok(())
        },
    )
}
