//! Store data and import bindings for the guest module.
//!
//! The guest is ABI-only: it imports nothing the binding needs to provide
//! beyond a memory-growth notification. Every other function import is
//! answered with a stub that traps with the import's name.

use crate::abi::{Token, imports};
use crate::error::{HighlightError, Result};
use crate::marshal::Utf8StreamDecoder;
use wasmtime::{Caller, Engine, ExternType, Linker, Module, StoreLimits, StoreLimitsBuilder};

/// Size of one wasm page in bytes.
pub const WASM_PAGE_SIZE: usize = 65536;

/// Output accumulated by the flush trampolines during one invocation.
#[derive(Debug, Default)]
pub struct StreamedOutput {
    text: Utf8StreamDecoder,
    tokens: Vec<Token>,
    chunks: usize,
    error: Option<HighlightError>,
}

impl StreamedOutput {
    /// Number of flushes received.
    pub fn chunks(&self) -> usize {
        self.chunks
    }

    /// Finish the text stream.
    pub fn into_text(self) -> Result<String> {
        match self.error {
            Some(err) => Err(err),
            None => self.text.finish(),
        }
    }

    /// Finish the token stream.
    pub fn into_tokens(self) -> Result<Vec<Token>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.tokens),
        }
    }

    fn push_text(&mut self, chunk: &[u8]) {
        self.chunks += 1;
        if self.error.is_some() {
            return;
        }
        if let Err(err) = self.text.push(chunk) {
            tracing::debug!(error = %err, "Rejecting streamed text chunk");
            self.error = Some(err);
        }
    }

    fn push_tokens(&mut self, tokens: impl IntoIterator<Item = Token>) {
        self.chunks += 1;
        if self.error.is_none() {
            self.tokens.extend(tokens);
        }
    }
}

/// Data attached to the wasmtime store of a bound instance.
pub struct HostState {
    /// Resource limits enforced on the guest.
    pub limits: StoreLimits,
    /// Output of the invocation in flight, if any.
    output: Option<StreamedOutput>,
}

impl HostState {
    /// Create store data limiting linear memory to `max_memory_pages`.
    pub fn new(max_memory_pages: u32) -> Self {
        let limits = StoreLimitsBuilder::new()
            .memory_size(max_memory_pages as usize * WASM_PAGE_SIZE)
            .build();
        Self {
            limits,
            output: None,
        }
    }

    /// Open the output accumulator for a new invocation.
    pub fn begin_output(&mut self) -> Result<()> {
        if self.output.is_some() {
            return Err(HighlightError::Reentrant);
        }
        self.output = Some(StreamedOutput::default());
        Ok(())
    }

    /// Check if an invocation is in flight.
    pub fn in_flight(&self) -> bool {
        self.output.is_some()
    }

    /// Close the accumulator and move its contents out.
    pub fn finish_output(&mut self) -> Option<StreamedOutput> {
        self.output.take()
    }

    /// Append a flushed text chunk.
    pub fn push_text(&mut self, chunk: &[u8]) -> Result<()> {
        self.current()?.push_text(chunk);
        Ok(())
    }

    /// Append flushed tokens.
    pub fn push_tokens(&mut self, tokens: impl IntoIterator<Item = Token>) -> Result<()> {
        self.current()?.push_tokens(tokens);
        Ok(())
    }

    fn current(&mut self) -> Result<&mut StreamedOutput> {
        self.output.as_mut().ok_or_else(|| HighlightError::GuestFault {
            cause: "flush callback invoked while no invocation is in flight".to_string(),
        })
    }
}

/// Register the memory-growth notification.
fn register_memory_functions(linker: &mut Linker<HostState>) -> Result<()> {
    let (module, name) = imports::NOTIFY_MEMORY_GROWTH;

    // emscripten_notify_memory_growth(memory_index: u32)
    // Memory views are rebuilt on every access, so there is nothing to refresh.
    linker
        .func_wrap(
            module,
            name,
            |caller: Caller<'_, HostState>, memory_index: u32| {
                tracing::trace!(
                    memory_index,
                    in_flight = caller.data().in_flight(),
                    "[WASM] memory grew"
                );
            },
        )
        .map_err(|e| HighlightError::Instantiate {
            cause: format!("failed to define {module}::{name}: {e}"),
        })?;

    Ok(())
}

/// Answer every other function import with a trapping stub.
fn register_trap_stubs(linker: &mut Linker<HostState>, module: &Module) -> Result<()> {
    for import in module.imports() {
        let ExternType::Func(ty) = import.ty() else {
            continue;
        };
        if (import.module(), import.name()) == imports::NOTIFY_MEMORY_GROWTH {
            continue;
        }

        let qualified = format!("{}::{}", import.module(), import.name());
        let message = format!("guest called unsupported import {qualified}");
        linker
            .func_new(import.module(), import.name(), ty, move |_caller, _params, _results| {
                Err(wasmtime::Error::msg(message.clone()))
            })
            .map_err(|e| HighlightError::Instantiate {
                cause: format!("failed to stub {qualified}: {e}"),
            })?;
    }
    Ok(())
}

/// Create a linker that satisfies every import of `module`.
pub fn create_linker(engine: &Engine, module: &Module) -> Result<Linker<HostState>> {
    let mut linker = Linker::new(engine);
    linker.allow_shadowing(true);
    register_memory_functions(&mut linker)?;
    register_trap_stubs(&mut linker, module)?;
    Ok(linker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::Store;

    #[test]
    fn second_invocation_is_rejected() {
        let mut state = HostState::new(16);
        state.begin_output().unwrap();
        assert!(state.in_flight());
        assert!(matches!(
            state.begin_output(),
            Err(HighlightError::Reentrant)
        ));

        state.push_text(b"ok").unwrap();
        let output = state.finish_output().expect("output");
        assert_eq!(output.chunks(), 1);
        assert_eq!(output.into_text().unwrap(), "ok");

        assert!(!state.in_flight());
        state.begin_output().unwrap();
    }

    #[test]
    fn flush_outside_invocation_faults() {
        let mut state = HostState::new(16);
        let err = state.push_text(b"stale").unwrap_err();
        assert!(err.is_fatal());
        assert!(state.push_tokens(Vec::new()).is_err());
    }

    #[test]
    fn invalid_chunk_error_is_sticky() {
        let mut state = HostState::new(16);
        state.begin_output().unwrap();
        state.push_text(&[0xFF]).unwrap();
        state.push_text(b"fine").unwrap();

        let output = state.finish_output().expect("output");
        assert_eq!(output.chunks(), 2);
        assert!(matches!(
            output.into_text(),
            Err(HighlightError::InvalidUtf8 { .. })
        ));
    }

    #[test]
    fn tokens_accumulate_across_flushes() {
        let mut state = HostState::new(16);
        state.begin_output().unwrap();
        let token = Token {
            begin: 0,
            length: 2,
            kind: 1,
        };
        state.push_tokens([token]).unwrap();
        state.push_tokens([token, token]).unwrap();

        let tokens = state.finish_output().expect("output").into_tokens().unwrap();
        assert_eq!(tokens.len(), 3);
    }

    #[test]
    fn unknown_imports_trap_with_their_name() {
        let engine = Engine::default();
        let wasm = wat::parse_str(
            r#"
            (module
                (import "env" "emscripten_notify_memory_growth" (func $grow (param i32)))
                (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
                (func (export "grow") (call $grow (i32.const 0)))
                (func (export "exit") (call $exit (i32.const 1)))
            )
            "#,
        )
        .expect("Failed to parse WAT");
        let module = Module::new(&engine, &wasm).expect("Failed to compile module");
        let linker = create_linker(&engine, &module).expect("Failed to create linker");

        let mut store = Store::new(&engine, HostState::new(16));
        let instance = linker
            .instantiate(&mut store, &module)
            .expect("Failed to instantiate");

        let grow = instance
            .get_typed_func::<(), ()>(&mut store, "grow")
            .expect("grow export");
        grow.call(&mut store, ()).expect("growth notification is a no-op");

        let exit = instance
            .get_typed_func::<(), ()>(&mut store, "exit")
            .expect("exit export");
        let err = exit.call(&mut store, ()).unwrap_err();
        assert!(format!("{err:?}").contains("wasi_snapshot_preview1::proc_exit"));
    }
}
