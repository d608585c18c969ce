//! Loading and binding the guest module.
//!
//! A [`BoundInstance`] owns one instantiated guest together with everything
//! the host needs to talk to it: the store, the allocator bridge, the
//! resolved exports and the installed callback slots.

use crate::abi::exports;
use crate::alloc::AllocatorBridge;
use crate::callback::{self, Callbacks};
use crate::config::BindingConfig;
use crate::error::{HighlightError, Result};
use crate::host::{HostState, WASM_PAGE_SIZE, create_linker};
use crate::memory::MemoryView;
use crate::runtime::{CompiledModule, GuestRuntime};
use crate::state::GuestStateFns;
use std::path::Path;
use std::sync::Arc;
use wasmtime::{Instance, Store, TypedFunc, WasmParams, WasmResults};

/// Guest entry points resolved at load time.
pub(crate) struct GuestExports {
    /// `ulight_source_to_html(ulight_state*) -> ulight_status`.
    pub(crate) source_to_html: TypedFunc<u32, u32>,
    /// `ulight_source_to_tokens(ulight_state*) -> ulight_status`.
    pub(crate) source_to_tokens: Option<TypedFunc<u32, u32>>,
    /// `ulight_get_lang(const char*, size_t) -> ulight_lang`.
    pub(crate) get_lang: TypedFunc<(u32, u32), u32>,
    /// `ulight_lang_from_path(const char*, size_t) -> ulight_lang`.
    pub(crate) lang_from_path: Option<TypedFunc<(u32, u32), u32>>,
    /// `ulight_new` and `ulight_delete`, when both are exported.
    pub(crate) state_fns: Option<GuestStateFns>,
}

/// Disjoint borrows of a [`BoundInstance`] used while driving one call.
pub(crate) struct Parts<'a> {
    pub(crate) store: &'a mut Store<HostState>,
    pub(crate) instance: &'a Instance,
    pub(crate) allocator: &'a mut AllocatorBridge,
    pub(crate) memory: &'a MemoryView,
    pub(crate) exports: &'a GuestExports,
    pub(crate) callbacks: &'a Callbacks,
    pub(crate) config: &'a BindingConfig,
    faulted: &'a mut Option<String>,
}

impl Parts<'_> {
    /// Read an exported `i32` global holding a guest address.
    pub(crate) fn global_address(&mut self, name: &str) -> Result<u32> {
        global_address(self.instance, self.store, name)
    }

    /// Mark the instance unusable after a trap.
    pub(crate) fn poison(&mut self, cause: &str) {
        if self.faulted.is_none() {
            *self.faulted = Some(cause.to_string());
        }
    }
}

/// An instantiated, initialized guest ready for highlighting.
///
/// Calls take `&mut self`, so one instance serves one call at a time. Use
/// one instance per thread or [`SharedHighlighter`](crate::SharedHighlighter)
/// for concurrent callers.
pub struct BoundInstance {
    store: Store<HostState>,
    instance: Instance,
    memory: MemoryView,
    allocator: AllocatorBridge,
    exports: GuestExports,
    callbacks: Callbacks,
    config: BindingConfig,
    module: Arc<CompiledModule>,
    /// Cause of the trap that poisoned this instance.
    faulted: Option<String>,
}

impl BoundInstance {
    /// Instantiate a compiled module and bind it.
    pub fn new(module: Arc<CompiledModule>, config: BindingConfig) -> Result<Self> {
        config.validate()?;

        let wasm_module = module.module();
        let engine = wasm_module.engine();
        let linker = create_linker(engine, wasm_module)?;

        let mut store = Store::new(engine, HostState::new(config.max_memory_pages));
        store.limiter(|state| &mut state.limits);

        let instance = linker
            .instantiate(&mut store, wasm_module)
            .map_err(|e| HighlightError::Instantiate {
                cause: format!("{e:#}"),
            })?;

        let memory = instance
            .get_memory(&mut store, exports::MEMORY)
            .map(MemoryView::new)
            .ok_or_else(|| missing(exports::MEMORY))?;

        initialize(&instance, &mut store)?;

        let alloc_fn = typed(&instance, &mut store, exports::ALLOC)?;
        let free_fn = typed(&instance, &mut store, exports::FREE)?;
        let guest_exports = GuestExports {
            source_to_html: typed(&instance, &mut store, exports::SOURCE_TO_HTML)?,
            source_to_tokens: optional_typed(&instance, &mut store, exports::SOURCE_TO_TOKENS)?,
            get_lang: typed(&instance, &mut store, exports::GET_LANG)?,
            lang_from_path: optional_typed(&instance, &mut store, exports::LANG_FROM_PATH)?,
            state_fns: state_fns(&instance, &mut store)?,
        };

        for name in [
            exports::LANG_LIST,
            exports::LANG_LIST_LENGTH,
            exports::LANG_DISPLAY_NAMES,
        ] {
            global_address(&instance, &mut store, name)?;
        }

        let table = instance
            .get_table(&mut store, exports::FUNCTION_TABLE)
            .ok_or_else(|| missing(exports::FUNCTION_TABLE))?;
        let callbacks = callback::install(&mut store, &table, memory)?;

        tracing::info!(
            module = module.name(),
            memory_pages = memory.size(&store) / WASM_PAGE_SIZE,
            max_memory_pages = config.max_memory_pages,
            guest_state = guest_exports.state_fns.is_some(),
            tokens = guest_exports.source_to_tokens.is_some(),
            "Loaded ulight guest module"
        );

        Ok(Self {
            store,
            instance,
            memory,
            allocator: AllocatorBridge::new(memory, alloc_fn, free_fn),
            exports: guest_exports,
            callbacks,
            config,
            module,
            faulted: None,
        })
    }

    /// Compile `bytes` with `runtime` and bind the result.
    pub fn load(runtime: &GuestRuntime, bytes: &[u8], config: BindingConfig) -> Result<Self> {
        let module = runtime.compile("ulight", bytes)?;
        Self::new(module, config)
    }

    /// Read a module file, compile it with `runtime` and bind the result.
    pub fn load_file(
        runtime: &GuestRuntime,
        path: impl AsRef<Path>,
        config: BindingConfig,
    ) -> Result<Self> {
        let module = runtime.compile_file(path.as_ref())?;
        Self::new(module, config)
    }

    /// Re-instantiate from the retained compiled module.
    ///
    /// This is the only way to recover from a [`HighlightError::GuestFault`].
    /// Guest state from the previous instantiation is discarded.
    pub fn reload(&mut self) -> Result<()> {
        let fresh = Self::new(Arc::clone(&self.module), self.config.clone())?;
        if let Some(cause) = self.faulted.as_deref() {
            tracing::info!(module = self.module.name(), cause, "Reloaded faulted guest");
        }
        *self = fresh;
        Ok(())
    }

    /// Check if a guest trap poisoned this instance.
    pub fn is_faulted(&self) -> bool {
        self.faulted.is_some()
    }

    /// Get the configuration this instance was bound with.
    pub fn config(&self) -> &BindingConfig {
        &self.config
    }

    /// Get the compiled module backing this instance.
    pub fn module(&self) -> &Arc<CompiledModule> {
        &self.module
    }

    /// Get the installed callback slots.
    pub fn callbacks(&self) -> Callbacks {
        self.callbacks
    }

    /// Number of host-made guest allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.allocator.live_allocations()
    }

    /// Total size of host-made guest allocations not yet freed.
    pub fn live_bytes(&self) -> u64 {
        self.allocator.live_bytes()
    }

    /// Current size of the guest's linear memory in bytes.
    pub fn memory_size(&self) -> usize {
        self.memory.size(&self.store)
    }

    /// Read an exported `i32` global as an unsigned word.
    pub fn guest_global(&mut self, name: &str) -> Result<u32> {
        global_address(&self.instance, &mut self.store, name)
    }

    /// Run `f` against the instance, poisoning it if the guest faults.
    pub(crate) fn run<R>(&mut self, f: impl FnOnce(&mut Parts<'_>) -> Result<R>) -> Result<R> {
        if let Some(cause) = &self.faulted {
            return Err(HighlightError::GuestFault {
                cause: format!("instance must be reloaded after an earlier fault: {cause}"),
            });
        }

        let mut parts = self.parts();
        let result = f(&mut parts);
        if let Err(HighlightError::GuestFault { cause }) = &result {
            parts.poison(cause);
        }

        if let Some(cause) = &self.faulted {
            tracing::error!(module = self.module.name(), cause, "Guest faulted");
        }
        result
    }

    pub(crate) fn parts(&mut self) -> Parts<'_> {
        Parts {
            store: &mut self.store,
            instance: &self.instance,
            allocator: &mut self.allocator,
            memory: &self.memory,
            exports: &self.exports,
            callbacks: &self.callbacks,
            config: &self.config,
            faulted: &mut self.faulted,
        }
    }
}

/// Compile and bind module bytes.
///
/// One-shot: each call compiles with a fresh [`GuestRuntime`] that is
/// dropped afterwards, so nothing is cached between calls. Keep a runtime
/// and use [`BoundInstance::load`] to share compiled code across instances.
pub fn load(bytes: &[u8], config: BindingConfig) -> Result<BoundInstance> {
    let runtime = GuestRuntime::with_defaults()?;
    BoundInstance::load(&runtime, bytes, config)
}

/// Read, compile and bind a module file.
///
/// One-shot like [`load`]; see [`BoundInstance::load_file`] for the
/// cached variant.
pub fn load_file(path: impl AsRef<Path>, config: BindingConfig) -> Result<BoundInstance> {
    let runtime = GuestRuntime::with_defaults()?;
    BoundInstance::load_file(&runtime, path, config)
}

/// Run the reactor initializer if the guest has one.
fn initialize(instance: &Instance, store: &mut Store<HostState>) -> Result<()> {
    let Some(func) = instance.get_func(&mut *store, exports::INITIALIZE) else {
        tracing::warn!("Guest module has no _initialize export; skipping initialization");
        return Ok(());
    };

    func.typed::<(), ()>(&*store)
        .map_err(|e| HighlightError::MissingExport {
            name: exports::INITIALIZE.to_string(),
            cause: format!("{e:#}"),
        })?
        .call(&mut *store, ())
        .map_err(|e| HighlightError::Instantiate {
            cause: format!("_initialize trapped: {e:#}"),
        })
}

/// Resolve the guest's request-state constructor pair.
fn state_fns(instance: &Instance, store: &mut Store<HostState>) -> Result<Option<GuestStateFns>> {
    let new_state = optional_typed(instance, store, exports::NEW_STATE)?;
    let delete_state = optional_typed(instance, store, exports::DELETE_STATE)?;
    match (new_state, delete_state) {
        (Some(new_state), Some(delete_state)) => Ok(Some(GuestStateFns {
            new_state,
            delete_state,
        })),
        (None, None) => Ok(None),
        _ => {
            tracing::warn!("Guest exports only one of ulight_new/ulight_delete; allocating state on the host");
            Ok(None)
        }
    }
}

fn typed<Params, Results>(
    instance: &Instance,
    store: &mut Store<HostState>,
    name: &str,
) -> Result<TypedFunc<Params, Results>>
where
    Params: WasmParams,
    Results: WasmResults,
{
    instance
        .get_typed_func::<Params, Results>(&mut *store, name)
        .map_err(|e| HighlightError::MissingExport {
            name: name.to_string(),
            cause: format!("{e:#}"),
        })
}

fn optional_typed<Params, Results>(
    instance: &Instance,
    store: &mut Store<HostState>,
    name: &str,
) -> Result<Option<TypedFunc<Params, Results>>>
where
    Params: WasmParams,
    Results: WasmResults,
{
    if instance.get_func(&mut *store, name).is_none() {
        return Ok(None);
    }
    typed(instance, store, name).map(Some)
}

fn global_address(instance: &Instance, store: &mut Store<HostState>, name: &str) -> Result<u32> {
    let global = instance
        .get_global(&mut *store, name)
        .ok_or_else(|| missing(name))?;
    global
        .get(&mut *store)
        .i32()
        .map(|value| value as u32)
        .ok_or_else(|| HighlightError::MissingExport {
            name: name.to_string(),
            cause: "global is not an i32".to_string(),
        })
}

fn missing(name: &str) -> HighlightError {
    HighlightError::MissingExport {
        name: name.to_string(),
        cause: "export not found".to_string(),
    }
}
