//! Engine management and compiled-module caching.

use crate::error::{HighlightError, Result};
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use wasmtime::{Config, Engine, Module};

/// Configuration for the wasmtime engine.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Whether to cache compiled modules by content hash.
    pub cache_modules: bool,
    /// Enable debug info in compiled modules.
    pub debug_info: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::production()
    }
}

impl RuntimeConfig {
    /// Create a configuration for production use.
    pub fn production() -> Self {
        Self {
            cache_modules: true,
            debug_info: false,
        }
    }

    /// Create a configuration for tests: no shared cache, debug info on.
    pub fn testing() -> Self {
        Self {
            cache_modules: false,
            debug_info: true,
        }
    }

    /// Enable or disable module caching.
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_modules = enabled;
        self
    }

    /// Enable or disable debug info.
    pub fn with_debug_info(mut self, enabled: bool) -> Self {
        self.debug_info = enabled;
        self
    }

    fn to_wasmtime_config(&self) -> Config {
        let mut config = Config::new();

        // The binding has no timeout mechanism; fuel and epochs stay off.
        config.consume_fuel(false);
        config.epoch_interruption(false);

        config.debug_info(self.debug_info);
        config.strategy(wasmtime::Strategy::Cranelift);

        config
    }
}

/// A compiled guest module ready for instantiation.
pub struct CompiledModule {
    module: Module,
    name: String,
    hash: u64,
}

impl CompiledModule {
    /// Get the underlying wasmtime module.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Name the module was compiled under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hash of the module bytes.
    pub fn hash(&self) -> u64 {
        self.hash
    }
}

/// Owns the wasmtime engine and a cache of compiled guest modules.
///
/// Compiling the highlighter is by far the most expensive step of loading,
/// so instances created from the same bytes share one compiled module.
pub struct GuestRuntime {
    /// The wasmtime engine (thread-safe, can be shared).
    engine: Engine,
    config: RuntimeConfig,
    /// Compiled modules by content hash.
    module_cache: DashMap<u64, Arc<CompiledModule>>,
}

impl GuestRuntime {
    /// Create a runtime with the given configuration.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let engine = Engine::new(&config.to_wasmtime_config()).map_err(|e| {
            HighlightError::Compile {
                module: "engine".to_string(),
                cause: e.to_string(),
            }
        })?;

        Ok(Self {
            engine,
            config,
            module_cache: DashMap::new(),
        })
    }

    /// Create a runtime with the default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(RuntimeConfig::default())
    }

    /// Get the wasmtime engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Get the runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Compile module bytes, reusing a cached compilation when available.
    pub fn compile(&self, name: &str, wasm_bytes: &[u8]) -> Result<Arc<CompiledModule>> {
        let hash = hash_bytes(wasm_bytes);

        if self.config.cache_modules {
            if let Some(cached) = self.module_cache.get(&hash) {
                tracing::debug!(module = name, hash, "Using cached guest module");
                return Ok(Arc::clone(&cached));
            }
        }

        let module = Module::new(&self.engine, wasm_bytes).map_err(|e| HighlightError::Compile {
            module: name.to_string(),
            cause: format!("{e:#}"),
        })?;

        let compiled = Arc::new(CompiledModule {
            module,
            name: name.to_string(),
            hash,
        });

        if self.config.cache_modules {
            self.module_cache.insert(hash, Arc::clone(&compiled));
        }

        Ok(compiled)
    }

    /// Read and compile a module file.
    pub fn compile_file(&self, path: &Path) -> Result<Arc<CompiledModule>> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown");

        let wasm_bytes = std::fs::read(path).map_err(|e| HighlightError::Io {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })?;

        self.compile(name, &wasm_bytes)
    }

    /// Validate module bytes without keeping the compilation.
    pub fn validate(&self, wasm_bytes: &[u8]) -> Result<()> {
        Module::validate(&self.engine, wasm_bytes).map_err(|e| HighlightError::Compile {
            module: "validation".to_string(),
            cause: format!("{e:#}"),
        })
    }

    /// Clear the module cache.
    pub fn clear_cache(&self) {
        self.module_cache.clear();
    }

    /// Get the number of cached modules.
    pub fn cache_size(&self) -> usize {
        self.module_cache.len()
    }
}

/// Compute a cache key for module bytes.
fn hash_bytes(bytes: &[u8]) -> u64 {
    use std::hash::{Hash, Hasher};

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}
