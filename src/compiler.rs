//! Driving a code-generation backend.
//!
//! Compilation is serialized through one driver lock. Backends keep large
//! per-context state (type tables, module caches), so a single context is
//! shared across compilations and only replaced once its estimated memory use
//! crosses [`RuntimeConfig::compile_context_threshold`].

use std::any::TypeId;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::error::CompileError;
use crate::locks::{LockLevel, RankedMutex};
use crate::stack::Method;

/// Estimated context growth per compiled code unit.
const BYTES_PER_CODE_UNIT: usize = 900;

/// Backends whose process-wide setup has already run.
static INITIALIZED_BACKENDS: Lazy<Mutex<HashSet<TypeId>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// A method handed to the backend.
#[derive(Debug, Clone)]
pub struct CompilationUnit {
    pub method: Arc<Method>,
    /// Size of the method's bytecode in 16-bit code units.
    pub code_units: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineCode {
    pub method: Arc<Method>,
    pub instructions: Vec<u8>,
    pub frame_size: usize,
    pub core_spill_mask: u32,
}

pub trait CodegenBackend: Send + Sync + 'static {
    type Context: Send;

    /// Process-wide setup. Runs once per backend type, before its first
    /// driver is created.
    fn initialize_globals()
    where
        Self: Sized;

    fn create_context(&self) -> Self::Context;

    fn compile(&self, context: &mut Self::Context, unit: &CompilationUnit) -> Result<MachineCode, CompileError>;
}

struct SharedContext<C> {
    context: C,
    mem_usage: usize,
}

/// Compiles methods with `B`, caching the result per method.
pub struct CompilerDriver<B: CodegenBackend> {
    backend: B,
    shared: RankedMutex<Option<SharedContext<B::Context>>>,
    threshold: usize,
    cache: DashMap<String, Arc<MachineCode>>,
    contexts_created: AtomicUsize,
}

impl<B: CodegenBackend> CompilerDriver<B> {
    pub fn new(config: &RuntimeConfig, backend: B) -> Self {
        if INITIALIZED_BACKENDS.lock().insert(TypeId::of::<B>()) {
            tracing::debug!(target: "compiler", backend = std::any::type_name::<B>(), "initializing backend");
            B::initialize_globals();
        }
        Self {
            backend,
            shared: RankedMutex::new("compiler driver lock", LockLevel::CompilerDriver, config.check_locks, None),
            threshold: config.compile_context_threshold,
            cache: DashMap::new(),
            contexts_created: AtomicUsize::new(0),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Compiles `unit`, or returns the code produced for its method earlier.
    pub fn compile(&self, unit: &CompilationUnit) -> Result<Arc<MachineCode>, CompileError> {
        let key = unit.method.pretty_name();
        if unit.code_units == 0 {
            return Err(CompileError::NoCode(key));
        }
        if let Some(code) = self.cached_by_key(&key) {
            return Ok(code);
        }

        let mut shared = self.shared.lock();
        // Compiled by another thread while this one waited for the lock.
        if let Some(code) = self.cached_by_key(&key) {
            return Ok(code);
        }
        let stale_usage = shared
            .as_ref()
            .map(|current| current.mem_usage)
            .filter(|usage| *usage >= self.threshold);
        if let Some(mem_usage) = stale_usage {
            tracing::debug!(target: "compiler", mem_usage, "replacing compile context");
            *shared = None;
        }
        let current = shared.get_or_insert_with(|| {
            self.contexts_created.fetch_add(1, Ordering::Relaxed);
            SharedContext {
                context: self.backend.create_context(),
                mem_usage: 0,
            }
        });
        current.mem_usage = current
            .mem_usage
            .saturating_add(unit.code_units as usize * BYTES_PER_CODE_UNIT);

        let code = match self.backend.compile(&mut current.context, unit) {
            Ok(code) => Arc::new(code),
            Err(err) => {
                tracing::warn!(target: "compiler", %err, "compilation failed");
                return Err(err);
            }
        };
        self.cache.insert(key, Arc::clone(&code));
        tracing::trace!(target: "compiler", method = %unit.method.pretty_name(), bytes = code.instructions.len(), "compiled");
        Ok(code)
    }

    fn cached_by_key(&self, key: &str) -> Option<Arc<MachineCode>> {
        self.cache.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn cached(&self, method: &Method) -> Option<Arc<MachineCode>> {
        self.cached_by_key(&method.pretty_name())
    }

    /// Number of backend contexts created so far.
    pub fn contexts_created(&self) -> usize {
        self.contexts_created.load(Ordering::Relaxed)
    }

    /// Estimated memory held by the current context, 0 if there is none.
    pub fn context_mem_usage(&self) -> usize {
        self.shared.lock().as_ref().map_or(0, |current| current.mem_usage)
    }
}
