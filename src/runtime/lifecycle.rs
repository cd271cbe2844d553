//! Runtimes: creation, module loading, start functions and export lookup

use std::any::Any;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError, Weak};

use tracing::debug;

use super::config::{RuntimeConfig, FRAME_OVERHEAD};
use super::diagnostics::{ErrorInfo, ErrorSlot};
use super::environment::{next_context_id, Environment, EnvironmentShared};
use super::executor::Executor;
use super::invoker::{FunctionDescriptor, FunctionHandle};
use super::linker;
use super::memory::Memory;
use super::module::Module;
use super::store::Store;
use crate::error::{Error, Result};

type UserData = Arc<dyn Any + Send + Sync>;

pub(crate) struct RuntimeShared {
    pub(crate) id: u64,
    env: Weak<EnvironmentShared>,
    env_id: u64,
    pub(crate) config: RuntimeConfig,
    store: Mutex<Store>,
    // outside the store lock so host callbacks can read it mid-call
    user_data: RwLock<Option<UserData>>,
    pub(crate) errors: ErrorSlot,
}

impl RuntimeShared {
    pub(crate) fn check_env(&self) -> Result<()> {
        if self.env.strong_count() == 0 {
            return Err(Error::invalid_state("stale context: environment destroyed"));
        }
        Ok(())
    }

    /// Exclusive access to the store. Never blocks: a runtime already
    /// executing (on another thread, or re-entered from a host function)
    /// reports itself busy.
    pub(crate) fn lock_store(&self) -> Result<MutexGuard<'_, Store>> {
        match self.store.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(Error::invalid_state("runtime is busy")),
        }
    }

    pub(crate) fn user_data(&self) -> Option<UserData> {
        self.user_data.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// A module loaded into a runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleHandle {
    runtime_id: u64,
    instance: usize,
}

impl ModuleHandle {
    pub fn runtime_id(&self) -> u64 {
        self.runtime_id
    }

    /// Position of the module in the runtime's load order
    pub fn index(&self) -> usize {
        self.instance
    }
}

/// Borrow of the runtime memory. Holds the runtime lock, so drop it before
/// calling into the runtime again.
pub struct MemoryView<'a> {
    store: MutexGuard<'a, Store>,
}

impl MemoryView<'_> {
    pub fn pages(&self) -> u32 {
        self.store.memory.as_ref().map_or(0, Memory::size)
    }
}

impl Deref for MemoryView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.store.memory.as_ref().map(Memory::data).unwrap_or(&[])
    }
}

impl DerefMut for MemoryView<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self.store.memory.as_mut() {
            Some(memory) => memory.data_mut(),
            None => &mut [],
        }
    }
}

/// An isolated execution context: one linear memory, the function, global
/// and table spaces of its loaded modules, and a bounded value stack.
pub struct Runtime {
    shared: Arc<RuntimeShared>,
}

impl Runtime {
    /// Create a runtime with a value stack of `stack_size` bytes and
    /// otherwise default configuration
    pub fn new(env: &Environment, stack_size: usize) -> Result<Runtime> {
        Self::with_config(env, RuntimeConfig::default().with_stack_size(stack_size))
    }

    pub fn with_config(env: &Environment, config: RuntimeConfig) -> Result<Runtime> {
        if config.stack_slots() < FRAME_OVERHEAD {
            let err = Error::invalid_state(format!("stack size {} is too small", config.stack_size_bytes));
            return env.shared().errors.record(Err(err));
        }
        let id = next_context_id();
        debug!(runtime = id, env = env.id(), stack = config.stack_size_bytes, "runtime created");
        Ok(Runtime {
            shared: Arc::new(RuntimeShared {
                id,
                env: env.downgrade(),
                env_id: env.id(),
                config,
                store: Mutex::new(Store::new()),
                user_data: RwLock::new(None),
                errors: ErrorSlot::new(),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Release the runtime. Loaded modules go first, newest first, then the
    /// memory. Outstanding handles fail with `InvalidState` afterwards.
    pub fn destroy(self) {
        drop(self);
    }

    pub fn memory(&self) -> Result<MemoryView<'_>> {
        let result = self
            .shared
            .check_env()
            .and_then(|()| self.shared.lock_store())
            .map(|store| MemoryView { store });
        self.shared.errors.record(result)
    }

    /// Memory size in bytes
    pub fn memory_size(&self) -> Result<usize> {
        Ok(self.memory()?.len())
    }

    pub fn memory_pages(&self) -> Result<u32> {
        Ok(self.memory()?.pages())
    }

    /// Grow memory by `delta` pages, returning the previous size in pages
    pub fn grow_memory(&self, delta: u32) -> Result<u32> {
        let result = self.shared.check_env().and_then(|()| {
            let mut store = self.shared.lock_store()?;
            let memory = store
                .memory
                .as_mut()
                .ok_or_else(|| Error::invalid_state("runtime has no memory"))?;
            memory
                .grow(delta)
                .ok_or_else(|| Error::invalid_state(format!("memory cannot grow by {delta} pages")))
        });
        self.shared.errors.record(result)
    }

    pub fn set_user_data(&self, data: Arc<dyn Any + Send + Sync>) -> Result<()> {
        self.replace_user_data(Some(data))
    }

    pub fn clear_user_data(&self) -> Result<()> {
        self.replace_user_data(None)
    }

    pub fn user_data(&self) -> Result<Option<Arc<dyn Any + Send + Sync>>> {
        self.shared.errors.record(self.shared.check_env())?;
        Ok(self.shared.user_data())
    }

    fn replace_user_data(&self, data: Option<UserData>) -> Result<()> {
        self.shared.errors.record(self.shared.check_env())?;
        *self.shared.user_data.write().unwrap_or_else(|e| e.into_inner()) = data;
        Ok(())
    }

    pub fn last_error(&self) -> Option<ErrorInfo> {
        self.shared.errors.get()
    }

    pub fn reset_error_info(&self) {
        self.shared.errors.clear();
    }

    /// Instantiate `module`. Every import must be bound; the runtime is left
    /// unchanged when loading fails.
    pub fn load(&self, module: Module) -> Result<ModuleHandle> {
        self.load_ref(&module)
    }

    /// Load without consuming the module, so a failed load can be retried
    /// after more imports are bound
    pub(crate) fn load_ref(&self, module: &Module) -> Result<ModuleHandle> {
        let result = self.load_inner(module);
        self.shared.errors.record(result)
    }

    fn load_inner(&self, module: &Module) -> Result<ModuleHandle> {
        self.shared.check_env()?;
        if module.env_id() != self.shared.env_id {
            return Err(Error::invalid_state("module was parsed against another environment"));
        }
        let mut store = self.shared.lock_store()?;
        let instance = linker::instantiate(&mut store, self.shared.id, &self.shared.config, module)?;
        Ok(ModuleHandle {
            runtime_id: self.shared.id,
            instance,
        })
    }

    /// Run the module's start function if it has one and it has not run
    /// yet. A trapping start leaves the module unstarted.
    pub fn run_start(&self, module: &ModuleHandle) -> Result<()> {
        let result = self.run_start_inner(module);
        self.shared.errors.record(result)
    }

    fn run_start_inner(&self, module: &ModuleHandle) -> Result<()> {
        if module.runtime_id != self.shared.id {
            return Err(Error::invalid_state("module handle belongs to another runtime"));
        }
        self.shared.check_env()?;
        let mut store = self.shared.lock_store()?;
        let instance = store.instance(module.instance)?;
        let start = match (instance.started, instance.start) {
            (false, Some(start)) => start,
            _ => return Ok(()),
        };

        debug!(runtime = self.shared.id, instance = module.instance, "running start function");
        let user_data = self.shared.user_data();
        Executor::new(&mut store, &self.shared.config, user_data.as_deref()).invoke(start, &[])?;
        if let Some(instance) = store.instances.get_mut(module.instance) {
            instance.started = true;
        }
        Ok(())
    }

    /// Look up an exported function by exact name, searching modules in
    /// load order
    pub fn find_function(&self, name: &str) -> Result<FunctionHandle> {
        let result = self.find_function_inner(name);
        self.shared.errors.record(result)
    }

    fn find_function_inner(&self, name: &str) -> Result<FunctionHandle> {
        self.shared.check_env()?;
        let store = self.shared.lock_store()?;
        let (instance, addr) = store
            .find_export(name)
            .ok_or_else(|| Error::not_found(format!("function {name}")))?;
        let descriptor = FunctionDescriptor::new(name, store.function(addr)?.ty());
        Ok(FunctionHandle::new(
            Arc::downgrade(&self.shared),
            self.shared.id,
            addr,
            instance,
            descriptor,
        ))
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.shared.id)
            .field("env", &self.shared.env_id)
            .field("config", &self.shared.config)
            .finish()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        debug!(runtime = self.shared.id, "runtime destroyed");
    }
}
