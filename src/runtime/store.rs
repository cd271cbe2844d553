//! Runtime store: everything a runtime owns
//!
//! The store holds a single address space for functions, globals and tables
//! shared by all modules loaded into the runtime, plus the one linear memory
//! and the value stack. Addresses are plain indices and never reused; a
//! module instance maps its own index spaces onto them.
//!
//! ```text
//! functions: [0] host env.log   [1] wasm a#0   [2] wasm b#0 ...
//! instances: [0] a (func_addrs [0, 1])  [1] b (func_addrs [1, 2])
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use super::host::HostFunction;
use super::memory::Memory;
use super::stack::Stack;
use super::table::Table;
use super::{Trap, Value};
use crate::parser::module::{FunctionType, ParsedModule};

/// Index into the store's function space
pub type FuncAddr = usize;

/// Index into the store's global space
pub type GlobalAddr = usize;

pub enum FunctionInstance {
    Wasm {
        module: Arc<ParsedModule>,
        /// Index of the owning instance in `Store::instances`
        instance: usize,
        /// Index into the module's code section
        body: usize,
        ty: FunctionType,
    },
    Host {
        func: Arc<dyn HostFunction>,
        ty: FunctionType,
        /// `module.field` of the import it was bound to
        name: String,
    },
}

impl FunctionInstance {
    pub fn ty(&self) -> &FunctionType {
        match self {
            FunctionInstance::Wasm { ty, .. } | FunctionInstance::Host { ty, .. } => ty,
        }
    }
}

impl fmt::Debug for FunctionInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionInstance::Wasm { instance, body, ty, .. } => f
                .debug_struct("Wasm")
                .field("instance", instance)
                .field("body", body)
                .field("ty", ty)
                .finish(),
            FunctionInstance::Host { ty, name, .. } => {
                f.debug_struct("Host").field("name", name).field("ty", ty).finish()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalInstance {
    pub value: Value,
    pub mutable: bool,
}

/// A module loaded into a runtime
#[derive(Debug)]
pub struct ModuleInstance {
    pub module: Arc<ParsedModule>,
    /// Module function index -> store address
    pub func_addrs: Vec<FuncAddr>,
    /// Module global index -> store address
    pub global_addrs: Vec<GlobalAddr>,
    pub table_addr: Option<usize>,
    pub start: Option<FuncAddr>,
    pub started: bool,
}

#[derive(Debug, Default)]
pub struct Store {
    pub memory: Option<Memory>,
    pub functions: Vec<FunctionInstance>,
    pub globals: Vec<GlobalInstance>,
    pub tables: Vec<Table>,
    pub instances: Vec<ModuleInstance>,
    pub stack: Stack,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function(&self, addr: FuncAddr) -> Result<&FunctionInstance, Trap> {
        self.functions.get(addr).ok_or(Trap::UndefinedElement)
    }

    pub fn instance(&self, idx: usize) -> Result<&ModuleInstance, Trap> {
        self.instances.get(idx).ok_or(Trap::UndefinedElement)
    }

    pub fn global(&self, addr: GlobalAddr) -> Result<&GlobalInstance, Trap> {
        self.globals.get(addr).ok_or(Trap::UndefinedElement)
    }

    pub fn global_mut(&mut self, addr: GlobalAddr) -> Result<&mut GlobalInstance, Trap> {
        self.globals.get_mut(addr).ok_or(Trap::UndefinedElement)
    }

    /// Find an exported function, searching instances in load order
    pub fn find_export(&self, name: &str) -> Option<(usize, FuncAddr)> {
        self.instances.iter().enumerate().find_map(|(idx, inst)| {
            inst.module
                .exported_functions()
                .find(|(export, _)| *export == name)
                .and_then(|(_, func_idx)| inst.func_addrs.get(func_idx as usize))
                .map(|addr| (idx, *addr))
        })
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        while let Some(instance) = self.instances.pop() {
            trace!(
                instance = self.instances.len(),
                functions = instance.func_addrs.len(),
                "releasing module instance"
            );
        }
        self.functions.clear();
        if let Some(memory) = self.memory.take() {
            trace!(pages = memory.size(), "releasing memory");
        }
    }
}
