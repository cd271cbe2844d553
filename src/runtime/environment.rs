//! Environments: the structural type registry shared by runtimes
//!
//! Runtimes keep only a weak reference to their environment. Dropping the
//! environment therefore never frees a runtime, but every later operation on
//! such a runtime fails with a stale-context error.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tracing::debug;

use super::diagnostics::{ErrorInfo, ErrorSlot};
use crate::parser::module::FunctionType;

/// Dense id of an interned function signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type#{}", self.0)
    }
}

/// Source of ids for environments and runtimes
pub(crate) fn next_context_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Default)]
struct TypeRegistry {
    types: Vec<FunctionType>,
    ids: HashMap<FunctionType, TypeId>,
}

impl TypeRegistry {
    fn intern(&mut self, ft: &FunctionType) -> TypeId {
        if let Some(id) = self.ids.get(ft) {
            return *id;
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(ft.clone());
        self.ids.insert(ft.clone(), id);
        id
    }
}

#[derive(Debug)]
pub(crate) struct EnvironmentShared {
    pub(crate) id: u64,
    types: RwLock<TypeRegistry>,
    pub(crate) errors: ErrorSlot,
}

impl EnvironmentShared {
    pub(crate) fn register_type(&self, ft: &FunctionType) -> TypeId {
        self.types.write().unwrap_or_else(|e| e.into_inner()).intern(ft)
    }
}

/// Registry of function signatures and parent of runtimes.
///
/// Registration takes a write lock, lookups a read lock, so runtimes on
/// different threads may share one environment.
#[derive(Debug)]
pub struct Environment {
    shared: Arc<EnvironmentShared>,
}

impl Environment {
    pub fn new() -> Self {
        let id = next_context_id();
        debug!(env = id, "environment created");
        Environment {
            shared: Arc::new(EnvironmentShared {
                id,
                types: RwLock::new(TypeRegistry::default()),
                errors: ErrorSlot::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Intern a signature, returning the id shared by every structurally
    /// equal signature
    pub fn register_type(&self, ft: &FunctionType) -> TypeId {
        self.shared.register_type(ft)
    }

    pub fn function_type(&self, id: TypeId) -> Option<FunctionType> {
        let types = self.shared.types.read().unwrap_or_else(|e| e.into_inner());
        types.types.get(id.0 as usize).cloned()
    }

    pub fn type_count(&self) -> usize {
        self.shared.types.read().unwrap_or_else(|e| e.into_inner()).types.len()
    }

    /// Most recent failure of an environment-scoped operation (module parsing
    /// and linking)
    pub fn last_error(&self) -> Option<ErrorInfo> {
        self.shared.errors.get()
    }

    pub fn reset_error_info(&self) {
        self.shared.errors.clear();
    }

    /// Release the environment. Runtimes created from it become stale.
    pub fn destroy(self) {
        drop(self);
    }

    pub(crate) fn shared(&self) -> &Arc<EnvironmentShared> {
        &self.shared
    }

    pub(crate) fn downgrade(&self) -> Weak<EnvironmentShared> {
        Arc::downgrade(&self.shared)
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        debug!(env = self.shared.id, "environment destroyed");
    }
}
