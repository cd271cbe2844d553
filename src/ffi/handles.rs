//! Process-wide table of objects handed out across the C ABI
//!
//! A handle is `(generation << 32) | index`. Freeing a slot bumps its
//! generation, so a handle kept past its object's lifetime no longer matches
//! and resolves to nothing instead of to whatever reuses the slot.

use std::sync::{Arc, Mutex, MutexGuard};

use once_cell::sync::Lazy;

use crate::error::{Error, Result};
use crate::runtime::{Environment, FunctionHandle, Module, ModuleHandle, Runtime};

pub type Handle = u64;

pub(crate) struct ModuleEntry {
    pub(crate) module: Module,
    pub(crate) loaded: Option<ModuleHandle>,
}

pub(crate) enum Object {
    Environment(Arc<Environment>),
    Runtime(Arc<Runtime>),
    Module(ModuleEntry),
    Function(FunctionHandle),
}

impl Object {
    fn kind(&self) -> &'static str {
        match self {
            Object::Environment(_) => "environment",
            Object::Runtime(_) => "runtime",
            Object::Module(_) => "module",
            Object::Function(_) => "function",
        }
    }
}

struct Slot {
    generation: u32,
    object: Option<Object>,
}

#[derive(Default)]
pub(crate) struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

fn split(handle: Handle) -> (u32, usize) {
    ((handle >> 32) as u32, (handle & 0xFFFF_FFFF) as usize)
}

fn join(generation: u32, index: u32) -> Handle {
    (u64::from(generation) << 32) | u64::from(index)
}

impl HandleTable {
    pub(crate) fn insert(&mut self, object: Object) -> Handle {
        if let Some(index) = self.free.pop() {
            if let Some(slot) = self.slots.get_mut(index as usize) {
                slot.object = Some(object);
                return join(slot.generation, index);
            }
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 1,
            object: Some(object),
        });
        join(1, index)
    }

    pub(crate) fn get(&self, handle: Handle) -> Option<&Object> {
        let (generation, index) = split(handle);
        self.slots
            .get(index)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.object.as_ref())
    }

    pub(crate) fn get_mut(&mut self, handle: Handle) -> Option<&mut Object> {
        let (generation, index) = split(handle);
        self.slots
            .get_mut(index)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.object.as_mut())
    }

    pub(crate) fn remove(&mut self, handle: Handle) -> Option<Object> {
        let (generation, index) = split(handle);
        let slot = self.slots.get_mut(index).filter(|slot| slot.generation == generation)?;
        let object = slot.object.take()?;
        // generation 0 is never issued, so a zero handle is always invalid
        slot.generation = slot.generation.checked_add(1).unwrap_or(1);
        self.free.push(index as u32);
        Some(object)
    }

    /// Drop every entry the predicate selects, returning how many went
    pub(crate) fn remove_where(&mut self, mut pred: impl FnMut(&Object) -> bool) -> usize {
        let doomed: Vec<Handle> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.object.as_ref().is_some_and(&mut pred))
            .map(|(index, slot)| join(slot.generation, index as u32))
            .collect();
        let mut removed = 0;
        for handle in doomed {
            if self.remove(handle).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Handle of an existing entry the predicate selects
    pub(crate) fn find(&self, mut pred: impl FnMut(&Object) -> bool) -> Option<Handle> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            slot.object
                .as_ref()
                .filter(|object| pred(object))
                .map(|_| join(slot.generation, index as u32))
        })
    }

    #[cfg(test)]
    fn live(&self) -> usize {
        self.slots.iter().filter(|slot| slot.object.is_some()).count()
    }
}

static TABLE: Lazy<Mutex<HandleTable>> = Lazy::new(|| Mutex::new(HandleTable::default()));

pub(crate) fn table() -> MutexGuard<'static, HandleTable> {
    TABLE.lock().unwrap_or_else(|e| e.into_inner())
}

fn stale(handle: Handle, expected: &str, found: Option<&Object>) -> Error {
    match found {
        Some(object) => Error::invalid_state(format!(
            "{} handle {handle:#x} used where a {expected} is required",
            object.kind()
        )),
        None => Error::invalid_state(format!("stale {expected} handle {handle:#x}")),
    }
}

pub(crate) fn environment(handle: Handle) -> Result<Arc<Environment>> {
    let table = table();
    match table.get(handle) {
        Some(Object::Environment(env)) => Ok(Arc::clone(env)),
        other => Err(stale(handle, "environment", other)),
    }
}

pub(crate) fn runtime(handle: Handle) -> Result<Arc<Runtime>> {
    let table = table();
    match table.get(handle) {
        Some(Object::Runtime(rt)) => Ok(Arc::clone(rt)),
        other => Err(stale(handle, "runtime", other)),
    }
}

pub(crate) fn function(handle: Handle) -> Result<FunctionHandle> {
    let table = table();
    match table.get(handle) {
        Some(Object::Function(func)) => Ok(func.clone()),
        other => Err(stale(handle, "function", other)),
    }
}

/// Run `f` on a module entry while the table is locked. `f` must not call
/// back into the C ABI.
pub(crate) fn with_module<T>(handle: Handle, f: impl FnOnce(&mut ModuleEntry) -> Result<T>) -> Result<T> {
    let mut table = table();
    match table.get_mut(handle) {
        Some(Object::Module(entry)) => f(entry),
        Some(other) => Err(stale(handle, "module", Some(other))),
        None => Err(Error::invalid_state(format!("stale module handle {handle:#x}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ResultCode;

    #[test]
    fn test_generations() {
        let mut table = HandleTable::default();
        let first = table.insert(Object::Environment(Arc::new(Environment::new())));
        assert_eq!(first, 1 << 32);
        assert!(table.get(first).is_some());
        assert!(table.get(0).is_none());

        assert!(table.remove(first).is_some());
        assert!(table.remove(first).is_none());
        assert!(table.get(first).is_none());

        let second = table.insert(Object::Environment(Arc::new(Environment::new())));
        assert_eq!(second & 0xFFFF_FFFF, first & 0xFFFF_FFFF);
        assert_ne!(second, first);
        assert!(table.get(first).is_none());
        assert_eq!(table.live(), 1);
    }

    #[test]
    fn test_remove_where_and_find() {
        let mut table = HandleTable::default();
        let env = Arc::new(Environment::new());
        let rt = Arc::new(Runtime::new(&env, 4096).unwrap());
        table.insert(Object::Environment(Arc::clone(&env)));
        let rt_handle = table.insert(Object::Runtime(Arc::clone(&rt)));

        assert_eq!(table.find(|o| matches!(o, Object::Runtime(_))), Some(rt_handle));
        assert_eq!(table.remove_where(|o| matches!(o, Object::Environment(_))), 1);
        assert_eq!(table.live(), 1);
    }

    #[test]
    fn test_wrong_kind_is_invalid_state() {
        let handle = table().insert(Object::Environment(Arc::new(Environment::new())));
        let err = runtime(handle).unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidState);
        assert!(err.to_string().contains("environment handle"));
        assert!(environment(handle).is_ok());
        table().remove(handle);
        assert!(environment(handle).is_err());
    }
}
