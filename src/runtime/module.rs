//! Linkable modules
//!
//! A [`Module`] is a parsed module plus one binding slot per import. Slots are
//! filled through the `link_*` methods and consumed when the module is loaded
//! into a runtime.

use std::fmt;
use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use super::environment::{Environment, EnvironmentShared, TypeId};
use super::host::HostFunction;
use super::invoker::FunctionHandle;
use super::Value;
use crate::error::{Error, Result};
use crate::parser;
use crate::parser::module::{FunctionType, ImportDesc, ParsedModule};

/// What an import slot is bound to
#[derive(Clone)]
pub(crate) enum ImportBinding {
    Host { func: Arc<dyn HostFunction>, name: String },
    /// Export of a module already loaded into the target runtime
    Export(FunctionHandle),
    /// Constant value of an immutable global import
    Global(Value),
}

impl fmt::Debug for ImportBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportBinding::Host { name, .. } => write!(f, "Host({name})"),
            ImportBinding::Export(handle) => write!(f, "Export({})", handle.name()),
            ImportBinding::Global(value) => write!(f, "Global({value})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Module {
    env_id: u64,
    env: Weak<EnvironmentShared>,
    info: Arc<ParsedModule>,
    type_ids: Vec<TypeId>,
    bindings: Vec<Option<ImportBinding>>,
}

impl Module {
    /// Decode and validate `bytes`, registering the module's signatures with
    /// `env`. Failures are also recorded in the environment's error slot.
    pub fn parse(env: &Environment, bytes: &[u8]) -> Result<Module> {
        let result = parser::parse(bytes).map_err(Error::from).map(|info| {
            let type_ids = info.types.iter().map(|ft| env.register_type(ft)).collect();
            debug!(env = env.id(), imports = info.imports.len(), "module parsed");
            Module {
                env_id: env.id(),
                env: env.downgrade(),
                bindings: vec![None; info.imports.len()],
                info: Arc::new(info),
                type_ids,
            }
        });
        env.shared().errors.record(result)
    }

    pub fn info(&self) -> &ParsedModule {
        &self.info
    }

    pub(crate) fn shared_info(&self) -> Arc<ParsedModule> {
        Arc::clone(&self.info)
    }

    pub fn env_id(&self) -> u64 {
        self.env_id
    }

    /// Interned id of each entry of the module's type section
    pub fn type_ids(&self) -> &[TypeId] {
        &self.type_ids
    }

    pub(crate) fn binding(&self, import_idx: usize) -> Option<&ImportBinding> {
        self.bindings.get(import_idx).and_then(Option::as_ref)
    }

    /// `module.field` names of imports that still need a binding. Memory
    /// imports bind to the runtime memory and are never listed.
    pub fn unresolved_imports(&self) -> Vec<String> {
        self.info
            .imports
            .iter()
            .zip(&self.bindings)
            .filter(|(import, binding)| binding.is_none() && !matches!(import.desc, ImportDesc::Memory(_)))
            .map(|(import, _)| format!("{}.{}", import.module, import.name))
            .collect()
    }

    /// Bind a host callback to every unbound function import named
    /// `module_name.field`. A `module_name` of `"*"` matches any module.
    pub fn link_raw(
        &mut self,
        module_name: &str,
        field: &str,
        ty: &FunctionType,
        func: impl HostFunction + 'static,
    ) -> Result<()> {
        let binding = ImportBinding::Host {
            func: Arc::new(func),
            name: format!("{module_name}.{field}"),
        };
        let result = self.bind_function(module_name, field, ty, binding);
        self.record(result)
    }

    /// Bind function imports to a function exported by a module already
    /// loaded into the runtime this module will be loaded into
    pub fn link_function(&mut self, module_name: &str, field: &str, target: &FunctionHandle) -> Result<()> {
        let descriptor = target.descriptor();
        let ty = FunctionType::new(&descriptor.params, &descriptor.results);
        let result = self.bind_function(module_name, field, &ty, ImportBinding::Export(target.clone()));
        self.record(result)
    }

    /// Bind an immutable global import to a constant value
    pub fn link_global(&mut self, module_name: &str, field: &str, value: Value) -> Result<()> {
        let result = self.bind_global(module_name, field, value);
        self.record(result)
    }

    fn matching_imports<'a>(
        &'a self,
        module_name: &'a str,
        field: &'a str,
    ) -> impl Iterator<Item = (usize, &'a ImportDesc)> + 'a {
        self.info.imports.iter().enumerate().filter_map(move |(idx, import)| {
            let module_matches = module_name == "*" || import.module == module_name;
            (module_matches && import.name == field).then_some((idx, &import.desc))
        })
    }

    fn bind_function(&mut self, module_name: &str, field: &str, ty: &FunctionType, binding: ImportBinding) -> Result<()> {
        let candidates: Vec<(usize, u32)> = self
            .matching_imports(module_name, field)
            .filter_map(|(idx, desc)| match desc {
                ImportDesc::Function(type_idx) => Some((idx, *type_idx)),
                _ => None,
            })
            .collect();
        if candidates.is_empty() {
            return Err(Error::not_found(format!("no function import {module_name}.{field}")));
        }

        let mut bound = 0;
        let mut expected = None;
        for (idx, type_idx) in candidates {
            let import_ty = self.info.types.get(type_idx as usize);
            if import_ty != Some(ty) {
                expected = import_ty.cloned();
                continue;
            }
            match self.bindings.get_mut(idx) {
                Some(slot) if slot.is_none() => {
                    *slot = Some(binding.clone());
                    bound += 1;
                }
                _ => {}
            }
        }

        match (bound, expected) {
            (0, Some(expected)) => Err(Error::link(format!(
                "signature mismatch for {module_name}.{field}: import expects {expected}, got {ty}"
            ))),
            (0, None) => Err(Error::link(format!("{module_name}.{field} is already linked"))),
            (n, _) => {
                trace!(import = %format!("{module_name}.{field}"), slots = n, "function import bound");
                Ok(())
            }
        }
    }

    fn bind_global(&mut self, module_name: &str, field: &str, value: Value) -> Result<()> {
        let candidates: Vec<_> = self
            .matching_imports(module_name, field)
            .filter_map(|(idx, desc)| match desc {
                ImportDesc::Global(gt) => Some((idx, *gt)),
                _ => None,
            })
            .collect();
        if candidates.is_empty() {
            return Err(Error::not_found(format!("no global import {module_name}.{field}")));
        }

        for (_, gt) in &candidates {
            if gt.mutable {
                return Err(Error::link(format!("{module_name}.{field} is a mutable global")));
            }
            if gt.value_type != value.typ() {
                return Err(Error::link(format!(
                    "global {module_name}.{field} is {}, got {}",
                    gt.value_type,
                    value.typ()
                )));
            }
        }

        let mut bound = 0;
        for (idx, _) in candidates {
            match self.bindings.get_mut(idx) {
                Some(slot) if slot.is_none() => {
                    *slot = Some(ImportBinding::Global(value));
                    bound += 1;
                }
                _ => {}
            }
        }
        if bound == 0 {
            return Err(Error::link(format!("{module_name}.{field} is already linked")));
        }
        trace!(import = %format!("{module_name}.{field}"), slots = bound, "global import bound");
        Ok(())
    }

    #[track_caller]
    fn record<T>(&self, result: Result<T>) -> Result<T> {
        match self.env.upgrade() {
            Some(env) => env.errors.record(result),
            None => result,
        }
    }
}
