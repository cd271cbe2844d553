//! Instantiation of modules into a runtime store
//!
//! Loading happens in two phases. [`plan`] resolves every import, evaluates
//! global initialisers, sizes memory and checks element and data segment
//! bounds without touching the store. [`commit`] then applies the plan; the
//! only step in it that can fail (allocating or growing the memory) runs
//! first, so a failed load leaves the store exactly as it was.

use std::sync::Arc;

use tracing::{debug, trace};

use super::config::RuntimeConfig;
use super::memory::{Memory, MAX_PAGES, PAGE_SIZE};
use super::module::{ImportBinding, Module};
use super::store::{FuncAddr, FunctionInstance, GlobalInstance, ModuleInstance, Store};
use super::table::Table;
use super::Value;
use crate::error::{Error, Result};
use crate::parser::module::{ConstExpr, ImportDesc, ParsedModule};

#[derive(Debug, PartialEq)]
enum MemoryPlan {
    None,
    Create { min: u32, max: u32 },
    Grow { delta: u32 },
    Keep,
}

struct Plan {
    module: Arc<ParsedModule>,
    instance: usize,
    host_functions: Vec<FunctionInstance>,
    func_addrs: Vec<FuncAddr>,
    globals: Vec<GlobalInstance>,
    memory: MemoryPlan,
    table: Option<Table>,
    data: Vec<(u32, usize)>,
}

/// Load `module` into `store`, returning the new instance index
pub(crate) fn instantiate(store: &mut Store, runtime_id: u64, config: &RuntimeConfig, module: &Module) -> Result<usize> {
    let plan = plan(store, runtime_id, config, module)?;
    commit(store, plan)
}

fn plan(store: &Store, runtime_id: u64, config: &RuntimeConfig, module: &Module) -> Result<Plan> {
    let info = module.shared_info();
    let instance = store.instances.len();

    let mut host_functions = Vec::new();
    let mut func_addrs = Vec::with_capacity(info.total_functions() as usize);
    let mut imported_globals = Vec::new();
    let mut next_addr = store.functions.len();

    for (idx, import) in info.imports.iter().enumerate() {
        let name = || format!("{}.{}", import.module, import.name);
        match (&import.desc, module.binding(idx)) {
            (ImportDesc::Function(type_idx), Some(ImportBinding::Host { func, name: bound_name })) => {
                let ty = info.types.get(*type_idx as usize).cloned().unwrap_or_default();
                host_functions.push(FunctionInstance::Host {
                    func: Arc::clone(func),
                    ty,
                    name: bound_name.clone(),
                });
                func_addrs.push(next_addr);
                next_addr += 1;
            }
            (ImportDesc::Function(_), Some(ImportBinding::Export(handle))) => {
                if handle.runtime_id != runtime_id || store.function(handle.func_addr).is_err() {
                    return Err(Error::link(format!(
                        "{} is bound to a function of another runtime",
                        name()
                    )));
                }
                func_addrs.push(handle.func_addr);
            }
            (ImportDesc::Global(gt), Some(ImportBinding::Global(value))) => {
                imported_globals.push(*value);
                debug_assert_eq!(gt.value_type, value.typ());
            }
            (ImportDesc::Memory(_), _) => {}
            (ImportDesc::Table(_), _) => {
                return Err(Error::link(format!("table import {} is not supported", name())));
            }
            _ => return Err(Error::link(format!("unresolved import {}", name()))),
        }
    }

    let first_defined = next_addr;
    func_addrs.extend((0..info.functions.len()).map(|i| first_defined + i));

    let mut globals: Vec<GlobalInstance> = imported_globals
        .iter()
        .map(|value| GlobalInstance {
            value: *value,
            mutable: false,
        })
        .collect();
    for global in &info.globals {
        globals.push(GlobalInstance {
            value: eval_const(&global.init, &imported_globals)?,
            mutable: global.global_type.mutable,
        });
    }

    let (memory, memory_bytes) = plan_memory(store, config, &info)?;

    let mut table = info.tables.first().map(|tt| Table::new(tt.limits));
    for (i, segment) in info.elements.iter().enumerate() {
        let offset = eval_offset(&segment.offset, &imported_globals)?;
        let table = table
            .as_mut()
            .ok_or_else(|| Error::link(format!("element segment {i} has no table")))?;
        let addrs = segment
            .functions
            .iter()
            .map(|idx| func_addrs.get(*idx as usize).copied())
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| Error::link(format!("element segment {i} references an unknown function")))?;
        if !table.fits(offset, addrs.len()) {
            return Err(Error::link(format!("element segment {i} out of bounds")));
        }
        table.init(offset, &addrs)?;
    }

    let mut data = Vec::with_capacity(info.data.len());
    for (i, segment) in info.data.iter().enumerate() {
        let offset = eval_offset(&segment.offset, &imported_globals)?;
        if offset as u64 + segment.bytes.len() as u64 > memory_bytes as u64 {
            return Err(Error::link(format!("data segment {i} out of bounds")));
        }
        data.push((offset, i));
    }

    Ok(Plan {
        module: info,
        instance,
        host_functions,
        func_addrs,
        globals,
        memory,
        table,
        data,
    })
}

/// Decide what loading does to the runtime memory. Returns the plan and the
/// memory size in bytes once it is applied.
fn plan_memory(store: &Store, config: &RuntimeConfig, info: &ParsedModule) -> Result<(MemoryPlan, usize)> {
    let current = store.memory.as_ref();
    let Some(limits) = info.memory_limits() else {
        return Ok((MemoryPlan::None, current.map_or(0, Memory::size_bytes)));
    };

    let max = limits.max.unwrap_or(MAX_PAGES).min(config.max_memory_pages);
    if limits.min > max {
        return Err(Error::link(format!(
            "memory needs {} pages, at most {max} allowed",
            limits.min
        )));
    }

    if let (Some(memory), Some(declared)) = (current, limits.max) {
        if memory.max_pages() > declared {
            return Err(Error::link(format!(
                "memory declares at most {declared} pages, runtime memory may grow to {}",
                memory.max_pages()
            )));
        }
    }

    let plan = match current {
        None => MemoryPlan::Create { min: limits.min, max },
        Some(memory) if memory.size() >= limits.min => MemoryPlan::Keep,
        Some(memory) if limits.min <= memory.max_pages() => MemoryPlan::Grow {
            delta: limits.min - memory.size(),
        },
        Some(memory) => {
            return Err(Error::link(format!(
                "memory needs {} pages, runtime memory is limited to {}",
                limits.min,
                memory.max_pages()
            )))
        }
    };
    let pages = current.map_or(0, Memory::size).max(limits.min);
    Ok((plan, pages as usize * PAGE_SIZE))
}

fn eval_const(expr: &ConstExpr, imported_globals: &[Value]) -> Result<Value> {
    Ok(match expr {
        ConstExpr::I32(v) => Value::I32(*v),
        ConstExpr::I64(v) => Value::I64(*v),
        ConstExpr::F32(v) => Value::F32(*v),
        ConstExpr::F64(v) => Value::F64(*v),
        ConstExpr::GlobalGet(idx) => *imported_globals
            .get(*idx as usize)
            .ok_or_else(|| Error::link(format!("initialiser reads unknown global {idx}")))?,
    })
}

fn eval_offset(expr: &ConstExpr, imported_globals: &[Value]) -> Result<u32> {
    match eval_const(expr, imported_globals)? {
        Value::I32(offset) => Ok(offset as u32),
        other => Err(Error::link(format!("segment offset must be i32, got {other}"))),
    }
}

fn commit(store: &mut Store, plan: Plan) -> Result<usize> {
    match plan.memory {
        MemoryPlan::Create { min, max } => {
            let memory = Memory::try_new(min, max)
                .ok_or_else(|| Error::link(format!("cannot allocate {min} pages of memory")))?;
            store.memory = Some(memory);
        }
        MemoryPlan::Grow { delta } => {
            let grown = store.memory.as_mut().and_then(|memory| memory.grow(delta));
            if grown.is_none() {
                return Err(Error::link(format!("cannot grow memory by {delta} pages")));
            }
        }
        MemoryPlan::None | MemoryPlan::Keep => {}
    }

    let module = plan.module;
    store.functions.extend(plan.host_functions);
    for (body, type_idx) in module.functions.iter().enumerate() {
        store.functions.push(FunctionInstance::Wasm {
            module: Arc::clone(&module),
            instance: plan.instance,
            body,
            ty: module.types.get(*type_idx as usize).cloned().unwrap_or_default(),
        });
    }

    let global_addrs = (store.globals.len()..store.globals.len() + plan.globals.len()).collect();
    store.globals.extend(plan.globals);

    let table_addr = plan.table.map(|table| {
        store.tables.push(table);
        store.tables.len() - 1
    });

    if let Some(memory) = store.memory.as_mut() {
        for (offset, segment) in plan.data {
            if let Some(data) = module.data.get(segment) {
                memory.write_bytes(offset, &data.bytes)?;
                trace!(offset, len = data.bytes.len(), "data segment written");
            }
        }
    }

    let start = module
        .start
        .and_then(|idx| plan.func_addrs.get(idx as usize).copied());
    debug!(
        instance = plan.instance,
        functions = plan.func_addrs.len(),
        memory_pages = store.memory.as_ref().map_or(0, Memory::size),
        has_start = start.is_some(),
        "module instantiated"
    );
    store.instances.push(ModuleInstance {
        module,
        func_addrs: plan.func_addrs,
        global_addrs,
        table_addr,
        start,
        started: start.is_none(),
    });
    Ok(plan.instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::builder::{Code, ModuleBuilder};
    use crate::parser::module::ValueType::*;
    use crate::runtime::{Environment, HostContext, ResultCode, Trap};

    fn load(store: &mut Store, env: &Environment, builder: &ModuleBuilder) -> Result<usize> {
        let module = Module::parse(env, &builder.build())?;
        instantiate(store, 1, &RuntimeConfig::DEFAULT, &module)
    }

    #[test]
    fn test_unresolved_import_leaves_store_untouched() {
        let env = Environment::new();
        let mut store = Store::new();
        let mut b = ModuleBuilder::new();
        b.import_function("env", "tick", &[], &[]);
        b.memory(1, None).data(0, b"abc");
        b.add_global(I32, true, ConstExpr::I32(3));
        b.add_function(&[], &[], &[], Code::new().call(0).end());

        let err = load(&mut store, &env, &b).unwrap_err();
        assert_eq!(err.code(), ResultCode::LinkError);
        assert!(err.to_string().contains("unresolved import env.tick"));
        assert!(store.memory.is_none());
        assert!(store.functions.is_empty());
        assert!(store.globals.is_empty());
        assert!(store.instances.is_empty());
    }

    #[test]
    fn test_segments_and_globals_initialised() {
        let env = Environment::new();
        let mut store = Store::new();
        let mut b = ModuleBuilder::new();
        let base = b.import_global("env", "base", I32, false);
        b.memory(1, Some(4)).data(8, b"hello");
        b.table(4, None);
        b.add_global(I32, false, ConstExpr::GlobalGet(base));
        let f = b.add_function(&[], &[], &[], Code::new().end());
        b.element(2, &[f, f]);

        let mut module = Module::parse(&env, &b.build()).unwrap();
        module.link_global("env", "base", Value::I32(40)).unwrap();
        let instance = instantiate(&mut store, 1, &RuntimeConfig::DEFAULT, &module).unwrap();

        assert_eq!(instance, 0);
        let memory = store.memory.as_ref().unwrap();
        assert_eq!(memory.size(), 1);
        assert_eq!(memory.max_pages(), 4);
        assert_eq!(&memory.data()[8..13], b"hello");
        assert_eq!(store.globals[1].value, Value::I32(40));
        assert_eq!(store.tables[0].get(2), Ok(0));
        assert_eq!(store.tables[0].get(0), Err(Trap::UninitializedElement));
        assert!(store.instances[0].started);
    }

    #[test]
    fn test_out_of_bounds_data_rejected() {
        let env = Environment::new();
        let mut store = Store::new();
        let mut b = ModuleBuilder::new();
        b.memory(1, Some(1)).data(65534, b"xyz");
        assert_eq!(load(&mut store, &env, &b).unwrap_err().code(), ResultCode::LinkError);
        assert!(store.memory.is_none());
    }

    #[test]
    fn test_memory_cap_applies() {
        let env = Environment::new();
        let mut store = Store::new();
        let mut b = ModuleBuilder::new();
        b.memory(3, None);
        let module = Module::parse(&env, &b.build()).unwrap();
        let config = RuntimeConfig::DEFAULT.with_max_memory_pages(2);
        assert!(instantiate(&mut store, 1, &config, &module).is_err());

        let module = Module::parse(&env, &b.build()).unwrap();
        let config = RuntimeConfig::DEFAULT.with_max_memory_pages(8);
        instantiate(&mut store, 1, &config, &module).unwrap();
        assert_eq!(store.memory.as_ref().map(Memory::max_pages), Some(8));
    }

    #[test]
    fn test_second_module_shares_and_grows_memory() {
        let env = Environment::new();
        let mut store = Store::new();
        let mut first = ModuleBuilder::new();
        first.memory(1, None);
        load(&mut store, &env, &first).unwrap();

        let mut second = ModuleBuilder::new();
        second.import_memory("env", "memory", 2, None);
        second.data(65536, b"!");
        load(&mut store, &env, &second).unwrap();

        let memory = store.memory.as_ref().unwrap();
        assert_eq!(memory.size(), 2);
        assert_eq!(memory.data()[65536], b'!');
    }

    #[test]
    fn test_host_imports_get_fresh_addresses() {
        let env = Environment::new();
        let mut store = Store::new();
        let mut b = ModuleBuilder::new();
        b.import_function("env", "f", &[], &[I32]);
        b.add_function(&[], &[], &[], Code::new().call(0).drop().end());
        b.start(1);

        let mut module = Module::parse(&env, &b.build()).unwrap();
        let seven = |_: &mut HostContext<'_>, _: &[Value]| -> std::result::Result<Vec<Value>, Trap> {
            Ok(vec![Value::I32(7)])
        };
        module
            .link_raw("env", "f", &crate::parser::module::FunctionType::new(&[], &[I32]), seven)
            .unwrap();
        instantiate(&mut store, 1, &RuntimeConfig::DEFAULT, &module).unwrap();

        assert_eq!(store.instances[0].func_addrs, vec![0, 1]);
        assert_eq!(store.instances[0].start, Some(1));
        assert!(!store.instances[0].started);
        assert!(matches!(store.functions[0], FunctionInstance::Host { .. }));
    }
}
