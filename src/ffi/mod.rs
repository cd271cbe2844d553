//! C ABI
//!
//! Every object crosses the boundary as a [`Handle`] into a process-wide
//! table. Functions return a [`ResultCode`] as `i32` unless they produce a
//! handle or a count, in which case 0 signals failure. Errors reported by the
//! engine land in the last-error slot of the environment or runtime involved
//! and can be read back with [`wasmbed_get_error_info`]. Panics never unwind
//! into the caller.
#![allow(unsafe_code)]
#![allow(clippy::missing_safety_doc)]

pub mod handles;

use std::ffi::{c_char, c_void, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::slice;
use std::sync::Arc;

use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::parser::module::{FunctionType, ValueType};
use crate::runtime::{
    Environment, ErrorInfo, FunctionHandle, HostContext, HostFunction, Module, ResultCode, Runtime, Trap, Value,
};
use handles::{table, Handle, ModuleEntry, Object};

pub const WASMBED_TYPE_NONE: u32 = 0;
pub const WASMBED_TYPE_I32: u32 = 1;
pub const WASMBED_TYPE_I64: u32 = 2;
pub const WASMBED_TYPE_F32: u32 = 3;
pub const WASMBED_TYPE_F64: u32 = 4;

fn type_code(typ: ValueType) -> u32 {
    match typ {
        ValueType::I32 => WASMBED_TYPE_I32,
        ValueType::I64 => WASMBED_TYPE_I64,
        ValueType::F32 => WASMBED_TYPE_F32,
        ValueType::F64 => WASMBED_TYPE_F64,
    }
}

fn value_type(code: u32) -> Option<ValueType> {
    match code {
        WASMBED_TYPE_I32 => Some(ValueType::I32),
        WASMBED_TYPE_I64 => Some(ValueType::I64),
        WASMBED_TYPE_F32 => Some(ValueType::F32),
        WASMBED_TYPE_F64 => Some(ValueType::F64),
        _ => None,
    }
}

/// A tagged value. `bits` holds the payload as produced by
/// [`Value::to_bits`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WasmbedValue {
    pub ty: u32,
    pub bits: u64,
}

impl WasmbedValue {
    pub const NONE: WasmbedValue = WasmbedValue {
        ty: WASMBED_TYPE_NONE,
        bits: 0,
    };

    fn to_value(self) -> Option<Value> {
        value_type(self.ty).map(|typ| Value::from_bits(typ, self.bits))
    }
}

impl From<Value> for WasmbedValue {
    fn from(value: Value) -> Self {
        WasmbedValue {
            ty: type_code(value.typ()),
            bits: value.to_bits(),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct WasmbedErrorInfo {
    pub code: i32,
    pub line: u32,
    pub message: [u8; 256],
    pub file: [u8; 128],
}

impl WasmbedErrorInfo {
    fn empty() -> Self {
        WasmbedErrorInfo {
            code: ResultCode::Ok as i32,
            line: 0,
            message: [0; 256],
            file: [0; 128],
        }
    }

    fn from_info(info: &ErrorInfo) -> Self {
        let mut out = Self::empty();
        out.code = info.code as i32;
        out.line = info.line;
        copy_c_string(&info.message, &mut out.message);
        copy_c_string(info.file, &mut out.file);
        out
    }
}

/// Copy as much of `text` as fits, always leaving a terminating NUL
fn copy_c_string(text: &str, buf: &mut [u8]) {
    let Some(room) = buf.len().checked_sub(1) else {
        return;
    };
    let n = text.len().min(room);
    buf[..n].copy_from_slice(&text.as_bytes()[..n]);
    buf[n] = 0;
}

/// Host callback. Receives the user data pointer given at link time, the
/// runtime memory, the arguments, and a result buffer pre-tagged with the
/// expected result types. A nonzero return traps the calling function.
pub type RawHostFn = unsafe extern "C" fn(
    user_data: *mut c_void,
    memory: *mut u8,
    memory_len: u64,
    args: *const WasmbedValue,
    nargs: u32,
    results: *mut WasmbedValue,
    nresults: u32,
) -> i32;

#[derive(Clone, Copy)]
struct SendPtr(*mut c_void);

// The pointer is opaque to the engine and only handed back to the host.
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

struct RawHostFunction {
    name: String,
    func: RawHostFn,
    user_data: SendPtr,
    ty: FunctionType,
}

impl HostFunction for RawHostFunction {
    fn call(&self, ctx: &mut HostContext<'_>, args: &[Value]) -> std::result::Result<Vec<Value>, Trap> {
        let raw_args: Vec<WasmbedValue> = args.iter().copied().map(WasmbedValue::from).collect();
        let mut raw_results: Vec<WasmbedValue> = self
            .ty
            .return_types
            .iter()
            .map(|typ| WasmbedValue {
                ty: type_code(*typ),
                bits: 0,
            })
            .collect();
        let memory = ctx.memory_mut();
        let (mem_ptr, mem_len) = match memory.is_empty() {
            true => (ptr::null_mut(), 0),
            false => (memory.as_mut_ptr(), memory.len() as u64),
        };

        let rc = unsafe {
            (self.func)(
                self.user_data.0,
                mem_ptr,
                mem_len,
                raw_args.as_ptr(),
                raw_args.len() as u32,
                raw_results.as_mut_ptr(),
                raw_results.len() as u32,
            )
        };
        if rc != 0 {
            return Err(Trap::Host(format!("{} returned {rc}", self.name)));
        }

        raw_results
            .iter()
            .zip(&self.ty.return_types)
            .map(|(raw, expected)| match raw.to_value() {
                Some(value) if value.typ() == *expected => Ok(value),
                _ => Err(Trap::Host(format!(
                    "{} returned a value of type code {}, expected {expected}",
                    self.name, raw.ty
                ))),
            })
            .collect()
    }
}

struct RawUserData(*mut c_void);

unsafe impl Send for RawUserData {}
unsafe impl Sync for RawUserData {}

fn guard<T>(export: &'static str, failed: T, f: impl FnOnce() -> Result<T>) -> (T, ResultCode) {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => (value, ResultCode::Ok),
        Ok(Err(err)) => {
            debug!(export, error = %err, "call failed");
            (failed, err.code())
        }
        Err(_) => {
            error!(export, "panic caught at the C boundary");
            (failed, ResultCode::InvalidState)
        }
    }
}

fn guard_code(export: &'static str, f: impl FnOnce() -> Result<()>) -> i32 {
    guard(export, (), f).1 as i32
}

fn guard_value<T>(export: &'static str, failed: T, f: impl FnOnce() -> Result<T>) -> T {
    guard(export, failed, f).0
}

unsafe fn c_str<'a>(text: *const c_char, what: &str) -> Result<&'a str> {
    if text.is_null() {
        return Err(Error::invalid_state(format!("{what} is null")));
    }
    CStr::from_ptr(text)
        .to_str()
        .map_err(|_| Error::invalid_state(format!("{what} is not valid UTF-8")))
}

unsafe fn out_ptr<'a, T>(out: *mut T, what: &str) -> Result<&'a mut T> {
    out.as_mut().ok_or_else(|| Error::invalid_state(format!("{what} is null")))
}

#[no_mangle]
pub extern "C" fn wasmbed_new_environment() -> Handle {
    guard_value("wasmbed_new_environment", 0, || {
        Ok(table().insert(Object::Environment(Arc::new(Environment::new()))))
    })
}

/// Runtimes created from the environment stay allocated but report stale
/// context errors from then on
#[no_mangle]
pub extern "C" fn wasmbed_free_environment(env: Handle) -> i32 {
    guard_code("wasmbed_free_environment", || {
        handles::environment(env)?;
        let object = table().remove(env);
        drop(object);
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn wasmbed_new_runtime(env: Handle, stack_size: u64) -> Handle {
    guard_value("wasmbed_new_runtime", 0, || {
        let env = handles::environment(env)?;
        let runtime = Runtime::new(&env, stack_size as usize)?;
        Ok(table().insert(Object::Runtime(Arc::new(runtime))))
    })
}

/// Also frees every function handle found through the runtime
#[no_mangle]
pub extern "C" fn wasmbed_free_runtime(rt: Handle) -> i32 {
    guard_code("wasmbed_free_runtime", || {
        let runtime = handles::runtime(rt)?;
        let runtime_id = runtime.id();
        let mut table = table();
        table.remove(rt);
        let functions = table.remove_where(|o| matches!(o, Object::Function(f) if f.runtime_id() == runtime_id));
        drop(table);
        debug!(runtime = runtime_id, functions, "runtime handle freed");
        Ok(())
    })
}

/// The pointer stays valid until memory next grows or the runtime is freed
#[no_mangle]
pub unsafe extern "C" fn wasmbed_get_memory(rt: Handle, data: *mut *mut u8, len: *mut u64) -> i32 {
    guard_code("wasmbed_get_memory", || {
        let runtime = handles::runtime(rt)?;
        let data = out_ptr(data, "data")?;
        let len = out_ptr(len, "len")?;
        let mut view = runtime.memory()?;
        *data = match view.is_empty() {
            true => ptr::null_mut(),
            false => view.as_mut_ptr(),
        };
        *len = view.len() as u64;
        Ok(())
    })
}

#[no_mangle]
pub unsafe extern "C" fn wasmbed_get_memory_size(rt: Handle, len: *mut u64) -> i32 {
    guard_code("wasmbed_get_memory_size", || {
        let runtime = handles::runtime(rt)?;
        let len = out_ptr(len, "len")?;
        *len = runtime.memory_size()? as u64;
        Ok(())
    })
}

#[no_mangle]
pub unsafe extern "C" fn wasmbed_get_user_data(rt: Handle, data: *mut *mut c_void) -> i32 {
    guard_code("wasmbed_get_user_data", || {
        let runtime = handles::runtime(rt)?;
        let data = out_ptr(data, "data")?;
        *data = runtime
            .user_data()?
            .and_then(|d| d.downcast_ref::<RawUserData>().map(|raw| raw.0))
            .unwrap_or(ptr::null_mut());
        Ok(())
    })
}

/// A null pointer clears the user data
#[no_mangle]
pub extern "C" fn wasmbed_set_user_data(rt: Handle, data: *mut c_void) -> i32 {
    guard_code("wasmbed_set_user_data", || {
        let runtime = handles::runtime(rt)?;
        match data.is_null() {
            true => runtime.clear_user_data(),
            false => runtime.set_user_data(Arc::new(RawUserData(data))),
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn wasmbed_parse_module(env: Handle, bytes: *const u8, len: u64, module: *mut Handle) -> i32 {
    guard_code("wasmbed_parse_module", || {
        let env = handles::environment(env)?;
        let out = out_ptr(module, "module")?;
        let bytes = match bytes.is_null() {
            true => &[][..],
            false => slice::from_raw_parts(bytes, len as usize),
        };
        let parsed = Module::parse(&env, bytes)?;
        *out = table().insert(Object::Module(ModuleEntry {
            module: parsed,
            loaded: None,
        }));
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn wasmbed_free_module(module: Handle) -> i32 {
    guard_code("wasmbed_free_module", || {
        handles::with_module(module, |_| Ok(()))?;
        let object = table().remove(module);
        drop(object);
        Ok(())
    })
}

/// Load a module into a runtime. A module loads at most once; after a failed
/// load more imports may be linked and the load retried.
#[no_mangle]
pub extern "C" fn wasmbed_load_module(rt: Handle, module: Handle) -> i32 {
    guard_code("wasmbed_load_module", || {
        let runtime = handles::runtime(rt)?;
        let parsed = handles::with_module(module, |entry| match entry.loaded {
            Some(_) => Err(Error::invalid_state("module already loaded")),
            None => Ok(entry.module.clone()),
        })?;
        let loaded = runtime.load_ref(&parsed)?;
        handles::with_module(module, |entry| {
            entry.loaded = Some(loaded);
            Ok(())
        })
    })
}

#[no_mangle]
pub extern "C" fn wasmbed_run_start(rt: Handle, module: Handle) -> i32 {
    guard_code("wasmbed_run_start", || {
        let runtime = handles::runtime(rt)?;
        let loaded = handles::with_module(module, |entry| {
            entry
                .loaded
                .ok_or_else(|| Error::invalid_state("module is not loaded"))
        })?;
        runtime.run_start(&loaded)
    })
}

/// Bind `func` to the function imports named `module_name.field`
/// (`module_name` may be `"*"`). `signature` is compact, e.g. `"i(ii)"`.
#[no_mangle]
pub unsafe extern "C" fn wasmbed_link_raw_function(
    module: Handle,
    module_name: *const c_char,
    field: *const c_char,
    signature: *const c_char,
    func: Option<RawHostFn>,
    user_data: *mut c_void,
) -> i32 {
    guard_code("wasmbed_link_raw_function", || {
        let module_name = c_str(module_name, "module name")?;
        let field = c_str(field, "field")?;
        let signature = c_str(signature, "signature")?;
        let func = func.ok_or_else(|| Error::invalid_state("host function is null"))?;
        let ty = FunctionType::parse_signature(signature)
            .ok_or_else(|| Error::link(format!("malformed signature {signature:?}")))?;
        let host = RawHostFunction {
            name: format!("{module_name}.{field}"),
            func,
            user_data: SendPtr(user_data),
            ty: ty.clone(),
        };
        handles::with_module(module, |entry| {
            if entry.loaded.is_some() {
                return Err(Error::invalid_state("module already loaded"));
            }
            entry.module.link_raw(module_name, field, &ty, host)
        })
    })
}

/// Look up an export. Repeated lookups of one function return the same
/// handle, which shares call state and results.
#[no_mangle]
pub unsafe extern "C" fn wasmbed_find_function(rt: Handle, name: *const c_char, func: *mut Handle) -> i32 {
    guard_code("wasmbed_find_function", || {
        let runtime = handles::runtime(rt)?;
        let name = c_str(name, "function name")?;
        let out = out_ptr(func, "func")?;
        let found = runtime.find_function(name)?;
        let mut table = table();
        let existing = table.find(|o| {
            matches!(o, Object::Function(f) if f.runtime_id() == found.runtime_id() && f.func_addr == found.func_addr && f.name() == found.name())
        });
        *out = match existing {
            Some(handle) => handle,
            None => table.insert(Object::Function(found)),
        };
        Ok(())
    })
}

fn call_with(func: &FunctionHandle, args: &[Value]) -> Result<()> {
    func.call(args).map(drop)
}

/// Call with typed arguments; read the results with
/// [`wasmbed_get_results`]
#[no_mangle]
pub unsafe extern "C" fn wasmbed_call(func: Handle, args: *const WasmbedValue, nargs: u32) -> i32 {
    guard_code("wasmbed_call", || {
        let func = handles::function(func)?;
        let raw = match (args.is_null(), nargs) {
            (_, 0) => &[][..],
            (true, _) => return Err(Error::invalid_state("args is null")),
            (false, n) => slice::from_raw_parts(args, n as usize),
        };
        let values = raw
            .iter()
            .enumerate()
            .map(|(i, arg)| {
                arg.to_value()
                    .ok_or_else(|| Error::arg_mismatch(format!("argument {i} has unknown type code {}", arg.ty)))
            })
            .collect::<Result<Vec<_>>>()?;
        call_with(&func, &values)
    })
}

/// Call with textual arguments, converted according to the parameter types
#[no_mangle]
pub unsafe extern "C" fn wasmbed_call_argv(func: Handle, argc: u32, argv: *const *const c_char) -> i32 {
    guard_code("wasmbed_call_argv", || {
        let func = handles::function(func)?;
        if argc as usize != func.arg_count() {
            return Err(Error::arg_mismatch(format!(
                "{} takes {} arguments, got {argc}",
                func.name(),
                func.arg_count()
            )));
        }
        let texts = match (argv.is_null(), argc) {
            (_, 0) => &[][..],
            (true, _) => return Err(Error::invalid_state("argv is null")),
            (false, n) => slice::from_raw_parts(argv, n as usize),
        };
        let mut values = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            let text = c_str(*text, "argument")?;
            let typ = func
                .arg_type(i)
                .ok_or_else(|| Error::arg_mismatch(format!("no parameter {i}")))?;
            values.push(Value::parse(typ, text).map_err(Error::arg_mismatch)?);
        }
        call_with(&func, &values)
    })
}

/// Copy the results of the last completed call. `count` receives the number
/// of results even when `capacity` is too small.
#[no_mangle]
pub unsafe extern "C" fn wasmbed_get_results(
    func: Handle,
    out: *mut WasmbedValue,
    capacity: u32,
    count: *mut u32,
) -> i32 {
    guard_code("wasmbed_get_results", || {
        let func = handles::function(func)?;
        let count = out_ptr(count, "count")?;
        let results = func.results()?;
        *count = results.len() as u32;
        if results.is_empty() {
            return Ok(());
        }
        if out.is_null() || (capacity as usize) < results.len() {
            return Err(Error::invalid_state(format!(
                "result buffer holds {capacity} values, {} needed",
                results.len()
            )));
        }
        let out = slice::from_raw_parts_mut(out, results.len());
        for (slot, value) in out.iter_mut().zip(results) {
            *slot = value.into();
        }
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn wasmbed_get_arg_count(func: Handle) -> u32 {
    guard_value("wasmbed_get_arg_count", 0, || Ok(handles::function(func)?.arg_count() as u32))
}

#[no_mangle]
pub extern "C" fn wasmbed_get_ret_count(func: Handle) -> u32 {
    guard_value("wasmbed_get_ret_count", 0, || Ok(handles::function(func)?.ret_count() as u32))
}

/// Type code of parameter `idx`, `WASMBED_TYPE_NONE` when out of range
#[no_mangle]
pub extern "C" fn wasmbed_get_arg_type(func: Handle, idx: u32) -> u32 {
    guard_value("wasmbed_get_arg_type", WASMBED_TYPE_NONE, || {
        Ok(handles::function(func)?
            .arg_type(idx as usize)
            .map_or(WASMBED_TYPE_NONE, type_code))
    })
}

#[no_mangle]
pub extern "C" fn wasmbed_get_ret_type(func: Handle, idx: u32) -> u32 {
    guard_value("wasmbed_get_ret_type", WASMBED_TYPE_NONE, || {
        Ok(handles::function(func)?
            .ret_type(idx as usize)
            .map_or(WASMBED_TYPE_NONE, type_code))
    })
}

/// Copy the export name into `buf`, truncated and NUL terminated
#[no_mangle]
pub unsafe extern "C" fn wasmbed_get_function_name(func: Handle, buf: *mut c_char, len: u32) -> i32 {
    guard_code("wasmbed_get_function_name", || {
        let func = handles::function(func)?;
        if buf.is_null() || len == 0 {
            return Err(Error::invalid_state("name buffer is empty"));
        }
        let buf = slice::from_raw_parts_mut(buf.cast::<u8>(), len as usize);
        copy_c_string(func.name(), buf);
        Ok(())
    })
}

/// Last error of an environment or runtime; `code` is 0 when there is none
#[no_mangle]
pub unsafe extern "C" fn wasmbed_get_error_info(handle: Handle, out: *mut WasmbedErrorInfo) -> i32 {
    guard_code("wasmbed_get_error_info", || {
        let out = out_ptr(out, "out")?;
        let info = last_error(handle)?;
        *out = info.as_ref().map_or_else(WasmbedErrorInfo::empty, WasmbedErrorInfo::from_info);
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn wasmbed_reset_error_info(handle: Handle) -> i32 {
    guard_code("wasmbed_reset_error_info", || {
        let table = table();
        match table.get(handle) {
            Some(Object::Environment(env)) => env.reset_error_info(),
            Some(Object::Runtime(rt)) => rt.reset_error_info(),
            _ => return Err(Error::invalid_state(format!("{handle:#x} is not an environment or runtime"))),
        }
        Ok(())
    })
}

fn last_error(handle: Handle) -> Result<Option<ErrorInfo>> {
    let table = table();
    match table.get(handle) {
        Some(Object::Environment(env)) => Ok(env.last_error()),
        Some(Object::Runtime(rt)) => Ok(rt.last_error()),
        _ => Err(Error::invalid_state(format!("{handle:#x} is not an environment or runtime"))),
    }
}

/// Static description of a result code
#[no_mangle]
pub extern "C" fn wasmbed_result_message(code: i32) -> *const c_char {
    ResultCode::from_i32(code)
        .map_or("unknown result code\0", |code| code.message())
        .as_ptr()
        .cast()
}
