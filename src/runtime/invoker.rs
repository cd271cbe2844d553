//! Function handles: lookup results, argument checking and call state
//!
//! A [`FunctionHandle`] refers to its runtime weakly. Introspection keeps
//! working after the runtime is gone; calling does not.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use tracing::trace;

use super::executor::Executor;
use super::lifecycle::RuntimeShared;
use super::store::FuncAddr;
use super::Value;
use crate::error::{Error, Result};
use crate::parser::module::{FunctionType, ValueType};

/// Progress of the most recent call through a handle. `Completed` and
/// `Trapped` are terminal; the next call starts again from `Idle`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum CallState {
    #[default]
    Idle,
    ArgsBound,
    Executing,
    Completed,
    Trapped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionDescriptor {
    pub name: String,
    pub params: Vec<ValueType>,
    pub results: Vec<ValueType>,
}

impl FunctionDescriptor {
    pub fn new(name: &str, ty: &FunctionType) -> Self {
        FunctionDescriptor {
            name: name.to_string(),
            params: ty.parameters.clone(),
            results: ty.return_types.clone(),
        }
    }

    pub fn function_type(&self) -> FunctionType {
        FunctionType::new(&self.params, &self.results)
    }
}

impl fmt::Display for FunctionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.function_type())
    }
}

#[derive(Debug, Default)]
struct CallRecord {
    state: CallState,
    results: Vec<Value>,
}

/// Callable export of a module loaded into a runtime. Clones share call
/// state and results.
#[derive(Clone)]
pub struct FunctionHandle {
    runtime: Weak<RuntimeShared>,
    pub(crate) runtime_id: u64,
    pub(crate) func_addr: FuncAddr,
    instance: usize,
    descriptor: Arc<FunctionDescriptor>,
    record: Arc<Mutex<CallRecord>>,
}

impl FunctionHandle {
    pub(crate) fn new(
        runtime: Weak<RuntimeShared>,
        runtime_id: u64,
        func_addr: FuncAddr,
        instance: usize,
        descriptor: FunctionDescriptor,
    ) -> Self {
        FunctionHandle {
            runtime,
            runtime_id,
            func_addr,
            instance,
            descriptor: Arc::new(descriptor),
            record: Arc::new(Mutex::new(CallRecord::default())),
        }
    }

    /// Run the function. Arguments must match the signature exactly; on a
    /// mismatch nothing is executed.
    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>> {
        let runtime = self
            .runtime
            .upgrade()
            .ok_or_else(|| Error::invalid_state("runtime has been destroyed"))?;
        let result = self.call_on(&runtime, args);
        runtime.errors.record(result)
    }

    fn call_on(&self, runtime: &RuntimeShared, args: &[Value]) -> Result<Vec<Value>> {
        {
            let mut record = self.record();
            record.state = CallState::Idle;
            record.results.clear();
        }
        self.check_args(args)?;
        self.set_state(CallState::ArgsBound);

        runtime.check_env()?;
        let mut store = runtime.lock_store()?;
        if !store.instance(self.instance)?.started {
            return Err(Error::invalid_state("module not yet started"));
        }

        self.set_state(CallState::Executing);
        trace!(function = %self.descriptor.name, args = args.len(), "call");
        let user_data = runtime.user_data();
        let result = Executor::new(&mut store, &runtime.config, user_data.as_deref()).invoke(self.func_addr, args);
        drop(store);

        let mut record = self.record();
        match result {
            Ok(values) => {
                record.state = CallState::Completed;
                record.results = values.clone();
                Ok(values)
            }
            Err(trap) => {
                record.state = CallState::Trapped;
                Err(trap.into())
            }
        }
    }

    fn check_args(&self, args: &[Value]) -> Result<()> {
        let params = &self.descriptor.params;
        if args.len() != params.len() {
            return Err(Error::arg_mismatch(format!(
                "{} takes {} arguments, got {}",
                self.descriptor.name,
                params.len(),
                args.len()
            )));
        }
        for (i, (arg, expected)) in args.iter().zip(params).enumerate() {
            if arg.typ() != *expected {
                return Err(Error::arg_mismatch(format!(
                    "argument {i} of {} must be {expected}, got {}",
                    self.descriptor.name,
                    arg.typ()
                )));
            }
        }
        Ok(())
    }

    /// Results of the last call, if it completed
    pub fn results(&self) -> Result<Vec<Value>> {
        let record = self.record();
        let result = match record.state {
            CallState::Completed => Ok(record.results.clone()),
            state => Err(Error::invalid_state(format!("no completed call (state {state:?})"))),
        };
        match self.runtime.upgrade() {
            Some(runtime) => runtime.errors.record(result),
            None => result,
        }
    }

    pub fn call_state(&self) -> CallState {
        self.record().state
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    pub fn arg_count(&self) -> usize {
        self.descriptor.params.len()
    }

    pub fn ret_count(&self) -> usize {
        self.descriptor.results.len()
    }

    pub fn arg_type(&self, idx: usize) -> Option<ValueType> {
        self.descriptor.params.get(idx).copied()
    }

    pub fn ret_type(&self, idx: usize) -> Option<ValueType> {
        self.descriptor.results.get(idx).copied()
    }

    pub fn runtime_id(&self) -> u64 {
        self.runtime_id
    }

    fn set_state(&self, state: CallState) {
        self.record().state = state;
    }

    fn record(&self) -> MutexGuard<'_, CallRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for FunctionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionHandle")
            .field("runtime", &self.runtime_id)
            .field("addr", &self.func_addr)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::builder::{Code, ModuleBuilder};
    use crate::parser::instruction::NumericOp;
    use crate::parser::module::ValueType::*;
    use crate::runtime::{Environment, Module, ResultCode, Runtime};
    use rstest::rstest;

    fn add_runtime(env: &Environment) -> Runtime {
        let mut b = ModuleBuilder::new();
        let add = b.add_function(
            &[I32, I32],
            &[I32],
            &[],
            Code::new().local_get(0).local_get(1).numeric(NumericOp::I32Add).end(),
        );
        b.export_function("add", add);
        let runtime = Runtime::new(env, 64 * 1024).unwrap();
        runtime.load(Module::parse(env, &b.build()).unwrap()).unwrap();
        runtime
    }

    #[test]
    fn test_state_machine() {
        let env = Environment::new();
        let runtime = add_runtime(&env);
        let add = runtime.find_function("add").unwrap();
        assert_eq!(add.call_state(), CallState::Idle);
        assert_eq!(add.results().unwrap_err().code(), ResultCode::InvalidState);

        assert_eq!(add.call(&[Value::I32(2), Value::I32(3)]).unwrap(), vec![Value::I32(5)]);
        assert_eq!(add.call_state(), CallState::Completed);
        assert_eq!(add.results().unwrap(), vec![Value::I32(5)]);

        assert!(add.call(&[Value::I32(2)]).is_err());
        assert_eq!(add.call_state(), CallState::Idle);
        assert!(add.results().is_err());
    }

    #[rstest]
    #[case(&[Value::I32(1)])]
    #[case(&[Value::I32(1), Value::I32(2), Value::I32(3)])]
    #[case(&[Value::I32(1), Value::I64(2)])]
    #[case(&[Value::F32(1.0), Value::I32(2)])]
    fn test_argument_mismatch(#[case] args: &[Value]) {
        let env = Environment::new();
        let runtime = add_runtime(&env);
        let add = runtime.find_function("add").unwrap();
        let err = add.call(args).unwrap_err();
        assert_eq!(err.code(), ResultCode::ArgMismatch);
        assert_eq!(runtime.last_error().map(|e| e.code), Some(ResultCode::ArgMismatch));
    }

    #[test]
    fn test_introspection_outlives_runtime() {
        let env = Environment::new();
        let runtime = add_runtime(&env);
        let add = runtime.find_function("add").unwrap();
        runtime.destroy();

        assert_eq!(add.name(), "add");
        assert_eq!(add.arg_count(), 2);
        assert_eq!(add.ret_count(), 1);
        assert_eq!(add.arg_type(1), Some(I32));
        assert_eq!(add.ret_type(1), None);
        assert_eq!(add.descriptor().to_string(), "add (i32, i32) -> i32");
        let err = add.call(&[Value::I32(1), Value::I32(2)]).unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidState);
    }

    #[test]
    fn test_descriptor_serializes() {
        let descriptor = FunctionDescriptor::new("f", &FunctionType::new(&[I64], &[F32]));
        let json = serde_json::to_string(&descriptor).unwrap();
        assert_eq!(json, r#"{"name":"f","params":["i64"],"results":["f32"]}"#);
    }
}
