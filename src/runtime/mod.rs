//! WebAssembly runtime
//!
//! An [`Environment`] owns the structural type registry. A [`Runtime`] created
//! from it holds one linear memory, the function/global/table spaces of every
//! module loaded into it, and the value stack used by the interpreter. A
//! [`Module`] is parsed against an environment, has its imports bound, and is
//! then loaded into exactly one runtime, after which its exports are reachable
//! through [`FunctionHandle`]s.

pub mod config;
pub mod diagnostics;
pub mod environment;
pub mod executor;
pub mod host;
pub mod invoker;
pub mod lifecycle;
pub mod linker;
pub mod memory;
pub mod module;
pub mod ops;
pub mod stack;
pub mod store;
pub mod table;
pub mod value;

pub use config::RuntimeConfig;
pub use diagnostics::{ErrorInfo, ResultCode};
pub use environment::{Environment, TypeId};
pub use host::{HostContext, HostFunction};
pub use invoker::{CallState, FunctionDescriptor, FunctionHandle};
pub use lifecycle::{MemoryView, ModuleHandle, Runtime};
pub use memory::{Memory, PAGE_SIZE};
pub use module::Module;
pub use value::Value;

use crate::parser::module::ValueType;

/// A fault that aborts the current call. The runtime stays usable.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Trap {
    #[error("unreachable executed")]
    Unreachable,
    #[error("out of bounds memory access")]
    OutOfBoundsMemory,
    #[error("integer divide by zero")]
    IntegerDivideByZero,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("invalid conversion to integer")]
    InvalidConversion,
    #[error("call stack exhausted")]
    StackExhausted,
    #[error("undefined element")]
    UndefinedElement,
    #[error("uninitialized element")]
    UninitializedElement,
    #[error("indirect call type mismatch")]
    IndirectCallTypeMismatch,
    #[error("step limit exceeded")]
    StepLimitExceeded,
    #[error("call into module {0} before its start function ran")]
    ModuleNotStarted(usize),
    #[error("host function trapped: {0}")]
    Host(String),
    // The two below cannot arise from validated code
    #[error("value stack underflow")]
    StackUnderflow,
    #[error("operand type mismatch: expected {expected}, got {actual}")]
    OperandTypeMismatch { expected: ValueType, actual: ValueType },
}
