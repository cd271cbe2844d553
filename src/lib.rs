//! An embeddable WebAssembly interpreter.
//!
//! wasmbed decodes and validates WebAssembly MVP binaries and runs them on an
//! iterative stack-machine interpreter with a bounded value stack. It is meant
//! to be hosted by another program, from Rust or through the C ABI in [`ffi`].
//!
//! # Modules
//!
//! - [`parser`] -- Binary format decoder and validator, plus a small module builder.
//! - [`runtime`] -- Environments, runtimes, linking, the interpreter and host functions.
//! - [`ffi`] -- `extern "C"` surface over handles into a process-wide table.
//! - [`error`] -- The crate error type and its result codes.
//!
//! # Example
//!
//! Build a module, load it, and call an exported function:
//!
//! ```
//! use wasmbed::parser::builder::{Code, ModuleBuilder};
//! use wasmbed::parser::instruction::NumericOp;
//! use wasmbed::parser::module::ValueType::I32;
//! use wasmbed::{Environment, Module, Runtime, Value};
//!
//! let mut builder = ModuleBuilder::new();
//! let add = builder.add_function(
//!     &[I32, I32],
//!     &[I32],
//!     &[],
//!     Code::new().local_get(0).local_get(1).numeric(NumericOp::I32Add).end(),
//! );
//! builder.export_function("add", add);
//!
//! let env = Environment::new();
//! let runtime = Runtime::new(&env, 64 * 1024).unwrap();
//! let module = Module::parse(&env, &builder.build()).unwrap();
//! runtime.load(module).unwrap();
//!
//! let add = runtime.find_function("add").unwrap();
//! assert_eq!(add.call(&[Value::I32(2), Value::I32(3)]).unwrap(), vec![Value::I32(5)]);
//! ```

pub mod error;
pub mod ffi;
pub mod parser;
pub mod runtime;

pub use error::{Error, Result};
pub use parser::module::{FunctionType, ValueType};
pub use runtime::{Environment, FunctionHandle, Module, ResultCode, Runtime, RuntimeConfig, Trap, Value};
