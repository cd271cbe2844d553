//! Instruction semantics that only touch the value stack and memory
//!
//! Control flow, calls and variable access live in the executor; everything
//! here is a pure function of its operands.

pub mod conversion;
pub mod memory;
pub mod numeric;

pub(crate) use crate::runtime::stack::Stack;
pub(crate) use crate::runtime::value::WasmType;
pub(crate) use crate::runtime::{Trap, Value};

/// Pop one operand, push `f(a)`
#[inline]
pub(crate) fn unop<T: WasmType, R: Into<Value>>(stack: &mut Stack, f: impl FnOnce(T) -> R) -> Result<(), Trap> {
    let a = stack.pop_as::<T>()?;
    stack.push(f(a).into());
    Ok(())
}

/// Pop `b` then `a`, push `f(a, b)`
#[inline]
pub(crate) fn binop<T: WasmType, R: Into<Value>>(stack: &mut Stack, f: impl FnOnce(T, T) -> R) -> Result<(), Trap> {
    let b = stack.pop_as::<T>()?;
    let a = stack.pop_as::<T>()?;
    stack.push(f(a, b).into());
    Ok(())
}

#[inline]
pub(crate) fn try_unop<T: WasmType, R: Into<Value>>(
    stack: &mut Stack,
    f: impl FnOnce(T) -> Result<R, Trap>,
) -> Result<(), Trap> {
    let a = stack.pop_as::<T>()?;
    stack.push(f(a)?.into());
    Ok(())
}

#[inline]
pub(crate) fn try_binop<T: WasmType, R: Into<Value>>(
    stack: &mut Stack,
    f: impl FnOnce(T, T) -> Result<R, Trap>,
) -> Result<(), Trap> {
    let b = stack.pop_as::<T>()?;
    let a = stack.pop_as::<T>()?;
    stack.push(f(a, b)?.into());
    Ok(())
}
