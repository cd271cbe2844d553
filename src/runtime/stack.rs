//! WebAssembly value stack
//!
//! One stack is shared by every active frame of a runtime. A frame's locals
//! occupy the slots starting at its `locals_base`; operands follow them.

use super::value::WasmType;
use super::{Trap, Value};
use crate::parser::module::ValueType;

#[derive(Debug, Default)]
pub struct Stack {
    values: Vec<Value>,
}

impl Stack {
    pub fn new() -> Self {
        Stack { values: Vec::new() }
    }

    pub fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    pub fn push_all(&mut self, values: impl IntoIterator<Item = Value>) {
        self.values.extend(values);
    }

    pub fn pop(&mut self) -> Result<Value, Trap> {
        self.values.pop().ok_or(Trap::StackUnderflow)
    }

    /// Pop a value and check its type
    pub fn pop_typed(&mut self, expected: ValueType) -> Result<Value, Trap> {
        let value = self.pop()?;
        if value.typ() != expected {
            return Err(Trap::OperandTypeMismatch {
                expected,
                actual: value.typ(),
            });
        }
        Ok(value)
    }

    /// Pop a value as a Rust primitive
    pub fn pop_as<T: WasmType>(&mut self) -> Result<T, Trap> {
        let value = self.pop_typed(T::TYPE)?;
        T::from_value(value).ok_or(Trap::OperandTypeMismatch {
            expected: T::TYPE,
            actual: value.typ(),
        })
    }

    pub fn pop_i32(&mut self) -> Result<i32, Trap> {
        self.pop_as::<i32>()
    }

    pub fn pop_i64(&mut self) -> Result<i64, Trap> {
        self.pop_as::<i64>()
    }

    pub fn pop_f32(&mut self) -> Result<f32, Trap> {
        self.pop_as::<f32>()
    }

    pub fn pop_f64(&mut self) -> Result<f64, Trap> {
        self.pop_as::<f64>()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn peek(&self) -> Option<&Value> {
        self.values.last()
    }

    pub fn get(&self, index: usize) -> Result<Value, Trap> {
        self.values.get(index).copied().ok_or(Trap::StackUnderflow)
    }

    pub fn set(&mut self, index: usize, value: Value) -> Result<(), Trap> {
        let slot = self.values.get_mut(index).ok_or(Trap::StackUnderflow)?;
        *slot = value;
        Ok(())
    }

    /// Remove the top `n` values, returning them bottom first
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, Trap> {
        let len = self.values.len();
        if n > len {
            return Err(Trap::StackUnderflow);
        }
        Ok(self.values.split_off(len - n))
    }

    /// Keep the top `arity` values and discard everything between them and
    /// `height`. Used when a branch unwinds to a label.
    pub fn unwind(&mut self, height: usize, arity: usize) -> Result<(), Trap> {
        let len = self.values.len();
        if height + arity > len {
            return Err(Trap::StackUnderflow);
        }
        self.values.drain(height..len - arity);
        Ok(())
    }

    pub fn truncate(&mut self, len: usize) {
        self.values.truncate(len);
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}
