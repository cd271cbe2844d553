//! Memory instructions
//!
//! Loads and stores compute the effective address `addr + offset` in 64 bits
//! and trap when any byte of the access lies outside the current memory.

use super::*;
use crate::parser::instruction::{LoadOp, MemArg, StoreOp};
use crate::runtime::memory::Memory;

fn require(memory: Option<&Memory>) -> Result<&Memory, Trap> {
    memory.ok_or(Trap::OutOfBoundsMemory)
}

/// `t.load*`: [i32] -> [t]
pub fn load(stack: &mut Stack, memory: Option<&Memory>, op: LoadOp, memarg: &MemArg) -> Result<(), Trap> {
    let mem = require(memory)?;
    let addr = stack.pop_i32()? as u32;
    let off = memarg.offset;
    use LoadOp::*;
    let value = match op {
        I32Load => Value::I32(i32::from_le_bytes(mem.load(addr, off)?)),
        I64Load => Value::I64(i64::from_le_bytes(mem.load(addr, off)?)),
        F32Load => Value::F32(f32::from_le_bytes(mem.load(addr, off)?)),
        F64Load => Value::F64(f64::from_le_bytes(mem.load(addr, off)?)),
        I32Load8S => Value::I32(i8::from_le_bytes(mem.load(addr, off)?) as i32),
        I32Load8U => Value::I32(u8::from_le_bytes(mem.load(addr, off)?) as i32),
        I32Load16S => Value::I32(i16::from_le_bytes(mem.load(addr, off)?) as i32),
        I32Load16U => Value::I32(u16::from_le_bytes(mem.load(addr, off)?) as i32),
        I64Load8S => Value::I64(i8::from_le_bytes(mem.load(addr, off)?) as i64),
        I64Load8U => Value::I64(u8::from_le_bytes(mem.load(addr, off)?) as i64),
        I64Load16S => Value::I64(i16::from_le_bytes(mem.load(addr, off)?) as i64),
        I64Load16U => Value::I64(u16::from_le_bytes(mem.load(addr, off)?) as i64),
        I64Load32S => Value::I64(i32::from_le_bytes(mem.load(addr, off)?) as i64),
        I64Load32U => Value::I64(u32::from_le_bytes(mem.load(addr, off)?) as i64),
    };
    stack.push(value);
    Ok(())
}

/// `t.store*`: [i32 t] -> []
pub fn store(stack: &mut Stack, memory: Option<&mut Memory>, op: StoreOp, memarg: &MemArg) -> Result<(), Trap> {
    let mem = memory.ok_or(Trap::OutOfBoundsMemory)?;
    let value = stack.pop_typed(op.value_type())?;
    let addr = stack.pop_i32()? as u32;
    let off = memarg.offset;
    use StoreOp::*;
    match (op, value) {
        (I32Store, Value::I32(v)) => mem.store(addr, off, v.to_le_bytes()),
        (I64Store, Value::I64(v)) => mem.store(addr, off, v.to_le_bytes()),
        (F32Store, Value::F32(v)) => mem.store(addr, off, v.to_le_bytes()),
        (F64Store, Value::F64(v)) => mem.store(addr, off, v.to_le_bytes()),
        (I32Store8, Value::I32(v)) => mem.store(addr, off, (v as u8).to_le_bytes()),
        (I32Store16, Value::I32(v)) => mem.store(addr, off, (v as u16).to_le_bytes()),
        (I64Store8, Value::I64(v)) => mem.store(addr, off, (v as u8).to_le_bytes()),
        (I64Store16, Value::I64(v)) => mem.store(addr, off, (v as u16).to_le_bytes()),
        (I64Store32, Value::I64(v)) => mem.store(addr, off, (v as u32).to_le_bytes()),
        (_, value) => Err(Trap::OperandTypeMismatch {
            expected: op.value_type(),
            actual: value.typ(),
        }),
    }
}

/// `memory.size`: [] -> [i32]
pub fn size(stack: &mut Stack, memory: Option<&Memory>) -> Result<(), Trap> {
    let pages = require(memory)?.size();
    stack.push(Value::I32(pages as i32));
    Ok(())
}

/// `memory.grow`: [i32] -> [i32], the previous size in pages or -1
pub fn grow(stack: &mut Stack, memory: Option<&mut Memory>) -> Result<(), Trap> {
    let mem = memory.ok_or(Trap::OutOfBoundsMemory)?;
    let delta = stack.pop_i32()? as u32;
    let result = mem.grow(delta).map(|prev| prev as i32).unwrap_or(-1);
    stack.push(Value::I32(result));
    Ok(())
}
