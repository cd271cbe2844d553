//! WebAssembly value representation

use crate::parser::module::ValueType;
use fhex::ToHex;
use serde::Serialize;
use std::fmt;

/// Runtime representation of WebAssembly values
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Value {
    /// Get the WebAssembly type of this value
    pub fn typ(&self) -> ValueType {
        match self {
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
        }
    }

    /// Zero value of a type, used to initialise declared locals
    pub fn default_for(typ: ValueType) -> Self {
        match typ {
            ValueType::I32 => Value::I32(0),
            ValueType::I64 => Value::I64(0),
            ValueType::F32 => Value::F32(0.0),
            ValueType::F64 => Value::F64(0.0),
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// Raw 64-bit payload: integers zero-extended from their unsigned form,
    /// floats as their IEEE 754 bit pattern
    pub fn to_bits(&self) -> u64 {
        match self {
            Value::I32(v) => *v as u32 as u64,
            Value::I64(v) => *v as u64,
            Value::F32(v) => v.to_bits() as u64,
            Value::F64(v) => v.to_bits(),
        }
    }

    /// Inverse of [`Value::to_bits`]; upper bits are ignored for 32-bit types
    pub fn from_bits(typ: ValueType, bits: u64) -> Self {
        match typ {
            ValueType::I32 => Value::I32(bits as u32 as i32),
            ValueType::I64 => Value::I64(bits as i64),
            ValueType::F32 => Value::F32(f32::from_bits(bits as u32)),
            ValueType::F64 => Value::F64(f64::from_bits(bits)),
        }
    }

    /// Parse a textual argument of the given type.
    ///
    /// Integers accept signed or unsigned decimal and `0x` hex (taken as a
    /// bit pattern). Floats accept decimal notation, `nan`/`inf`, or `0x`
    /// hex as a raw bit pattern.
    pub fn parse(typ: ValueType, text: &str) -> Result<Self, String> {
        let text = text.trim();
        let hex = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"));
        match typ {
            ValueType::I32 => match hex {
                Some(h) => u32::from_str_radix(h, 16).map(|v| Value::I32(v as i32)),
                None => text
                    .parse::<i32>()
                    .or_else(|_| text.parse::<u32>().map(|v| v as i32))
                    .map(Value::I32),
            }
            .map_err(|e| format!("invalid i32 '{text}': {e}")),
            ValueType::I64 => match hex {
                Some(h) => u64::from_str_radix(h, 16).map(|v| Value::I64(v as i64)),
                None => text
                    .parse::<i64>()
                    .or_else(|_| text.parse::<u64>().map(|v| v as i64))
                    .map(Value::I64),
            }
            .map_err(|e| format!("invalid i64 '{text}': {e}")),
            ValueType::F32 => match hex {
                Some(h) => u32::from_str_radix(h, 16)
                    .map(|bits| Value::F32(f32::from_bits(bits)))
                    .map_err(|e| format!("invalid f32 '{text}': {e}")),
                None => text
                    .parse::<f32>()
                    .map(Value::F32)
                    .map_err(|e| format!("invalid f32 '{text}': {e}")),
            },
            ValueType::F64 => match hex {
                Some(h) => u64::from_str_radix(h, 16)
                    .map(|bits| Value::F64(f64::from_bits(bits)))
                    .map_err(|e| format!("invalid f64 '{text}': {e}")),
                None => text
                    .parse::<f64>()
                    .map(Value::F64)
                    .map_err(|e| format!("invalid f64 '{text}': {e}")),
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "{v}:i32"),
            Value::I64(v) => write!(f, "{v}:i64"),
            Value::F32(v) => write!(f, "{}:f32", v.to_hex()),
            Value::F64(v) => write!(f, "{}:f64", v.to_hex()),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::F32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

/// Rust primitives that map onto a WebAssembly value type
pub trait WasmType: Copy + Into<Value> {
    const TYPE: ValueType;

    fn from_value(value: Value) -> Option<Self>;
}

impl WasmType for i32 {
    const TYPE: ValueType = ValueType::I32;

    fn from_value(value: Value) -> Option<Self> {
        value.as_i32()
    }
}

impl WasmType for i64 {
    const TYPE: ValueType = ValueType::I64;

    fn from_value(value: Value) -> Option<Self> {
        value.as_i64()
    }
}

impl WasmType for f32 {
    const TYPE: ValueType = ValueType::F32;

    fn from_value(value: Value) -> Option<Self> {
        value.as_f32()
    }
}

impl WasmType for f64 {
    const TYPE: ValueType = ValueType::F64;

    fn from_value(value: Value) -> Option<Self> {
        value.as_f64()
    }
}
