//! WebAssembly instruction representation and decoding
//!
//! Function bodies are decoded into a flat `Vec<Instruction>`. Structured
//! control instructions carry the positions of their matching `else`/`end`
//! so the interpreter can branch without scanning; those positions are
//! filled in by [`super::structure::ControlMap`] while the body is decoded.

use super::encoding;
use super::error::{ParseError, ParseErrorKind};
use super::limits;
use super::module::ValueType;
use super::reader::Reader;
use fhex::ToHex;
use std::fmt;

/// Memory argument for memory access instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemArg {
    /// Alignment hint as a power of two
    pub align: u32,
    pub offset: u32,
}

impl MemArg {
    pub fn decode(reader: &mut Reader) -> Result<Self, ParseError> {
        let align = reader.read_vu32()?;
        let offset = reader.read_vu32()?;
        Ok(MemArg { align, offset })
    }
}

/// Block type for structured control instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Empty,
    Value(ValueType),
    /// Function type index for multi-value blocks
    FuncType(u32),
}

impl BlockType {
    pub fn decode(reader: &mut Reader) -> Result<Self, ParseError> {
        let b = match reader.peek_byte() {
            Some(b) => b,
            None => return Err(reader.error(ParseErrorKind::UnexpectedEof)),
        };
        if b == encoding::BLOCK_TYPE_EMPTY {
            reader.read_byte()?;
            return Ok(BlockType::Empty);
        }
        if let Some(vt) = ValueType::decode(b) {
            reader.read_byte()?;
            return Ok(BlockType::Value(vt));
        }
        let start = reader.pos();
        let idx = reader.read_vs33()?;
        if idx < 0 {
            return Err(reader.error_at(start, ParseErrorKind::InvalidValueType(b)));
        }
        Ok(BlockType::FuncType(idx as u32))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOp {
    I32Load,
    I64Load,
    F32Load,
    F64Load,
    I32Load8S,
    I32Load8U,
    I32Load16S,
    I32Load16U,
    I64Load8S,
    I64Load8U,
    I64Load16S,
    I64Load16U,
    I64Load32S,
    I64Load32U,
}

impl LoadOp {
    fn decode(opcode: u8) -> Option<Self> {
        use LoadOp::*;
        Some(match opcode {
            0x28 => I32Load,
            0x29 => I64Load,
            0x2A => F32Load,
            0x2B => F64Load,
            0x2C => I32Load8S,
            0x2D => I32Load8U,
            0x2E => I32Load16S,
            0x2F => I32Load16U,
            0x30 => I64Load8S,
            0x31 => I64Load8U,
            0x32 => I64Load16S,
            0x33 => I64Load16U,
            0x34 => I64Load32S,
            0x35 => I64Load32U,
            _ => return None,
        })
    }

    pub fn opcode(&self) -> u8 {
        0x28 + *self as u8
    }

    pub fn value_type(&self) -> ValueType {
        use LoadOp::*;
        match self {
            I32Load | I32Load8S | I32Load8U | I32Load16S | I32Load16U => ValueType::I32,
            F32Load => ValueType::F32,
            F64Load => ValueType::F64,
            _ => ValueType::I64,
        }
    }

    /// Access width in bytes
    pub fn width(&self) -> u32 {
        use LoadOp::*;
        match self {
            I32Load8S | I32Load8U | I64Load8S | I64Load8U => 1,
            I32Load16S | I32Load16U | I64Load16S | I64Load16U => 2,
            I32Load | F32Load | I64Load32S | I64Load32U => 4,
            I64Load | F64Load => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    I32Store,
    I64Store,
    F32Store,
    F64Store,
    I32Store8,
    I32Store16,
    I64Store8,
    I64Store16,
    I64Store32,
}

impl StoreOp {
    fn decode(opcode: u8) -> Option<Self> {
        use StoreOp::*;
        Some(match opcode {
            0x36 => I32Store,
            0x37 => I64Store,
            0x38 => F32Store,
            0x39 => F64Store,
            0x3A => I32Store8,
            0x3B => I32Store16,
            0x3C => I64Store8,
            0x3D => I64Store16,
            0x3E => I64Store32,
            _ => return None,
        })
    }

    pub fn opcode(&self) -> u8 {
        0x36 + *self as u8
    }

    pub fn value_type(&self) -> ValueType {
        use StoreOp::*;
        match self {
            I32Store | I32Store8 | I32Store16 => ValueType::I32,
            F32Store => ValueType::F32,
            F64Store => ValueType::F64,
            _ => ValueType::I64,
        }
    }

    pub fn width(&self) -> u32 {
        use StoreOp::*;
        match self {
            I32Store8 | I64Store8 => 1,
            I32Store16 | I64Store16 => 2,
            I32Store | F32Store | I64Store32 => 4,
            I64Store | F64Store => 8,
        }
    }
}

macro_rules! numeric_ops {
    ($( $name:ident = $code:literal : [$($input:ident),*] -> $output:ident, )*) => {
        /// Stack-only numeric instructions: constants aside, everything that
        /// pops fixed operand types and pushes one result.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum NumericOp {
            $( $name, )*
        }

        impl NumericOp {
            /// `code` is the opcode byte, or `0xFC00 | sub` for 0xFC-prefixed ops
            pub fn decode(code: u16) -> Option<Self> {
                match code {
                    $( $code => Some(NumericOp::$name), )*
                    _ => None,
                }
            }

            pub fn code(&self) -> u16 {
                match self {
                    $( NumericOp::$name => $code, )*
                }
            }

            /// Operand types (bottom to top) and the result type
            pub fn signature(&self) -> (&'static [ValueType], ValueType) {
                match self {
                    $( NumericOp::$name => (&[$(ValueType::$input),*], ValueType::$output), )*
                }
            }
        }
    };
}

numeric_ops! {
    I32Eqz = 0x45: [I32] -> I32,
    I32Eq = 0x46: [I32, I32] -> I32,
    I32Ne = 0x47: [I32, I32] -> I32,
    I32LtS = 0x48: [I32, I32] -> I32,
    I32LtU = 0x49: [I32, I32] -> I32,
    I32GtS = 0x4A: [I32, I32] -> I32,
    I32GtU = 0x4B: [I32, I32] -> I32,
    I32LeS = 0x4C: [I32, I32] -> I32,
    I32LeU = 0x4D: [I32, I32] -> I32,
    I32GeS = 0x4E: [I32, I32] -> I32,
    I32GeU = 0x4F: [I32, I32] -> I32,
    I64Eqz = 0x50: [I64] -> I32,
    I64Eq = 0x51: [I64, I64] -> I32,
    I64Ne = 0x52: [I64, I64] -> I32,
    I64LtS = 0x53: [I64, I64] -> I32,
    I64LtU = 0x54: [I64, I64] -> I32,
    I64GtS = 0x55: [I64, I64] -> I32,
    I64GtU = 0x56: [I64, I64] -> I32,
    I64LeS = 0x57: [I64, I64] -> I32,
    I64LeU = 0x58: [I64, I64] -> I32,
    I64GeS = 0x59: [I64, I64] -> I32,
    I64GeU = 0x5A: [I64, I64] -> I32,
    F32Eq = 0x5B: [F32, F32] -> I32,
    F32Ne = 0x5C: [F32, F32] -> I32,
    F32Lt = 0x5D: [F32, F32] -> I32,
    F32Gt = 0x5E: [F32, F32] -> I32,
    F32Le = 0x5F: [F32, F32] -> I32,
    F32Ge = 0x60: [F32, F32] -> I32,
    F64Eq = 0x61: [F64, F64] -> I32,
    F64Ne = 0x62: [F64, F64] -> I32,
    F64Lt = 0x63: [F64, F64] -> I32,
    F64Gt = 0x64: [F64, F64] -> I32,
    F64Le = 0x65: [F64, F64] -> I32,
    F64Ge = 0x66: [F64, F64] -> I32,
    I32Clz = 0x67: [I32] -> I32,
    I32Ctz = 0x68: [I32] -> I32,
    I32Popcnt = 0x69: [I32] -> I32,
    I32Add = 0x6A: [I32, I32] -> I32,
    I32Sub = 0x6B: [I32, I32] -> I32,
    I32Mul = 0x6C: [I32, I32] -> I32,
    I32DivS = 0x6D: [I32, I32] -> I32,
    I32DivU = 0x6E: [I32, I32] -> I32,
    I32RemS = 0x6F: [I32, I32] -> I32,
    I32RemU = 0x70: [I32, I32] -> I32,
    I32And = 0x71: [I32, I32] -> I32,
    I32Or = 0x72: [I32, I32] -> I32,
    I32Xor = 0x73: [I32, I32] -> I32,
    I32Shl = 0x74: [I32, I32] -> I32,
    I32ShrS = 0x75: [I32, I32] -> I32,
    I32ShrU = 0x76: [I32, I32] -> I32,
    I32Rotl = 0x77: [I32, I32] -> I32,
    I32Rotr = 0x78: [I32, I32] -> I32,
    I64Clz = 0x79: [I64] -> I64,
    I64Ctz = 0x7A: [I64] -> I64,
    I64Popcnt = 0x7B: [I64] -> I64,
    I64Add = 0x7C: [I64, I64] -> I64,
    I64Sub = 0x7D: [I64, I64] -> I64,
    I64Mul = 0x7E: [I64, I64] -> I64,
    I64DivS = 0x7F: [I64, I64] -> I64,
    I64DivU = 0x80: [I64, I64] -> I64,
    I64RemS = 0x81: [I64, I64] -> I64,
    I64RemU = 0x82: [I64, I64] -> I64,
    I64And = 0x83: [I64, I64] -> I64,
    I64Or = 0x84: [I64, I64] -> I64,
    I64Xor = 0x85: [I64, I64] -> I64,
    I64Shl = 0x86: [I64, I64] -> I64,
    I64ShrS = 0x87: [I64, I64] -> I64,
    I64ShrU = 0x88: [I64, I64] -> I64,
    I64Rotl = 0x89: [I64, I64] -> I64,
    I64Rotr = 0x8A: [I64, I64] -> I64,
    F32Abs = 0x8B: [F32] -> F32,
    F32Neg = 0x8C: [F32] -> F32,
    F32Ceil = 0x8D: [F32] -> F32,
    F32Floor = 0x8E: [F32] -> F32,
    F32Trunc = 0x8F: [F32] -> F32,
    F32Nearest = 0x90: [F32] -> F32,
    F32Sqrt = 0x91: [F32] -> F32,
    F32Add = 0x92: [F32, F32] -> F32,
    F32Sub = 0x93: [F32, F32] -> F32,
    F32Mul = 0x94: [F32, F32] -> F32,
    F32Div = 0x95: [F32, F32] -> F32,
    F32Min = 0x96: [F32, F32] -> F32,
    F32Max = 0x97: [F32, F32] -> F32,
    F32Copysign = 0x98: [F32, F32] -> F32,
    F64Abs = 0x99: [F64] -> F64,
    F64Neg = 0x9A: [F64] -> F64,
    F64Ceil = 0x9B: [F64] -> F64,
    F64Floor = 0x9C: [F64] -> F64,
    F64Trunc = 0x9D: [F64] -> F64,
    F64Nearest = 0x9E: [F64] -> F64,
    F64Sqrt = 0x9F: [F64] -> F64,
    F64Add = 0xA0: [F64, F64] -> F64,
    F64Sub = 0xA1: [F64, F64] -> F64,
    F64Mul = 0xA2: [F64, F64] -> F64,
    F64Div = 0xA3: [F64, F64] -> F64,
    F64Min = 0xA4: [F64, F64] -> F64,
    F64Max = 0xA5: [F64, F64] -> F64,
    F64Copysign = 0xA6: [F64, F64] -> F64,
    I32WrapI64 = 0xA7: [I64] -> I32,
    I32TruncF32S = 0xA8: [F32] -> I32,
    I32TruncF32U = 0xA9: [F32] -> I32,
    I32TruncF64S = 0xAA: [F64] -> I32,
    I32TruncF64U = 0xAB: [F64] -> I32,
    I64ExtendI32S = 0xAC: [I32] -> I64,
    I64ExtendI32U = 0xAD: [I32] -> I64,
    I64TruncF32S = 0xAE: [F32] -> I64,
    I64TruncF32U = 0xAF: [F32] -> I64,
    I64TruncF64S = 0xB0: [F64] -> I64,
    I64TruncF64U = 0xB1: [F64] -> I64,
    F32ConvertI32S = 0xB2: [I32] -> F32,
    F32ConvertI32U = 0xB3: [I32] -> F32,
    F32ConvertI64S = 0xB4: [I64] -> F32,
    F32ConvertI64U = 0xB5: [I64] -> F32,
    F32DemoteF64 = 0xB6: [F64] -> F32,
    F64ConvertI32S = 0xB7: [I32] -> F64,
    F64ConvertI32U = 0xB8: [I32] -> F64,
    F64ConvertI64S = 0xB9: [I64] -> F64,
    F64ConvertI64U = 0xBA: [I64] -> F64,
    F64PromoteF32 = 0xBB: [F32] -> F64,
    I32ReinterpretF32 = 0xBC: [F32] -> I32,
    I64ReinterpretF64 = 0xBD: [F64] -> I64,
    F32ReinterpretI32 = 0xBE: [I32] -> F32,
    F64ReinterpretI64 = 0xBF: [I64] -> F64,
    I32Extend8S = 0xC0: [I32] -> I32,
    I32Extend16S = 0xC1: [I32] -> I32,
    I64Extend8S = 0xC2: [I64] -> I64,
    I64Extend16S = 0xC3: [I64] -> I64,
    I64Extend32S = 0xC4: [I64] -> I64,
    I32TruncSatF32S = 0xFC00: [F32] -> I32,
    I32TruncSatF32U = 0xFC01: [F32] -> I32,
    I32TruncSatF64S = 0xFC02: [F64] -> I32,
    I32TruncSatF64U = 0xFC03: [F64] -> I32,
    I64TruncSatF32S = 0xFC04: [F32] -> I64,
    I64TruncSatF32U = 0xFC05: [F32] -> I64,
    I64TruncSatF64S = 0xFC06: [F64] -> I64,
    I64TruncSatF64U = 0xFC07: [F64] -> I64,
}

/// A decoded instruction.
///
/// `end`/`else_pc` fields are instruction indices within the same body.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Unreachable,
    Nop,
    Block { block_type: BlockType, end: u32 },
    Loop { block_type: BlockType },
    /// `else_pc == end` when there is no else arm
    If { block_type: BlockType, else_pc: u32, end: u32 },
    Else { end: u32 },
    End,
    Br(u32),
    BrIf(u32),
    BrTable { labels: Box<[u32]>, default: u32 },
    Return,
    Call(u32),
    CallIndirect { type_index: u32, table_index: u32 },
    Drop,
    Select,
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),
    Load(LoadOp, MemArg),
    Store(StoreOp, MemArg),
    MemorySize,
    MemoryGrow,
    I32Const(i32),
    I64Const(i64),
    F32Const(f32),
    F64Const(f64),
    Numeric(NumericOp),
}

impl Instruction {
    /// Decode one instruction. Block targets are left at zero for the
    /// control map to patch.
    pub fn decode(reader: &mut Reader) -> Result<Self, ParseError> {
        let start = reader.pos();
        let opcode = reader.read_byte()?;

        use Instruction::*;
        let inst = match opcode {
            encoding::OP_UNREACHABLE => Unreachable,
            encoding::OP_NOP => Nop,
            encoding::OP_BLOCK => Block {
                block_type: BlockType::decode(reader)?,
                end: 0,
            },
            encoding::OP_LOOP => Loop {
                block_type: BlockType::decode(reader)?,
            },
            encoding::OP_IF => If {
                block_type: BlockType::decode(reader)?,
                else_pc: 0,
                end: 0,
            },
            encoding::OP_ELSE => Else { end: 0 },
            encoding::OP_END => End,
            encoding::OP_BR => Br(reader.read_vu32()?),
            encoding::OP_BR_IF => BrIf(reader.read_vu32()?),
            encoding::OP_BR_TABLE => {
                let count = reader.read_vu32()?;
                if count > limits::MAX_BR_TABLE_LABELS {
                    return Err(reader.error_at(start, ParseErrorKind::LimitExceeded("br_table label count")));
                }
                reader.check_count(count)?;
                let mut labels = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    labels.push(reader.read_vu32()?);
                }
                let default = reader.read_vu32()?;
                BrTable {
                    labels: labels.into_boxed_slice(),
                    default,
                }
            }
            encoding::OP_RETURN => Return,
            encoding::OP_CALL => Call(reader.read_vu32()?),
            encoding::OP_CALL_INDIRECT => CallIndirect {
                type_index: reader.read_vu32()?,
                table_index: reader.read_vu32()?,
            },
            encoding::OP_DROP => Drop,
            encoding::OP_SELECT => Select,
            encoding::OP_LOCAL_GET => LocalGet(reader.read_vu32()?),
            encoding::OP_LOCAL_SET => LocalSet(reader.read_vu32()?),
            encoding::OP_LOCAL_TEE => LocalTee(reader.read_vu32()?),
            encoding::OP_GLOBAL_GET => GlobalGet(reader.read_vu32()?),
            encoding::OP_GLOBAL_SET => GlobalSet(reader.read_vu32()?),
            0x28..=0x35 => match LoadOp::decode(opcode) {
                Some(op) => Load(op, MemArg::decode(reader)?),
                None => return Err(reader.error_at(start, ParseErrorKind::IllegalOpcode(opcode))),
            },
            0x36..=0x3E => match StoreOp::decode(opcode) {
                Some(op) => Store(op, MemArg::decode(reader)?),
                None => return Err(reader.error_at(start, ParseErrorKind::IllegalOpcode(opcode))),
            },
            encoding::OP_MEMORY_SIZE | encoding::OP_MEMORY_GROW => {
                // reserved memory index byte
                let mem = reader.read_byte()?;
                if mem != 0 {
                    return Err(reader.error_at(start, ParseErrorKind::IndexOutOfRange { what: "memory", index: mem as u32 }));
                }
                if opcode == encoding::OP_MEMORY_SIZE {
                    MemorySize
                } else {
                    MemoryGrow
                }
            }
            encoding::OP_I32_CONST => I32Const(reader.read_vs32()?),
            encoding::OP_I64_CONST => I64Const(reader.read_vs64()?),
            encoding::OP_F32_CONST => F32Const(reader.read_f32()?),
            encoding::OP_F64_CONST => F64Const(reader.read_f64()?),
            encoding::OP_PREFIX_FC => {
                let sub = reader.read_vu32()?;
                match u16::try_from(sub).ok().and_then(|s| NumericOp::decode(0xFC00 | s)) {
                    Some(op) if sub <= 0xff => Numeric(op),
                    _ => return Err(reader.error_at(start, ParseErrorKind::IllegalPrefixedOpcode(opcode, sub))),
                }
            }
            _ => match NumericOp::decode(opcode as u16) {
                Some(op) => Numeric(op),
                None => return Err(reader.error_at(start, ParseErrorKind::IllegalOpcode(opcode))),
            },
        };
        Ok(inst)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Instruction::*;
        match self {
            Block { block_type, end } => write!(f, "block {block_type:?} (end @{end})"),
            Loop { block_type } => write!(f, "loop {block_type:?}"),
            If { block_type, else_pc, end } => write!(f, "if {block_type:?} (else @{else_pc}, end @{end})"),
            Else { .. } => write!(f, "else"),
            F32Const(v) => write!(f, "f32.const {}", v.to_hex()),
            F64Const(v) => write!(f, "f64.const {}", v.to_hex()),
            Load(op, m) => write!(f, "{op:?} align={} offset={}", m.align, m.offset),
            Store(op, m) => write!(f, "{op:?} align={} offset={}", m.align, m.offset),
            Numeric(op) => write!(f, "{op:?}"),
            other => write!(f, "{other:?}"),
        }
    }
}
