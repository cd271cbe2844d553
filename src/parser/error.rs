//! Parse failures with the byte offset where decoding stopped

use super::validate::ValidationError;
use thiserror::Error;

/// A failure to decode or validate a module binary.
///
/// `offset` is the absolute position in the input where the problem was
/// detected. For body validation errors it points at the offending
/// instruction.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} (at offset {offset:#x})")]
pub struct ParseError {
    pub offset: usize,
    pub kind: ParseErrorKind,
}

impl ParseError {
    pub fn new(offset: usize, kind: ParseErrorKind) -> Self {
        ParseError { offset, kind }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseErrorKind {
    #[error("unexpected end")]
    UnexpectedEof,

    #[error("magic header not detected")]
    BadMagic,

    #[error("unknown binary version {0}")]
    UnsupportedVersion(u32),

    #[error("malformed section id {0}")]
    UnknownSection(u8),

    #[error("unexpected content after last section or section {0} out of order")]
    SectionOutOfOrder(u8),

    #[error("section size mismatch")]
    SectionSizeMismatch,

    #[error("integer representation too long")]
    IntegerTooLong,

    #[error("integer too large")]
    IntegerTooLarge,

    #[error("malformed UTF-8 encoding")]
    InvalidUtf8,

    #[error("invalid value type {0:#04x}")]
    InvalidValueType(u8),

    #[error("expected function type marker 0x60, got {0:#04x}")]
    BadFunctionTypeMarker(u8),

    #[error("malformed import kind {0:#04x}")]
    InvalidExternalKind(u8),

    #[error("malformed reference type {0:#04x}")]
    InvalidRefType(u8),

    #[error("malformed limits flags {0:#04x}")]
    InvalidLimitsFlags(u8),

    #[error("malformed mutability {0:#04x}")]
    InvalidMutability(u8),

    #[error("unknown {what} {index}")]
    IndexOutOfRange { what: &'static str, index: u32 },

    #[error("function and code section have inconsistent lengths")]
    FunctionCodeMismatch,

    #[error("data count and data section have inconsistent lengths")]
    DataCountMismatch,

    #[error("multiple memories")]
    MultipleMemories,

    #[error("multiple tables")]
    MultipleTables,

    #[error("size minimum must not be greater than maximum")]
    LimitsMinExceedsMax,

    #[error("memory size must be at most 65536 pages (4GiB)")]
    MemoryTooLarge,

    #[error("duplicate export name {0:?}")]
    DuplicateExport(String),

    #[error("start function must have type [] -> []")]
    InvalidStartFunction,

    #[error("{0} exceeds implementation limit")]
    LimitExceeded(&'static str),

    #[error("too many locals")]
    TooManyLocals,

    #[error("illegal opcode {0:#04x}")]
    IllegalOpcode(u8),

    #[error("illegal opcode {0:#04x} {1}")]
    IllegalPrefixedOpcode(u8, u32),

    #[error("constant expression required")]
    ConstantExpressionRequired,

    #[error("unsupported {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}
