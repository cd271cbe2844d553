//! Binary encoding primitives for WebAssembly values.
//!
//! Provides LEB128 integer encoding, IEEE 754 float encoding and byte vector
//! encoding for the WebAssembly binary format, plus the section, descriptor
//! and opcode constants shared by the decoder and [`super::builder`].
//!
//! All functions write directly into a caller-provided `&mut Vec<u8>` buffer.

use byteorder::{ByteOrder, LittleEndian};

// ---------------------------------------------------------------------------
// Binary format constants
// ---------------------------------------------------------------------------

pub const MAGIC: u32 = 0x6d736100; // \0asm
pub const VERSION: u32 = 1;

// Section IDs
pub const SECTION_CUSTOM: u8 = 0;
pub const SECTION_TYPE: u8 = 1;
pub const SECTION_IMPORT: u8 = 2;
pub const SECTION_FUNCTION: u8 = 3;
pub const SECTION_TABLE: u8 = 4;
pub const SECTION_MEMORY: u8 = 5;
pub const SECTION_GLOBAL: u8 = 6;
pub const SECTION_EXPORT: u8 = 7;
pub const SECTION_START: u8 = 8;
pub const SECTION_ELEMENT: u8 = 9;
pub const SECTION_CODE: u8 = 10;
pub const SECTION_DATA: u8 = 11;
pub const SECTION_DATA_COUNT: u8 = 12;

/// Position of a known section in the canonical order. The data count
/// section sits between element and code even though its id is 12.
pub fn section_rank(id: u8) -> Option<u8> {
    match id {
        SECTION_TYPE..=SECTION_ELEMENT => Some(id),
        SECTION_DATA_COUNT => Some(10),
        SECTION_CODE => Some(11),
        SECTION_DATA => Some(12),
        _ => None,
    }
}

// Type constructors
pub const TYPE_FUNC: u8 = 0x60;
pub const TYPE_I32: u8 = 0x7f;
pub const TYPE_I64: u8 = 0x7e;
pub const TYPE_F32: u8 = 0x7d;
pub const TYPE_F64: u8 = 0x7c;
pub const TYPE_FUNCREF: u8 = 0x70;

// Import/export descriptor kinds
pub const DESC_FUNC: u8 = 0x00;
pub const DESC_TABLE: u8 = 0x01;
pub const DESC_MEMORY: u8 = 0x02;
pub const DESC_GLOBAL: u8 = 0x03;

// Limits flags
pub const LIMITS_MIN: u8 = 0x00;
pub const LIMITS_MIN_MAX: u8 = 0x01;

// Element segment flags: active, table 0, function indices
pub const ELEM_ACTIVE_FUNCS: u32 = 0;

// Data segment flags
pub const DATA_ACTIVE: u32 = 0;
pub const DATA_PASSIVE: u32 = 1;
pub const DATA_ACTIVE_EXPLICIT: u32 = 2;

// Block type: empty
pub const BLOCK_TYPE_EMPTY: u8 = 0x40;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

pub const OP_UNREACHABLE: u8 = 0x00;
pub const OP_NOP: u8 = 0x01;
pub const OP_BLOCK: u8 = 0x02;
pub const OP_LOOP: u8 = 0x03;
pub const OP_IF: u8 = 0x04;
pub const OP_ELSE: u8 = 0x05;
pub const OP_END: u8 = 0x0B;
pub const OP_BR: u8 = 0x0C;
pub const OP_BR_IF: u8 = 0x0D;
pub const OP_BR_TABLE: u8 = 0x0E;
pub const OP_RETURN: u8 = 0x0F;
pub const OP_CALL: u8 = 0x10;
pub const OP_CALL_INDIRECT: u8 = 0x11;
pub const OP_DROP: u8 = 0x1A;
pub const OP_SELECT: u8 = 0x1B;
pub const OP_LOCAL_GET: u8 = 0x20;
pub const OP_LOCAL_SET: u8 = 0x21;
pub const OP_LOCAL_TEE: u8 = 0x22;
pub const OP_GLOBAL_GET: u8 = 0x23;
pub const OP_GLOBAL_SET: u8 = 0x24;
pub const OP_MEMORY_SIZE: u8 = 0x3F;
pub const OP_MEMORY_GROW: u8 = 0x40;
pub const OP_I32_CONST: u8 = 0x41;
pub const OP_I64_CONST: u8 = 0x42;
pub const OP_F32_CONST: u8 = 0x43;
pub const OP_F64_CONST: u8 = 0x44;
pub const OP_PREFIX_FC: u8 = 0xFC;

// ---------------------------------------------------------------------------
// Unsigned LEB128
// ---------------------------------------------------------------------------

fn write_vu(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            break;
        }
        byte |= 0x80;
        buf.push(byte);
    }
}

/// Appends the unsigned LEB128 encoding of a u32 value to `buf`.
pub fn write_vu32(buf: &mut Vec<u8>, v: u32) {
    write_vu(buf, v as u64);
}

// ---------------------------------------------------------------------------
// Signed LEB128
// ---------------------------------------------------------------------------

fn write_vs(buf: &mut Vec<u8>, mut value: i64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if (value == 0 && (byte & 0x40) == 0) || (value == -1 && (byte & 0x40) != 0) {
            buf.push(byte);
            break;
        }
        byte |= 0x80;
        buf.push(byte);
    }
}

/// Appends the signed LEB128 encoding of an i32 value to `buf`.
pub fn write_vs32(buf: &mut Vec<u8>, v: i32) {
    write_vs(buf, v as i64);
}

/// Appends the signed LEB128 encoding of an i64 value to `buf`.
pub fn write_vs64(buf: &mut Vec<u8>, v: i64) {
    write_vs(buf, v);
}

// ---------------------------------------------------------------------------
// IEEE 754 floats (little-endian)
// ---------------------------------------------------------------------------

pub fn write_f32(buf: &mut Vec<u8>, v: f32) {
    let mut bytes = [0u8; 4];
    LittleEndian::write_f32(&mut bytes, v);
    buf.extend_from_slice(&bytes);
}

pub fn write_f64(buf: &mut Vec<u8>, v: f64) {
    let mut bytes = [0u8; 8];
    LittleEndian::write_f64(&mut bytes, v);
    buf.extend_from_slice(&bytes);
}

pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    let mut bytes = [0u8; 4];
    LittleEndian::write_u32(&mut bytes, v);
    buf.extend_from_slice(&bytes);
}

// ---------------------------------------------------------------------------
// Length-prefixed vectors
// ---------------------------------------------------------------------------

/// Appends a length-prefixed byte vector (vu32 length + raw bytes) to `buf`.
pub fn write_u8vec(buf: &mut Vec<u8>, v: &[u8]) {
    write_vu32(buf, v.len() as u32);
    buf.extend_from_slice(v);
}

pub fn write_name(buf: &mut Vec<u8>, name: &str) {
    write_u8vec(buf, name.as_bytes());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_vu32(v: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        write_vu32(&mut buf, v);
        buf
    }

    fn encode_vs32(v: i32) -> Vec<u8> {
        let mut buf = Vec::new();
        write_vs32(&mut buf, v);
        buf
    }

    #[test]
    fn test_write_vu32() {
        assert_eq!(encode_vu32(0), vec![0]);
        assert_eq!(encode_vu32(624485), vec![0b11100101, 0b10001110, 0b00100110]);
        assert_eq!(encode_vu32(127), vec![0x7f]);
        assert_eq!(encode_vu32(16256), vec![0x80, 0x7f]);
        assert_eq!(encode_vu32(0xffffffff), vec![0xff, 0xff, 0xff, 0xff, 0xf]);
    }

    #[test]
    fn test_write_vs32() {
        assert_eq!(encode_vs32(0), vec![0]);
        assert_eq!(encode_vs32(-1), vec![0x7f]);
        assert_eq!(encode_vs32(63), vec![0x3f]);
        assert_eq!(encode_vs32(64), vec![0xc0, 0x00]);
        assert_eq!(encode_vs32(-123456), vec![0xc0, 0xbb, 0x78]);
    }

    #[test]
    fn test_write_floats() {
        let mut buf = Vec::new();
        write_f32(&mut buf, 1.0);
        write_f64(&mut buf, -2.5);
        assert_eq!(&buf[..4], &[0x00, 0x00, 0x80, 0x3f]);
        assert_eq!(&buf[4..], &(-2.5f64).to_le_bytes());
    }

    #[test]
    fn test_section_rank_orders_data_count_before_code() {
        assert!(section_rank(SECTION_ELEMENT) < section_rank(SECTION_DATA_COUNT));
        assert!(section_rank(SECTION_DATA_COUNT) < section_rank(SECTION_CODE));
        assert!(section_rank(SECTION_CODE) < section_rank(SECTION_DATA));
        assert_eq!(section_rank(SECTION_CUSTOM), None);
        assert_eq!(section_rank(13), None);
    }
}
