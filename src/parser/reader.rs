use byteorder::{ByteOrder, LittleEndian};

use super::error::{ParseError, ParseErrorKind};

/// A cursor over a module binary.
///
/// Sub-readers created with [`Reader::sub_reader`] keep reporting absolute
/// offsets so errors always point into the original input.
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Reader<'a> {
        Reader {
            bytes,
            pos: 0,
            base: 0,
        }
    }
}

impl<'a> Reader<'a> {
    // Basic operations --------------------------------------------------------

    /// Absolute position in the original input
    pub fn pos(&self) -> usize {
        self.base + self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn error(&self, kind: ParseErrorKind) -> ParseError {
        ParseError::new(self.pos(), kind)
    }

    pub fn error_at(&self, offset: usize, kind: ParseErrorKind) -> ParseError {
        ParseError::new(offset, kind)
    }

    pub fn read_byte(&mut self) -> Result<u8, ParseError> {
        match self.bytes.get(self.pos) {
            Some(byte) => {
                self.pos += 1;
                Ok(*byte)
            }
            None => Err(self.error(ParseErrorKind::UnexpectedEof)),
        }
    }

    pub fn peek_byte(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ParseError> {
        if len > self.remaining() {
            return Err(self.error(ParseErrorKind::UnexpectedEof));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Split off the next `len` bytes as their own reader and advance past them.
    pub fn sub_reader(&mut self, len: usize) -> Result<Reader<'a>, ParseError> {
        let base = self.pos();
        let bytes = self.read_bytes(len)?;
        Ok(Reader { bytes, pos: 0, base })
    }

    /// Guard against count fields that claim more items than there are bytes
    /// left; every item takes at least one byte.
    pub fn check_count(&self, count: u32) -> Result<(), ParseError> {
        if count as usize > self.remaining() {
            return Err(self.error(ParseErrorKind::UnexpectedEof));
        }
        Ok(())
    }

    // Read and interpret types ------------------------------------------------

    // le
    pub fn read_u32(&mut self) -> Result<u32, ParseError> {
        let bytes = self.read_bytes(4)?;
        Ok(LittleEndian::read_u32(bytes))
    }

    pub fn read_f32(&mut self) -> Result<f32, ParseError> {
        let bytes = self.read_bytes(4)?;
        Ok(LittleEndian::read_f32(bytes))
    }

    pub fn read_f64(&mut self) -> Result<f64, ParseError> {
        let bytes = self.read_bytes(8)?;
        Ok(LittleEndian::read_f64(bytes))
    }

    pub fn read_vu32(&mut self) -> Result<u32, ParseError> {
        Ok(self.read_unsigned(32)? as u32)
    }

    pub fn read_vu64(&mut self) -> Result<u64, ParseError> {
        self.read_unsigned(64)
    }

    pub fn read_vs32(&mut self) -> Result<i32, ParseError> {
        Ok(self.read_signed(32)? as i32)
    }

    /// Block types encode a type index as a positive signed 33-bit integer
    pub fn read_vs33(&mut self) -> Result<i64, ParseError> {
        self.read_signed(33)
    }

    pub fn read_vs64(&mut self) -> Result<i64, ParseError> {
        self.read_signed(64)
    }

    pub fn read_name(&mut self) -> Result<String, ParseError> {
        let len = self.read_vu32()? as usize;
        let start = self.pos();
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| self.error_at(start, ParseErrorKind::InvalidUtf8))
    }

    fn read_unsigned(&mut self, bits: u32) -> Result<u64, ParseError> {
        let start = self.pos();
        let mut result: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_byte()?;
            let payload = (byte & 0x7f) as u64;
            if shift + 7 > bits {
                if byte & 0x80 != 0 {
                    return Err(self.error_at(start, ParseErrorKind::IntegerTooLong));
                }
                if payload >> (bits - shift) != 0 {
                    return Err(self.error_at(start, ParseErrorKind::IntegerTooLarge));
                }
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    fn read_signed(&mut self, bits: u32) -> Result<i64, ParseError> {
        let start = self.pos();
        let mut result: i64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_byte()?;
            let payload = (byte & 0x7f) as i64;
            if shift + 7 >= bits {
                if byte & 0x80 != 0 {
                    return Err(self.error_at(start, ParseErrorKind::IntegerTooLong));
                }
                // the sign bit and every unused bit above it must agree
                let remaining = bits - shift;
                let high = (byte & 0x7f) >> (remaining - 1);
                if high != 0 && high != (0x7f >> (remaining - 1)) {
                    return Err(self.error_at(start, ParseErrorKind::IntegerTooLarge));
                }
                result |= payload << shift;
                if shift + 7 < 64 && payload & 0x40 != 0 {
                    result |= -1i64 << (shift + 7);
                }
                return Ok(result);
            }
            result |= payload << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if payload & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
    }
}
