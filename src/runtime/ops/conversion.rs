//! Float to integer truncation
//!
//! The trapping `trunc` instructions fail on NaN and on values whose
//! truncation does not fit the target type. The remaining conversions are
//! plain casts and are dispatched inline by [`super::numeric::execute`].

use super::Trap;

/// Truncate toward zero, requiring the result to lie strictly between the
/// exclusive bounds `lower` and `upper`. Every f32 widens to f64 exactly, so
/// one check serves both source widths.
fn trunc_checked(value: f64, lower: f64, upper: f64) -> Result<f64, Trap> {
    if value.is_nan() {
        return Err(Trap::InvalidConversion);
    }
    let truncated = value.trunc();
    if truncated <= lower || truncated >= upper {
        return Err(Trap::IntegerOverflow);
    }
    Ok(truncated)
}

pub fn trunc_i32_s(value: f64) -> Result<i32, Trap> {
    trunc_checked(value, -2147483649.0, 2147483648.0).map(|t| t as i32)
}

pub fn trunc_i32_u(value: f64) -> Result<i32, Trap> {
    trunc_checked(value, -1.0, 4294967296.0).map(|t| t as u32 as i32)
}

pub fn trunc_i64_s(value: f64) -> Result<i64, Trap> {
    // -2^63 - 1 rounds to -2^63 in f64, so the lower bound is inclusive here
    if value.trunc() == -9223372036854775808.0 {
        return Ok(i64::MIN);
    }
    trunc_checked(value, -9223372036854775808.0, 9223372036854775808.0).map(|t| t as i64)
}

pub fn trunc_i64_u(value: f64) -> Result<i64, Trap> {
    trunc_checked(value, -1.0, 18446744073709551616.0).map(|t| t as u64 as i64)
}

#[cfg(test)]
mod tests {
    use super::super::numeric::execute;
    use super::super::{Stack, Value};
    use super::*;
    use crate::parser::instruction::NumericOp::{self, *};

    fn run(op: NumericOp, operand: Value) -> Result<Value, Trap> {
        let mut stack = Stack::new();
        stack.push(operand);
        execute(&mut stack, op)?;
        stack.pop()
    }

    #[test]
    fn test_trapping_truncation() {
        assert_eq!(run(I32TruncF32S, Value::F32(-1.9)), Ok(Value::I32(-1)));
        assert_eq!(run(I32TruncF32U, Value::F32(-0.9)), Ok(Value::I32(0)));
        assert_eq!(run(I32TruncF64U, Value::F64(4294967295.9)), Ok(Value::I32(-1)));
        assert_eq!(run(I32TruncF64S, Value::F64(-2147483648.9)), Ok(Value::I32(i32::MIN)));
        assert_eq!(run(I32TruncF64S, Value::F64(2147483648.0)), Err(Trap::IntegerOverflow));
        assert_eq!(run(I32TruncF32S, Value::F32(f32::NAN)), Err(Trap::InvalidConversion));
        assert_eq!(run(I32TruncF32U, Value::F32(f32::INFINITY)), Err(Trap::IntegerOverflow));
        assert_eq!(run(I64TruncF64S, Value::F64(-9223372036854775808.0)), Ok(Value::I64(i64::MIN)));
        assert_eq!(run(I64TruncF64S, Value::F64(9223372036854775808.0)), Err(Trap::IntegerOverflow));
        assert_eq!(run(I64TruncF32U, Value::F32(-1.0)), Err(Trap::IntegerOverflow));
        assert_eq!(
            run(I64TruncF64U, Value::F64(18446744073709549568.0)),
            Ok(Value::I64(-2048))
        );
    }

    #[test]
    fn test_saturating_truncation() {
        assert_eq!(run(I32TruncSatF32S, Value::F32(f32::NAN)), Ok(Value::I32(0)));
        assert_eq!(run(I32TruncSatF64S, Value::F64(1e20)), Ok(Value::I32(i32::MAX)));
        assert_eq!(run(I32TruncSatF64U, Value::F64(-5.0)), Ok(Value::I32(0)));
        assert_eq!(run(I64TruncSatF32U, Value::F32(f32::INFINITY)), Ok(Value::I64(-1)));
    }

    #[test]
    fn test_width_and_bits() {
        assert_eq!(run(I32WrapI64, Value::I64(0x1_0000_0002)), Ok(Value::I32(2)));
        assert_eq!(run(I64ExtendI32U, Value::I32(-1)), Ok(Value::I64(0xffff_ffff)));
        assert_eq!(run(I64ExtendI32S, Value::I32(-1)), Ok(Value::I64(-1)));
        assert_eq!(run(I32Extend8S, Value::I32(0x80)), Ok(Value::I32(-128)));
        assert_eq!(run(I64Extend16S, Value::I64(0x7fff)), Ok(Value::I64(0x7fff)));
        assert_eq!(run(F32ReinterpretI32, Value::I32(0x3f80_0000)), Ok(Value::F32(1.0)));
        assert_eq!(run(I64ReinterpretF64, Value::F64(1.0)), Ok(Value::I64(0x3ff0_0000_0000_0000)));
        assert_eq!(run(F64ConvertI64U, Value::I64(-1)), Ok(Value::F64(18446744073709551615.0)));
        assert_eq!(run(F32DemoteF64, Value::F64(0.5)), Ok(Value::F32(0.5)));
    }
}
