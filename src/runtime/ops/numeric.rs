//! Numeric instructions: arithmetic, bitwise, comparison, tests and
//! conversions
//!
//! Integer arithmetic wraps modulo 2^N. Division traps on a zero divisor and
//! signed division traps on `MIN / -1`; the corresponding remainder is 0.
//! Float arithmetic is IEEE 754 with WebAssembly's `min`/`max` rules.

use super::*;
use super::conversion;
use crate::parser::instruction::NumericOp;

/// Execute a stack-only numeric instruction
pub fn execute(stack: &mut Stack, op: NumericOp) -> Result<(), Trap> {
    use NumericOp::*;
    match op {
        I32Eqz => unop(stack, |a: i32| i32::from(a == 0)),
        I32Eq => binop(stack, |a: i32, b| i32::from(a == b)),
        I32Ne => binop(stack, |a: i32, b| i32::from(a != b)),
        I32LtS => binop(stack, |a: i32, b| i32::from(a < b)),
        I32LtU => binop(stack, |a: i32, b| i32::from((a as u32) < (b as u32))),
        I32GtS => binop(stack, |a: i32, b| i32::from(a > b)),
        I32GtU => binop(stack, |a: i32, b| i32::from((a as u32) > (b as u32))),
        I32LeS => binop(stack, |a: i32, b| i32::from(a <= b)),
        I32LeU => binop(stack, |a: i32, b| i32::from((a as u32) <= (b as u32))),
        I32GeS => binop(stack, |a: i32, b| i32::from(a >= b)),
        I32GeU => binop(stack, |a: i32, b| i32::from((a as u32) >= (b as u32))),

        I64Eqz => unop(stack, |a: i64| i32::from(a == 0)),
        I64Eq => binop(stack, |a: i64, b| i32::from(a == b)),
        I64Ne => binop(stack, |a: i64, b| i32::from(a != b)),
        I64LtS => binop(stack, |a: i64, b| i32::from(a < b)),
        I64LtU => binop(stack, |a: i64, b| i32::from((a as u64) < (b as u64))),
        I64GtS => binop(stack, |a: i64, b| i32::from(a > b)),
        I64GtU => binop(stack, |a: i64, b| i32::from((a as u64) > (b as u64))),
        I64LeS => binop(stack, |a: i64, b| i32::from(a <= b)),
        I64LeU => binop(stack, |a: i64, b| i32::from((a as u64) <= (b as u64))),
        I64GeS => binop(stack, |a: i64, b| i32::from(a >= b)),
        I64GeU => binop(stack, |a: i64, b| i32::from((a as u64) >= (b as u64))),

        F32Eq => binop(stack, |a: f32, b| i32::from(a == b)),
        F32Ne => binop(stack, |a: f32, b| i32::from(a != b)),
        F32Lt => binop(stack, |a: f32, b| i32::from(a < b)),
        F32Gt => binop(stack, |a: f32, b| i32::from(a > b)),
        F32Le => binop(stack, |a: f32, b| i32::from(a <= b)),
        F32Ge => binop(stack, |a: f32, b| i32::from(a >= b)),
        F64Eq => binop(stack, |a: f64, b| i32::from(a == b)),
        F64Ne => binop(stack, |a: f64, b| i32::from(a != b)),
        F64Lt => binop(stack, |a: f64, b| i32::from(a < b)),
        F64Gt => binop(stack, |a: f64, b| i32::from(a > b)),
        F64Le => binop(stack, |a: f64, b| i32::from(a <= b)),
        F64Ge => binop(stack, |a: f64, b| i32::from(a >= b)),

        I32Clz => unop(stack, |a: i32| a.leading_zeros() as i32),
        I32Ctz => unop(stack, |a: i32| a.trailing_zeros() as i32),
        I32Popcnt => unop(stack, |a: i32| a.count_ones() as i32),
        I32Add => binop(stack, |a: i32, b| a.wrapping_add(b)),
        I32Sub => binop(stack, |a: i32, b| a.wrapping_sub(b)),
        I32Mul => binop(stack, |a: i32, b| a.wrapping_mul(b)),
        I32DivS => try_binop(stack, i32_div_s),
        I32DivU => try_binop(stack, |a: i32, b: i32| {
            checked_divisor(b)?;
            Ok((a as u32 / b as u32) as i32)
        }),
        I32RemS => try_binop(stack, |a: i32, b: i32| {
            checked_divisor(b)?;
            Ok(a.wrapping_rem(b))
        }),
        I32RemU => try_binop(stack, |a: i32, b: i32| {
            checked_divisor(b)?;
            Ok((a as u32 % b as u32) as i32)
        }),
        I32And => binop(stack, |a: i32, b| a & b),
        I32Or => binop(stack, |a: i32, b| a | b),
        I32Xor => binop(stack, |a: i32, b| a ^ b),
        I32Shl => binop(stack, |a: i32, b| a.wrapping_shl(b as u32)),
        I32ShrS => binop(stack, |a: i32, b| a.wrapping_shr(b as u32)),
        I32ShrU => binop(stack, |a: i32, b| (a as u32).wrapping_shr(b as u32) as i32),
        I32Rotl => binop(stack, |a: i32, b| a.rotate_left(b as u32 % 32)),
        I32Rotr => binop(stack, |a: i32, b| a.rotate_right(b as u32 % 32)),

        I64Clz => unop(stack, |a: i64| a.leading_zeros() as i64),
        I64Ctz => unop(stack, |a: i64| a.trailing_zeros() as i64),
        I64Popcnt => unop(stack, |a: i64| a.count_ones() as i64),
        I64Add => binop(stack, |a: i64, b| a.wrapping_add(b)),
        I64Sub => binop(stack, |a: i64, b| a.wrapping_sub(b)),
        I64Mul => binop(stack, |a: i64, b| a.wrapping_mul(b)),
        I64DivS => try_binop(stack, i64_div_s),
        I64DivU => try_binop(stack, |a: i64, b: i64| {
            checked_divisor(b)?;
            Ok((a as u64 / b as u64) as i64)
        }),
        I64RemS => try_binop(stack, |a: i64, b: i64| {
            checked_divisor(b)?;
            Ok(a.wrapping_rem(b))
        }),
        I64RemU => try_binop(stack, |a: i64, b: i64| {
            checked_divisor(b)?;
            Ok((a as u64 % b as u64) as i64)
        }),
        I64And => binop(stack, |a: i64, b| a & b),
        I64Or => binop(stack, |a: i64, b| a | b),
        I64Xor => binop(stack, |a: i64, b| a ^ b),
        I64Shl => binop(stack, |a: i64, b| a.wrapping_shl(b as u32)),
        I64ShrS => binop(stack, |a: i64, b| a.wrapping_shr(b as u32)),
        I64ShrU => binop(stack, |a: i64, b| (a as u64).wrapping_shr(b as u32) as i64),
        I64Rotl => binop(stack, |a: i64, b| a.rotate_left((b as u64 % 64) as u32)),
        I64Rotr => binop(stack, |a: i64, b| a.rotate_right((b as u64 % 64) as u32)),

        F32Abs => unop(stack, f32::abs),
        F32Neg => unop(stack, |a: f32| -a),
        F32Ceil => unop(stack, f32::ceil),
        F32Floor => unop(stack, f32::floor),
        F32Trunc => unop(stack, f32::trunc),
        F32Nearest => unop(stack, f32::round_ties_even),
        F32Sqrt => unop(stack, f32::sqrt),
        F32Add => binop(stack, |a: f32, b| a + b),
        F32Sub => binop(stack, |a: f32, b| a - b),
        F32Mul => binop(stack, |a: f32, b| a * b),
        F32Div => binop(stack, |a: f32, b| a / b),
        F32Min => binop(stack, f32_min),
        F32Max => binop(stack, f32_max),
        F32Copysign => binop(stack, f32::copysign),

        F64Abs => unop(stack, f64::abs),
        F64Neg => unop(stack, |a: f64| -a),
        F64Ceil => unop(stack, f64::ceil),
        F64Floor => unop(stack, f64::floor),
        F64Trunc => unop(stack, f64::trunc),
        F64Nearest => unop(stack, f64::round_ties_even),
        F64Sqrt => unop(stack, f64::sqrt),
        F64Add => binop(stack, |a: f64, b| a + b),
        F64Sub => binop(stack, |a: f64, b| a - b),
        F64Mul => binop(stack, |a: f64, b| a * b),
        F64Div => binop(stack, |a: f64, b| a / b),
        F64Min => binop(stack, f64_min),
        F64Max => binop(stack, f64_max),
        F64Copysign => binop(stack, f64::copysign),

        // conversions
        I32WrapI64 => unop(stack, |a: i64| a as i32),
        I64ExtendI32S => unop(stack, |a: i32| a as i64),
        I64ExtendI32U => unop(stack, |a: i32| a as u32 as i64),
        I32Extend8S => unop(stack, |a: i32| a as i8 as i32),
        I32Extend16S => unop(stack, |a: i32| a as i16 as i32),
        I64Extend8S => unop(stack, |a: i64| a as i8 as i64),
        I64Extend16S => unop(stack, |a: i64| a as i16 as i64),
        I64Extend32S => unop(stack, |a: i64| a as i32 as i64),

        I32TruncF32S => try_unop(stack, |a: f32| conversion::trunc_i32_s(a as f64)),
        I32TruncF32U => try_unop(stack, |a: f32| conversion::trunc_i32_u(a as f64)),
        I32TruncF64S => try_unop(stack, conversion::trunc_i32_s),
        I32TruncF64U => try_unop(stack, conversion::trunc_i32_u),
        I64TruncF32S => try_unop(stack, |a: f32| conversion::trunc_i64_s(a as f64)),
        I64TruncF32U => try_unop(stack, |a: f32| conversion::trunc_i64_u(a as f64)),
        I64TruncF64S => try_unop(stack, conversion::trunc_i64_s),
        I64TruncF64U => try_unop(stack, conversion::trunc_i64_u),

        // `as` from float to int saturates and maps NaN to 0
        I32TruncSatF32S => unop(stack, |a: f32| a as i32),
        I32TruncSatF32U => unop(stack, |a: f32| a as u32 as i32),
        I32TruncSatF64S => unop(stack, |a: f64| a as i32),
        I32TruncSatF64U => unop(stack, |a: f64| a as u32 as i32),
        I64TruncSatF32S => unop(stack, |a: f32| a as i64),
        I64TruncSatF32U => unop(stack, |a: f32| a as u64 as i64),
        I64TruncSatF64S => unop(stack, |a: f64| a as i64),
        I64TruncSatF64U => unop(stack, |a: f64| a as u64 as i64),

        F32ConvertI32S => unop(stack, |a: i32| a as f32),
        F32ConvertI32U => unop(stack, |a: i32| a as u32 as f32),
        F32ConvertI64S => unop(stack, |a: i64| a as f32),
        F32ConvertI64U => unop(stack, |a: i64| a as u64 as f32),
        F64ConvertI32S => unop(stack, |a: i32| a as f64),
        F64ConvertI32U => unop(stack, |a: i32| a as u32 as f64),
        F64ConvertI64S => unop(stack, |a: i64| a as f64),
        F64ConvertI64U => unop(stack, |a: i64| a as u64 as f64),
        F32DemoteF64 => unop(stack, |a: f64| a as f32),
        F64PromoteF32 => unop(stack, |a: f32| a as f64),

        I32ReinterpretF32 => unop(stack, |a: f32| a.to_bits() as i32),
        I64ReinterpretF64 => unop(stack, |a: f64| a.to_bits() as i64),
        F32ReinterpretI32 => unop(stack, |a: i32| f32::from_bits(a as u32)),
        F64ReinterpretI64 => unop(stack, |a: i64| f64::from_bits(a as u64)),
    }
}

fn checked_divisor<T: Default + PartialEq>(divisor: T) -> Result<(), Trap> {
    if divisor == T::default() {
        return Err(Trap::IntegerDivideByZero);
    }
    Ok(())
}

/// i32.div_s: traps on zero and on `i32::MIN / -1`, whose quotient 2^31 is
/// not representable
pub fn i32_div_s(a: i32, b: i32) -> Result<i32, Trap> {
    checked_divisor(b)?;
    a.checked_div(b).ok_or(Trap::IntegerOverflow)
}

pub fn i64_div_s(a: i64, b: i64) -> Result<i64, Trap> {
    checked_divisor(b)?;
    a.checked_div(b).ok_or(Trap::IntegerOverflow)
}

/// f32.min: NaN if either operand is NaN, and -0.0 orders below +0.0
pub fn f32_min(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == 0.0 && b == 0.0 {
        if a.is_sign_negative() {
            a
        } else {
            b
        }
    } else {
        a.min(b)
    }
}

pub fn f32_max(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == 0.0 && b == 0.0 {
        if a.is_sign_negative() {
            b
        } else {
            a
        }
    } else {
        a.max(b)
    }
}

pub fn f64_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == 0.0 && b == 0.0 {
        if a.is_sign_negative() {
            a
        } else {
            b
        }
    } else {
        a.min(b)
    }
}

pub fn f64_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == 0.0 && b == 0.0 {
        if a.is_sign_negative() {
            b
        } else {
            a
        }
    } else {
        a.max(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use NumericOp::*;

    fn run(op: NumericOp, operands: &[Value]) -> Result<Value, Trap> {
        let mut stack = Stack::new();
        stack.push_all(operands.iter().copied());
        execute(&mut stack, op)?;
        let result = stack.pop()?;
        assert!(stack.is_empty());
        Ok(result)
    }

    #[rstest]
    #[case(I32Add, 2, 3, 5)]
    #[case(I32Add, i32::MAX, 1, i32::MIN)]
    #[case(I32Sub, 0, 1, -1)]
    #[case(I32Mul, 0x10000, 0x10000, 0)]
    #[case(I32DivS, -7, 2, -3)]
    #[case(I32DivU, -1, 2, i32::MAX)]
    #[case(I32RemS, -7, 2, -1)]
    #[case(I32RemS, i32::MIN, -1, 0)]
    #[case(I32RemU, -1, 10, 5)]
    #[case(I32Shl, 1, 33, 2)]
    #[case(I32ShrS, -8, 1, -4)]
    #[case(I32ShrU, -8, 1, 0x7fff_fffc)]
    #[case(I32Rotl, 0x8000_0001u32 as i32, 1, 3)]
    #[case(I32Rotr, 1, 1, i32::MIN)]
    #[case(I32LtU, -1, 1, 0)]
    #[case(I32LtS, -1, 1, 1)]
    fn test_i32_binops(#[case] op: NumericOp, #[case] a: i32, #[case] b: i32, #[case] expected: i32) {
        assert_eq!(run(op, &[Value::I32(a), Value::I32(b)]), Ok(Value::I32(expected)));
    }

    #[rstest]
    #[case(I32DivS, 1, 0, Trap::IntegerDivideByZero)]
    #[case(I32DivU, 1, 0, Trap::IntegerDivideByZero)]
    #[case(I32RemS, 1, 0, Trap::IntegerDivideByZero)]
    #[case(I32RemU, 1, 0, Trap::IntegerDivideByZero)]
    #[case(I32DivS, i32::MIN, -1, Trap::IntegerOverflow)]
    fn test_i32_traps(#[case] op: NumericOp, #[case] a: i32, #[case] b: i32, #[case] trap: Trap) {
        assert_eq!(run(op, &[Value::I32(a), Value::I32(b)]), Err(trap));
    }

    #[test]
    fn test_i64_ops() {
        assert_eq!(run(I64Add, &[Value::I64(i64::MAX), Value::I64(1)]), Ok(Value::I64(i64::MIN)));
        assert_eq!(run(I64DivS, &[Value::I64(i64::MIN), Value::I64(-1)]), Err(Trap::IntegerOverflow));
        assert_eq!(run(I64RemS, &[Value::I64(i64::MIN), Value::I64(-1)]), Ok(Value::I64(0)));
        assert_eq!(run(I64Clz, &[Value::I64(1)]), Ok(Value::I64(63)));
        assert_eq!(run(I64Eqz, &[Value::I64(0)]), Ok(Value::I32(1)));
        assert_eq!(run(I64GtU, &[Value::I64(-1), Value::I64(1)]), Ok(Value::I32(1)));
        assert_eq!(run(I64Rotl, &[Value::I64(1), Value::I64(65)]), Ok(Value::I64(2)));
    }

    #[test]
    fn test_bit_counts() {
        assert_eq!(run(I32Clz, &[Value::I32(0)]), Ok(Value::I32(32)));
        assert_eq!(run(I32Ctz, &[Value::I32(8)]), Ok(Value::I32(3)));
        assert_eq!(run(I32Popcnt, &[Value::I32(-1)]), Ok(Value::I32(32)));
    }

    #[test]
    fn test_float_min_max() {
        assert!(f32_min(f32::NAN, 1.0).is_nan());
        assert!(f64_max(1.0, f64::NAN).is_nan());
        assert!(f32_min(0.0, -0.0).is_sign_negative());
        assert!(f32_max(-0.0, 0.0).is_sign_positive());
        assert!(f64_min(-0.0, 0.0).is_sign_negative());
        assert_eq!(f64_max(-1.0, 2.0), 2.0);
    }

    #[test]
    fn test_float_ops() {
        assert_eq!(run(F32Nearest, &[Value::F32(2.5)]), Ok(Value::F32(2.0)));
        assert_eq!(run(F64Nearest, &[Value::F64(-3.5)]), Ok(Value::F64(-4.0)));
        assert_eq!(run(F64Add, &[Value::F64(0.5), Value::F64(0.25)]), Ok(Value::F64(0.75)));
        assert_eq!(run(F32Copysign, &[Value::F32(1.0), Value::F32(-0.0)]), Ok(Value::F32(-1.0)));
        assert_eq!(run(F64Lt, &[Value::F64(f64::NAN), Value::F64(1.0)]), Ok(Value::I32(0)));
        assert_eq!(run(F32Ne, &[Value::F32(f32::NAN), Value::F32(f32::NAN)]), Ok(Value::I32(1)));
    }

    #[test]
    fn test_operand_type_checked() {
        assert_eq!(
            run(I32Add, &[Value::I64(1), Value::I32(2)]),
            Err(Trap::OperandTypeMismatch {
                expected: crate::parser::module::ValueType::I32,
                actual: crate::parser::module::ValueType::I64
            })
        );
    }
}
