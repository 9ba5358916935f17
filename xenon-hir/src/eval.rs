//! Evaluation of HIR operations on raw value bits.
//!
//! Used by the interpreter to execute instructions and by constant propagation to fold them, so
//! that both always agree on the result of an operation. Values are passed as `u128` bit patterns
//! masked to the width of their type; floats are stored as their IEEE bit pattern.

use crate::{Opcode, TypeName};

/// Sign extends the low `bits` of `value`.
#[inline]
pub fn sxt(value: u128, bits: u32) -> i128 {
    let shift = 128 - bits;
    ((value << shift) as i128) >> shift
}

#[inline]
fn to_f64(ty: TypeName, bits: u128) -> f64 {
    match ty {
        TypeName::F32 => f32::from_bits(bits as u32) as f64,
        _ => f64::from_bits(bits as u64),
    }
}

#[inline]
fn from_f64(ty: TypeName, value: f64) -> u128 {
    match ty {
        TypeName::F32 => (value as f32).to_bits() as u128,
        _ => value.to_bits() as u128,
    }
}

#[inline]
fn bool_bits(value: bool) -> u128 {
    value as u128
}

fn byte_swap(ty: TypeName, a: u128) -> u128 {
    match ty {
        TypeName::I8 => a,
        TypeName::I16 => (a as u16).swap_bytes() as u128,
        TypeName::I32 | TypeName::F32 => (a as u32).swap_bytes() as u128,
        TypeName::I64 | TypeName::F64 => (a as u64).swap_bytes() as u128,
        TypeName::V128 => a.swap_bytes(),
    }
}

fn convert(dest: TypeName, src: TypeName, a: u128) -> u128 {
    match (src.is_float(), dest.is_float()) {
        (false, true) => {
            let value = sxt(a, src.bits()) as i64;
            match dest {
                TypeName::F32 => (value as f32).to_bits() as u128,
                _ => (value as f64).to_bits() as u128,
            }
        }
        // Float to int conversions saturate, NaN converts to zero.
        (true, false) => {
            let value = to_f64(src, a);
            let result = match dest {
                TypeName::I8 => value as i8 as u128,
                TypeName::I16 => value as i16 as u128,
                TypeName::I32 => value as i32 as u128,
                _ => value as i64 as u128,
            };
            result & dest.mask()
        }
        (true, true) => from_f64(dest, to_f64(src, a)),
        (false, false) => (sxt(a, src.bits()) as u128) & dest.mask(),
    }
}

/// Evaluates a single operand operation producing a value of type `dest` from an operand of type
/// `src`. Returns `None` if the operation is not supported for the given types.
pub fn eval_unary(op: Opcode, dest: TypeName, src: TypeName, a: u128) -> Option<u128> {
    let a = a & src.mask();
    let result = match op {
        Opcode::Assign => a,
        Opcode::Cast => a & dest.mask(),
        Opcode::ZeroExtend => a,
        Opcode::SignExtend => sxt(a, src.bits()) as u128,
        Opcode::Truncate => a,
        Opcode::Convert => convert(dest, src, a),
        Opcode::IsTrue => bool_bits(a != 0),
        Opcode::IsFalse => bool_bits(a == 0),
        Opcode::Not => !a,
        Opcode::ByteSwap => byte_swap(src, a),
        Opcode::CountLeadingZeros if src.is_int() => {
            (a.leading_zeros() - (128 - src.bits())) as u128
        }
        Opcode::Neg if src.is_int() => a.wrapping_neg(),
        Opcode::Neg if src.is_float() => a ^ (1 << (src.bits() - 1)),
        Opcode::Abs if src.is_int() => sxt(a, src.bits()).unsigned_abs(),
        Opcode::Abs if src.is_float() => a & !(1 << (src.bits() - 1)),
        Opcode::Sqrt if src.is_float() => from_f64(src, to_f64(src, a).sqrt()),
        _ => return None,
    };
    Some(result & dest.mask())
}

fn eval_float_binary(op: Opcode, ty: TypeName, a: u128, b: u128) -> Option<u128> {
    let (x, y) = (to_f64(ty, a), to_f64(ty, b));
    let arith = |value: f64| Some(from_f64(ty, value));
    match op {
        Opcode::Add => arith(x + y),
        Opcode::Sub => arith(x - y),
        Opcode::Mul => arith(x * y),
        Opcode::Div => arith(x / y),
        Opcode::CompareEq => Some(bool_bits(x == y)),
        Opcode::CompareNe => Some(bool_bits(x != y)),
        Opcode::CompareSlt => Some(bool_bits(x < y)),
        Opcode::CompareSle => Some(bool_bits(x <= y)),
        Opcode::CompareSgt => Some(bool_bits(x > y)),
        Opcode::CompareSge => Some(bool_bits(x >= y)),
        // Unsigned float comparisons are true when the operands are unordered.
        Opcode::CompareUlt => Some(bool_bits(!(x >= y))),
        Opcode::CompareUle => Some(bool_bits(!(x > y))),
        Opcode::CompareUgt => Some(bool_bits(!(x <= y))),
        Opcode::CompareUge => Some(bool_bits(!(x < y))),
        _ => None,
    }
}

/// Evaluates a two operand operation where `a` has type `ty`. Shift amounts (`b`) may be of any
/// integer type and are taken modulo the bit width of `ty`.
///
/// Division by zero produces zero.
pub fn eval_binary(op: Opcode, ty: TypeName, a: u128, b: u128) -> Option<u128> {
    let mask = ty.mask();
    let (a, b) = (a & mask, b & mask);

    if ty.is_float() {
        return eval_float_binary(op, ty, a, b);
    }
    if ty.is_vec() {
        return match op {
            Opcode::And => Some(a & b),
            Opcode::Or => Some(a | b),
            Opcode::Xor => Some(a ^ b),
            Opcode::CompareEq => Some(bool_bits(a == b)),
            Opcode::CompareNe => Some(bool_bits(a != b)),
            _ => None,
        };
    }

    let bits = ty.bits();
    let (sa, sb) = (sxt(a, bits), sxt(b, bits));
    let result = match op {
        Opcode::CompareEq => bool_bits(a == b),
        Opcode::CompareNe => bool_bits(a != b),
        Opcode::CompareSlt => bool_bits(sa < sb),
        Opcode::CompareSle => bool_bits(sa <= sb),
        Opcode::CompareSgt => bool_bits(sa > sb),
        Opcode::CompareSge => bool_bits(sa >= sb),
        Opcode::CompareUlt => bool_bits(a < b),
        Opcode::CompareUle => bool_bits(a <= b),
        Opcode::CompareUgt => bool_bits(a > b),
        Opcode::CompareUge => bool_bits(a >= b),

        Opcode::Add => a.wrapping_add(b),
        Opcode::Sub => a.wrapping_sub(b),
        Opcode::Mul => a.wrapping_mul(b),
        Opcode::MulHi => (sa.wrapping_mul(sb) >> bits) as u128,
        Opcode::MulHiUnsigned => a.wrapping_mul(b) >> bits,
        Opcode::Div if b == 0 => 0,
        Opcode::Div => sa.wrapping_div(sb) as u128,
        Opcode::DivUnsigned if b == 0 => 0,
        Opcode::DivUnsigned => a / b,

        Opcode::AddCarryOut => bool_bits(a + b > mask),
        Opcode::SubCarryOut => bool_bits(a >= b),
        Opcode::AddOverflow => {
            let sum = sxt((sa + sb) as u128 & mask, bits);
            bool_bits(sum != sa + sb)
        }
        Opcode::SubOverflow => {
            let diff = sxt((sa - sb) as u128 & mask, bits);
            bool_bits(diff != sa - sb)
        }

        Opcode::And => a & b,
        Opcode::Or => a | b,
        Opcode::Xor => a ^ b,
        Opcode::Shl => a << (b % bits as u128),
        Opcode::Shr => a >> (b % bits as u128),
        Opcode::Sha => (sa >> (b % bits as u128)) as u128,
        Opcode::RotateLeft => {
            let n = (b % bits as u128) as u32;
            if n == 0 { a } else { (a << n) | (a >> (bits - n)) }
        }
        _ => return None,
    };

    let dest_mask = match op {
        Opcode::CompareEq
        | Opcode::CompareNe
        | Opcode::CompareSlt
        | Opcode::CompareSle
        | Opcode::CompareSgt
        | Opcode::CompareSge
        | Opcode::CompareUlt
        | Opcode::CompareUle
        | Opcode::CompareUgt
        | Opcode::CompareUge
        | Opcode::AddCarryOut
        | Opcode::SubCarryOut
        | Opcode::AddOverflow
        | Opcode::SubOverflow => TypeName::I8.mask(),
        _ => mask,
    };
    Some(result & dest_mask)
}

/// Evaluates a three operand operation. `ty` is the type of the result (for `select`, the type of
/// the selected operands; for carry operations, the type of `a` and `b`).
pub fn eval_ternary(op: Opcode, ty: TypeName, a: u128, b: u128, c: u128) -> Option<u128> {
    let mask = ty.mask();
    match op {
        Opcode::Select => Some(if a != 0 { b & mask } else { c & mask }),
        Opcode::AddWithCarry if ty.is_int() => {
            Some((a & mask).wrapping_add(b & mask).wrapping_add((c != 0) as u128) & mask)
        }
        Opcode::AdcCarryOut if ty.is_int() => {
            Some(bool_bits((a & mask) + (b & mask) + (c != 0) as u128 > mask))
        }
        Opcode::MulAdd if ty.is_float() => {
            let (x, y, z) = (to_f64(ty, a), to_f64(ty, b), to_f64(ty, c));
            Some(from_f64(ty, x.mul_add(y, z)))
        }
        Opcode::MulSub if ty.is_float() => {
            let (x, y, z) = (to_f64(ty, a), to_f64(ty, b), to_f64(ty, c));
            Some(from_f64(ty, x.mul_add(y, -z)))
        }
        _ => None,
    }
}
