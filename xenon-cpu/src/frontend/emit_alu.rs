//! Integer arithmetic, logical, compare, rotate and shift instructions.
//!
//! XER[CA] and XER[OV] are computed from the low 32 bits of the operands, CR0 from the full 64-bit
//! result.

use xenon_hir::{TypeName, ValueId};

use crate::frontend::{
    decode::{Instr, PpcOpcode},
    translator::{EmitResult, Emitter, Unhandled},
};

/// Builds the rotate mask covering IBM bits `mb..=me` of a 64-bit value (wrapping if `mb > me`).
pub(crate) fn mask64(mb: u32, me: u32) -> u64 {
    let begin = u64::MAX >> mb;
    let end = u64::MAX << (63 - me);
    match mb <= me {
        true => begin & end,
        false => begin | end,
    }
}

impl<'a> Emitter<'a> {
    fn trunc32(&mut self, value: ValueId) -> ValueId {
        self.f.truncate(value, TypeName::I32)
    }

    fn finish_rd(&mut self, i: Instr, value: ValueId) {
        self.store_gpr(i.rd(), value);
        if i.rc() {
            self.update_cr(0, value);
        }
    }

    fn finish_ra(&mut self, i: Instr, value: ValueId) {
        self.store_gpr(i.ra(), value);
        if i.rc() {
            self.update_cr(0, value);
        }
    }

    /// Signed overflow of a 32-bit addition `a + b (+ carry) = result`.
    fn add_overflow32(&mut self, a: ValueId, b: ValueId, result: ValueId) -> ValueId {
        let a = self.trunc32(a);
        let b = self.trunc32(b);
        let r = self.trunc32(result);
        let x = self.f.xor(a, r);
        let y = self.f.xor(b, r);
        let both = self.f.and(x, y);
        let sign = self.f.shr_imm(both, 31);
        self.f.truncate(sign, TypeName::I8)
    }

    /// `a + b + carry`, updating XER[CA] (and XER[OV] if requested).
    fn add_extended(&mut self, a: ValueId, b: ValueId, carry: ValueId, oe: bool) -> ValueId {
        let result = self.f.add_with_carry(a, b, carry);
        let (a32, b32) = (self.trunc32(a), self.trunc32(b));
        let ca = self.f.adc_carry_out(a32, b32, carry);
        self.store_ca(ca);
        if oe {
            let ov = self.add_overflow32(a, b, result);
            self.store_ov(ov);
        }
        result
    }

    /// Duplicates the low word of `value` into the high word (`ROTL32` operates on `x || x`).
    fn dup32(&mut self, value: ValueId) -> ValueId {
        let low = self.trunc32(value);
        let low = self.f.zero_extend(low, TypeName::I64);
        let high = self.f.shl_imm(low, 32);
        self.f.or(low, high)
    }

    /// Carry out of an arithmetic right shift of `value` by `amount`: set when `value` is negative
    /// and any 1 bits were shifted out.
    fn sra_carry(&mut self, value: ValueId, shifted: ValueId, amount: ValueId) -> ValueId {
        let zero = self.f.const_i64(0);
        let negative = self.f.compare_slt(value, zero);
        let restored = self.f.shl(shifted, amount);
        let lost = self.f.compare_ne(restored, value);
        self.f.and(negative, lost)
    }
}

pub(crate) fn emit(e: &mut Emitter, i: Instr) -> EmitResult {
    use PpcOpcode::*;

    match i.opcode {
        addx => {
            let a = e.load_gpr(i.ra());
            let b = e.load_gpr(i.rb());
            let v = e.f.add(a, b);
            if i.oe() {
                let (a32, b32) = (e.trunc32(a), e.trunc32(b));
                let ov = e.f.add_overflow(a32, b32);
                e.store_ov(ov);
            }
            e.finish_rd(i, v);
        }
        addcx => {
            let a = e.load_gpr(i.ra());
            let b = e.load_gpr(i.rb());
            let v = e.f.add(a, b);
            let (a32, b32) = (e.trunc32(a), e.trunc32(b));
            let ca = e.f.add_carry_out(a32, b32);
            e.store_ca(ca);
            if i.oe() {
                let ov = e.f.add_overflow(a32, b32);
                e.store_ov(ov);
            }
            e.finish_rd(i, v);
        }
        addex => {
            let a = e.load_gpr(i.ra());
            let b = e.load_gpr(i.rb());
            let ca = e.load_ca();
            let v = e.add_extended(a, b, ca, i.oe());
            e.finish_rd(i, v);
        }
        addi => {
            let a = e.load_gpr_or_zero(i.ra());
            let v = e.f.add_imm(a, i.simm() as u64);
            e.store_gpr(i.rd(), v);
        }
        addis => {
            let a = e.load_gpr_or_zero(i.ra());
            let v = e.f.add_imm(a, (i.simm() << 16) as u64);
            e.store_gpr(i.rd(), v);
        }
        addic | addicx => {
            let a = e.load_gpr(i.ra());
            let v = e.f.add_imm(a, i.simm() as u64);
            let a32 = e.trunc32(a);
            let imm = e.f.const_i32(i.simm() as u32);
            let ca = e.f.add_carry_out(a32, imm);
            e.store_ca(ca);
            e.store_gpr(i.rd(), v);
            if i.opcode == addicx {
                e.update_cr(0, v);
            }
        }
        addmex | addzex => {
            let a = e.load_gpr(i.ra());
            let b = match i.opcode {
                addmex => e.f.const_i64(u64::MAX),
                _ => e.f.const_i64(0),
            };
            let ca = e.load_ca();
            let v = e.add_extended(a, b, ca, i.oe());
            e.finish_rd(i, v);
        }

        subfx => {
            let a = e.load_gpr(i.ra());
            let b = e.load_gpr(i.rb());
            let v = e.f.sub(b, a);
            if i.oe() {
                let (a32, b32) = (e.trunc32(a), e.trunc32(b));
                let ov = e.f.sub_overflow(b32, a32);
                e.store_ov(ov);
            }
            e.finish_rd(i, v);
        }
        subfcx => {
            let a = e.load_gpr(i.ra());
            let b = e.load_gpr(i.rb());
            let v = e.f.sub(b, a);
            let (a32, b32) = (e.trunc32(a), e.trunc32(b));
            let ca = e.f.sub_carry_out(b32, a32);
            e.store_ca(ca);
            if i.oe() {
                let ov = e.f.sub_overflow(b32, a32);
                e.store_ov(ov);
            }
            e.finish_rd(i, v);
        }
        subfex => {
            let a = e.load_gpr(i.ra());
            let not_a = e.f.not(a);
            let b = e.load_gpr(i.rb());
            let ca = e.load_ca();
            let v = e.add_extended(not_a, b, ca, i.oe());
            e.finish_rd(i, v);
        }
        subficx => {
            let a = e.load_gpr(i.ra());
            let imm = e.f.const_i64(i.simm() as u64);
            let v = e.f.sub(imm, a);
            let a32 = e.trunc32(a);
            let imm32 = e.f.const_i32(i.simm() as u32);
            let ca = e.f.sub_carry_out(imm32, a32);
            e.store_ca(ca);
            e.store_gpr(i.rd(), v);
        }
        subfmex | subfzex => {
            let a = e.load_gpr(i.ra());
            let not_a = e.f.not(a);
            let b = match i.opcode {
                subfmex => e.f.const_i64(u64::MAX),
                _ => e.f.const_i64(0),
            };
            let ca = e.load_ca();
            let v = e.add_extended(not_a, b, ca, i.oe());
            e.finish_rd(i, v);
        }
        negx => {
            let a = e.load_gpr(i.ra());
            let v = e.f.neg(a);
            if i.oe() {
                let a32 = e.trunc32(a);
                let min = e.f.const_i32(0x8000_0000);
                let ov = e.f.compare_eq(a32, min);
                e.store_ov(ov);
            }
            e.finish_rd(i, v);
        }

        mullwx => {
            let a = e.load_gpr32(i.ra());
            let a = e.f.sign_extend(a, TypeName::I64);
            let b = e.load_gpr32(i.rb());
            let b = e.f.sign_extend(b, TypeName::I64);
            let v = e.f.mul(a, b);
            if i.oe() {
                let low = e.trunc32(v);
                let low = e.f.sign_extend(low, TypeName::I64);
                let ov = e.f.compare_ne(low, v);
                e.store_ov(ov);
            }
            e.finish_rd(i, v);
        }
        mulhwx | mulhwux => {
            let a = e.load_gpr32(i.ra());
            let b = e.load_gpr32(i.rb());
            let v = match i.opcode {
                mulhwx => {
                    let hi = e.f.mul_hi(a, b);
                    e.f.sign_extend(hi, TypeName::I64)
                }
                _ => {
                    let hi = e.f.mul_hi_unsigned(a, b);
                    e.f.zero_extend(hi, TypeName::I64)
                }
            };
            e.finish_rd(i, v);
        }
        mulldx => {
            let a = e.load_gpr(i.ra());
            let b = e.load_gpr(i.rb());
            let v = e.f.mul(a, b);
            if i.oe() {
                let hi = e.f.mul_hi(a, b);
                let sign = e.f.sha_imm(v, 63);
                let ov = e.f.compare_ne(hi, sign);
                e.store_ov(ov);
            }
            e.finish_rd(i, v);
        }
        mulhdx | mulhdux => {
            let a = e.load_gpr(i.ra());
            let b = e.load_gpr(i.rb());
            let v = match i.opcode {
                mulhdx => e.f.mul_hi(a, b),
                _ => e.f.mul_hi_unsigned(a, b),
            };
            e.finish_rd(i, v);
        }
        mulli => {
            let a = e.load_gpr(i.ra());
            let imm = e.f.const_i64(i.simm() as u64);
            let v = e.f.mul(a, imm);
            e.store_gpr(i.rd(), v);
        }

        divwx | divwux => {
            let a = e.load_gpr32(i.ra());
            let b = e.load_gpr32(i.rb());
            let v = match i.opcode {
                divwx => e.f.div(a, b),
                _ => e.f.div_unsigned(a, b),
            };
            if i.oe() {
                let zero = e.f.const_i32(0);
                let mut ov = e.f.compare_eq(b, zero);
                if i.opcode == divwx {
                    let min = e.f.const_i32(0x8000_0000);
                    let minus_one = e.f.const_i32(u32::MAX);
                    let a_min = e.f.compare_eq(a, min);
                    let b_minus_one = e.f.compare_eq(b, minus_one);
                    let overflow = e.f.and(a_min, b_minus_one);
                    ov = e.f.or(ov, overflow);
                }
                e.store_ov(ov);
            }
            let v = e.f.zero_extend(v, TypeName::I64);
            e.finish_rd(i, v);
        }
        divdx | divdux => {
            let a = e.load_gpr(i.ra());
            let b = e.load_gpr(i.rb());
            let v = match i.opcode {
                divdx => e.f.div(a, b),
                _ => e.f.div_unsigned(a, b),
            };
            if i.oe() {
                let zero = e.f.const_i64(0);
                let mut ov = e.f.compare_eq(b, zero);
                if i.opcode == divdx {
                    let min = e.f.const_i64(1 << 63);
                    let minus_one = e.f.const_i64(u64::MAX);
                    let a_min = e.f.compare_eq(a, min);
                    let b_minus_one = e.f.compare_eq(b, minus_one);
                    let overflow = e.f.and(a_min, b_minus_one);
                    ov = e.f.or(ov, overflow);
                }
                e.store_ov(ov);
            }
            e.finish_rd(i, v);
        }

        cmp | cmpl => {
            let signed = i.opcode == cmp;
            let (a, b) = match i.l() {
                true => (e.load_gpr(i.ra()), e.load_gpr(i.rb())),
                false => (e.load_gpr32(i.ra()), e.load_gpr32(i.rb())),
            };
            e.update_cr_compare(i.crfd(), a, b, signed);
        }
        cmpi | cmpli => {
            let signed = i.opcode == cmpi;
            let imm = match signed {
                true => i.simm() as u64,
                false => i.uimm(),
            };
            let (a, b) = match i.l() {
                true => (e.load_gpr(i.ra()), e.f.const_i64(imm)),
                false => (e.load_gpr32(i.ra()), e.f.const_i32(imm as u32)),
            };
            e.update_cr_compare(i.crfd(), a, b, signed);
        }

        andx | andcx | orx | orcx | xorx | nandx | norx | eqvx => {
            let s = e.load_gpr(i.rs());
            let b = e.load_gpr(i.rb());
            let v = match i.opcode {
                andx => e.f.and(s, b),
                andcx => {
                    let not_b = e.f.not(b);
                    e.f.and(s, not_b)
                }
                orx if i.rs() == i.rb() => s,
                orx => e.f.or(s, b),
                orcx => {
                    let not_b = e.f.not(b);
                    e.f.or(s, not_b)
                }
                xorx => e.f.xor(s, b),
                nandx => {
                    let x = e.f.and(s, b);
                    e.f.not(x)
                }
                norx => {
                    let x = e.f.or(s, b);
                    e.f.not(x)
                }
                _ => {
                    let x = e.f.xor(s, b);
                    e.f.not(x)
                }
            };
            e.finish_ra(i, v);
        }
        andix | andisx => {
            let s = e.load_gpr(i.rs());
            let imm = match i.opcode {
                andix => i.uimm(),
                _ => i.uimm() << 16,
            };
            let v = e.f.and_imm(s, imm);
            e.store_gpr(i.ra(), v);
            e.update_cr(0, v);
        }
        ori | oris | xori | xoris => {
            if i.code == 0x6000_0000 {
                // nop
                return Ok(());
            }
            let s = e.load_gpr(i.rs());
            let v = match i.opcode {
                ori => e.f.or_imm(s, i.uimm()),
                oris => e.f.or_imm(s, i.uimm() << 16),
                xori => e.f.xor_imm(s, i.uimm()),
                _ => e.f.xor_imm(s, i.uimm() << 16),
            };
            e.store_gpr(i.ra(), v);
        }

        extsbx | extshx | extswx => {
            let s = e.load_gpr(i.rs());
            let ty = match i.opcode {
                extsbx => TypeName::I8,
                extshx => TypeName::I16,
                _ => TypeName::I32,
            };
            let narrow = e.f.truncate(s, ty);
            let v = e.f.sign_extend(narrow, TypeName::I64);
            e.finish_ra(i, v);
        }
        cntlzwx | cntlzdx => {
            let s = match i.opcode {
                cntlzwx => e.load_gpr32(i.rs()),
                _ => e.load_gpr(i.rs()),
            };
            let count = e.f.count_leading_zeros(s);
            let v = e.f.zero_extend(count, TypeName::I64);
            e.finish_ra(i, v);
        }

        rlwinmx | rlwnmx => {
            let s = e.load_gpr(i.rs());
            let dup = e.dup32(s);
            let rotated = match i.opcode {
                rlwinmx => e.f.rotate_left_imm(dup, i.sh() as u8),
                _ => {
                    let b = e.load_gpr(i.rb());
                    let amount = e.f.and_imm(b, 0x1f);
                    e.f.rotate_left(dup, amount)
                }
            };
            let v = e.f.and_imm(rotated, mask64(i.mb() + 32, i.me() + 32));
            e.finish_ra(i, v);
        }
        rlwimix => {
            let s = e.load_gpr(i.rs());
            let dup = e.dup32(s);
            let rotated = e.f.rotate_left_imm(dup, i.sh() as u8);
            let mask = mask64(i.mb() + 32, i.me() + 32);
            let inserted = e.f.and_imm(rotated, mask);
            let old = e.load_gpr(i.ra());
            let kept = e.f.and_imm(old, !mask);
            let v = e.f.or(inserted, kept);
            e.finish_ra(i, v);
        }
        rldiclx | rldicrx => {
            let s = e.load_gpr(i.rs());
            let rotated = e.f.rotate_left_imm(s, i.sh64() as u8);
            let mask = match i.opcode {
                rldiclx => mask64(i.mb64(), 63),
                _ => mask64(0, i.mb64()),
            };
            let v = e.f.and_imm(rotated, mask);
            e.finish_ra(i, v);
        }

        slwx | srwx => {
            let s = e.load_gpr32(i.rs());
            let s = e.f.zero_extend(s, TypeName::I64);
            let b = e.load_gpr(i.rb());
            let amount = e.f.and_imm(b, 0x3f);
            let v = match i.opcode {
                slwx => {
                    let shifted = e.f.shl(s, amount);
                    e.f.and_imm(shifted, 0xffff_ffff)
                }
                _ => e.f.shr(s, amount),
            };
            e.finish_ra(i, v);
        }
        srawx | srawix => {
            let s = e.load_gpr32(i.rs());
            let s = e.f.sign_extend(s, TypeName::I64);
            let amount = match i.opcode {
                srawx => {
                    let b = e.load_gpr(i.rb());
                    e.f.and_imm(b, 0x3f)
                }
                _ => e.f.const_i64(i.sh() as u64),
            };
            let v = e.f.sha(s, amount);
            let ca = e.sra_carry(s, v, amount);
            e.store_ca(ca);
            e.finish_ra(i, v);
        }
        sldx | srdx => {
            let s = e.load_gpr(i.rs());
            let b = e.load_gpr(i.rb());
            let amount = e.f.and_imm(b, 0x7f);
            let shifted = match i.opcode {
                sldx => e.f.shl(s, amount),
                _ => e.f.shr(s, amount),
            };
            let limit = e.f.const_i64(64);
            let too_far = e.f.compare_uge(amount, limit);
            let zero = e.f.const_i64(0);
            let v = e.f.select(too_far, zero, shifted);
            e.finish_ra(i, v);
        }
        sradx => {
            let s = e.load_gpr(i.rs());
            let b = e.load_gpr(i.rb());
            let amount = e.f.and_imm(b, 0x7f);
            let limit = e.f.const_i64(63);
            let too_far = e.f.compare_ugt(amount, limit);
            let clamped = e.f.select(too_far, limit, amount);
            let v = e.f.sha(s, clamped);

            // Shifts of 64 or more move every bit out, including the sign bit.
            let lost = e.sra_carry(s, v, clamped);
            let zero = e.f.const_i64(0);
            let negative = e.f.compare_slt(s, zero);
            let all_out = e.f.and(negative, too_far);
            let ca = e.f.or(lost, all_out);
            e.store_ca(ca);
            e.finish_ra(i, v);
        }
        sradix => {
            let s = e.load_gpr(i.rs());
            let amount = e.f.const_i64(i.sh64() as u64);
            let v = e.f.sha(s, amount);
            let ca = e.sra_carry(s, v, amount);
            e.store_ca(ca);
            e.finish_ra(i, v);
        }

        _ => return Err(Unhandled),
    }
    Ok(())
}

#[test]
fn rotate_masks() {
    assert_eq!(mask64(32, 63), 0xffff_ffff);
    assert_eq!(mask64(0, 63), u64::MAX);
    assert_eq!(mask64(0, 0), 1 << 63);
    assert_eq!(mask64(63, 0), (1 << 63) | 1);
    assert_eq!(mask64(32 + 16, 32 + 31), 0xffff);
}
