//! Floating point loads, stores and arithmetic.
//!
//! FPSCR exception and rounding state is not modelled, so record forms (which copy FPSCR bits into
//! CR1) are left untranslated.

use xenon_hir::{TypeName, ValueId};

use crate::{
    context::{fpr_offset, CR_EQ, CR_GT, CR_LT, CR_SO},
    frontend::{
        decode::{Instr, PpcOpcode},
        emit_memory::Form,
        translator::{EmitResult, Emitter, Unhandled},
    },
};

impl<'a> Emitter<'a> {
    /// Rounds a double to single precision, keeping the double representation.
    fn round_to_single(&mut self, value: ValueId) -> ValueId {
        let single = self.f.convert(value, TypeName::F32);
        self.f.convert(single, TypeName::F64)
    }

    fn load_float(&mut self, i: Instr, form: Form, ty: TypeName) -> EmitResult {
        let ea = self.memory_address(i, form)?;
        let value = self.f.load(ea, ty);
        let value = match ty {
            TypeName::F32 => self.f.convert(value, TypeName::F64),
            _ => value,
        };
        self.store_fpr(i.rd(), value);
        Ok(())
    }

    fn store_float(&mut self, i: Instr, form: Form, ty: TypeName) -> EmitResult {
        let value = self.load_fpr(i.rs());
        let value = match ty {
            TypeName::F32 => self.f.convert(value, TypeName::F32),
            _ => value,
        };
        let ea = self.memory_address(i, form)?;
        self.f.store(ea, value);
        Ok(())
    }
}

pub(crate) fn emit(e: &mut Emitter, i: Instr) -> EmitResult {
    use PpcOpcode::*;
    use TypeName::{F32, F64};

    match i.opcode {
        lfs => return e.load_float(i, Form::D, F32),
        lfsu => return e.load_float(i, Form::DUpdate, F32),
        lfsx => return e.load_float(i, Form::X, F32),
        lfsux => return e.load_float(i, Form::XUpdate, F32),
        lfd => return e.load_float(i, Form::D, F64),
        lfdu => return e.load_float(i, Form::DUpdate, F64),
        lfdx => return e.load_float(i, Form::X, F64),
        lfdux => return e.load_float(i, Form::XUpdate, F64),
        stfs => return e.store_float(i, Form::D, F32),
        stfsu => return e.store_float(i, Form::DUpdate, F32),
        stfsx => return e.store_float(i, Form::X, F32),
        stfsux => return e.store_float(i, Form::XUpdate, F32),
        stfd => return e.store_float(i, Form::D, F64),
        stfdu => return e.store_float(i, Form::DUpdate, F64),
        stfdx => return e.store_float(i, Form::X, F64),
        stfdux => return e.store_float(i, Form::XUpdate, F64),
        _ => {}
    }

    if i.rc() && i.opcode != fcmpu {
        return Err(Unhandled);
    }

    match i.opcode {
        faddx | fsubx | fdivx | faddsx | fsubsx | fdivsx => {
            let a = e.load_fpr(i.ra());
            let b = e.load_fpr(i.rb());
            let v = match i.opcode {
                faddx | faddsx => e.f.add(a, b),
                fsubx | fsubsx => e.f.sub(a, b),
                _ => e.f.div(a, b),
            };
            let v = match i.opcode {
                faddsx | fsubsx | fdivsx => e.round_to_single(v),
                _ => v,
            };
            e.store_fpr(i.rd(), v);
        }
        fmulx | fmulsx => {
            let a = e.load_fpr(i.ra());
            let c = e.load_fpr(i.frc());
            let v = e.f.mul(a, c);
            let v = if i.opcode == fmulsx { e.round_to_single(v) } else { v };
            e.store_fpr(i.rd(), v);
        }
        fmaddx | fmsubx | fmaddsx | fmsubsx => {
            let a = e.load_fpr(i.ra());
            let b = e.load_fpr(i.rb());
            let c = e.load_fpr(i.frc());
            let v = match i.opcode {
                fmaddx | fmaddsx => e.f.mul_add(a, c, b),
                _ => e.f.mul_sub(a, c, b),
            };
            let v = match i.opcode {
                fmaddsx | fmsubsx => e.round_to_single(v),
                _ => v,
            };
            e.store_fpr(i.rd(), v);
        }
        fsqrtx | fsqrtsx => {
            let b = e.load_fpr(i.rb());
            let v = e.f.sqrt(b);
            let v = if i.opcode == fsqrtsx { e.round_to_single(v) } else { v };
            e.store_fpr(i.rd(), v);
        }
        fmrx | fnegx | fabsx => {
            let b = e.load_fpr(i.rb());
            let v = match i.opcode {
                fmrx => b,
                fnegx => e.f.neg(b),
                _ => e.f.abs(b),
            };
            e.store_fpr(i.rd(), v);
        }
        frspx => {
            let b = e.load_fpr(i.rb());
            let v = e.round_to_single(b);
            e.store_fpr(i.rd(), v);
        }
        fctiwzx | fctidzx => {
            let b = e.load_fpr(i.rb());
            let v = match i.opcode {
                fctiwzx => {
                    let v = e.f.convert(b, TypeName::I32);
                    e.f.zero_extend(v, TypeName::I64)
                }
                _ => e.f.convert(b, TypeName::I64),
            };
            e.f.store_context(fpr_offset(i.rd()), v);
        }
        fcfidx => {
            let b = e.f.load_context(fpr_offset(i.rb()), TypeName::I64);
            let v = e.f.convert(b, F64);
            e.store_fpr(i.rd(), v);
        }
        fcmpu => {
            let a = e.load_fpr(i.ra());
            let b = e.load_fpr(i.rb());
            let lt = e.f.compare_slt(a, b);
            let gt = e.f.compare_sgt(a, b);
            let eq = e.f.compare_eq(a, b);
            let ordered = e.f.or(lt, gt);
            let ordered = e.f.or(ordered, eq);
            let unordered = e.f.xor_imm(ordered, 1);

            let base = i.crfd() * 4;
            e.store_cr_bit(base + CR_LT as u32, lt);
            e.store_cr_bit(base + CR_GT as u32, gt);
            e.store_cr_bit(base + CR_EQ as u32, eq);
            e.store_cr_bit(base + CR_SO as u32, unordered);
        }
        _ => return Err(Unhandled),
    }
    Ok(())
}
