//! Integer loads and stores, reservations and cache control.

use xenon_hir::{TypeName, ValueId};

use crate::{
    context::{CR_EQ, CR_GT, CR_LT, CR_SO, RESERVED_OFFSET},
    frontend::{
        decode::{Instr, PpcOpcode},
        translator::{EmitResult, Emitter, Unhandled},
    },
};

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Form {
    /// `d(rA|0)`
    D,
    /// `d(rA)`, rA updated with the effective address.
    DUpdate,
    /// `ds(rA|0)`
    Ds,
    /// `ds(rA)` with update.
    DsUpdate,
    /// `(rA|0) + rB`
    X,
    /// `rA + rB` with update.
    XUpdate,
}

impl Form {
    fn is_update(self) -> bool {
        matches!(self, Self::DUpdate | Self::DsUpdate | Self::XUpdate)
    }
}

#[derive(Clone, Copy)]
enum Extend {
    Zero,
    Sign,
}

impl<'a> Emitter<'a> {
    fn effective_address(&mut self, i: Instr, form: Form) -> ValueId {
        match form {
            Form::D | Form::DUpdate => self.ea_d(i.ra(), i.simm()),
            Form::Ds | Form::DsUpdate => self.ea_d(i.ra(), i.ds()),
            Form::X | Form::XUpdate => self.ea_x(i.ra(), i.rb()),
        }
    }

    /// Computes the effective address of a load or store, writing it back to rA for update forms.
    pub(crate) fn memory_address(&mut self, i: Instr, form: Form) -> Result<ValueId, Unhandled> {
        if form.is_update() && i.ra() == 0 {
            return Err(Unhandled);
        }
        let ea = self.effective_address(i, form);
        if form.is_update() {
            self.store_gpr(i.ra(), ea);
        }
        Ok(ea)
    }

    fn load_int(&mut self, i: Instr, form: Form, ty: TypeName, extend: Extend) -> EmitResult {
        let ea = self.memory_address(i, form)?;
        let value = self.f.load(ea, ty);
        let value = match extend {
            Extend::Zero => self.f.zero_extend(value, TypeName::I64),
            Extend::Sign => self.f.sign_extend(value, TypeName::I64),
        };
        self.store_gpr(i.rd(), value);
        Ok(())
    }

    fn store_int(&mut self, i: Instr, form: Form, ty: TypeName) -> EmitResult {
        // Load the source first: for update forms rS may be the same register as rA.
        let value = self.load_gpr(i.rs());
        let value = self.f.truncate(value, ty);
        let ea = self.memory_address(i, form)?;
        self.f.store(ea, value);
        Ok(())
    }

    /// `stwcx.`/`stdcx.`: stores only if memory still holds the reserved value, reporting
    /// success in CR0[EQ].
    fn store_conditional(&mut self, i: Instr, ty: TypeName) -> EmitResult {
        let ea = self.ea_x(i.ra(), i.rb());
        let reserved = self.f.load_context(RESERVED_OFFSET, TypeName::I64);
        let reserved = self.f.truncate(reserved, ty);
        let current = self.f.load(ea, ty);
        let ok = self.f.compare_eq(current, reserved);

        let done = self.f.new_label();
        self.f.branch_false(ok, done);
        let value = self.load_gpr(i.rs());
        let value = self.f.truncate(value, ty);
        self.f.store(ea, value);
        self.f.mark_label(done);

        let zero = self.f.const_i8(0);
        self.store_cr_bit(CR_LT as u32, zero);
        self.store_cr_bit(CR_GT as u32, zero);
        self.store_cr_bit(CR_EQ as u32, ok);
        let so = self.load_so();
        self.store_cr_bit(CR_SO as u32, so);
        Ok(())
    }
}

pub(crate) fn emit(e: &mut Emitter, i: Instr) -> EmitResult {
    use PpcOpcode::*;
    use TypeName::{I16, I32, I64, I8};

    match i.opcode {
        lbz => e.load_int(i, Form::D, I8, Extend::Zero),
        lbzu => e.load_int(i, Form::DUpdate, I8, Extend::Zero),
        lbzx => e.load_int(i, Form::X, I8, Extend::Zero),
        lbzux => e.load_int(i, Form::XUpdate, I8, Extend::Zero),
        lhz => e.load_int(i, Form::D, I16, Extend::Zero),
        lhzu => e.load_int(i, Form::DUpdate, I16, Extend::Zero),
        lhzx => e.load_int(i, Form::X, I16, Extend::Zero),
        lhzux => e.load_int(i, Form::XUpdate, I16, Extend::Zero),
        lha => e.load_int(i, Form::D, I16, Extend::Sign),
        lhau => e.load_int(i, Form::DUpdate, I16, Extend::Sign),
        lhax => e.load_int(i, Form::X, I16, Extend::Sign),
        lhaux => e.load_int(i, Form::XUpdate, I16, Extend::Sign),
        lwz => e.load_int(i, Form::D, I32, Extend::Zero),
        lwzu => e.load_int(i, Form::DUpdate, I32, Extend::Zero),
        lwzx => e.load_int(i, Form::X, I32, Extend::Zero),
        lwzux => e.load_int(i, Form::XUpdate, I32, Extend::Zero),
        lwa => e.load_int(i, Form::Ds, I32, Extend::Sign),
        lwax => e.load_int(i, Form::X, I32, Extend::Sign),
        ld => e.load_int(i, Form::Ds, I64, Extend::Zero),
        ldu => e.load_int(i, Form::DsUpdate, I64, Extend::Zero),
        ldx => e.load_int(i, Form::X, I64, Extend::Zero),
        ldux => e.load_int(i, Form::XUpdate, I64, Extend::Zero),

        stb => e.store_int(i, Form::D, I8),
        stbu => e.store_int(i, Form::DUpdate, I8),
        stbx => e.store_int(i, Form::X, I8),
        stbux => e.store_int(i, Form::XUpdate, I8),
        sth => e.store_int(i, Form::D, I16),
        sthu => e.store_int(i, Form::DUpdate, I16),
        sthx => e.store_int(i, Form::X, I16),
        sthux => e.store_int(i, Form::XUpdate, I16),
        stw => e.store_int(i, Form::D, I32),
        stwu => e.store_int(i, Form::DUpdate, I32),
        stwx => e.store_int(i, Form::X, I32),
        stwux => e.store_int(i, Form::XUpdate, I32),
        std_ => e.store_int(i, Form::Ds, I64),
        stdu => e.store_int(i, Form::DsUpdate, I64),
        stdx => e.store_int(i, Form::X, I64),
        stdux => e.store_int(i, Form::XUpdate, I64),

        lhbrx | lwbrx => {
            let ty = if i.opcode == lhbrx { I16 } else { I32 };
            let ea = e.ea_x(i.ra(), i.rb());
            let value = e.f.load(ea, ty);
            let value = e.f.byte_swap(value);
            let value = e.f.zero_extend(value, I64);
            e.store_gpr(i.rd(), value);
            Ok(())
        }
        sthbrx | stwbrx => {
            let ty = if i.opcode == sthbrx { I16 } else { I32 };
            let ea = e.ea_x(i.ra(), i.rb());
            let value = e.load_gpr(i.rs());
            let value = e.f.truncate(value, ty);
            let value = e.f.byte_swap(value);
            e.f.store(ea, value);
            Ok(())
        }

        lmw => {
            let ea = e.ea_d(i.ra(), i.simm());
            for (n, reg) in (i.rd()..32).enumerate() {
                let addr = e.f.add_imm(ea, n as u64 * 4);
                let value = e.f.load(addr, I32);
                let value = e.f.zero_extend(value, I64);
                e.store_gpr(reg, value);
            }
            Ok(())
        }
        stmw => {
            let ea = e.ea_d(i.ra(), i.simm());
            for (n, reg) in (i.rs()..32).enumerate() {
                let addr = e.f.add_imm(ea, n as u64 * 4);
                let value = e.load_gpr32(reg);
                e.f.store(addr, value);
            }
            Ok(())
        }

        lwarx | ldarx => {
            let ty = if i.opcode == lwarx { I32 } else { I64 };
            let ea = e.ea_x(i.ra(), i.rb());
            let value = e.f.load(ea, ty);
            let value = e.f.zero_extend(value, I64);
            e.f.store_context(RESERVED_OFFSET, value);
            e.store_gpr(i.rd(), value);
            Ok(())
        }
        stwcx => e.store_conditional(i, I32),
        stdcx => e.store_conditional(i, I64),

        dcbf | dcbst | dcbt | dcbtst => Ok(()),
        dcbz => {
            let ea = e.ea_x(i.ra(), i.rb());
            let line = e.f.and_imm(ea, !31);
            let zero = e.f.const_i64(0);
            for offset in (0..32).step_by(8) {
                let addr = e.f.add_imm(line, offset);
                e.f.store(addr, zero);
            }
            Ok(())
        }

        _ => Err(Unhandled),
    }
}
