//! Branches, traps, system calls and condition/special register moves.

use xenon_hir::{trap_code, Function, TypeName, ValueId};

use crate::{
    context::{XER_CA_OFFSET, XER_OV_OFFSET, XER_SO_OFFSET},
    exports::SYSCALL_MODULE,
    frontend::{
        decode::{Instr, PpcOpcode},
        translator::{EmitResult, Emitter, Unhandled},
    },
};

const SPR_XER: u32 = 1;
const SPR_LR: u32 = 8;
const SPR_CTR: u32 = 9;

/// Decrement CTR unless this BO bit is set.
const BO_NO_CTR: u32 = 0b00100;
/// Branch if CTR is zero (instead of non-zero) after decrementing.
const BO_CTR_ZERO: u32 = 0b00010;
/// Ignore the condition bit unless this BO bit is clear.
const BO_NO_COND: u32 = 0b10000;
/// The value the condition bit must have.
const BO_COND_TRUE: u32 = 0b01000;

/// How a branch should be taken.
enum Condition {
    Always,
    If(ValueId),
}

impl<'a> Emitter<'a> {
    /// Computes the combined CTR and CR condition of a `bc*` instruction. Decrements CTR as a side
    /// effect when requested by BO.
    fn branch_condition(&mut self, i: Instr, allow_ctr: bool) -> Condition {
        let bo = i.bo();

        let ctr_ok = match bo & BO_NO_CTR == 0 && allow_ctr {
            true => {
                let ctr = self.load_ctr();
                let ctr = self.f.add_imm(ctr, u64::MAX);
                self.store_ctr(ctr);
                let ctr = self.f.truncate(ctr, TypeName::I32);
                let zero = self.f.const_i32(0);
                Some(match bo & BO_CTR_ZERO != 0 {
                    true => self.f.compare_eq(ctr, zero),
                    false => self.f.compare_ne(ctr, zero),
                })
            }
            false => None,
        };

        let cond_ok = match bo & BO_NO_COND == 0 {
            true => {
                let bit = self.load_cr_bit(i.bi());
                Some(match bo & BO_COND_TRUE != 0 {
                    true => self.f.is_true(bit),
                    false => self.f.is_false(bit),
                })
            }
            false => None,
        };

        match (ctr_ok, cond_ok) {
            (Some(a), Some(b)) => Condition::If(self.f.and(a, b)),
            (Some(x), None) | (None, Some(x)) => Condition::If(x),
            (None, None) => Condition::Always,
        }
    }

    fn set_link(&mut self, i: Instr) {
        let next = self.f.const_i64(i.address.wrapping_add(4) as u64);
        self.store_lr(next);
    }

    /// Branches to a direct target: a label inside the function, otherwise a tail jump.
    fn branch_direct(&mut self, cond: Condition, target: u32) {
        match (self.label_for(target), cond) {
            (Some(label), Condition::Always) => self.f.branch(label),
            (Some(label), Condition::If(cond)) => self.f.branch_true(cond, label),
            (None, cond) => {
                let target = self.f.const_i64(target as u64);
                self.jump_out(cond, target);
            }
        }
    }

    fn jump_out(&mut self, cond: Condition, target: ValueId) {
        match cond {
            Condition::Always => self.tail_jump(target),
            Condition::If(cond) => {
                let skip = self.f.new_label();
                self.f.branch_false(cond, skip);
                self.tail_jump(target);
                self.f.mark_label(skip);
            }
        }
    }

    fn call_direct(&mut self, cond: Condition, target: u32) {
        match cond {
            Condition::Always => self.f.call(target),
            Condition::If(cond) => self.f.call_true(cond, target),
        }
    }

    fn call_indirect(&mut self, cond: Condition, target: ValueId) {
        match cond {
            Condition::Always => self.f.call_indirect(target),
            Condition::If(cond) => self.f.call_indirect_true(cond, target),
        }
    }

    /// Traps when any of the conditions selected by `to` hold for `a` compared against `b`.
    fn emit_trap(&mut self, i: Instr, a: ValueId, b: ValueId) {
        let to = i.to();
        if to == 0x1f {
            self.f.trap(trap_code::TRAP, i.address);
            return;
        }

        let checks: [(u32, fn(&mut Function, ValueId, ValueId) -> ValueId); 5] = [
            (0x10, Function::compare_slt),
            (0x08, Function::compare_sgt),
            (0x04, Function::compare_eq),
            (0x02, Function::compare_ult),
            (0x01, Function::compare_ugt),
        ];

        let mut cond = None;
        for (bit, compare) in checks {
            if to & bit == 0 {
                continue;
            }
            let x = compare(&mut **self.f, a, b);
            cond = Some(match cond {
                Some(prev) => self.f.or(prev, x),
                None => x,
            });
        }

        if let Some(cond) = cond {
            self.f.trap_true(cond, trap_code::TRAP, i.address);
        }
    }
}

pub(crate) fn emit(e: &mut Emitter, i: Instr) -> EmitResult {
    use PpcOpcode::*;

    match i.opcode {
        bx => {
            let target = i.branch_target();
            if i.lk() {
                e.set_link(i);
                e.call_direct(Condition::Always, target);
            }
            else {
                e.branch_direct(Condition::Always, target);
            }
        }
        bcx => {
            let cond = e.branch_condition(i, true);
            let target = i.cond_branch_target();
            if i.lk() {
                e.set_link(i);
                e.call_direct(cond, target);
            }
            else {
                e.branch_direct(cond, target);
            }
        }
        bclrx => {
            let cond = e.branch_condition(i, true);
            if i.lk() {
                let target = e.load_lr();
                e.set_link(i);
                e.call_indirect(cond, target);
            }
            else {
                match cond {
                    Condition::Always => e.f.ret(),
                    Condition::If(cond) => e.f.ret_true(cond),
                }
            }
        }
        bcctrx => {
            // CTR cannot be decremented when it is also the branch target.
            let cond = e.branch_condition(i, false);
            let target = e.load_ctr();
            if i.lk() {
                e.set_link(i);
                e.call_indirect(cond, target);
            }
            else {
                e.jump_out(cond, target);
            }
        }

        sc => match e.env.extern_index(SYSCALL_MODULE, i.lev()) {
            Some(index) => e.f.call_extern(index),
            None => e.f.trap(trap_code::SYSCALL, i.address),
        },
        tw | td => {
            let (a, b) = match i.opcode {
                tw => (e.load_gpr32(i.ra()), e.load_gpr32(i.rb())),
                _ => (e.load_gpr(i.ra()), e.load_gpr(i.rb())),
            };
            e.emit_trap(i, a, b);
        }
        twi | tdi => {
            let (a, b) = match i.opcode {
                twi => (e.load_gpr32(i.ra()), e.f.const_i32(i.simm() as u32)),
                _ => (e.load_gpr(i.ra()), e.f.const_i64(i.simm() as u64)),
            };
            e.emit_trap(i, a, b);
        }

        mfspr => {
            let v = match i.spr() {
                SPR_LR => e.load_lr(),
                SPR_CTR => e.load_ctr(),
                SPR_XER => {
                    let mut xer = e.f.const_i64(0);
                    for (offset, shift) in [
                        (XER_SO_OFFSET, 31),
                        (XER_OV_OFFSET, 30),
                        (XER_CA_OFFSET, 29),
                    ] {
                        let bit = e.f.load_context(offset, TypeName::I8);
                        let bit = e.bool_to_i64(bit);
                        let bit = e.f.shl_imm(bit, shift);
                        xer = e.f.or(xer, bit);
                    }
                    xer
                }
                _ => return Err(Unhandled),
            };
            e.store_gpr(i.rd(), v);
        }
        mtspr => {
            let v = e.load_gpr(i.rs());
            match i.spr() {
                SPR_LR => e.store_lr(v),
                SPR_CTR => e.store_ctr(v),
                SPR_XER => {
                    for (offset, shift) in [
                        (XER_SO_OFFSET, 31),
                        (XER_OV_OFFSET, 30),
                        (XER_CA_OFFSET, 29),
                    ] {
                        let bit = e.f.shr_imm(v, shift);
                        let bit = e.f.and_imm(bit, 1);
                        let bit = e.f.truncate(bit, TypeName::I8);
                        e.f.store_context(offset, bit);
                    }
                }
                _ => return Err(Unhandled),
            }
        }
        mfcr => {
            let mut cr = e.f.const_i64(0);
            for bit in 0..32 {
                let value = e.load_cr_bit(bit);
                let value = e.bool_to_i64(value);
                let value = e.f.shl_imm(value, (31 - bit) as u8);
                cr = e.f.or(cr, value);
            }
            e.store_gpr(i.rd(), cr);
        }
        mtcrf => {
            let s = e.load_gpr(i.rs());
            for field in 0..8 {
                if i.crm() & (0x80 >> field) == 0 {
                    continue;
                }
                for bit in field * 4..field * 4 + 4 {
                    let value = e.f.shr_imm(s, (31 - bit) as u8);
                    let value = e.f.and_imm(value, 1);
                    let value = e.f.truncate(value, TypeName::I8);
                    e.store_cr_bit(bit, value);
                }
            }
        }
        mcrf => {
            for bit in 0..4 {
                let value = e.load_cr_bit(i.crfs() * 4 + bit);
                e.store_cr_bit(i.crfd() * 4 + bit, value);
            }
        }
        crand | crandc | creqv | crnand | crnor | cror | crorc | crxor => {
            let a = e.load_cr_bit(i.crba());
            let b = e.load_cr_bit(i.crbb());
            let v = match i.opcode {
                crand => e.f.and(a, b),
                crandc => {
                    let not_b = e.f.xor_imm(b, 1);
                    e.f.and(a, not_b)
                }
                creqv => {
                    let x = e.f.xor(a, b);
                    e.f.xor_imm(x, 1)
                }
                crnand => {
                    let x = e.f.and(a, b);
                    e.f.xor_imm(x, 1)
                }
                crnor => {
                    let x = e.f.or(a, b);
                    e.f.xor_imm(x, 1)
                }
                cror => e.f.or(a, b),
                crorc => {
                    let not_b = e.f.xor_imm(b, 1);
                    e.f.or(a, not_b)
                }
                _ => e.f.xor(a, b),
            };
            e.store_cr_bit(i.crbd(), v);
        }

        isync | sync | eieio => {}

        _ => return Err(Unhandled),
    }
    Ok(())
}
