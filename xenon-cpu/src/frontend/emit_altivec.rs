//! VMX loads, stores and bitwise operations.

use xenon_hir::TypeName;

use crate::frontend::{
    decode::{Instr, PpcOpcode},
    translator::{EmitResult, Emitter, Unhandled},
};

pub(crate) fn emit(e: &mut Emitter, i: Instr) -> EmitResult {
    use PpcOpcode::*;

    match i.opcode {
        lvx | stvx => {
            let ea = e.ea_x(i.ra(), i.rb());
            let ea = e.f.and_imm(ea, !0xf);
            if i.opcode == lvx {
                let value = e.f.load(ea, TypeName::V128);
                e.store_vr(i.rd(), value);
            }
            else {
                let value = e.load_vr(i.rs());
                e.f.store(ea, value);
            }
        }
        vand | vandc | vor | vxor | vnor => {
            let a = e.load_vr(i.ra());
            let b = e.load_vr(i.rb());
            let v = match i.opcode {
                vand => e.f.and(a, b),
                vandc => {
                    let not_b = e.f.not(b);
                    e.f.and(a, not_b)
                }
                vor => e.f.or(a, b),
                vxor => e.f.xor(a, b),
                _ => {
                    let x = e.f.or(a, b);
                    e.f.not(x)
                }
            };
            e.store_vr(i.rd(), v);
        }
        _ => return Err(Unhandled),
    }
    Ok(())
}
