use xenon_hir::{Function, InstrId, Opcode, OpcodeTable, Operand, TypeName, ValueId};

use crate::compiler::{CompilerPass, PassError};

/// Peephole rewrites of algebraic identities and redundant conversions.
pub struct SimplificationPass;

impl CompilerPass for SimplificationPass {
    fn name(&self) -> &'static str {
        "simplify"
    }

    fn run(&self, func: &mut Function, _: &OpcodeTable) -> Result<(), PassError> {
        for instr in func.all_instrs() {
            simplify(func, instr);
        }
        Ok(())
    }
}

/// Replaces the result of `instr` with `value` and removes it.
fn forward(func: &mut Function, instr: InstrId, value: ValueId) {
    if let Some(dest) = func.instr(instr).dest {
        func.replace_all_uses(dest, value);
    }
    func.remove_instr(instr);
}

fn const_of(func: &Function, value: ValueId) -> Option<u128> {
    func.value(value).const_bits()
}

/// Returns the defining opcode and first operand of `value`.
fn def_of(func: &Function, value: ValueId) -> Option<(Opcode, ValueId)> {
    let def = func.instr(func.value(value).def?);
    Some((def.opcode, def.src[0].as_value()?))
}

fn simplify(func: &mut Function, instr: InstrId) {
    let i = func.instr(instr);
    let (opcode, src) = (i.opcode, i.src);
    let Some(dest) = i.dest else { return };
    let ty = func.ty(dest);
    if ty.is_float() {
        return;
    }

    match opcode {
        Opcode::Add | Opcode::Or | Opcode::Xor | Opcode::Sub | Opcode::And | Opcode::Mul => {
            let (a, b) = (i.src_value(0), i.src_value(1));
            simplify_binary(func, instr, opcode, ty, a, b);
        }
        Opcode::Truncate | Opcode::ZeroExtend | Opcode::SignExtend => {
            let Some(x) = src[0].as_value() else { return };
            let Some((inner, y)) = def_of(func, x) else { return };
            let none = Operand::None;
            match (opcode, inner) {
                (Opcode::Truncate, Opcode::Truncate | Opcode::ZeroExtend | Opcode::SignExtend) => {
                    let size = func.ty(y).size();
                    if size == ty.size() {
                        forward(func, instr, y);
                    }
                    else if size > ty.size() {
                        func.replace_instr(instr, Opcode::Truncate, [y.into(), none, none]);
                    }
                    else {
                        func.replace_instr(instr, inner, [y.into(), none, none]);
                    }
                }
                (Opcode::ZeroExtend, Opcode::ZeroExtend)
                | (Opcode::SignExtend, Opcode::SignExtend) => {
                    func.replace_instr(instr, opcode, [y.into(), none, none]);
                }
                _ => {}
            }
        }
        Opcode::Not => {
            let Some(x) = src[0].as_value() else { return };
            if let Some((Opcode::Not, y)) = def_of(func, x) {
                forward(func, instr, y);
            }
        }
        _ => {}
    }
}

fn simplify_binary(
    func: &mut Function,
    instr: InstrId,
    opcode: Opcode,
    ty: TypeName,
    a: ValueId,
    b: ValueId,
) {
    let (ca, cb) = (const_of(func, a), const_of(func, b));

    if a == b && matches!(opcode, Opcode::Xor | Opcode::Sub) {
        func.fold_to_constant(instr, 0);
        return;
    }

    // Commutative identities with the constant on either side; `sub` only with it on the right.
    let (x, c) = match (ca, cb) {
        (_, Some(c)) => (a, c),
        (Some(c), None) if opcode != Opcode::Sub => (b, c),
        _ => return,
    };

    match (opcode, c) {
        (Opcode::Add | Opcode::Or | Opcode::Xor | Opcode::Sub, 0) => forward(func, instr, x),
        (Opcode::And | Opcode::Mul, 0) => func.fold_to_constant(instr, 0),
        (Opcode::Mul, 1) => forward(func, instr, x),
        (Opcode::Mul, c) if c.is_power_of_two() && ty.is_int() => {
            let amount = func.load_constant(TypeName::I8, c.trailing_zeros() as u128);
            func.replace_instr(instr, Opcode::Shl, [x.into(), amount.into(), Operand::None]);
        }
        _ => {}
    }
}

#[cfg(test)]
mod test {
    use xenon_hir::FunctionBuilder;

    use super::*;

    fn run(f: FunctionBuilder) -> Function {
        let mut f = f.finish();
        SimplificationPass.run(&mut f, &OpcodeTable::new()).unwrap();
        f
    }

    fn stored_value(f: &Function) -> ValueId {
        let store = f.all_instrs().into_iter().find(|x| f.instr(*x).opcode == Opcode::StoreContext);
        f.instr(store.unwrap()).src_value(1)
    }

    #[test]
    fn identities() {
        for op in [Opcode::Add, Opcode::Or, Opcode::Xor, Opcode::Sub] {
            let mut f = FunctionBuilder::new(0x8200_0000);
            let x = f.load_context(0x18, TypeName::I64);
            let zero = f.const_i64(0);
            let y = f.append_value(op, TypeName::I64, [x.into(), zero.into(), Operand::None]);
            f.store_context(0x20, y);
            let f = run(f);
            assert_eq!(stored_value(&f), x, "{op:?}");
        }

        let mut f = FunctionBuilder::new(0x8200_0000);
        let x = f.load_context(0x18, TypeName::I64);
        let zero = f.const_i64(0);
        let y = f.and(zero, x);
        f.store_context(0x20, y);
        let f = run(f);
        assert_eq!(f.value(stored_value(&f)).const_u64(), Some(0));

        let mut f = FunctionBuilder::new(0x8200_0000);
        let x = f.load_context(0x18, TypeName::I64);
        let y = f.xor(x, x);
        f.store_context(0x20, y);
        let f = run(f);
        assert_eq!(f.value(stored_value(&f)).const_u64(), Some(0));
    }

    #[test]
    fn multiply_by_power_of_two_becomes_shift() {
        let mut f = FunctionBuilder::new(0x8200_0000);
        let x = f.load_context(0x18, TypeName::I32);
        let eight = f.const_i32(8);
        let y = f.mul(x, eight);
        f.store_context(0x20, y);
        let f = run(f);

        let def = f.instr(f.value(y).def.unwrap());
        assert_eq!(def.opcode, Opcode::Shl);
        assert_eq!(f.value(def.src_value(1)).const_u64(), Some(3));
    }

    #[test]
    fn conversion_chains_collapse() {
        let mut f = FunctionBuilder::new(0x8200_0000);
        let x = f.load_context(0x18, TypeName::I32);
        let wide = f.zero_extend(x, TypeName::I64);
        let narrow = f.truncate(wide, TypeName::I32);
        f.store_context(0x20, narrow);
        let f = run(f);
        assert_eq!(stored_value(&f), x);

        let mut f = FunctionBuilder::new(0x8200_0000);
        let x = f.load_context(0x18, TypeName::I64);
        let a = f.truncate(x, TypeName::I32);
        let b = f.truncate(a, TypeName::I8);
        f.store_context(0x20, b);
        let f = run(f);
        let def = f.instr(f.value(b).def.unwrap());
        assert_eq!((def.opcode, def.src_value(0)), (Opcode::Truncate, x));
    }

    #[test]
    fn double_not_is_removed() {
        let mut f = FunctionBuilder::new(0x8200_0000);
        let x = f.load_context(0x18, TypeName::I64);
        let a = f.not(x);
        let b = f.not(a);
        f.store_context(0x20, b);
        let f = run(f);
        assert_eq!(stored_value(&f), x);
    }
}
