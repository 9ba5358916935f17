use xenon_hir::{eval, Function, InstrId, Opcode, OpcodeFlags, OpcodeTable, Operand, ValueId};

use crate::compiler::{cfa, CompilerPass, PassError};

/// Folds instructions whose operands are all constant.
pub struct ConstantPropagationPass;

impl CompilerPass for ConstantPropagationPass {
    fn name(&self) -> &'static str {
        "const_prop"
    }

    fn run(&self, func: &mut Function, table: &OpcodeTable) -> Result<(), PassError> {
        let mut cfg_changed = false;
        for instr in func.all_instrs() {
            let opcode = func.instr(instr).opcode;
            if is_conditional(opcode) {
                cfg_changed |= fold_conditional(func, instr);
                continue;
            }

            let skip = OpcodeFlags::VOLATILE
                | OpcodeFlags::MEMORY
                | OpcodeFlags::DISALLOW_CONSTANT_FOLDING;
            if table.flags(opcode).intersects(skip) {
                continue;
            }
            if let Some(bits) = evaluate(func, instr) {
                func.fold_to_constant(instr, bits);
            }
        }

        if cfg_changed {
            cfa::analyze(func, table)?;
        }
        Ok(())
    }
}

fn is_conditional(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::BranchTrue
            | Opcode::BranchFalse
            | Opcode::CallTrue
            | Opcode::CallIndirectTrue
            | Opcode::ReturnTrue
            | Opcode::TrapTrue
            | Opcode::DebugBreakTrue
    )
}

/// Computes the result of `instr` if all of its value operands are constant.
pub(crate) fn evaluate(func: &Function, instr: InstrId) -> Option<u128> {
    let i = func.instr(instr);
    let dest = func.ty(i.dest?);

    let mut operands: [(ValueId, u128); 3] = [(ValueId(0), 0); 3];
    let mut count = 0;
    for value in i.value_operands() {
        operands[count] = (value, func.value(value).const_bits()?);
        count += 1;
    }

    let ty = |index: usize| func.ty(operands[index].0);
    let bits = |index: usize| operands[index].1;
    match count {
        1 => eval::eval_unary(i.opcode, dest, ty(0), bits(0)),
        2 => eval::eval_binary(i.opcode, ty(0), bits(0), bits(1)),
        3 => {
            let ty = match i.opcode {
                Opcode::Select => dest,
                _ => ty(0),
            };
            eval::eval_ternary(i.opcode, ty, bits(0), bits(1), bits(2))
        }
        _ => None,
    }
}

/// Resolves a conditional instruction with a constant condition into its unconditional form, or
/// removes it. Returns whether the instruction changed.
fn fold_conditional(func: &mut Function, instr: InstrId) -> bool {
    let (opcode, src) = (func.instr(instr).opcode, func.instr(instr).src);
    let Some(cond) = src[0].as_value().and_then(|x| func.value(x).const_bits()) else {
        return false;
    };

    let taken = match opcode {
        Opcode::BranchFalse => cond == 0,
        _ => cond != 0,
    };
    if !taken {
        func.remove_instr(instr);
        return true;
    }

    let none = Operand::None;
    let (opcode, src) = match opcode {
        Opcode::BranchTrue | Opcode::BranchFalse => (Opcode::Branch, [src[1], none, none]),
        Opcode::CallTrue => (Opcode::Call, [src[1], none, none]),
        Opcode::CallIndirectTrue => (Opcode::CallIndirect, [src[1], none, none]),
        Opcode::ReturnTrue => (Opcode::Return, [none, none, none]),
        Opcode::TrapTrue => (Opcode::Trap, [src[1], src[2], none]),
        Opcode::DebugBreakTrue => (Opcode::DebugBreak, [src[1], none, none]),
        _ => return false,
    };
    func.replace_instr(instr, opcode, src);
    true
}

#[cfg(test)]
mod test {
    use xenon_hir::{FunctionBuilder, TypeName};

    use super::*;

    fn opcodes(f: &Function) -> Vec<Opcode> {
        f.all_instrs().into_iter().map(|x| f.instr(x).opcode).collect()
    }

    #[test]
    fn arithmetic_is_folded() {
        let table = OpcodeTable::new();
        let mut f = FunctionBuilder::new(0x8200_0000);
        let a = f.const_i64(5);
        let b = f.const_i64(7);
        let sum = f.add(a, b);
        let narrow = f.truncate(sum, TypeName::I32);
        let ca = f.add_carry_out(narrow, narrow);
        f.store_context(0x18, sum);
        f.store_context(0x20, ca);
        f.ret();
        let mut f = f.finish();

        ConstantPropagationPass.run(&mut f, &table).unwrap();
        assert_eq!(opcodes(&f), vec![Opcode::StoreContext, Opcode::StoreContext, Opcode::Return]);
        assert_eq!(f.value(sum).const_u64(), Some(12));
        assert_eq!(f.value(narrow).const_u64(), Some(12));
        assert_eq!(f.value(ca).const_u64(), Some(0));
    }

    #[test]
    fn constant_conditions_are_resolved() {
        let table = OpcodeTable::new();
        let mut f = FunctionBuilder::new(0x8200_0000);
        let yes = f.const_i8(1);
        let no = f.const_i8(0);
        f.call_true(yes, 0x8200_1000);
        f.call_true(no, 0x8200_2000);
        f.ret_true(no);
        let exit = f.new_label();
        f.branch_false(no, exit);
        f.trap(1, 0x8200_0000);
        f.mark_label(exit);
        f.ret();
        let mut f = f.finish();

        ConstantPropagationPass.run(&mut f, &table).unwrap();
        assert_eq!(opcodes(&f), vec![Opcode::Call, Opcode::Branch, Opcode::Trap, Opcode::Return]);
        let call = f.all_instrs()[0];
        assert_eq!(f.instr(call).src[0], Operand::Symbol(0x8200_1000));
    }

    #[test]
    fn loads_are_not_folded() {
        let table = OpcodeTable::new();
        let mut f = FunctionBuilder::new(0x8200_0000);
        let addr = f.const_i64(0x8200_0000);
        let value = f.load(addr, TypeName::I32);
        let converted = f.convert(addr, TypeName::F64);
        f.store_context(0x18, value);
        f.store_context(0x100, converted);
        f.ret();
        let mut f = f.finish();

        ConstantPropagationPass.run(&mut f, &table).unwrap();
        assert_eq!(f.instr_count(&table), 5);
    }
}
