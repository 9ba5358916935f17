use xenon_hir::{Function, Opcode, OpcodeFlags, OpcodeTable};

use crate::compiler::{CompilerPass, PassError};

/// Removes side-effect free instructions with unused results and forwards `assign`s.
pub struct DeadCodeEliminationPass;

impl CompilerPass for DeadCodeEliminationPass {
    fn name(&self) -> &'static str {
        "dce"
    }

    fn run(&self, func: &mut Function, table: &OpcodeTable) -> Result<(), PassError> {
        let mut removed = 0;
        loop {
            let count = sweep(func, table);
            if count == 0 {
                break;
            }
            removed += count;
        }
        if removed != 0 {
            tracing::trace!("{:#x}: removed {removed} dead instructions", func.address);
        }
        Ok(())
    }
}

/// Visits instructions in reverse so that whole chains of dead values go in a single sweep.
fn sweep(func: &mut Function, table: &OpcodeTable) -> usize {
    let mut removed = 0;
    for instr in func.all_instrs().into_iter().rev() {
        let i = func.instr(instr);
        match i.opcode {
            Opcode::Assign => {
                if let (Some(dest), Some(src)) = (i.dest, i.src[0].as_value()) {
                    func.replace_all_uses(dest, src);
                }
                func.remove_instr(instr);
                removed += 1;
            }
            Opcode::Nop => {
                func.remove_instr(instr);
                removed += 1;
            }
            op if !is_removable(table.flags(op), i.dest.is_some()) => {}
            _ => {
                if i.dest.map_or(false, |x| func.value(x).uses.is_empty()) {
                    func.remove_instr(instr);
                    removed += 1;
                }
            }
        }
    }
    removed
}

/// Guest memory reads are dropped along with their result, any other memory or volatile
/// operation stays.
fn is_removable(flags: OpcodeFlags, has_dest: bool) -> bool {
    if flags.contains(OpcodeFlags::MEMORY) {
        return has_dest;
    }
    !flags.contains(OpcodeFlags::VOLATILE)
}

#[cfg(test)]
mod test {
    use xenon_hir::{FunctionBuilder, TypeName};

    use super::*;

    fn build() -> Function {
        let mut f = FunctionBuilder::new(0x8200_0000);
        let a = f.load_context(0x18, TypeName::I64);
        let b = f.load_context(0x20, TypeName::I64);
        let dead = f.add(a, b);
        let _dead2 = f.mul(dead, b);
        let copy = f.assign(a);
        f.store_context(0x28, copy);
        let addr = f.const_i64(0x1000);
        let _unused_load = f.load(addr, TypeName::I32);
        f.nop();
        f.ret();
        f.finish()
    }

    #[test]
    fn removes_dead_chains() {
        let table = OpcodeTable::new();
        let mut f = build();
        DeadCodeEliminationPass.run(&mut f, &table).unwrap();

        let ops: Vec<_> = f.all_instrs().into_iter().map(|x| f.instr(x).opcode).collect();
        assert_eq!(ops, vec![Opcode::LoadContext, Opcode::StoreContext, Opcode::Return]);

        let store = f.all_instrs()[1];
        let a = f.instr(f.all_instrs()[0]).dest.unwrap();
        assert_eq!(f.instr(store).src_value(1), a);
    }

    #[test]
    fn used_loads_and_stores_survive() {
        let table = OpcodeTable::new();
        let mut f = FunctionBuilder::new(0x8200_0000);
        let addr = f.const_i64(0x1000);
        let _dead = f.load(addr, TypeName::I32);
        let value = f.load(addr, TypeName::I64);
        f.store(addr, value);
        f.ret();
        let mut f = f.finish();
        DeadCodeEliminationPass.run(&mut f, &table).unwrap();

        let ops: Vec<_> = f.all_instrs().into_iter().map(|x| f.instr(x).opcode).collect();
        assert_eq!(ops, vec![Opcode::Load, Opcode::Store, Opcode::Return]);
    }

    #[test]
    fn running_twice_is_a_no_op() {
        let table = OpcodeTable::new();
        let mut f = build();
        DeadCodeEliminationPass.run(&mut f, &table).unwrap();
        let once = f.display().to_string();
        let instrs = f.all_instrs();

        DeadCodeEliminationPass.run(&mut f, &table).unwrap();
        assert_eq!(f.display().to_string(), once);
        assert_eq!(f.all_instrs(), instrs);
    }
}
