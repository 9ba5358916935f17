use xenon_hir::{BlockId, Function, InstrId, Opcode, OpcodeFlags, OpcodeTable, TypeName, ValueId};

use crate::compiler::{CompilerPass, PassError};

/// Forwards context loads and stores within a block and removes overwritten stores.
pub struct Mem2RegPass;

impl CompilerPass for Mem2RegPass {
    fn name(&self) -> &'static str {
        "mem2reg"
    }

    fn run(&self, func: &mut Function, table: &OpcodeTable) -> Result<(), PassError> {
        let mut slots = vec![];
        for block in func.block_ids() {
            slots.clear();
            promote_block(func, table, block, &mut slots);
        }
        Ok(())
    }
}

/// The known value of a range of the context.
struct Slot {
    offset: usize,
    ty: TypeName,
    value: ValueId,
    /// The store that wrote `value`, if nothing has observed it yet.
    store: Option<InstrId>,
}

impl Slot {
    fn end(&self) -> usize {
        self.offset + self.ty.size()
    }

    fn overlaps(&self, offset: usize, size: usize) -> bool {
        self.offset < offset + size && offset < self.end()
    }
}

fn promote_block(func: &mut Function, table: &OpcodeTable, block: BlockId, slots: &mut Vec<Slot>) {
    for instr in func.instr_ids(block) {
        let opcode = func.instr(instr).opcode;
        match opcode {
            Opcode::LoadContext => {
                let (Some(offset), Some(dest)) =
                    (func.instr(instr).src[0].as_offset(), func.instr(instr).dest)
                else {
                    continue;
                };
                let (offset, ty) = (offset as usize, func.ty(dest));

                if let Some(slot) = slots.iter().find(|x| x.offset == offset && x.ty == ty) {
                    let value = slot.value;
                    func.replace_all_uses(dest, value);
                    func.remove_instr(instr);
                    continue;
                }

                slots.retain_mut(|slot| {
                    if !slot.overlaps(offset, ty.size()) {
                        return true;
                    }
                    slot.store = None;
                    false
                });
                slots.push(Slot { offset, ty, value: dest, store: None });
            }
            Opcode::StoreContext => {
                let Some(offset) = func.instr(instr).src[0].as_offset() else { continue };
                let value = func.instr(instr).src_value(1);
                let (offset, ty) = (offset as usize, func.ty(value));
                let end = offset + ty.size();

                let mut dead = vec![];
                slots.retain(|slot| {
                    if !slot.overlaps(offset, ty.size()) {
                        return true;
                    }
                    if let Some(store) = slot.store {
                        if offset <= slot.offset && slot.end() <= end {
                            dead.push(store);
                        }
                    }
                    false
                });
                for store in dead {
                    tracing::trace!("{:#x}: removing overwritten store {store}", func.address);
                    func.remove_instr(store);
                }
                slots.push(Slot { offset, ty, value, store: Some(instr) });
            }
            _ => {
                let flags = table.flags(opcode);
                if flags.contains(OpcodeFlags::IGNORE) {
                    continue;
                }
                if flags.contains(OpcodeFlags::MEMORY) {
                    // Guest memory accesses may fault, which makes the context visible.
                    slots.iter_mut().for_each(|slot| slot.store = None);
                }
                else if flags.contains(OpcodeFlags::VOLATILE) {
                    slots.clear();
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use xenon_hir::FunctionBuilder;

    use super::*;

    fn opcodes(f: &Function) -> Vec<Opcode> {
        f.all_instrs().into_iter().map(|x| f.instr(x).opcode).collect()
    }

    #[test]
    fn store_then_load_is_forwarded() {
        let table = OpcodeTable::new();
        let mut f = FunctionBuilder::new(0x8200_0000);
        let a = f.load_context(0x18, TypeName::I64);
        let b = f.load_context(0x18, TypeName::I64);
        let sum = f.add(a, b);
        f.store_context(0x20, sum);
        let reload = f.load_context(0x20, TypeName::I64);
        f.store_context(0x28, reload);
        f.ret();
        let mut f = f.finish();

        Mem2RegPass.run(&mut f, &table).unwrap();
        assert_eq!(opcodes(&f), vec![
            Opcode::LoadContext,
            Opcode::Add,
            Opcode::StoreContext,
            Opcode::StoreContext,
            Opcode::Return
        ]);
        let add = f.value(sum).def.unwrap();
        assert_eq!(f.instr(add).src_value(0), a);
        assert_eq!(f.instr(add).src_value(1), a);
    }

    #[test]
    fn overwritten_store_is_removed() {
        let table = OpcodeTable::new();
        let mut f = FunctionBuilder::new(0x8200_0000);
        let one = f.const_i64(1);
        let two = f.const_i64(2);
        f.store_context(0x18, one);
        f.store_context(0x18, two);
        f.ret();
        let mut f = f.finish();

        Mem2RegPass.run(&mut f, &table).unwrap();
        assert_eq!(opcodes(&f), vec![Opcode::StoreContext, Opcode::Return]);
        let store = f.all_instrs()[0];
        assert_eq!(f.instr(store).src_value(1), two);
    }

    #[test]
    fn calls_flush_known_values() {
        let table = OpcodeTable::new();
        let mut f = FunctionBuilder::new(0x8200_0000);
        let one = f.const_i64(1);
        f.store_context(0x18, one);
        f.call(0x8200_1000);
        let a = f.load_context(0x18, TypeName::I64);
        f.store_context(0x18, a);
        f.ret();
        let mut f = f.finish();

        Mem2RegPass.run(&mut f, &table).unwrap();
        assert_eq!(opcodes(&f), vec![
            Opcode::StoreContext,
            Opcode::Call,
            Opcode::LoadContext,
            Opcode::StoreContext,
            Opcode::Return
        ]);
    }

    #[test]
    fn memory_access_keeps_pending_stores() {
        let table = OpcodeTable::new();
        let mut f = FunctionBuilder::new(0x8200_0000);
        let one = f.const_i64(1);
        let two = f.const_i64(2);
        f.store_context(0x18, one);
        let value = f.load(one, TypeName::I32);
        f.store_context(0x18, two);
        let reload = f.load_context(0x18, TypeName::I64);
        f.store(reload, value);
        f.ret();
        let mut f = f.finish();

        Mem2RegPass.run(&mut f, &table).unwrap();
        assert_eq!(opcodes(&f), vec![
            Opcode::StoreContext,
            Opcode::Load,
            Opcode::StoreContext,
            Opcode::Store,
            Opcode::Return
        ]);
    }
}
