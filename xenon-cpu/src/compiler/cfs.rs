use xenon_hir::{BlockId, Function, Opcode, OpcodeTable};

use crate::compiler::{cfa, CompilerPass, PassError};

/// Merges straight-line chains of blocks and removes blocks that cannot be reached from the entry.
pub struct ControlFlowSimplificationPass;

impl CompilerPass for ControlFlowSimplificationPass {
    fn name(&self) -> &'static str {
        "cfs"
    }

    fn run(&self, func: &mut Function, table: &OpcodeTable) -> Result<(), PassError> {
        cfa::analyze(func, table)?;

        let mut cursor = func.first_block();
        while let Some(block) = cursor {
            match mergeable_successor(func, table, block) {
                Some(next) => merge(func, table, block, next),
                None => cursor = func.block(block).next,
            }
        }

        remove_unreachable(func);
        cfa::analyze(func, table)
    }
}

/// Returns the block following `block` if control can only reach it from `block`.
fn mergeable_successor(func: &Function, table: &OpcodeTable, block: BlockId) -> Option<BlockId> {
    let next = func.block(block).next?;
    if func.block(block).successors != [next] || func.block(next).predecessors != [block] {
        return None;
    }
    match func.terminator(block, table).map(|x| func.instr(x).opcode) {
        Some(Opcode::ReturnTrue | Opcode::Return) => None,
        _ => Some(next),
    }
}

fn merge(func: &mut Function, table: &OpcodeTable, block: BlockId, next: BlockId) {
    if let Some(term) = func.terminator(block, table) {
        // Every branch out of `block` targets `next`, which now directly follows.
        let opcode = func.instr(term).opcode;
        if matches!(opcode, Opcode::Branch | Opcode::BranchTrue | Opcode::BranchFalse) {
            func.remove_instr(term);
        }
    }

    let successors = std::mem::take(&mut func.block_mut(next).successors);
    func.merge_blocks(block, next);
    for &succ in &successors {
        let preds = &mut func.block_mut(succ).predecessors;
        preds.retain(|x| *x != next && *x != block);
        preds.push(block);
    }
    func.block_mut(block).successors = successors;
}

fn remove_unreachable(func: &mut Function) {
    let Some(entry) = func.first_block() else { return };

    let len = func.block_ids().iter().map(|x| x.index() + 1).max().unwrap_or(0);
    let mut reachable = vec![false; len];
    let mut stack = vec![entry];
    while let Some(block) = stack.pop() {
        if std::mem::replace(&mut reachable[block.index()], true) {
            continue;
        }
        stack.extend(func.block(block).successors.iter().copied());
    }

    for block in func.block_ids() {
        if !reachable[block.index()] {
            tracing::trace!("{:#x}: removing unreachable block {block}", func.address);
            func.remove_block(block);
        }
    }
}

#[cfg(test)]
mod test {
    use xenon_hir::{FunctionBuilder, TypeName};

    use super::*;

    #[test]
    fn branch_to_next_block_is_merged() {
        let table = OpcodeTable::new();
        let mut f = FunctionBuilder::new(0x8200_0000);
        let next = f.new_label();
        let a = f.load_context(0x18, TypeName::I64);
        f.branch(next);
        f.mark_label(next);
        f.store_context(0x20, a);
        f.ret();
        let mut f = f.finish();

        ControlFlowSimplificationPass.run(&mut f, &table).unwrap();
        let blocks = f.block_ids();
        assert_eq!(blocks.len(), 1);
        let ops: Vec<_> = f.instr_ids(blocks[0]).iter().map(|x| f.instr(*x).opcode).collect();
        assert_eq!(ops, vec![Opcode::LoadContext, Opcode::StoreContext, Opcode::Return]);
        assert_eq!(f.label(next).block, Some(blocks[0]));
    }

    #[test]
    fn unreachable_blocks_are_removed() {
        let table = OpcodeTable::new();
        let mut f = FunctionBuilder::new(0x8200_0000);
        f.ret();
        let dead = f.load_context(0x18, TypeName::I64);
        f.store_context(0x20, dead);
        f.ret();
        let mut f = f.finish();

        ControlFlowSimplificationPass.run(&mut f, &table).unwrap();
        assert_eq!(f.block_ids().len(), 1);
        assert_eq!(f.all_instrs().len(), 1);
    }

    #[test]
    fn join_points_are_kept() {
        let table = OpcodeTable::new();
        let mut f = FunctionBuilder::new(0x8200_0000);
        let skip = f.new_label();
        let a = f.load_context(0x18, TypeName::I8);
        f.branch_true(a, skip);
        let b = f.load_context(0x20, TypeName::I64);
        f.store_context(0x28, b);
        f.mark_label(skip);
        f.ret();
        let mut f = f.finish();

        ControlFlowSimplificationPass.run(&mut f, &table).unwrap();
        let blocks = f.block_ids();
        assert_eq!(blocks.len(), 3);
        assert_eq!(f.block(blocks[2]).predecessors.len(), 2);
    }
}
