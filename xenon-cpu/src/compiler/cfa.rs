use xenon_hir::{BlockId, Function, Opcode, OpcodeTable};

use crate::compiler::{CompilerPass, PassError};

/// Computes predecessor/successor edges and block ordinals.
pub struct ControlFlowAnalysisPass;

impl CompilerPass for ControlFlowAnalysisPass {
    fn name(&self) -> &'static str {
        "cfa"
    }

    fn run(&self, func: &mut Function, table: &OpcodeTable) -> Result<(), PassError> {
        analyze(func, table)
    }
}

pub(crate) fn analyze(func: &mut Function, table: &OpcodeTable) -> Result<(), PassError> {
    let blocks = func.block_ids();
    for (ordinal, &block) in blocks.iter().enumerate() {
        let b = func.block_mut(block);
        b.ordinal = ordinal as u32;
        b.predecessors.clear();
        b.successors.clear();
    }

    for &block in &blocks {
        for instr in func.instr_ids(block) {
            let label = match func.instr(instr).opcode {
                Opcode::Branch => func.instr(instr).src[0].as_label(),
                Opcode::BranchTrue | Opcode::BranchFalse => func.instr(instr).src[1].as_label(),
                _ => continue,
            };
            let Some(label) = label else { continue };
            let target = func
                .label(label)
                .block
                .ok_or(PassError::UnboundLabel { address: func.address, label })?;
            add_edge(func, block, target);
        }

        let ends_flow = func
            .terminator(block, table)
            .map_or(false, |x| matches!(func.instr(x).opcode, Opcode::Branch | Opcode::Return));
        if !ends_flow {
            if let Some(next) = func.block(block).next {
                add_edge(func, block, next);
            }
        }
    }

    Ok(())
}

fn add_edge(func: &mut Function, from: BlockId, to: BlockId) {
    if !func.block(from).successors.contains(&to) {
        func.block_mut(from).successors.push(to);
    }
    if !func.block(to).predecessors.contains(&from) {
        func.block_mut(to).predecessors.push(from);
    }
}

#[cfg(test)]
mod test {
    use xenon_hir::{FunctionBuilder, TypeName};

    use super::*;

    #[test]
    fn edges_of_a_loop() {
        let table = OpcodeTable::new();
        let mut f = FunctionBuilder::new(0x8200_0000);
        let head = f.new_label();
        f.mark_label(head);
        let ctr = f.load_context(0x10, TypeName::I64);
        let cond = f.is_true(ctr);
        f.branch_true(cond, head);
        f.ret();
        let mut f = f.finish();

        analyze(&mut f, &table).unwrap();
        let blocks = f.block_ids();
        assert_eq!(blocks.len(), 2);
        assert_eq!(f.block(blocks[0]).successors, vec![blocks[0], blocks[1]]);
        assert_eq!(f.block(blocks[0]).predecessors, vec![blocks[0]]);
        assert_eq!(f.block(blocks[1]).predecessors, vec![blocks[0]]);
        assert!(f.block(blocks[1]).successors.is_empty());
        assert_eq!(f.block(blocks[1]).ordinal, 1);
    }

    #[test]
    fn unbound_label_is_an_error() {
        let table = OpcodeTable::new();
        let mut f = FunctionBuilder::new(0x8200_0000);
        let label = f.new_label();
        f.branch(label);
        let mut f = f.finish();
        assert_eq!(
            analyze(&mut f, &table),
            Err(PassError::UnboundLabel { address: 0x8200_0000, label })
        );
    }
}
