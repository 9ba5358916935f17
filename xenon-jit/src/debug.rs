use std::collections::HashSet;

use cranelift::{codegen::Context as CodeContext, prelude::*};

use crate::lir::{Lir, LirInstrId};

/// Renders the Cranelift IR of the current function, annotating it with the LIR instruction each
/// group of instructions was generated from.
pub(crate) fn debug_il(code_ctx: &CodeContext, lir: &Lir) -> String {
    let mut by_ordinal = vec![None; lir.instr_count()];
    for id in lir.all_instrs() {
        if let Some(slot) = by_ordinal.get_mut(lir.instr(id).ordinal as usize) {
            *slot = Some(id);
        }
    }

    let mut out = String::new();
    let mut decorator = LirDecorator { seen: HashSet::new(), lir, by_ordinal };
    if codegen::write::decorate_function(&mut decorator, &mut out, &code_ctx.func).is_err() {
        out.push_str("<error writing function>");
    }
    out
}

struct LirDecorator<'a> {
    seen: HashSet<u32>,
    lir: &'a Lir,
    by_ordinal: Vec<Option<LirInstrId>>,
}

impl<'a> codegen::write::FuncWriter for LirDecorator<'a> {
    fn write_block_header(
        &mut self,
        w: &mut dyn std::fmt::Write,
        func: &codegen::ir::Function,
        block: Block,
        indent: usize,
    ) -> std::fmt::Result {
        codegen::write::write_block_header(w, func, block, indent)
    }

    fn write_instruction(
        &mut self,
        w: &mut dyn std::fmt::Write,
        func: &codegen::ir::Function,
        aliases: &codegen::entity::SecondaryMap<Value, Vec<Value>>,
        inst: codegen::ir::Inst,
        indent: usize,
    ) -> std::fmt::Result {
        let srcloc = func.srcloc(inst);
        if !srcloc.is_default() && self.seen.insert(srcloc.bits()) {
            match self.by_ordinal.get(srcloc.bits() as usize).copied().flatten() {
                Some(id) => writeln!(w, "    ; {}", self.lir.instr(id))?,
                None => w.write_str("    ; exit\n")?,
            }
        }
        codegen::write::PlainWriter.write_instruction(w, func, aliases, inst, indent)
    }
}
