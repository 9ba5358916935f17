use xenon_hir::{
    trap_code, Arena, Function, FunctionBuilder, InstrId, LabelId, Opcode, Operand, TypeName,
    ValueId,
};

use crate::{
    context::{
        cr_bit_offset, fpr_offset, gpr_offset, vr_offset, CR_EQ, CR_GT, CR_LT, CR_SO, CTR_OFFSET,
        JUMP_PENDING_OFFSET, JUMP_TARGET_OFFSET, LR_OFFSET, XER_CA_OFFSET, XER_OV_OFFSET,
        XER_SO_OFFSET,
    },
    debug_info::{DebugInfo, DebugInfoFlags},
    frontend::{
        decode::{self, Category},
        disasm, emit_altivec, emit_alu, emit_control, emit_fpu, emit_memory,
    },
    mem::{Endian, MemError, Memory},
    sdb::{FunctionSymbol, SymbolKind},
};

/// What the translator needs to know about the environment it is translating for.
pub trait TranslationEnv {
    fn memory(&self) -> &dyn Memory;

    /// Whether a code breakpoint is set at `address`.
    fn has_breakpoint(&self, _address: u32) -> bool {
        false
    }

    /// Returns the trampoline index of a resolved import.
    fn extern_index(&self, _module: &str, _ordinal: u32) -> Option<u32> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslateError {
    /// The instruction at the address could not be read.
    ReadCode { address: u32, error: MemError },
    /// The symbol has not been scanned.
    Undeclared(u32),
}

impl std::fmt::Display for TranslateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadCode { address, error } => {
                write!(f, "failed to read instruction at {address:#x}: {error}")
            }
            Self::Undeclared(address) => write!(f, "function at {address:#x} has no extent"),
        }
    }
}

impl std::error::Error for TranslateError {}

/// Returned by emit routines for instruction forms they do not support.
#[derive(Debug)]
pub(crate) struct Unhandled;

pub(crate) type EmitResult = Result<(), Unhandled>;

#[derive(Default)]
pub struct Translator {
    /// Emit `debug_break` instead of a trap for instructions that cannot be translated.
    pub break_on_unimplemented: bool,
}

impl Translator {
    pub fn new(break_on_unimplemented: bool) -> Self {
        Self { break_on_unimplemented }
    }

    /// Translates the declared function `symbol` into HIR.
    ///
    /// The label and offset tables used to resolve branch targets are allocated from `arena`.
    pub fn translate(
        &self,
        env: &dyn TranslationEnv,
        symbol: &FunctionSymbol,
        f: &mut FunctionBuilder,
        arena: &Arena,
        debug_info: &mut Option<DebugInfo>,
    ) -> Result<(), TranslateError> {
        let start = symbol.address;
        let end = symbol.end_address();
        if end < start {
            return Err(TranslateError::Undeclared(start));
        }
        f.end_address = end;

        if let SymbolKind::Import { module, ordinal } = &symbol.kind {
            self.translate_import(env, f, start, module, *ordinal);
            return Ok(());
        }

        tracing::debug!("translating {:#x}..={end:#x} ({})", start, symbol.name());

        let count = ((end - start) / 4 + 1) as usize;
        let labels = arena.alloc_slice_fill(count, None::<LabelId>);
        let offsets = arena.alloc_slice_fill(count, None::<InstrId>);

        let entry = f.new_label();
        f.label_mut(entry).name = Some(symbol.name());
        labels[0] = Some(entry);

        let want_disasm =
            debug_info.as_ref().map_or(false, |x| x.wants(DebugInfoFlags::SOURCE_DISASM));
        let mut source_disasm = String::new();

        let mut e = Emitter { f, start, end, labels, offsets, env };
        let mut address = start;
        loop {
            let index = e.index_of(address);
            if let Some(label) = e.labels[index] {
                e.f.mark_label(label);
            }
            let offset = e.f.append(Opcode::SourceOffset, None, [
                Operand::Offset(address as u64),
                Operand::None,
                Operand::None,
            ]);
            e.offsets[index] = Some(offset);

            if env.has_breakpoint(address) {
                e.f.debug_break(address);
            }

            let code = env
                .memory()
                .read_u32(address, Endian::Big)
                .map_err(|error| TranslateError::ReadCode { address, error })?;

            let instr = decode::decode(address, code);
            if want_disasm {
                source_disasm.push_str(&format!("{address:08x} {code:08x}  "));
                match &instr {
                    Some(instr) => source_disasm.push_str(&disasm::disasm(instr)),
                    None => source_disasm.push_str("<invalid>"),
                }
                source_disasm.push('\n');
            }

            let result = match instr {
                Some(instr) => match instr.opcode.category() {
                    Category::Alu => emit_alu::emit(&mut e, instr),
                    Category::Control => emit_control::emit(&mut e, instr),
                    Category::Memory => emit_memory::emit(&mut e, instr),
                    Category::Fpu => emit_fpu::emit(&mut e, instr),
                    Category::Altivec => emit_altivec::emit(&mut e, instr),
                },
                None => Err(Unhandled),
            };
            if result.is_err() {
                tracing::debug!("{address:#x}: unimplemented instruction {code:#010x}");
                match self.break_on_unimplemented {
                    true => e.f.debug_break(address),
                    false => e.f.trap(trap_code::UNIMPLEMENTED, address),
                }
            }

            if address >= end {
                break;
            }
            address += 4;
        }

        // Control reaching the end of the extent continues with the next function.
        if falls_through(e.f) {
            let next = end.wrapping_add(4);
            tracing::trace!("{start:#x}: falls through to {next:#x}");
            let next = e.f.const_i64(next as u64);
            e.tail_jump(next);
        }

        if let Some(info) = debug_info.as_mut().filter(|_| want_disasm) {
            info.source_disasm = Some(source_disasm);
        }
        Ok(())
    }

    fn translate_import(
        &self,
        env: &dyn TranslationEnv,
        f: &mut FunctionBuilder,
        address: u32,
        module: &str,
        ordinal: u32,
    ) {
        f.source_offset(address);
        match env.extern_index(module, ordinal) {
            Some(index) => f.call_extern(index),
            None => {
                tracing::warn!("{address:#x}: unresolved import {module}:{ordinal}");
                f.trap(trap_code::UNIMPLEMENTED, address);
            }
        }
        f.ret();
    }
}

/// Returns whether execution can continue past the last instruction of the function.
fn falls_through(f: &Function) -> bool {
    let mut block = f.last_block();
    while let Some(id) = block {
        let b = f.block(id);
        if let Some(tail) = b.instr_tail {
            return !matches!(f.instr(tail).opcode, Opcode::Branch | Opcode::Return);
        }
        // An empty block with a label is a branch target at the very end.
        if b.label_head.is_some() {
            return true;
        }
        block = b.prev;
    }
    true
}

/// State shared by the emit routines while translating a function.
pub(crate) struct Emitter<'a> {
    pub f: &'a mut FunctionBuilder,
    pub start: u32,
    pub end: u32,
    labels: &'a mut [Option<LabelId>],
    offsets: &'a mut [Option<InstrId>],
    pub env: &'a dyn TranslationEnv,
}

impl<'a> Emitter<'a> {
    #[inline]
    fn index_of(&self, address: u32) -> usize {
        ((address - self.start) / 4) as usize
    }

    pub fn contains(&self, address: u32) -> bool {
        address % 4 == 0 && (self.start..=self.end).contains(&address)
    }

    /// Returns the label for a branch target inside the function, or `None` if the target is
    /// outside of it.
    ///
    /// Targets that have already been translated are split out into their own block.
    pub fn label_for(&mut self, target: u32) -> Option<LabelId> {
        if !self.contains(target) {
            return None;
        }
        let index = self.index_of(target);
        if let Some(label) = self.labels[index] {
            return Some(label);
        }

        let label = self.f.new_label();
        self.labels[index] = Some(label);
        if let Some(offset) = self.offsets[index] {
            match self.f.instr(offset).prev {
                Some(prev) => self.f.insert_label(label, prev),
                None => {
                    let block = self.f.instr(offset).block;
                    self.f.attach_label(label, block);
                }
            }
        }
        Some(label)
    }

    //
    // Register access
    //

    pub fn load_gpr(&mut self, reg: u32) -> ValueId {
        self.f.load_context(gpr_offset(reg), TypeName::I64)
    }

    pub fn store_gpr(&mut self, reg: u32, value: ValueId) {
        debug_assert_eq!(self.f.ty(value), TypeName::I64);
        self.f.store_context(gpr_offset(reg), value);
    }

    /// Loads `ra`, or zero when `ra` is r0 (the `(rA|0)` operand).
    pub fn load_gpr_or_zero(&mut self, reg: u32) -> ValueId {
        match reg {
            0 => self.f.const_i64(0),
            _ => self.load_gpr(reg),
        }
    }

    pub fn load_gpr32(&mut self, reg: u32) -> ValueId {
        let value = self.load_gpr(reg);
        self.f.truncate(value, TypeName::I32)
    }

    pub fn load_fpr(&mut self, reg: u32) -> ValueId {
        self.f.load_context(fpr_offset(reg), TypeName::F64)
    }

    pub fn store_fpr(&mut self, reg: u32, value: ValueId) {
        self.f.store_context(fpr_offset(reg), value);
    }

    pub fn load_vr(&mut self, reg: u32) -> ValueId {
        self.f.load_context(vr_offset(reg), TypeName::V128)
    }

    pub fn store_vr(&mut self, reg: u32, value: ValueId) {
        self.f.store_context(vr_offset(reg), value);
    }

    pub fn load_lr(&mut self) -> ValueId {
        self.f.load_context(LR_OFFSET, TypeName::I64)
    }

    pub fn store_lr(&mut self, value: ValueId) {
        self.f.store_context(LR_OFFSET, value);
    }

    pub fn load_ctr(&mut self) -> ValueId {
        self.f.load_context(CTR_OFFSET, TypeName::I64)
    }

    pub fn store_ctr(&mut self, value: ValueId) {
        self.f.store_context(CTR_OFFSET, value);
    }

    /// Leaves the function, asking the runtime to continue at `target`. Unlike a call this does
    /// not nest, so loops that span several functions run in constant host stack.
    pub fn tail_jump(&mut self, target: ValueId) {
        self.f.store_context(JUMP_TARGET_OFFSET, target);
        let pending = self.f.const_i8(1);
        self.f.store_context(JUMP_PENDING_OFFSET, pending);
        self.f.ret();
    }

    pub fn load_ca(&mut self) -> ValueId {
        self.f.load_context(XER_CA_OFFSET, TypeName::I8)
    }

    pub fn store_ca(&mut self, value: ValueId) {
        debug_assert_eq!(self.f.ty(value), TypeName::I8);
        self.f.store_context(XER_CA_OFFSET, value);
    }

    pub fn load_so(&mut self) -> ValueId {
        self.f.load_context(XER_SO_OFFSET, TypeName::I8)
    }

    /// Sets XER[OV] and accumulates it into XER[SO].
    pub fn store_ov(&mut self, value: ValueId) {
        self.f.store_context(XER_OV_OFFSET, value);
        let so = self.load_so();
        let so = self.f.or(so, value);
        self.f.store_context(XER_SO_OFFSET, so);
    }

    pub fn load_cr_bit(&mut self, bit: u32) -> ValueId {
        self.f.load_context(cr_bit_offset(bit), TypeName::I8)
    }

    pub fn store_cr_bit(&mut self, bit: u32, value: ValueId) {
        debug_assert_eq!(self.f.ty(value), TypeName::I8);
        self.f.store_context(cr_bit_offset(bit), value);
    }

    /// Sets condition register field `field` from comparing `a` against `b`.
    pub fn update_cr_compare(&mut self, field: u32, a: ValueId, b: ValueId, signed: bool) {
        let (lt, gt) = match signed {
            true => (self.f.compare_slt(a, b), self.f.compare_sgt(a, b)),
            false => (self.f.compare_ult(a, b), self.f.compare_ugt(a, b)),
        };
        let eq = self.f.compare_eq(a, b);
        let so = self.load_so();

        let base = field * 4;
        self.store_cr_bit(base + CR_LT as u32, lt);
        self.store_cr_bit(base + CR_GT as u32, gt);
        self.store_cr_bit(base + CR_EQ as u32, eq);
        self.store_cr_bit(base + CR_SO as u32, so);
    }

    /// Sets condition register field `field` from the sign of `value`.
    pub fn update_cr(&mut self, field: u32, value: ValueId) {
        let zero = self.f.const_like(value, 0);
        self.update_cr_compare(field, value, zero, true);
    }

    //
    // Effective addresses
    //

    /// `(rA|0) + d`
    pub fn ea_d(&mut self, ra: u32, offset: i64) -> ValueId {
        if ra == 0 {
            return self.f.const_i64(offset as u64);
        }
        let base = self.load_gpr(ra);
        match offset {
            0 => base,
            _ => self.f.add_imm(base, offset as u64),
        }
    }

    /// `(rA|0) + rB`
    pub fn ea_x(&mut self, ra: u32, rb: u32) -> ValueId {
        let b = self.load_gpr(rb);
        if ra == 0 {
            return b;
        }
        let a = self.load_gpr(ra);
        self.f.add(a, b)
    }

    //
    // Misc helpers
    //

    /// Converts a boolean into a 64-bit integer.
    pub fn bool_to_i64(&mut self, value: ValueId) -> ValueId {
        self.f.zero_extend(value, TypeName::I64)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::{mem::FlatMemory, sdb::SymbolDatabase};

    const BASE: u32 = 0x8200_0000;

    struct TestEnv {
        memory: FlatMemory,
        breakpoint: Option<u32>,
    }

    impl TranslationEnv for TestEnv {
        fn memory(&self) -> &dyn Memory {
            &self.memory
        }

        fn has_breakpoint(&self, address: u32) -> bool {
            self.breakpoint == Some(address)
        }

        fn extern_index(&self, module: &str, ordinal: u32) -> Option<u32> {
            (module == "xboxkrnl.exe" && ordinal == 7).then_some(0)
        }
    }

    fn translate(code: &[u32], breakpoint: Option<u32>) -> Function {
        let memory = FlatMemory::new(BASE, 0x1000);
        let bytes: Vec<u8> = code.iter().flat_map(|x| x.to_be_bytes()).collect();
        memory.load(BASE, &bytes).unwrap();
        let env = TestEnv { memory, breakpoint };

        let sdb = SymbolDatabase::new();
        let symbol = sdb.get_or_insert(BASE);
        symbol.declare(BASE + (code.len() as u32 - 1) * 4);

        let arena = Arena::new();
        let mut f = FunctionBuilder::new(BASE);
        Translator::default().translate(&env, &symbol, &mut f, &arena, &mut None).unwrap();
        f.finish()
    }

    fn opcodes(f: &Function) -> Vec<Opcode> {
        f.all_instrs().into_iter().map(|x| f.instr(x).opcode).collect()
    }

    #[test]
    fn add_and_return() {
        // add r3, r3, r4; blr
        let f = translate(&[0x7c63_2214, decode::BLR], None);
        assert_eq!(opcodes(&f), vec![
            Opcode::SourceOffset,
            Opcode::LoadContext,
            Opcode::LoadContext,
            Opcode::Add,
            Opcode::StoreContext,
            Opcode::SourceOffset,
            Opcode::Return,
        ]);
    }

    #[test]
    fn unknown_instruction_traps() {
        let f = translate(&[0xffff_ffff, decode::BLR], None);
        let instrs = f.all_instrs();
        let trap = f.instr(instrs[1]);
        assert_eq!(trap.opcode, Opcode::Trap);
        assert_eq!(trap.src[0], Operand::Offset(trap_code::UNIMPLEMENTED));
        assert_eq!(trap.src[1], Operand::Offset(BASE as u64));
    }

    #[test]
    fn backward_branch_splits_block() {
        let code = [
            0x3863_0001, // addi r3, r3, 1
            0x3884_ffff, // addi r4, r4, -1
            0x2c04_0000, // cmpwi r4, 0
            0x4082_fff8, // bne -0x8
            decode::BLR,
        ];
        let f = translate(&code, None);
        let blocks = f.block_ids();
        assert_eq!(blocks.len(), 3);
        assert_eq!(f.label_ids(blocks[0]).len(), 1);
        assert_eq!(f.label_ids(blocks[1]).len(), 1);

        let head = f.instr_ids(blocks[1])[0];
        assert_eq!(f.instr(head).opcode, Opcode::SourceOffset);
        assert_eq!(f.instr(head).src[0], Operand::Offset(BASE as u64 + 4));
    }

    #[test]
    fn falls_through_to_next_function() {
        let f = translate(&[0x3860_0001], None);
        let ops = opcodes(&f);
        let tail = [Opcode::StoreContext, Opcode::StoreContext, Opcode::Return];
        assert_eq!(&ops[ops.len() - 3..], &tail);
        assert!(!ops.contains(&Opcode::Call));

        let target = f.instr(f.all_instrs()[ops.len() - 3]);
        assert_eq!(target.src[0], Operand::Offset(JUMP_TARGET_OFFSET as u64));
        assert_eq!(f.value(target.src_value(1)).const_u64(), Some(BASE as u64 + 4));
    }

    #[test]
    fn conditional_jump_out_at_end_keeps_fallthrough() {
        // beq +0x100
        let f = translate(&[0x4182_0100], None);
        let ops = opcodes(&f);
        assert!(ops.contains(&Opcode::BranchFalse));
        assert_eq!(ops.iter().filter(|x| **x == Opcode::Return).count(), 2);

        let targets: Vec<_> = f
            .all_instrs()
            .into_iter()
            .map(|x| f.instr(x))
            .filter(|x| x.src[0] == Operand::Offset(JUMP_TARGET_OFFSET as u64))
            .map(|x| f.value(x.src_value(1)).const_u64())
            .collect();
        assert_eq!(targets, [Some(BASE as u64 + 0x100), Some(BASE as u64 + 4)]);
    }

    #[test]
    fn breakpoint_emits_debug_break() {
        let f = translate(&[0x3860_0001, decode::BLR], Some(BASE + 4));
        let ops = opcodes(&f);
        let tail = [Opcode::SourceOffset, Opcode::DebugBreak, Opcode::Return];
        assert_eq!(&ops[ops.len() - 3..], &tail);
    }

    #[test]
    fn imports_call_extern() {
        let env = TestEnv { memory: FlatMemory::new(BASE, 0x100), breakpoint: None };
        let sdb = SymbolDatabase::new();
        let resolved = sdb.declare_import(BASE, "xboxkrnl.exe", 7);
        let missing = sdb.declare_import(BASE + 4, "xboxkrnl.exe", 8);

        let arena = Arena::new();
        let mut f = FunctionBuilder::new(BASE);
        Translator::default().translate(&env, &resolved, &mut f, &arena, &mut None).unwrap();
        assert_eq!(opcodes(&f), vec![Opcode::SourceOffset, Opcode::CallExtern, Opcode::Return]);

        let mut f = FunctionBuilder::new(BASE + 4);
        Translator::default().translate(&env, &missing, &mut f, &arena, &mut None).unwrap();
        assert_eq!(opcodes(&f), vec![Opcode::SourceOffset, Opcode::Trap, Opcode::Return]);
    }

    #[test]
    fn source_disasm_is_collected() {
        let memory = FlatMemory::new(BASE, 0x100);
        memory.load(BASE, &0x3860_0001_u32.to_be_bytes()).unwrap();
        memory.load(BASE + 4, &decode::BLR.to_be_bytes()).unwrap();
        let env = TestEnv { memory, breakpoint: None };

        let sdb = SymbolDatabase::new();
        let symbol = sdb.get_or_insert(BASE);
        symbol.declare(BASE + 4);

        let arena = Arena::new();
        let mut f = FunctionBuilder::new(BASE);
        let mut info = Some(DebugInfo::new(DebugInfoFlags::SOURCE_DISASM));
        Translator::default().translate(&env, &symbol, &mut f, &arena, &mut info).unwrap();

        let text = info.unwrap().source_disasm.unwrap();
        assert_eq!(text, "82000000 38600001  li r3, 0x1\n82000004 4e800020  blr\n");
    }
}
