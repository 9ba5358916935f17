//! Low level IR used by the native backend.
//!
//! LIR operates on integer virtual registers. Every register holds a 64-bit value whose bits above
//! the width of the instruction that defined it are zero. Blocks, instructions and labels are
//! stored in per-function tables and linked by index, the same way as in HIR.

use xenon_hir::TypeName;

macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            #[inline(always)]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

define_id!(LirBlockId, "B");
define_id!(LirInstrId, "I");
define_id!(LirLabelId, "L");
define_id!(VReg, "%");

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Cond {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

impl Cond {
    pub fn name(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Slt => "slt",
            Self::Sle => "sle",
            Self::Sgt => "sgt",
            Self::Sge => "sge",
            Self::Ult => "ult",
            Self::Ule => "ule",
            Self::Ugt => "ugt",
            Self::Uge => "uge",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum LirOpcode {
    Mov,
    Add,
    Sub,
    Mul,
    MulHi,
    MulHiUnsigned,
    Div,
    DivUnsigned,
    And,
    Or,
    Xor,
    Not,
    Neg,
    Abs,
    Shl,
    Shr,
    Sar,
    Rotl,
    /// Sign extends from `src_ty` to `ty`.
    Sext,
    /// Truncation and zero extension: keeps the low bits of `ty`.
    Zext,
    Clz,
    Bswap,
    Cmp(Cond),
    /// `src[0] != 0 ? src[1] : src[2]`
    Select,
    /// `src[0] + src[1] + (src[2] != 0)`
    AddCarryIn,
    CarryOut,
    /// Carry out of `src[0] + src[1] + (src[2] != 0)`.
    CarryOutWithCarry,
    BorrowOut,
    AddOverflow,
    SubOverflow,

    LoadContext,
    StoreContext,
    LoadLocal,
    StoreLocal,
    LoadMem,
    StoreMem,

    Call,
    CallIndirect,
    CallExtern,
    Trap,
    DebugBreak,
    SetReturnAddress,
    Jump,
    Return,
}

impl LirOpcode {
    pub fn name(self) -> &'static str {
        match self {
            Self::Mov => "mov",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::MulHi => "mulhi",
            Self::MulHiUnsigned => "mulhiu",
            Self::Div => "div",
            Self::DivUnsigned => "divu",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Not => "not",
            Self::Neg => "neg",
            Self::Abs => "abs",
            Self::Shl => "shl",
            Self::Shr => "shr",
            Self::Sar => "sar",
            Self::Rotl => "rotl",
            Self::Sext => "sext",
            Self::Zext => "zext",
            Self::Clz => "clz",
            Self::Bswap => "bswap",
            Self::Cmp(_) => "cmp",
            Self::Select => "select",
            Self::AddCarryIn => "adc",
            Self::CarryOut => "carry",
            Self::CarryOutWithCarry => "adc.carry",
            Self::BorrowOut => "borrow",
            Self::AddOverflow => "add.ov",
            Self::SubOverflow => "sub.ov",
            Self::LoadContext => "ld.ctx",
            Self::StoreContext => "st.ctx",
            Self::LoadLocal => "ld.local",
            Self::StoreLocal => "st.local",
            Self::LoadMem => "ld",
            Self::StoreMem => "st",
            Self::Call => "call",
            Self::CallIndirect => "call.ind",
            Self::CallExtern => "call.ext",
            Self::Trap => "trap",
            Self::DebugBreak => "brk",
            Self::SetReturnAddress => "set.ret",
            Self::Jump => "jmp",
            Self::Return => "ret",
        }
    }

    /// Whether the instruction must be followed by a check for a pending exception.
    pub fn may_raise(self) -> bool {
        matches!(
            self,
            Self::LoadMem
                | Self::StoreMem
                | Self::Call
                | Self::CallIndirect
                | Self::CallExtern
                | Self::DebugBreak
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum LirOperand {
    #[default]
    None,
    Reg(VReg),
    Imm(u64),
    Label(LirLabelId),
}

impl LirOperand {
    pub fn as_reg(&self) -> Option<VReg> {
        match self {
            Self::Reg(r) => Some(*r),
            _ => None,
        }
    }
}

impl std::fmt::Display for LirOperand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("_"),
            Self::Reg(r) => write!(f, "{r}"),
            Self::Imm(x) => write!(f, "{x:#x}"),
            Self::Label(l) => write!(f, "{l}"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LirInstr {
    pub id: LirInstrId,
    pub block: LirBlockId,
    pub opcode: LirOpcode,
    /// The width the operation is performed at.
    pub ty: TypeName,
    /// The width of the operands, for extensions and comparisons.
    pub src_ty: TypeName,
    pub dest: Option<VReg>,
    pub src: [LirOperand; 3],
    /// When set, the instruction only executes if the register is non-zero.
    pub guard: Option<VReg>,
    pub next: Option<LirInstrId>,
    pub prev: Option<LirInstrId>,
    pub ordinal: u32,
}

impl LirInstr {
    /// Iterate over every register read by the instruction, including the guard.
    pub fn uses(&self) -> impl Iterator<Item = VReg> + '_ {
        self.src.iter().filter_map(|x| x.as_reg()).chain(self.guard)
    }
}

#[derive(Clone, Debug)]
pub struct LirBlock {
    pub id: LirBlockId,
    pub label: LirLabelId,
    pub next: Option<LirBlockId>,
    pub prev: Option<LirBlockId>,
    pub instr_head: Option<LirInstrId>,
    pub instr_tail: Option<LirInstrId>,
}

#[derive(Clone, Debug)]
pub struct LirLabel {
    pub id: LirLabelId,
    pub block: LirBlockId,
}

/// A template for a new instruction.
#[derive(Clone, Copy, Debug)]
pub struct InstrDesc {
    pub opcode: LirOpcode,
    pub ty: TypeName,
    pub src_ty: TypeName,
    pub dest: Option<VReg>,
    pub src: [LirOperand; 3],
    pub guard: Option<VReg>,
}

impl InstrDesc {
    pub fn new(opcode: LirOpcode, ty: TypeName) -> Self {
        Self { opcode, ty, src_ty: ty, dest: None, src: [LirOperand::None; 3], guard: None }
    }

    pub fn dest(mut self, dest: VReg) -> Self {
        self.dest = Some(dest);
        self
    }

    pub fn src(mut self, src: [LirOperand; 3]) -> Self {
        self.src = src;
        self
    }

    pub fn src_ty(mut self, ty: TypeName) -> Self {
        self.src_ty = ty;
        self
    }

    pub fn guard(mut self, guard: Option<VReg>) -> Self {
        self.guard = guard;
        self
    }
}

/// A function lowered to LIR.
#[derive(Debug)]
pub struct Lir {
    pub address: u32,
    blocks: Vec<LirBlock>,
    instrs: Vec<LirInstr>,
    labels: Vec<LirLabel>,
    first_block: Option<LirBlockId>,
    last_block: Option<LirBlockId>,
    vreg_count: u32,
    /// The number of local slots, stored after the spill slots in the spill area.
    pub local_count: u32,
}

impl Lir {
    pub fn new(address: u32, vreg_count: u32) -> Self {
        Self {
            address,
            blocks: vec![],
            instrs: vec![],
            labels: vec![],
            first_block: None,
            last_block: None,
            vreg_count,
            local_count: 0,
        }
    }

    #[inline]
    pub fn block(&self, id: LirBlockId) -> &LirBlock {
        &self.blocks[id.index()]
    }

    #[inline]
    pub fn instr(&self, id: LirInstrId) -> &LirInstr {
        &self.instrs[id.index()]
    }

    #[inline]
    pub fn instr_mut(&mut self, id: LirInstrId) -> &mut LirInstr {
        &mut self.instrs[id.index()]
    }

    #[inline]
    pub fn label_block(&self, label: LirLabelId) -> LirBlockId {
        self.labels[label.index()].block
    }

    pub fn first_block(&self) -> Option<LirBlockId> {
        self.first_block
    }

    pub fn vreg_count(&self) -> usize {
        self.vreg_count as usize
    }

    pub fn new_vreg(&mut self) -> VReg {
        let reg = VReg(self.vreg_count);
        self.vreg_count += 1;
        reg
    }

    /// Appends a new block (and its label) to the end of the function.
    pub fn append_block(&mut self) -> LirBlockId {
        let id = LirBlockId(self.blocks.len() as u32);
        let label = LirLabelId(self.labels.len() as u32);
        self.labels.push(LirLabel { id: label, block: id });
        self.blocks.push(LirBlock {
            id,
            label,
            next: None,
            prev: self.last_block,
            instr_head: None,
            instr_tail: None,
        });
        match self.last_block {
            Some(last) => self.blocks[last.index()].next = Some(id),
            None => self.first_block = Some(id),
        }
        self.last_block = Some(id);
        id
    }

    pub fn push(&mut self, block: LirBlockId, desc: InstrDesc) -> LirInstrId {
        let id = LirInstrId(self.instrs.len() as u32);
        let prev = self.blocks[block.index()].instr_tail;
        self.instrs.push(LirInstr {
            id,
            block,
            opcode: desc.opcode,
            ty: desc.ty,
            src_ty: desc.src_ty,
            dest: desc.dest,
            src: desc.src,
            guard: desc.guard,
            next: None,
            prev,
            ordinal: 0,
        });
        match prev {
            Some(prev) => self.instrs[prev.index()].next = Some(id),
            None => self.blocks[block.index()].instr_head = Some(id),
        }
        self.blocks[block.index()].instr_tail = Some(id);
        id
    }

    pub fn block_ids(&self) -> Vec<LirBlockId> {
        let mut out = vec![];
        let mut next = self.first_block;
        while let Some(block) = next {
            out.push(block);
            next = self.blocks[block.index()].next;
        }
        out
    }

    pub fn instr_ids(&self, block: LirBlockId) -> Vec<LirInstrId> {
        let mut out = vec![];
        let mut next = self.blocks[block.index()].instr_head;
        while let Some(instr) = next {
            out.push(instr);
            next = self.instrs[instr.index()].next;
        }
        out
    }

    pub fn all_instrs(&self) -> Vec<LirInstrId> {
        self.block_ids().into_iter().flat_map(|block| self.instr_ids(block)).collect()
    }

    pub fn instr_count(&self) -> usize {
        self.instrs.len()
    }

    /// Numbers instructions in layout order. Returns the number of instructions.
    pub fn assign_ordinals(&mut self) -> u32 {
        let mut ordinal = 0;
        for instr in self.all_instrs() {
            self.instrs[instr.index()].ordinal = ordinal;
            ordinal += 1;
        }
        ordinal
    }

    /// Panics if the instruction chain of `block` contains a cycle.
    pub fn assert_no_cycles(&self, block: LirBlockId) {
        let next = |x: Option<LirInstrId>| x.and_then(|i| self.instrs[i.index()].next);
        let mut slow = self.blocks[block.index()].instr_head;
        let mut fast = next(slow);
        while let Some(f) = fast {
            if Some(f) == slow {
                panic!("{:#x}: instruction cycle in {block} at {f}", self.address);
            }
            slow = next(slow);
            fast = next(next(fast));
        }
    }
}

impl std::fmt::Display for LirInstr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(dest) = self.dest {
            write!(f, "{dest} = ")?;
        }
        match self.opcode {
            LirOpcode::Cmp(cond) => write!(f, "cmp.{}.{}", cond.name(), self.src_ty)?,
            LirOpcode::Sext | LirOpcode::Zext => {
                write!(f, "{}.{}.{}", self.opcode.name(), self.src_ty, self.ty)?
            }
            op => write!(f, "{}.{}", op.name(), self.ty)?,
        }
        for src in self.src.iter().filter(|x| **x != LirOperand::None) {
            write!(f, " {src}")?;
        }
        if let Some(guard) = self.guard {
            write!(f, " if {guard}")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Lir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for block in self.block_ids() {
            writeln!(f, "{}:", self.block(block).label)?;
            for instr in self.instr_ids(block) {
                writeln!(f, "  {}", self.instr(instr))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layout_and_display() {
        let mut lir = Lir::new(0x8200_0000, 2);
        let b0 = lir.append_block();
        let b1 = lir.append_block();
        let sum = lir.new_vreg();
        lir.push(
            b0,
            InstrDesc::new(LirOpcode::Add, TypeName::I32)
                .dest(sum)
                .src([LirOperand::Reg(VReg(0)), LirOperand::Imm(4), LirOperand::None]),
        );
        let label = lir.block(b1).label;
        lir.push(
            b0,
            InstrDesc::new(LirOpcode::Jump, TypeName::I64)
                .src([LirOperand::Label(label), LirOperand::None, LirOperand::None])
                .guard(Some(VReg(1))),
        );
        lir.push(b1, InstrDesc::new(LirOpcode::Return, TypeName::I64));

        assert_eq!(sum, VReg(2));
        assert_eq!(lir.assign_ordinals(), 3);
        assert_eq!(lir.label_block(label), b1);
        assert_eq!(
            lir.to_string(),
            "L0:\n  %2 = add.i32 %0 0x4\n  jmp.i64 L1 if %1\nL1:\n  ret.i64\n"
        );
        lir.assert_no_cycles(b0);
    }

    #[test]
    #[should_panic(expected = "instruction cycle")]
    fn cycle_is_detected() {
        let mut lir = Lir::new(0, 0);
        let b0 = lir.append_block();
        let a = lir.push(b0, InstrDesc::new(LirOpcode::Return, TypeName::I64));
        let b = lir.push(b0, InstrDesc::new(LirOpcode::Return, TypeName::I64));
        lir.instr_mut(b).next = Some(a);
        lir.assert_no_cycles(b0);
    }
}
