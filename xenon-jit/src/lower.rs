//! Lowering of HIR to LIR through a table of patterns keyed by opcode and operand types.
//!
//! Only integer operations are lowered. Instructions without a pattern (floating point and vector
//! arithmetic, 128-bit context accesses) make the whole function fall back to the interpreter.

use hashbrown::HashMap;
use xenon_cpu::{AssembleError, ExceptionCode};
use xenon_hir::{
    BlockId, Function, Instr, LabelId, Opcode, OpcodeFlags, OpcodeTable, Operand, TypeName,
};

use crate::lir::{Cond, InstrDesc, Lir, LirBlockId, LirOpcode, LirOperand, VReg};

/// The types of the destination and of each value operand of an instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Shape {
    pub dest: Option<TypeName>,
    pub src: [Option<TypeName>; 3],
}

impl Shape {
    pub const fn new(dest: Option<TypeName>, src: [Option<TypeName>; 3]) -> Self {
        Self { dest, src }
    }

    pub fn of(func: &Function, instr: &Instr) -> Self {
        Self {
            dest: instr.dest.map(|x| func.ty(x)),
            src: instr.src.map(|x| x.as_value().map(|v| func.ty(v))),
        }
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = |x: Option<TypeName>| x.map_or("_", |x| x.name());
        write!(
            f,
            "{} <- ({}, {}, {})",
            name(self.dest),
            name(self.src[0]),
            name(self.src[1]),
            name(self.src[2])
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LowerError {
    NoPattern { opcode: Opcode, shape: Shape },
    UnboundLabel(LabelId),
}

impl std::fmt::Display for LowerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoPattern { opcode, shape } => {
                write!(f, "no lowering pattern for `{}` with {shape}", opcode.name())
            }
            Self::UnboundLabel(label) => write!(f, "branch to unbound {label}"),
        }
    }
}

impl std::error::Error for LowerError {}

impl From<LowerError> for AssembleError {
    fn from(err: LowerError) -> Self {
        match err {
            LowerError::NoPattern { opcode, shape } => {
                AssembleError::NoPattern { opcode, ty: shape.dest.or(shape.src[0]) }
            }
            LowerError::UnboundLabel(_) => AssembleError::Unsupported(err.to_string()),
        }
    }
}

pub type LowerFn = fn(&mut LowerCtx, &Instr) -> Result<(), LowerError>;

/// Whether a conditional instruction executes.
enum Guard {
    Always,
    Never,
    If(VReg),
}

pub struct LowerCtx<'a> {
    pub func: &'a Function,
    pub lir: Lir,
    block: LirBlockId,
    blocks: HashMap<BlockId, LirBlockId>,
}

impl<'a> LowerCtx<'a> {
    #[inline]
    fn dest(&self, instr: &Instr) -> VReg {
        VReg(instr.dest.map_or(0, |x| x.0))
    }

    fn ty(&self, instr: &Instr, slot: usize) -> TypeName {
        instr.src[slot].as_value().map_or(TypeName::I64, |v| self.func.ty(v))
    }

    fn dest_ty(&self, instr: &Instr) -> TypeName {
        instr.dest.map_or(TypeName::I64, |v| self.func.ty(v))
    }

    fn operand(&self, instr: &Instr, slot: usize) -> Result<LirOperand, LowerError> {
        Ok(match instr.src[slot] {
            Operand::None | Operand::Comment(_) => LirOperand::None,
            Operand::Value(v) => match self.func.value(v).const_bits() {
                Some(bits) => LirOperand::Imm(bits as u64),
                None => LirOperand::Reg(VReg(v.0)),
            },
            Operand::Offset(x) => LirOperand::Imm(x),
            Operand::Symbol(x) | Operand::Extern(x) => LirOperand::Imm(x as u64),
            Operand::Label(label) => {
                let target = self
                    .func
                    .label(label)
                    .block
                    .and_then(|b| self.blocks.get(&b))
                    .ok_or(LowerError::UnboundLabel(label))?;
                LirOperand::Label(self.lir.block(*target).label)
            }
        })
    }

    fn operands(&self, instr: &Instr) -> Result<[LirOperand; 3], LowerError> {
        Ok([self.operand(instr, 0)?, self.operand(instr, 1)?, self.operand(instr, 2)?])
    }

    fn guard(&self, instr: &Instr) -> Result<Guard, LowerError> {
        Ok(match self.operand(instr, 0)? {
            LirOperand::Reg(reg) => Guard::If(reg),
            LirOperand::Imm(0) => Guard::Never,
            _ => Guard::Always,
        })
    }

    fn emit(&mut self, desc: InstrDesc) {
        self.lir.push(self.block, desc);
    }

    /// Emits `desc` with its condition taken from the first operand of `instr`, and its operands
    /// from the remaining ones.
    fn emit_conditional(&mut self, instr: &Instr, desc: InstrDesc) -> Result<(), LowerError> {
        let guard = match self.guard(instr)? {
            Guard::Never => return Ok(()),
            Guard::Always => None,
            Guard::If(reg) => Some(reg),
        };
        let [_, a, b] = self.operands(instr)?;
        self.emit(desc.src([a, b, LirOperand::None]).guard(guard));
        Ok(())
    }
}

fn no_pattern(ctx: &LowerCtx, instr: &Instr) -> LowerError {
    LowerError::NoPattern { opcode: instr.opcode, shape: Shape::of(ctx.func, instr) }
}

fn lower_binary(ctx: &mut LowerCtx, instr: &Instr) -> Result<(), LowerError> {
    let op = match instr.opcode {
        Opcode::Add => LirOpcode::Add,
        Opcode::Sub => LirOpcode::Sub,
        Opcode::Mul => LirOpcode::Mul,
        Opcode::MulHi => LirOpcode::MulHi,
        Opcode::MulHiUnsigned => LirOpcode::MulHiUnsigned,
        Opcode::Div => LirOpcode::Div,
        Opcode::DivUnsigned => LirOpcode::DivUnsigned,
        Opcode::And => LirOpcode::And,
        Opcode::Or => LirOpcode::Or,
        Opcode::Xor => LirOpcode::Xor,
        Opcode::Shl => LirOpcode::Shl,
        Opcode::Shr => LirOpcode::Shr,
        Opcode::Sha => LirOpcode::Sar,
        Opcode::RotateLeft => LirOpcode::Rotl,
        _ => return Err(no_pattern(ctx, instr)),
    };
    let src = ctx.operands(instr)?;
    let desc = InstrDesc::new(op, ctx.dest_ty(instr)).dest(ctx.dest(instr)).src(src);
    ctx.emit(desc);
    Ok(())
}

fn lower_compare(ctx: &mut LowerCtx, instr: &Instr) -> Result<(), LowerError> {
    let op = match instr.opcode {
        Opcode::CompareEq => LirOpcode::Cmp(Cond::Eq),
        Opcode::CompareNe => LirOpcode::Cmp(Cond::Ne),
        Opcode::CompareSlt => LirOpcode::Cmp(Cond::Slt),
        Opcode::CompareSle => LirOpcode::Cmp(Cond::Sle),
        Opcode::CompareSgt => LirOpcode::Cmp(Cond::Sgt),
        Opcode::CompareSge => LirOpcode::Cmp(Cond::Sge),
        Opcode::CompareUlt => LirOpcode::Cmp(Cond::Ult),
        Opcode::CompareUle => LirOpcode::Cmp(Cond::Ule),
        Opcode::CompareUgt => LirOpcode::Cmp(Cond::Ugt),
        Opcode::CompareUge => LirOpcode::Cmp(Cond::Uge),
        Opcode::AddCarryOut => LirOpcode::CarryOut,
        Opcode::SubCarryOut => LirOpcode::BorrowOut,
        Opcode::AddOverflow => LirOpcode::AddOverflow,
        Opcode::SubOverflow => LirOpcode::SubOverflow,
        _ => return Err(no_pattern(ctx, instr)),
    };
    let desc = InstrDesc::new(op, TypeName::I8)
        .src_ty(ctx.ty(instr, 0))
        .dest(ctx.dest(instr))
        .src(ctx.operands(instr)?);
    ctx.emit(desc);
    Ok(())
}

fn lower_unary(ctx: &mut LowerCtx, instr: &Instr) -> Result<(), LowerError> {
    let src_ty = ctx.ty(instr, 0);
    let [a, _, _] = ctx.operands(instr)?;
    let zero = LirOperand::Imm(0);
    let (op, src) = match instr.opcode {
        Opcode::Assign | Opcode::Cast => (LirOpcode::Mov, [a, LirOperand::None, LirOperand::None]),
        Opcode::Not => (LirOpcode::Not, [a, LirOperand::None, LirOperand::None]),
        Opcode::Neg => (LirOpcode::Neg, [a, LirOperand::None, LirOperand::None]),
        Opcode::Abs => (LirOpcode::Abs, [a, LirOperand::None, LirOperand::None]),
        Opcode::ByteSwap => (LirOpcode::Bswap, [a, LirOperand::None, LirOperand::None]),
        Opcode::CountLeadingZeros => (LirOpcode::Clz, [a, LirOperand::None, LirOperand::None]),
        Opcode::ZeroExtend | Opcode::Truncate => {
            (LirOpcode::Zext, [a, LirOperand::None, LirOperand::None])
        }
        Opcode::SignExtend => (LirOpcode::Sext, [a, LirOperand::None, LirOperand::None]),
        Opcode::IsTrue => (LirOpcode::Cmp(Cond::Ne), [a, zero, LirOperand::None]),
        Opcode::IsFalse => (LirOpcode::Cmp(Cond::Eq), [a, zero, LirOperand::None]),
        _ => return Err(no_pattern(ctx, instr)),
    };
    let desc =
        InstrDesc::new(op, ctx.dest_ty(instr)).src_ty(src_ty).dest(ctx.dest(instr)).src(src);
    ctx.emit(desc);
    Ok(())
}

fn lower_ternary(ctx: &mut LowerCtx, instr: &Instr) -> Result<(), LowerError> {
    let op = match instr.opcode {
        Opcode::Select => LirOpcode::Select,
        Opcode::AddWithCarry => LirOpcode::AddCarryIn,
        Opcode::AdcCarryOut => LirOpcode::CarryOutWithCarry,
        _ => return Err(no_pattern(ctx, instr)),
    };
    let src_ty = match op {
        LirOpcode::Select => ctx.ty(instr, 1),
        _ => ctx.ty(instr, 0),
    };
    let desc = InstrDesc::new(op, ctx.dest_ty(instr))
        .src_ty(src_ty)
        .dest(ctx.dest(instr))
        .src(ctx.operands(instr)?);
    ctx.emit(desc);
    Ok(())
}

fn lower_load(ctx: &mut LowerCtx, instr: &Instr) -> Result<(), LowerError> {
    let op = match instr.opcode {
        Opcode::LoadContext => LirOpcode::LoadContext,
        Opcode::LoadLocal => LirOpcode::LoadLocal,
        Opcode::Load => LirOpcode::LoadMem,
        _ => return Err(no_pattern(ctx, instr)),
    };
    let src = ctx.operands(instr)?;
    let desc = InstrDesc::new(op, ctx.dest_ty(instr)).dest(ctx.dest(instr)).src(src);
    ctx.emit(desc);
    Ok(())
}

fn lower_store(ctx: &mut LowerCtx, instr: &Instr) -> Result<(), LowerError> {
    let op = match instr.opcode {
        Opcode::StoreContext => LirOpcode::StoreContext,
        Opcode::StoreLocal => LirOpcode::StoreLocal,
        Opcode::Store => LirOpcode::StoreMem,
        _ => return Err(no_pattern(ctx, instr)),
    };
    ctx.emit(InstrDesc::new(op, ctx.ty(instr, 1)).src(ctx.operands(instr)?));
    Ok(())
}

fn lower_call(ctx: &mut LowerCtx, instr: &Instr) -> Result<(), LowerError> {
    let i64 = TypeName::I64;
    match instr.opcode {
        Opcode::Call => ctx.emit(InstrDesc::new(LirOpcode::Call, i64).src(ctx.operands(instr)?)),
        Opcode::CallIndirect => {
            ctx.emit(InstrDesc::new(LirOpcode::CallIndirect, i64).src(ctx.operands(instr)?))
        }
        Opcode::CallExtern => {
            ctx.emit(InstrDesc::new(LirOpcode::CallExtern, i64).src(ctx.operands(instr)?))
        }
        Opcode::CallTrue => ctx.emit_conditional(instr, InstrDesc::new(LirOpcode::Call, i64))?,
        Opcode::CallIndirectTrue => {
            ctx.emit_conditional(instr, InstrDesc::new(LirOpcode::CallIndirect, i64))?
        }
        Opcode::SetReturnAddress => {
            ctx.emit(InstrDesc::new(LirOpcode::SetReturnAddress, i64).src(ctx.operands(instr)?))
        }
        _ => return Err(no_pattern(ctx, instr)),
    }
    Ok(())
}

fn lower_trap(ctx: &mut LowerCtx, instr: &Instr) -> Result<(), LowerError> {
    let i64 = TypeName::I64;
    let exception = |code: LirOperand| match code {
        LirOperand::Imm(code) => LirOperand::Imm(ExceptionCode::from_trap_code(code) as u64),
        other => other,
    };
    match instr.opcode {
        Opcode::Trap => {
            let [code, addr, _] = ctx.operands(instr)?;
            let src = [exception(code), addr, LirOperand::None];
            ctx.emit(InstrDesc::new(LirOpcode::Trap, i64).src(src));
        }
        Opcode::TrapTrue => {
            let guard = match ctx.guard(instr)? {
                Guard::Never => return Ok(()),
                Guard::Always => None,
                Guard::If(reg) => Some(reg),
            };
            let [_, code, addr] = ctx.operands(instr)?;
            let src = [exception(code), addr, LirOperand::None];
            ctx.emit(InstrDesc::new(LirOpcode::Trap, i64).src(src).guard(guard));
        }
        Opcode::DebugBreak => {
            ctx.emit(InstrDesc::new(LirOpcode::DebugBreak, i64).src(ctx.operands(instr)?))
        }
        Opcode::DebugBreakTrue => {
            ctx.emit_conditional(instr, InstrDesc::new(LirOpcode::DebugBreak, i64))?
        }
        _ => return Err(no_pattern(ctx, instr)),
    }
    Ok(())
}

fn lower_branch(ctx: &mut LowerCtx, instr: &Instr) -> Result<(), LowerError> {
    let i64 = TypeName::I64;
    match instr.opcode {
        Opcode::Branch => ctx.emit(InstrDesc::new(LirOpcode::Jump, i64).src(ctx.operands(instr)?)),
        Opcode::BranchTrue => ctx.emit_conditional(instr, InstrDesc::new(LirOpcode::Jump, i64))?,
        Opcode::BranchFalse => {
            let [cond, target, _] = ctx.operands(instr)?;
            let guard = match cond {
                LirOperand::Reg(reg) => {
                    let inverted = ctx.lir.new_vreg();
                    let cond_ty = ctx.ty(instr, 0);
                    ctx.emit(
                        InstrDesc::new(LirOpcode::Cmp(Cond::Eq), TypeName::I8)
                            .src_ty(cond_ty)
                            .dest(inverted)
                            .src([cond, LirOperand::Imm(0), LirOperand::None]),
                    );
                    Some(inverted)
                }
                LirOperand::Imm(0) => None,
                _ => return Ok(()),
            };
            let src = [target, LirOperand::None, LirOperand::None];
            ctx.emit(InstrDesc::new(LirOpcode::Jump, i64).src(src).guard(guard));
        }
        Opcode::Return => ctx.emit(InstrDesc::new(LirOpcode::Return, i64)),
        Opcode::ReturnTrue => match ctx.guard(instr)? {
            Guard::Never => {}
            Guard::Always => ctx.emit(InstrDesc::new(LirOpcode::Return, i64)),
            Guard::If(reg) => ctx.emit(InstrDesc::new(LirOpcode::Return, i64).guard(Some(reg))),
        },
        _ => return Err(no_pattern(ctx, instr)),
    }
    Ok(())
}

const INTS: [TypeName; 4] = [TypeName::I8, TypeName::I16, TypeName::I32, TypeName::I64];

/// Maps HIR opcodes and operand shapes to the routine that lowers them.
pub struct LoweringTable {
    patterns: HashMap<(Opcode, Shape), LowerFn>,
}

impl Default for LoweringTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LoweringTable {
    pub fn new() -> Self {
        let mut table = Self { patterns: HashMap::new() };
        table.register_integer_ops();
        table.register_memory_ops();
        table.register_control_ops();
        table
    }

    pub fn register(&mut self, opcode: Opcode, shape: Shape, lower: LowerFn) {
        self.patterns.insert((opcode, shape), lower);
    }

    pub fn lookup(&self, opcode: Opcode, shape: &Shape) -> Option<LowerFn> {
        self.patterns.get(&(opcode, *shape)).copied()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    fn register_integer_ops(&mut self) {
        use Opcode::*;

        for ty in INTS {
            let t = Some(ty);
            let i8 = Some(TypeName::I8);

            for op in [Add, Sub, Mul, MulHi, MulHiUnsigned, Div, DivUnsigned, And, Or, Xor] {
                self.register(op, Shape::new(t, [t, t, None]), lower_binary);
            }
            for op in [Shl, Shr, Sha, RotateLeft] {
                for amount in INTS {
                    self.register(op, Shape::new(t, [t, Some(amount), None]), lower_binary);
                }
            }
            for op in [
                CompareEq,
                CompareNe,
                CompareSlt,
                CompareSle,
                CompareSgt,
                CompareSge,
                CompareUlt,
                CompareUle,
                CompareUgt,
                CompareUge,
                AddCarryOut,
                SubCarryOut,
                AddOverflow,
                SubOverflow,
            ] {
                self.register(op, Shape::new(i8, [t, t, None]), lower_compare);
            }
            for op in [Assign, Cast, Not, Neg, Abs, ByteSwap] {
                self.register(op, Shape::new(t, [t, None, None]), lower_unary);
            }
            for op in [CountLeadingZeros, IsTrue, IsFalse] {
                self.register(op, Shape::new(i8, [t, None, None]), lower_unary);
            }
            for src in INTS {
                let shape = Shape::new(t, [Some(src), None, None]);
                if src.size() < ty.size() {
                    self.register(ZeroExtend, shape, lower_unary);
                    self.register(SignExtend, shape, lower_unary);
                }
                if src.size() > ty.size() {
                    self.register(Truncate, shape, lower_unary);
                }
            }
            for cond in INTS {
                self.register(Select, Shape::new(t, [Some(cond), t, t]), lower_ternary);
            }
            self.register(AddWithCarry, Shape::new(t, [t, t, i8]), lower_ternary);
            self.register(AdcCarryOut, Shape::new(i8, [t, t, i8]), lower_ternary);
        }
    }

    fn register_memory_ops(&mut self) {
        let i64 = Some(TypeName::I64);
        for ty in INTS {
            let t = Some(ty);
            self.register(Opcode::LoadContext, Shape::new(t, [None; 3]), lower_load);
            self.register(Opcode::LoadLocal, Shape::new(t, [None; 3]), lower_load);
            self.register(Opcode::Load, Shape::new(t, [i64, None, None]), lower_load);
            self.register(Opcode::StoreContext, Shape::new(None, [None, t, None]), lower_store);
            self.register(Opcode::StoreLocal, Shape::new(None, [None, t, None]), lower_store);
            self.register(Opcode::Store, Shape::new(None, [i64, t, None]), lower_store);
        }
    }

    fn register_control_ops(&mut self) {
        use Opcode::*;

        let i64 = Some(TypeName::I64);
        let none = Shape::new(None, [None; 3]);

        self.register(Trap, none, lower_trap);
        self.register(DebugBreak, none, lower_trap);
        self.register(Call, none, lower_call);
        self.register(CallExtern, none, lower_call);
        self.register(CallIndirect, Shape::new(None, [i64, None, None]), lower_call);
        self.register(SetReturnAddress, Shape::new(None, [i64, None, None]), lower_call);
        self.register(Branch, none, lower_branch);
        self.register(Return, none, lower_branch);

        for cond in INTS {
            let c = Some(cond);
            self.register(TrapTrue, Shape::new(None, [c, None, None]), lower_trap);
            self.register(DebugBreakTrue, Shape::new(None, [c, None, None]), lower_trap);
            self.register(CallTrue, Shape::new(None, [c, None, None]), lower_call);
            self.register(CallIndirectTrue, Shape::new(None, [c, i64, None]), lower_call);
            self.register(BranchTrue, Shape::new(None, [c, None, None]), lower_branch);
            self.register(BranchFalse, Shape::new(None, [c, None, None]), lower_branch);
            self.register(ReturnTrue, Shape::new(None, [c, None, None]), lower_branch);
        }
    }

    /// Lowers every instruction of `func`, failing on the first one without a pattern.
    pub fn lower(&self, func: &Function, table: &OpcodeTable) -> Result<Lir, LowerError> {
        let mut lir = Lir::new(func.address, func.value_count() as u32);
        lir.local_count = func.locals.len() as u32;

        let hir_blocks = func.block_ids();
        let mut blocks = HashMap::with_capacity(hir_blocks.len());
        for block in &hir_blocks {
            blocks.insert(*block, lir.append_block());
        }

        let Some(first) = lir.first_block() else { return Ok(lir) };
        let mut ctx = LowerCtx { func, lir, block: first, blocks };
        for block in hir_blocks {
            ctx.block = ctx.blocks[&block];
            for id in func.instr_ids(block) {
                let instr = func.instr(id);
                if table.flags(instr.opcode).contains(OpcodeFlags::IGNORE) {
                    continue;
                }
                let shape = Shape::of(func, instr);
                let Some(lower) = self.lookup(instr.opcode, &shape) else {
                    return Err(LowerError::NoPattern { opcode: instr.opcode, shape });
                };
                lower(&mut ctx, instr)?;
            }
        }

        tracing::trace!(
            "{:#x}: lowered {} hir instructions to {} lir instructions",
            func.address,
            func.instr_count(table),
            ctx.lir.instr_count()
        );
        Ok(ctx.lir)
    }
}

#[cfg(test)]
mod test {
    use xenon_cpu::context::{fpr_offset, gpr_offset, vr_offset};
    use xenon_hir::FunctionBuilder;

    use super::*;

    fn lower(f: FunctionBuilder) -> Result<Lir, LowerError> {
        LoweringTable::new().lower(&f.finish(), &OpcodeTable::new())
    }

    #[test]
    fn integer_function_is_lowered() {
        let mut f = FunctionBuilder::new(0x8200_0000);
        let a = f.load_context(gpr_offset(3), TypeName::I64);
        let b = f.load_context(gpr_offset(4), TypeName::I64);
        let sum = f.add(a, b);
        f.store_context(gpr_offset(3), sum);
        f.ret();

        let lir = lower(f).unwrap();
        assert_eq!(
            lir.to_string(),
            "L0:\n  %0 = ld.ctx.i64 0x18\n  %1 = ld.ctx.i64 0x20\n  %2 = add.i64 %0 %1\n  \
             st.ctx.i64 0x18 %2\n  ret.i64\n"
        );
    }

    #[test]
    fn constants_become_immediates() {
        let mut f = FunctionBuilder::new(0x8200_0000);
        let a = f.load_context(gpr_offset(3), TypeName::I32);
        let b = f.add_imm(a, 8);
        f.store_context(gpr_offset(3), b);
        f.ret();

        let lir = lower(f).unwrap();
        let add = lir.all_instrs()[1];
        assert_eq!(lir.instr(add).src[1], LirOperand::Imm(8));
    }

    #[test]
    fn float_arithmetic_has_no_pattern() {
        let mut f = FunctionBuilder::new(0x8200_0000);
        let a = f.load_context(fpr_offset(1), TypeName::F64);
        let b = f.add(a, a);
        f.store_context(fpr_offset(1), b);
        f.ret();

        let err = lower(f).unwrap_err();
        assert!(matches!(err, LowerError::NoPattern { opcode: Opcode::LoadContext, .. }));
        let AssembleError::NoPattern { ty, .. } = AssembleError::from(err) else { panic!() };
        assert_eq!(ty, Some(TypeName::F64));
    }

    #[test]
    fn vector_context_access_has_no_pattern() {
        let mut f = FunctionBuilder::new(0x8200_0000);
        let v = f.load_context(vr_offset(0), TypeName::V128);
        f.store_context(vr_offset(1), v);
        f.ret();
        assert!(lower(f).is_err());
    }

    #[test]
    fn conditional_branches() {
        let mut f = FunctionBuilder::new(0x8200_0000);
        let a = f.load_context(gpr_offset(3), TypeName::I64);
        let zero = f.const_i64(0);
        let cond = f.compare_eq(a, zero);
        let skip = f.new_label();
        f.branch_false(cond, skip);
        f.call(0x8200_1000);
        f.mark_label(skip);
        f.ret();

        let lir = lower(f).unwrap();
        let ops: Vec<_> = lir.all_instrs().into_iter().map(|x| lir.instr(x).opcode).collect();
        assert_eq!(ops, vec![
            LirOpcode::LoadContext,
            LirOpcode::Cmp(Cond::Eq),
            LirOpcode::Cmp(Cond::Eq),
            LirOpcode::Jump,
            LirOpcode::Call,
            LirOpcode::Return,
        ]);
        let jump = lir.instr(lir.all_instrs()[3]);
        assert_eq!(jump.guard, lir.instr(lir.all_instrs()[2]).dest);
    }
}
