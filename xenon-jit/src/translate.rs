//! Translation of register allocated LIR to Cranelift IR.
//!
//! Every virtual register is kept zero extended to 64 bits, either in a Cranelift variable (one
//! per host register) or in a slot of the spill area passed in by the caller. Operations narrow
//! their inputs to the width they work on and widen the result again.

use cranelift::{
    codegen::ir::{FuncRef, Function, SourceLoc},
    prelude::*,
};
use cranelift_jit::JITModule;
use cranelift_module::{FuncId, Module};
use memoffset::offset_of;
use xenon_cpu::{Exception, ThreadState};
use xenon_hir::TypeName;

use crate::{
    lir::{Cond, Lir, LirInstr, LirOpcode, LirOperand, VReg},
    regalloc::{Allocation, Location},
    MemHandler, RuntimeFunctions,
};

/// `FunctionBuilder::is_filled` is private in cranelift-frontend 0.107; a block is filled once it
/// ends in a terminator instruction.
trait BlockFilled {
    fn is_filled(&self) -> bool;
}

impl BlockFilled for FunctionBuilder<'_> {
    fn is_filled(&self) -> bool {
        self.current_block()
            .and_then(|block| self.func.layout.last_inst(block))
            .map_or(false, |inst| self.func.dfg.insts[inst].opcode().is_terminator())
    }
}

const EXCEPTION_CODE_OFFSET: i32 =
    (offset_of!(ThreadState, exception) + offset_of!(Exception, code)) as i32;
const EXCEPTION_VALUE_OFFSET: i32 =
    (offset_of!(ThreadState, exception) + offset_of!(Exception, value)) as i32;
const RETURN_ADDRESS_OFFSET: i32 = offset_of!(ThreadState, return_address) as i32;

impl MemHandler<FuncRef> {
    fn import(module: &mut JITModule, current: &mut Function, funcs: &MemHandler<FuncId>) -> Self {
        Self {
            load8: module.declare_func_in_func(funcs.load8, current),
            load16: module.declare_func_in_func(funcs.load16, current),
            load32: module.declare_func_in_func(funcs.load32, current),
            load64: module.declare_func_in_func(funcs.load64, current),
            store8: module.declare_func_in_func(funcs.store8, current),
            store16: module.declare_func_in_func(funcs.store16, current),
            store32: module.declare_func_in_func(funcs.store32, current),
            store64: module.declare_func_in_func(funcs.store64, current),
        }
    }

    fn load(&self, ty: TypeName) -> FuncRef {
        match ty.size() {
            1 => self.load8,
            2 => self.load16,
            4 => self.load32,
            _ => self.load64,
        }
    }

    fn store(&self, ty: TypeName) -> FuncRef {
        match ty.size() {
            1 => self.store8,
            2 => self.store16,
            4 => self.store32,
            _ => self.store64,
        }
    }
}

struct Symbols {
    mmu: MemHandler<FuncRef>,
    call: FuncRef,
    call_extern: FuncRef,
    debug_break: FuncRef,
}

impl Symbols {
    fn import(module: &mut JITModule, current: &mut Function, funcs: &RuntimeFunctions) -> Self {
        Self {
            mmu: MemHandler::import(module, current, &funcs.mmu),
            call: module.declare_func_in_func(funcs.call, current),
            call_extern: module.declare_func_in_func(funcs.call_extern, current),
            debug_break: module.declare_func_in_func(funcs.debug_break, current),
        }
    }
}

fn clif_type(ty: TypeName) -> Type {
    match ty {
        TypeName::I8 => types::I8,
        TypeName::I16 => types::I16,
        TypeName::I32 => types::I32,
        _ => types::I64,
    }
}

fn int_cc(cond: Cond) -> IntCC {
    match cond {
        Cond::Eq => IntCC::Equal,
        Cond::Ne => IntCC::NotEqual,
        Cond::Slt => IntCC::SignedLessThan,
        Cond::Sle => IntCC::SignedLessThanOrEqual,
        Cond::Sgt => IntCC::SignedGreaterThan,
        Cond::Sge => IntCC::SignedGreaterThanOrEqual,
        Cond::Ult => IntCC::UnsignedLessThan,
        Cond::Ule => IntCC::UnsignedLessThanOrEqual,
        Cond::Ugt => IntCC::UnsignedGreaterThan,
        Cond::Uge => IntCC::UnsignedGreaterThanOrEqual,
    }
}

fn imm(operand: LirOperand) -> u64 {
    match operand {
        LirOperand::Imm(x) => x,
        _ => 0,
    }
}

struct Translator<'a, 'b> {
    builder: FunctionBuilder<'b>,
    lir: &'a Lir,
    alloc: &'a Allocation,
    symbols: Symbols,
    thread: Value,
    spill: Value,
    regs: Vec<Variable>,
    blocks: Vec<Block>,
    exit: Block,
}

impl<'a, 'b> Translator<'a, 'b> {
    fn read_reg(&mut self, reg: VReg) -> Value {
        match self.alloc.location(reg) {
            Some(Location::Reg(r)) => self.builder.use_var(self.regs[r as usize]),
            Some(Location::Spill(slot)) => {
                let offset = (slot * 8) as i32;
                self.builder.ins().load(types::I64, MemFlags::trusted(), self.spill, offset)
            }
            None => self.builder.ins().iconst(types::I64, 0),
        }
    }

    fn write_reg(&mut self, reg: VReg, value: Value) {
        match self.alloc.location(reg) {
            Some(Location::Reg(r)) => self.builder.def_var(self.regs[r as usize], value),
            Some(Location::Spill(slot)) => {
                let offset = (slot * 8) as i32;
                self.builder.ins().store(MemFlags::trusted(), value, self.spill, offset);
            }
            None => {}
        }
    }

    fn local_offset(&self, slot: u64) -> i32 {
        ((self.alloc.spill_slots as u64 + slot) * 8) as i32
    }

    fn operand(&mut self, operand: LirOperand) -> Value {
        match operand {
            LirOperand::Reg(reg) => self.read_reg(reg),
            LirOperand::Imm(x) => self.builder.ins().iconst(types::I64, x as i64),
            LirOperand::None | LirOperand::Label(_) => self.builder.ins().iconst(types::I64, 0),
        }
    }

    /// Reads `operand` as a value of type `ty`.
    fn narrow(&mut self, operand: LirOperand, ty: TypeName) -> Value {
        let value = self.operand(operand);
        match ty {
            TypeName::I64 => value,
            _ => self.builder.ins().ireduce(clif_type(ty), value),
        }
    }

    /// Reads `operand` as a value of type `ty` sign extended to 64 bits.
    fn sext(&mut self, operand: LirOperand, ty: TypeName) -> Value {
        let value = self.narrow(operand, ty);
        match ty {
            TypeName::I64 => value,
            _ => self.builder.ins().sextend(types::I64, value),
        }
    }

    fn widen(&mut self, value: Value, ty: TypeName) -> Value {
        match ty {
            TypeName::I64 => value,
            _ => self.builder.ins().uextend(types::I64, value),
        }
    }

    /// Clears the bits of a 64-bit value that are outside of `ty`.
    fn mask(&mut self, value: Value, ty: TypeName) -> Value {
        match ty {
            TypeName::I64 => value,
            _ => self.builder.ins().band_imm(value, ty.mask() as i64),
        }
    }

    fn bool_to_i64(&mut self, value: Value) -> Value {
        self.builder.ins().uextend(types::I64, value)
    }

    /// Exits the function if the last runtime call raised an exception.
    fn check_exception(&mut self) {
        let code = self.builder.ins().load(
            types::I32,
            MemFlags::trusted(),
            self.thread,
            EXCEPTION_CODE_OFFSET,
        );
        let next = self.builder.create_block();
        self.builder.ins().brif(code, self.exit, &[], next, &[]);
        self.builder.switch_to_block(next);
    }

    fn call(&mut self, func: FuncRef, args: &[Value]) -> Option<Value> {
        let inst = self.builder.ins().call(func, args);
        self.builder.inst_results(inst).first().copied()
    }

    fn translate_instr(&mut self, instr: &LirInstr) {
        let skip = match instr.guard {
            Some(guard) => {
                let cond = self.read_reg(guard);
                let then = self.builder.create_block();
                let skip = self.builder.create_block();
                self.builder.ins().brif(cond, then, &[], skip, &[]);
                self.builder.switch_to_block(then);
                Some(skip)
            }
            None => None,
        };

        let result = self.translate_op(instr);
        if let (Some(dest), Some(value)) = (instr.dest, result) {
            self.write_reg(dest, value);
        }
        if instr.opcode.may_raise() {
            self.check_exception();
        }

        if let Some(skip) = skip {
            if !self.builder.is_filled() {
                self.builder.ins().jump(skip, &[]);
            }
            self.builder.switch_to_block(skip);
        }
    }

    fn translate_op(&mut self, instr: &LirInstr) -> Option<Value> {
        use LirOpcode as Op;

        let ty = instr.ty;
        let [a, b, c] = instr.src;
        let value = match instr.opcode {
            Op::Mov => self.operand(a),
            Op::Add | Op::Sub | Op::Mul | Op::And | Op::Or | Op::Xor => {
                let x = self.narrow(a, ty);
                let y = self.narrow(b, ty);
                let r = match instr.opcode {
                    Op::Add => self.builder.ins().iadd(x, y),
                    Op::Sub => self.builder.ins().isub(x, y),
                    Op::Mul => self.builder.ins().imul(x, y),
                    Op::And => self.builder.ins().band(x, y),
                    Op::Or => self.builder.ins().bor(x, y),
                    _ => self.builder.ins().bxor(x, y),
                };
                self.widen(r, ty)
            }
            Op::Shl | Op::Shr | Op::Sar | Op::Rotl => {
                // Cranelift masks the shift amount to the width of the shifted value.
                let x = self.narrow(a, ty);
                let amount = self.operand(b);
                let r = match instr.opcode {
                    Op::Shl => self.builder.ins().ishl(x, amount),
                    Op::Shr => self.builder.ins().ushr(x, amount),
                    Op::Sar => self.builder.ins().sshr(x, amount),
                    _ => self.builder.ins().rotl(x, amount),
                };
                self.widen(r, ty)
            }
            Op::MulHi => match ty {
                TypeName::I64 => {
                    let (x, y) = (self.operand(a), self.operand(b));
                    self.builder.ins().smulhi(x, y)
                }
                _ => {
                    let x = self.sext(a, ty);
                    let y = self.sext(b, ty);
                    let product = self.builder.ins().imul(x, y);
                    let high = self.builder.ins().sshr_imm(product, ty.bits() as i64);
                    self.mask(high, ty)
                }
            },
            Op::MulHiUnsigned => {
                let (x, y) = (self.operand(a), self.operand(b));
                match ty {
                    TypeName::I64 => self.builder.ins().umulhi(x, y),
                    _ => {
                        let product = self.builder.ins().imul(x, y);
                        self.builder.ins().ushr_imm(product, ty.bits() as i64)
                    }
                }
            }
            Op::Div | Op::DivUnsigned => {
                let signed = instr.opcode == Op::Div;
                let (x, y) = match signed {
                    true => (self.sext(a, ty), self.sext(b, ty)),
                    false => (self.operand(a), self.operand(b)),
                };
                let by_zero = self.builder.ins().icmp_imm(IntCC::Equal, y, 0);
                let invalid = match signed {
                    true => {
                        let min = self.builder.ins().icmp_imm(IntCC::Equal, x, i64::MIN);
                        let neg_one = self.builder.ins().icmp_imm(IntCC::Equal, y, -1);
                        let overflow = self.builder.ins().band(min, neg_one);
                        self.builder.ins().bor(by_zero, overflow)
                    }
                    false => by_zero,
                };
                // Dividing by one instead yields the wrapped result for `MIN / -1`.
                let one = self.builder.ins().iconst(types::I64, 1);
                let divisor = self.builder.ins().select(invalid, one, y);
                let quotient = match signed {
                    true => self.builder.ins().sdiv(x, divisor),
                    false => self.builder.ins().udiv(x, divisor),
                };
                let zero = self.builder.ins().iconst(types::I64, 0);
                let quotient = self.builder.ins().select(by_zero, zero, quotient);
                self.mask(quotient, ty)
            }
            Op::Not => {
                let x = self.operand(a);
                let r = self.builder.ins().bnot(x);
                self.mask(r, ty)
            }
            Op::Neg => {
                let x = self.operand(a);
                let r = self.builder.ins().ineg(x);
                self.mask(r, ty)
            }
            Op::Abs => {
                let x = self.sext(a, ty);
                let negated = self.builder.ins().ineg(x);
                let negative = self.builder.ins().icmp_imm(IntCC::SignedLessThan, x, 0);
                let r = self.builder.ins().select(negative, negated, x);
                self.mask(r, ty)
            }
            Op::Sext => {
                let x = self.sext(a, instr.src_ty);
                self.mask(x, ty)
            }
            Op::Zext => {
                let x = self.operand(a);
                self.mask(x, ty)
            }
            Op::Clz => {
                let x = self.narrow(a, instr.src_ty);
                let r = self.builder.ins().clz(x);
                self.widen(r, instr.src_ty)
            }
            Op::Bswap => match ty {
                TypeName::I8 => self.operand(a),
                _ => {
                    let x = self.narrow(a, ty);
                    let r = self.builder.ins().bswap(x);
                    self.widen(r, ty)
                }
            },
            Op::Cmp(cond) => {
                let x = self.narrow(a, instr.src_ty);
                let y = self.narrow(b, instr.src_ty);
                let r = self.builder.ins().icmp(int_cc(cond), x, y);
                self.bool_to_i64(r)
            }
            Op::Select => {
                let cond = self.operand(a);
                let (x, y) = (self.operand(b), self.operand(c));
                self.builder.ins().select(cond, x, y)
            }
            Op::AddCarryIn => {
                let x = self.narrow(a, ty);
                let y = self.narrow(b, ty);
                let carry = self.operand(c);
                let carry = self.builder.ins().icmp_imm(IntCC::NotEqual, carry, 0);
                let carry = match ty {
                    TypeName::I8 => carry,
                    _ => self.builder.ins().uextend(clif_type(ty), carry),
                };
                let sum = self.builder.ins().iadd(x, y);
                let sum = self.builder.ins().iadd(sum, carry);
                self.widen(sum, ty)
            }
            Op::CarryOut | Op::CarryOutWithCarry => {
                let (x, y) = (self.operand(a), self.operand(b));
                let carry_in = match instr.opcode {
                    Op::CarryOutWithCarry => {
                        let carry = self.operand(c);
                        let carry = self.builder.ins().icmp_imm(IntCC::NotEqual, carry, 0);
                        Some(self.bool_to_i64(carry))
                    }
                    _ => None,
                };
                let r = match instr.src_ty {
                    TypeName::I64 => {
                        let sum = self.builder.ins().iadd(x, y);
                        let carry = self.builder.ins().icmp(IntCC::UnsignedLessThan, sum, x);
                        match carry_in {
                            Some(carry_in) => {
                                let total = self.builder.ins().iadd(sum, carry_in);
                                let second =
                                    self.builder.ins().icmp(IntCC::UnsignedLessThan, total, sum);
                                self.builder.ins().bor(carry, second)
                            }
                            None => carry,
                        }
                    }
                    src_ty => {
                        let mut sum = self.builder.ins().iadd(x, y);
                        if let Some(carry_in) = carry_in {
                            sum = self.builder.ins().iadd(sum, carry_in);
                        }
                        let mask = src_ty.mask() as i64;
                        self.builder.ins().icmp_imm(IntCC::UnsignedGreaterThan, sum, mask)
                    }
                };
                self.bool_to_i64(r)
            }
            Op::BorrowOut => {
                let (x, y) = (self.operand(a), self.operand(b));
                let r = self.builder.ins().icmp(IntCC::UnsignedGreaterThanOrEqual, x, y);
                self.bool_to_i64(r)
            }
            Op::AddOverflow | Op::SubOverflow => {
                let src_ty = instr.src_ty;
                let x = self.narrow(a, src_ty);
                let y = self.narrow(b, src_ty);
                let sign = match instr.opcode {
                    Op::AddOverflow => {
                        let sum = self.builder.ins().iadd(x, y);
                        let xs = self.builder.ins().bxor(x, sum);
                        let ys = self.builder.ins().bxor(y, sum);
                        self.builder.ins().band(xs, ys)
                    }
                    _ => {
                        let diff = self.builder.ins().isub(x, y);
                        let xy = self.builder.ins().bxor(x, y);
                        let xd = self.builder.ins().bxor(x, diff);
                        self.builder.ins().band(xy, xd)
                    }
                };
                let r = self.builder.ins().icmp_imm(IntCC::SignedLessThan, sign, 0);
                self.bool_to_i64(r)
            }

            Op::LoadContext => {
                let offset = imm(a) as i32;
                let flags = MemFlags::trusted();
                let r = self.builder.ins().load(clif_type(ty), flags, self.thread, offset);
                self.widen(r, ty)
            }
            Op::StoreContext => {
                let offset = imm(a) as i32;
                let value = self.narrow(b, ty);
                self.builder.ins().store(MemFlags::trusted(), value, self.thread, offset);
                return None;
            }
            Op::LoadLocal => {
                let offset = self.local_offset(imm(a));
                self.builder.ins().load(types::I64, MemFlags::trusted(), self.spill, offset)
            }
            Op::StoreLocal => {
                let offset = self.local_offset(imm(a));
                let value = self.operand(b);
                self.builder.ins().store(MemFlags::trusted(), value, self.spill, offset);
                return None;
            }
            Op::LoadMem => {
                let addr = self.operand(a);
                let func = self.symbols.mmu.load(ty);
                return self.call(func, &[self.thread, addr]);
            }
            Op::StoreMem => {
                let addr = self.operand(a);
                let value = self.operand(b);
                let func = self.symbols.mmu.store(ty);
                self.call(func, &[self.thread, addr, value]);
                return None;
            }

            Op::Call | Op::CallIndirect => {
                let target = self.operand(a);
                self.call(self.symbols.call, &[self.thread, target]);
                return None;
            }
            Op::CallExtern => {
                let index = self.operand(a);
                self.call(self.symbols.call_extern, &[self.thread, index]);
                return None;
            }
            Op::DebugBreak => {
                let addr = self.operand(a);
                self.call(self.symbols.debug_break, &[self.thread, addr]);
                return None;
            }
            Op::Trap => {
                let code = self.builder.ins().iconst(types::I32, imm(a) as i64);
                let value = self.operand(b);
                let flags = MemFlags::trusted();
                self.builder.ins().store(flags, code, self.thread, EXCEPTION_CODE_OFFSET);
                self.builder.ins().store(flags, value, self.thread, EXCEPTION_VALUE_OFFSET);
                self.builder.ins().jump(self.exit, &[]);
                return None;
            }
            Op::SetReturnAddress => {
                let value = self.operand(a);
                let flags = MemFlags::trusted();
                self.builder.ins().store(flags, value, self.thread, RETURN_ADDRESS_OFFSET);
                return None;
            }
            Op::Jump => {
                let target = match a {
                    LirOperand::Label(label) => self.blocks[self.lir.label_block(label).index()],
                    _ => self.exit,
                };
                self.builder.ins().jump(target, &[]);
                return None;
            }
            Op::Return => {
                self.builder.ins().jump(self.exit, &[]);
                return None;
            }
        };
        Some(value)
    }
}

/// Translates `lir` into the function being built by `builder`, using the register assignment in
/// `alloc`. The function takes the thread state and the spill area as its two parameters.
pub(crate) fn translate(
    module: &mut JITModule,
    mut builder: FunctionBuilder,
    functions: &RuntimeFunctions,
    lir: &Lir,
    alloc: &Allocation,
) {
    let symbols = Symbols::import(module, &mut *builder.func, functions);

    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    let thread = builder.block_params(entry)[0];
    let spill = builder.block_params(entry)[1];

    let mut regs = Vec::with_capacity(alloc.host_regs);
    let zero = builder.ins().iconst(types::I64, 0);
    for i in 0..alloc.host_regs {
        let var = Variable::from_u32(i as u32);
        builder.declare_var(var, types::I64);
        builder.def_var(var, zero);
        regs.push(var);
    }

    let order = lir.block_ids();
    let blocks: Vec<Block> = order.iter().map(|_| builder.create_block()).collect();
    let exit = builder.create_block();
    match lir.first_block() {
        Some(first) => builder.ins().jump(blocks[first.index()], &[]),
        None => builder.ins().jump(exit, &[]),
    };

    let mut trans = Translator { builder, lir, alloc, symbols, thread, spill, regs, blocks, exit };
    for (i, block) in order.iter().enumerate() {
        trans.builder.switch_to_block(trans.blocks[block.index()]);
        for id in lir.instr_ids(*block) {
            if trans.builder.is_filled() {
                // Code after an unconditional exit is unreachable but still needs a block.
                let dead = trans.builder.create_block();
                trans.builder.switch_to_block(dead);
            }
            let instr = lir.instr(id);
            trans.builder.set_srcloc(SourceLoc::new(instr.ordinal));
            trans.translate_instr(instr);
        }
        if !trans.builder.is_filled() {
            let next = order.get(i + 1).map_or(trans.exit, |b| trans.blocks[b.index()]);
            trans.builder.ins().jump(next, &[]);
        }
    }

    trans.builder.switch_to_block(exit);
    trans.builder.set_srcloc(SourceLoc::default());
    trans.builder.ins().return_(&[]);
    trans.builder.seal_all_blocks();
    trans.builder.finalize();
}
