//! Helpers for appending instructions to a function.
//!
//! Instructions are appended to the *current* block. Unconditional and conditional branches end
//! the current block; the next instruction appended starts a new one.

use crate::{BlockId, Function, InstrId, LabelId, Opcode, Operand, TypeName, ValueId};

/// Codes carried by `trap` instructions.
pub mod trap_code {
    /// The instruction could not be translated.
    pub const UNIMPLEMENTED: u64 = 1;
    /// A guest `tw`/`twi` trap.
    pub const TRAP: u64 = 2;
    /// A guest `sc` without a resolved handler.
    pub const SYSCALL: u64 = 3;
    /// The word at this address is not a valid instruction.
    pub const INVALID_INSTRUCTION: u64 = 4;
}

/// Owns a function while it is being built.
pub struct FunctionBuilder {
    func: Function,
}

impl FunctionBuilder {
    pub fn new(address: u32) -> Self {
        Self { func: Function::new(address) }
    }

    pub fn finish(self) -> Function {
        self.func
    }
}

impl std::ops::Deref for FunctionBuilder {
    type Target = Function;

    fn deref(&self) -> &Self::Target {
        &self.func
    }
}

impl std::ops::DerefMut for FunctionBuilder {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.func
    }
}

macro_rules! binary_ops {
    ($($fn_name:ident => $op:ident),* $(,)?) => {
        $(
            pub fn $fn_name(&mut self, a: ValueId, b: ValueId) -> ValueId {
                self.check_same_type(a, b, Opcode::$op);
                let ty = self.ty(a);
                self.append_value(Opcode::$op, ty, [a.into(), b.into(), Operand::None])
            }
        )*
    };
}

macro_rules! compare_ops {
    ($($fn_name:ident => $op:ident),* $(,)?) => {
        $(
            pub fn $fn_name(&mut self, a: ValueId, b: ValueId) -> ValueId {
                self.check_same_type(a, b, Opcode::$op);
                self.append_value(Opcode::$op, TypeName::I8, [a.into(), b.into(), Operand::None])
            }
        )*
    };
}

macro_rules! unary_ops {
    ($($fn_name:ident => $op:ident),* $(,)?) => {
        $(
            pub fn $fn_name(&mut self, a: ValueId) -> ValueId {
                let ty = self.ty(a);
                self.append_value(Opcode::$op, ty, [a.into(), Operand::None, Operand::None])
            }
        )*
    };
}

impl Function {
    #[inline]
    fn check_same_type(&self, a: ValueId, b: ValueId, op: Opcode) {
        debug_assert_eq!(self.ty(a), self.ty(b), "type mismatch for {op:?}: {a} and {b}");
    }

    /// Returns the block instructions are appended to, creating it if needed.
    pub fn current_block(&mut self) -> BlockId {
        match self.current_block {
            Some(block) => block,
            None => {
                let block = self.insert_block(None);
                self.current_block = Some(block);
                block
            }
        }
    }

    /// Starts a new block at the end of the function.
    pub fn append_block(&mut self) -> BlockId {
        let block = self.insert_block(None);
        self.current_block = Some(block);
        block
    }

    /// Ends the current block: the next instruction starts a new block.
    pub fn end_block(&mut self) {
        self.current_block = None;
    }

    /// Binds `label` to the current position. A new block is started unless the current block is
    /// still empty.
    pub fn mark_label(&mut self, label: LabelId) {
        let block = match self.current_block {
            Some(block) if self.block(block).is_empty() => block,
            _ => self.append_block(),
        };
        self.attach_label(label, block);
    }

    /// Binds `label` to the position directly after `after`, splitting its block.
    pub fn insert_label(&mut self, label: LabelId, after: InstrId) {
        let block = self.instr(after).block;
        let target = match self.instr(after).next {
            Some(_) => self.split_block_after(after),
            None => match self.block(block).next {
                Some(next) if self.block(next).is_empty() => next,
                _ => self.insert_block(Some(block)),
            },
        };
        self.attach_label(label, target);
    }

    pub fn append(&mut self, opcode: Opcode, dest: Option<TypeName>, src: [Operand; 3]) -> InstrId {
        let block = self.current_block();
        let instr = self.push_instr(block, opcode, dest, src);
        if matches!(
            opcode,
            Opcode::Branch
                | Opcode::BranchTrue
                | Opcode::BranchFalse
                | Opcode::Return
                | Opcode::ReturnTrue
        ) {
            self.end_block();
        }
        instr
    }

    pub fn append_value(&mut self, opcode: Opcode, ty: TypeName, src: [Operand; 3]) -> ValueId {
        let instr = self.append(opcode, Some(ty), src);
        match self.instr(instr).dest {
            Some(value) => value,
            None => unreachable!(),
        }
    }

    //
    // Constants
    //

    pub fn load_constant(&mut self, ty: TypeName, bits: u128) -> ValueId {
        let value = self.alloc_value(ty);
        self.value_mut(value).set_constant(bits);
        value
    }

    pub fn load_zero(&mut self, ty: TypeName) -> ValueId {
        self.load_constant(ty, 0)
    }

    pub fn const_i8(&mut self, value: u8) -> ValueId {
        self.load_constant(TypeName::I8, value as u128)
    }

    pub fn const_i16(&mut self, value: u16) -> ValueId {
        self.load_constant(TypeName::I16, value as u128)
    }

    pub fn const_i32(&mut self, value: u32) -> ValueId {
        self.load_constant(TypeName::I32, value as u128)
    }

    pub fn const_i64(&mut self, value: u64) -> ValueId {
        self.load_constant(TypeName::I64, value as u128)
    }

    pub fn const_f32(&mut self, value: f32) -> ValueId {
        self.load_constant(TypeName::F32, value.to_bits() as u128)
    }

    pub fn const_f64(&mut self, value: f64) -> ValueId {
        self.load_constant(TypeName::F64, value.to_bits() as u128)
    }

    /// A constant with the same type as `like`.
    pub fn const_like(&mut self, like: ValueId, bits: u128) -> ValueId {
        let ty = self.ty(like);
        self.load_constant(ty, bits)
    }

    //
    // Meta
    //

    pub fn comment(&mut self, text: impl Into<String>) {
        let index = self.add_comment(text);
        self.append(Opcode::Comment, None, [Operand::Comment(index), Operand::None, Operand::None]);
    }

    pub fn nop(&mut self) {
        self.append(Opcode::Nop, None, [Operand::None; 3]);
    }

    pub fn source_offset(&mut self, address: u32) {
        self.append(
            Opcode::SourceOffset,
            None,
            [Operand::Offset(address as u64), Operand::None, Operand::None],
        );
    }

    pub fn debug_break(&mut self, address: u32) {
        self.append(
            Opcode::DebugBreak,
            None,
            [Operand::Offset(address as u64), Operand::None, Operand::None],
        );
    }

    pub fn debug_break_true(&mut self, cond: ValueId, address: u32) {
        self.append(
            Opcode::DebugBreakTrue,
            None,
            [cond.into(), Operand::Offset(address as u64), Operand::None],
        );
    }

    pub fn trap(&mut self, code: u64, address: u32) {
        self.append(
            Opcode::Trap,
            None,
            [Operand::Offset(code), Operand::Offset(address as u64), Operand::None],
        );
    }

    pub fn trap_true(&mut self, cond: ValueId, code: u64, address: u32) {
        self.append(Opcode::TrapTrue, None, [
            cond.into(),
            Operand::Offset(code),
            Operand::Offset(address as u64),
        ]);
    }

    //
    // Calls and control flow
    //

    pub fn call(&mut self, target: u32) {
        self.append(Opcode::Call, None, [Operand::Symbol(target), Operand::None, Operand::None]);
    }

    pub fn call_true(&mut self, cond: ValueId, target: u32) {
        self.append(Opcode::CallTrue, None, [cond.into(), Operand::Symbol(target), Operand::None]);
    }

    pub fn call_indirect(&mut self, target: ValueId) {
        self.append(Opcode::CallIndirect, None, [target.into(), Operand::None, Operand::None]);
    }

    pub fn call_indirect_true(&mut self, cond: ValueId, target: ValueId) {
        self.append(Opcode::CallIndirectTrue, None, [cond.into(), target.into(), Operand::None]);
    }

    pub fn call_extern(&mut self, index: u32) {
        self.append(
            Opcode::CallExtern,
            None,
            [Operand::Extern(index), Operand::None, Operand::None],
        );
    }

    pub fn ret(&mut self) {
        self.append(Opcode::Return, None, [Operand::None; 3]);
    }

    pub fn ret_true(&mut self, cond: ValueId) {
        self.append(Opcode::ReturnTrue, None, [cond.into(), Operand::None, Operand::None]);
    }

    pub fn set_return_address(&mut self, value: ValueId) {
        self.append(Opcode::SetReturnAddress, None, [value.into(), Operand::None, Operand::None]);
    }

    pub fn branch(&mut self, label: LabelId) {
        self.append(Opcode::Branch, None, [label.into(), Operand::None, Operand::None]);
    }

    pub fn branch_true(&mut self, cond: ValueId, label: LabelId) {
        self.append(Opcode::BranchTrue, None, [cond.into(), label.into(), Operand::None]);
    }

    pub fn branch_false(&mut self, cond: ValueId, label: LabelId) {
        self.append(Opcode::BranchFalse, None, [cond.into(), label.into(), Operand::None]);
    }

    //
    // Type conversions
    //

    pub fn assign(&mut self, value: ValueId) -> ValueId {
        let ty = self.ty(value);
        self.append_value(Opcode::Assign, ty, [value.into(), Operand::None, Operand::None])
    }

    /// Reinterprets the bits of `value` as `ty` (which must have the same size).
    pub fn cast(&mut self, value: ValueId, ty: TypeName) -> ValueId {
        debug_assert_eq!(self.ty(value).size(), ty.size());
        self.append_value(Opcode::Cast, ty, [value.into(), Operand::None, Operand::None])
    }

    pub fn zero_extend(&mut self, value: ValueId, ty: TypeName) -> ValueId {
        if self.ty(value) == ty {
            return value;
        }
        self.append_value(Opcode::ZeroExtend, ty, [value.into(), Operand::None, Operand::None])
    }

    pub fn sign_extend(&mut self, value: ValueId, ty: TypeName) -> ValueId {
        if self.ty(value) == ty {
            return value;
        }
        self.append_value(Opcode::SignExtend, ty, [value.into(), Operand::None, Operand::None])
    }

    pub fn truncate(&mut self, value: ValueId, ty: TypeName) -> ValueId {
        if self.ty(value) == ty {
            return value;
        }
        self.append_value(Opcode::Truncate, ty, [value.into(), Operand::None, Operand::None])
    }

    /// Numeric conversion between integer and float types, or between float widths.
    pub fn convert(&mut self, value: ValueId, ty: TypeName) -> ValueId {
        self.append_value(Opcode::Convert, ty, [value.into(), Operand::None, Operand::None])
    }

    //
    // Locals, context and memory
    //

    /// Allocates a new local slot of type `ty`.
    pub fn alloc_local(&mut self, ty: TypeName) -> u64 {
        self.locals.push(ty);
        self.locals.len() as u64 - 1
    }

    pub fn load_local(&mut self, slot: u64) -> ValueId {
        let ty = self.locals[slot as usize];
        self.append_value(
            Opcode::LoadLocal,
            ty,
            [Operand::Offset(slot), Operand::None, Operand::None],
        )
    }

    pub fn store_local(&mut self, slot: u64, value: ValueId) {
        self.append(Opcode::StoreLocal, None, [Operand::Offset(slot), value.into(), Operand::None]);
    }

    pub fn load_context(&mut self, offset: usize, ty: TypeName) -> ValueId {
        self.append_value(
            Opcode::LoadContext,
            ty,
            [Operand::Offset(offset as u64), Operand::None, Operand::None],
        )
    }

    pub fn store_context(&mut self, offset: usize, value: ValueId) {
        self.append(
            Opcode::StoreContext,
            None,
            [Operand::Offset(offset as u64), value.into(), Operand::None],
        );
    }

    /// Big-endian guest load from `address`.
    pub fn load(&mut self, address: ValueId, ty: TypeName) -> ValueId {
        self.append_value(Opcode::Load, ty, [address.into(), Operand::None, Operand::None])
    }

    /// Big-endian guest store of `value` to `address`.
    pub fn store(&mut self, address: ValueId, value: ValueId) {
        self.append(Opcode::Store, None, [address.into(), value.into(), Operand::None]);
    }

    //
    // Arithmetic and logic
    //

    pub fn select(&mut self, cond: ValueId, a: ValueId, b: ValueId) -> ValueId {
        self.check_same_type(a, b, Opcode::Select);
        let ty = self.ty(a);
        self.append_value(Opcode::Select, ty, [cond.into(), a.into(), b.into()])
    }

    pub fn is_true(&mut self, value: ValueId) -> ValueId {
        self.append_value(
            Opcode::IsTrue,
            TypeName::I8,
            [value.into(), Operand::None, Operand::None],
        )
    }

    pub fn is_false(&mut self, value: ValueId) -> ValueId {
        self.append_value(
            Opcode::IsFalse,
            TypeName::I8,
            [value.into(), Operand::None, Operand::None],
        )
    }

    compare_ops! {
        compare_eq => CompareEq,
        compare_ne => CompareNe,
        compare_slt => CompareSlt,
        compare_sle => CompareSle,
        compare_sgt => CompareSgt,
        compare_sge => CompareSge,
        compare_ult => CompareUlt,
        compare_ule => CompareUle,
        compare_ugt => CompareUgt,
        compare_uge => CompareUge,
        add_carry_out => AddCarryOut,
        sub_carry_out => SubCarryOut,
        add_overflow => AddOverflow,
        sub_overflow => SubOverflow,
    }

    binary_ops! {
        add => Add,
        sub => Sub,
        mul => Mul,
        mul_hi => MulHi,
        mul_hi_unsigned => MulHiUnsigned,
        div => Div,
        div_unsigned => DivUnsigned,
        and => And,
        or => Or,
        xor => Xor,
    }

    unary_ops! {
        neg => Neg,
        abs => Abs,
        sqrt => Sqrt,
        not => Not,
        byte_swap => ByteSwap,
    }

    /// `a + b + carry`, where `carry` is an `i8` boolean.
    pub fn add_with_carry(&mut self, a: ValueId, b: ValueId, carry: ValueId) -> ValueId {
        self.check_same_type(a, b, Opcode::AddWithCarry);
        let ty = self.ty(a);
        self.append_value(Opcode::AddWithCarry, ty, [a.into(), b.into(), carry.into()])
    }

    /// Carry out of `a + b + carry`.
    pub fn adc_carry_out(&mut self, a: ValueId, b: ValueId, carry: ValueId) -> ValueId {
        self.check_same_type(a, b, Opcode::AdcCarryOut);
        self.append_value(Opcode::AdcCarryOut, TypeName::I8, [a.into(), b.into(), carry.into()])
    }

    pub fn mul_add(&mut self, a: ValueId, b: ValueId, c: ValueId) -> ValueId {
        let ty = self.ty(a);
        self.append_value(Opcode::MulAdd, ty, [a.into(), b.into(), c.into()])
    }

    pub fn mul_sub(&mut self, a: ValueId, b: ValueId, c: ValueId) -> ValueId {
        let ty = self.ty(a);
        self.append_value(Opcode::MulSub, ty, [a.into(), b.into(), c.into()])
    }

    /// Shift amounts may have any integer type; they are taken modulo the bit width of `value`.
    pub fn shl(&mut self, value: ValueId, amount: ValueId) -> ValueId {
        let ty = self.ty(value);
        self.append_value(Opcode::Shl, ty, [value.into(), amount.into(), Operand::None])
    }

    pub fn shr(&mut self, value: ValueId, amount: ValueId) -> ValueId {
        let ty = self.ty(value);
        self.append_value(Opcode::Shr, ty, [value.into(), amount.into(), Operand::None])
    }

    pub fn sha(&mut self, value: ValueId, amount: ValueId) -> ValueId {
        let ty = self.ty(value);
        self.append_value(Opcode::Sha, ty, [value.into(), amount.into(), Operand::None])
    }

    pub fn rotate_left(&mut self, value: ValueId, amount: ValueId) -> ValueId {
        let ty = self.ty(value);
        self.append_value(Opcode::RotateLeft, ty, [value.into(), amount.into(), Operand::None])
    }

    pub fn count_leading_zeros(&mut self, value: ValueId) -> ValueId {
        self.append_value(
            Opcode::CountLeadingZeros,
            TypeName::I8,
            [value.into(), Operand::None, Operand::None],
        )
    }

    //
    // Common immediate forms
    //

    pub fn add_imm(&mut self, value: ValueId, imm: u64) -> ValueId {
        let imm = self.const_like(value, imm as u128);
        self.add(value, imm)
    }

    pub fn and_imm(&mut self, value: ValueId, imm: u64) -> ValueId {
        let imm = self.const_like(value, imm as u128);
        self.and(value, imm)
    }

    pub fn or_imm(&mut self, value: ValueId, imm: u64) -> ValueId {
        let imm = self.const_like(value, imm as u128);
        self.or(value, imm)
    }

    pub fn xor_imm(&mut self, value: ValueId, imm: u64) -> ValueId {
        let imm = self.const_like(value, imm as u128);
        self.xor(value, imm)
    }

    pub fn shl_imm(&mut self, value: ValueId, amount: u8) -> ValueId {
        let amount = self.const_i8(amount);
        self.shl(value, amount)
    }

    pub fn shr_imm(&mut self, value: ValueId, amount: u8) -> ValueId {
        let amount = self.const_i8(amount);
        self.shr(value, amount)
    }

    pub fn sha_imm(&mut self, value: ValueId, amount: u8) -> ValueId {
        let amount = self.const_i8(amount);
        self.sha(value, amount)
    }

    pub fn rotate_left_imm(&mut self, value: ValueId, amount: u8) -> ValueId {
        let amount = self.const_i8(amount);
        self.rotate_left(value, amount)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn branches_end_blocks() {
        let mut f = FunctionBuilder::new(0x8200_0000);
        let label = f.new_label();
        let a = f.const_i64(1);
        let cond = f.is_true(a);
        f.branch_true(cond, label);
        f.nop();
        f.mark_label(label);
        f.ret();

        let blocks = f.block_ids();
        assert_eq!(blocks.len(), 3);
        assert_eq!(f.label(label).block, Some(blocks[2]));
        assert_eq!(f.instr_ids(blocks[1]).len(), 1);
    }

    #[test]
    fn mark_label_reuses_empty_block() {
        let mut f = FunctionBuilder::new(0x8200_0000);
        let first = f.append_block();
        let label = f.new_label();
        f.mark_label(label);
        assert_eq!(f.label(label).block, Some(first));
        assert_eq!(f.block_ids(), vec![first]);
    }

    #[test]
    fn insert_label_splits_block() {
        let mut f = FunctionBuilder::new(0x8200_0000);
        f.source_offset(0x8200_0000);
        let a = f.load_context(0, TypeName::I64);
        f.source_offset(0x8200_0004);
        f.store_context(8, a);
        f.ret();

        let block = f.first_block().unwrap();
        let instrs = f.instr_ids(block);
        let label = f.new_label();
        f.insert_label(label, instrs[1]);

        let blocks = f.block_ids();
        assert_eq!(blocks.len(), 2);
        assert_eq!(f.label(label).block, Some(blocks[1]));
        assert_eq!(f.instr_ids(blocks[1]), &instrs[2..]);
    }

    #[test]
    fn calls_do_not_end_blocks() {
        let mut f = FunctionBuilder::new(0x8200_0000);
        f.call(0x8200_1000);
        f.call_extern(3);
        f.ret();
        assert_eq!(f.block_ids().len(), 1);
    }
}
