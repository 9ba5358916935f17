use std::sync::Arc;

use xenon_hir::{eval, Arena, Function, Opcode, OpcodeFlags, OpcodeTable, Operand, TypeName};

use crate::{
    backend::{AssembleError, Assembler, BackendKind, EntryPoint},
    debug_info::DebugInfo,
    mem::{Endian, MemResult, Memory},
    thread::ExceptionCode,
    ThreadState,
};

#[derive(Clone, Copy, Debug)]
enum Arg {
    None,
    Value(u32, TypeName),
    Const(u128, TypeName),
    /// An offset, symbol address or extern index.
    Imm(u64),
    /// Index of the first operation of a branch target.
    Target(u32),
}

impl Arg {
    fn ty(&self) -> TypeName {
        match self {
            Self::Value(_, ty) | Self::Const(_, ty) => *ty,
            _ => TypeName::I64,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Op {
    opcode: Opcode,
    dest: Option<(u32, TypeName)>,
    args: [Arg; 3],
}

/// A function flattened into a linear list of operations, with branch targets resolved to
/// operation indices.
#[derive(Debug)]
pub struct InterpreterFunction {
    pub address: u32,
    ops: Vec<Op>,
    value_count: usize,
    local_count: usize,
}

impl InterpreterFunction {
    pub fn new(func: &Function, table: &OpcodeTable) -> Result<Self, AssembleError> {
        let skip = |opcode: Opcode| table.flags(opcode).contains(OpcodeFlags::IGNORE);

        // Branch targets refer to the first operation emitted for the target block.
        let blocks = func.block_ids();
        let mut block_start = vec![0_u32; blocks.iter().map(|x| x.index() + 1).max().unwrap_or(0)];
        let mut count = 0;
        for block in blocks {
            block_start[block.index()] = count;
            count += func.instr_ids(block).iter().filter(|x| !skip(func.instr(**x).opcode)).count()
                as u32;
        }

        let mut ops = Vec::with_capacity(count as usize);
        for instr in func.all_instrs() {
            let i = func.instr(instr);
            if skip(i.opcode) {
                continue;
            }

            let mut args = [Arg::None; 3];
            for (arg, operand) in args.iter_mut().zip(&i.src) {
                *arg = match *operand {
                    Operand::None | Operand::Comment(_) => Arg::None,
                    Operand::Value(v) => {
                        let value = func.value(v);
                        match value.const_bits() {
                            Some(bits) => Arg::Const(bits, value.ty),
                            None => Arg::Value(v.0, value.ty),
                        }
                    }
                    Operand::Label(label) => match func.label(label).block {
                        Some(block) => Arg::Target(block_start[block.index()]),
                        None => {
                            return Err(AssembleError::Unsupported(format!("unbound {label}")))
                        }
                    },
                    Operand::Offset(x) => Arg::Imm(x),
                    Operand::Symbol(x) | Operand::Extern(x) => Arg::Imm(x as u64),
                };
            }

            let op = Op { opcode: i.opcode, dest: i.dest.map(|x| (x.0, func.ty(x))), args };
            check_supported(&op)?;
            ops.push(op);
        }

        Ok(Self {
            address: func.address,
            ops,
            value_count: func.value_count(),
            local_count: func.locals.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Evaluation only depends on the opcode and the operand types, so probing with zero operands
/// tells whether an operation can be executed.
fn check_supported(op: &Op) -> Result<(), AssembleError> {
    let Some((_, dest)) = op.dest else { return Ok(()) };
    let supported = match op.opcode {
        Opcode::LoadContext | Opcode::LoadLocal | Opcode::Load => true,
        _ => evaluate(op, dest, [0; 3]).is_some(),
    };
    match supported {
        true => Ok(()),
        false => Err(AssembleError::NoPattern { opcode: op.opcode, ty: Some(op.args[0].ty()) }),
    }
}

fn evaluate(op: &Op, dest: TypeName, x: [u128; 3]) -> Option<u128> {
    match op.args {
        [a, Arg::None, _] => eval::eval_unary(op.opcode, dest, a.ty(), x[0]),
        [a, _, Arg::None] => eval::eval_binary(op.opcode, a.ty(), x[0], x[1]),
        [a, _, _] => {
            let ty = if op.opcode == Opcode::Select { dest } else { a.ty() };
            eval::eval_ternary(op.opcode, ty, x[0], x[1], x[2])
        }
    }
}

fn load(memory: &dyn Memory, addr: u32, ty: TypeName) -> MemResult<u128> {
    Ok(match ty.size() {
        1 => memory.read_u8(addr)? as u128,
        2 => memory.read_u16(addr, Endian::Big)? as u128,
        4 => memory.read_u32(addr, Endian::Big)? as u128,
        8 => memory.read_u64(addr, Endian::Big)? as u128,
        _ => memory.read_u128(addr, Endian::Big)?,
    })
}

fn store(memory: &dyn Memory, addr: u32, ty: TypeName, value: u128) -> MemResult<()> {
    match ty.size() {
        1 => memory.write_u8(addr, value as u8),
        2 => memory.write_u16(addr, value as u16, Endian::Big),
        4 => memory.write_u32(addr, value as u32, Endian::Big),
        8 => memory.write_u64(addr, value as u64, Endian::Big),
        _ => memory.write_u128(addr, value, Endian::Big),
    }
}

/// Runs `func` to completion on `thread`. Returns early, with `thread.exception` set, if any
/// operation raises an exception.
pub fn interpret(thread: &mut ThreadState, func: &InterpreterFunction) {
    let processor = thread.processor.clone();
    let mut values = vec![0_u128; func.value_count];
    let mut locals = vec![0_u128; func.local_count];

    let mut pc = 0;
    while let Some(op) = func.ops.get(pc) {
        pc += 1;

        let read = |arg: Arg| match arg {
            Arg::None => 0,
            Arg::Value(index, _) => values[index as usize],
            Arg::Const(bits, _) => bits,
            Arg::Imm(x) => x as u128,
            Arg::Target(x) => x as u128,
        };
        let x = [read(op.args[0]), read(op.args[1]), read(op.args[2])];
        let target = |arg: Arg| match arg {
            Arg::Target(x) => x as usize,
            _ => usize::MAX,
        };

        let result = match op.opcode {
            Opcode::DebugBreak | Opcode::DebugBreakTrue => {
                let (cond, addr) = match op.opcode {
                    Opcode::DebugBreak => (true, x[0]),
                    _ => (x[0] != 0, x[1]),
                };
                if cond {
                    processor.debug_break(thread, addr as u32);
                    if !thread.exception.is_none() {
                        return;
                    }
                }
                None
            }
            Opcode::Trap => {
                thread.raise(ExceptionCode::from_trap_code(x[0] as u64), x[1] as u64);
                return;
            }
            Opcode::TrapTrue => {
                if x[0] != 0 {
                    thread.raise(ExceptionCode::from_trap_code(x[1] as u64), x[2] as u64);
                    return;
                }
                None
            }

            Opcode::Call | Opcode::CallIndirect | Opcode::CallTrue | Opcode::CallIndirectTrue => {
                let (cond, addr) = match op.opcode {
                    Opcode::Call | Opcode::CallIndirect => (true, x[0]),
                    _ => (x[0] != 0, x[1]),
                };
                if cond {
                    processor.call(thread, addr as u32);
                    if !thread.exception.is_none() {
                        return;
                    }
                }
                None
            }
            Opcode::CallExtern => {
                processor.call_extern(thread, x[0] as u32);
                if !thread.exception.is_none() {
                    return;
                }
                None
            }
            Opcode::Return => return,
            Opcode::ReturnTrue => {
                if x[0] != 0 {
                    return;
                }
                None
            }
            Opcode::SetReturnAddress => {
                thread.return_address = x[0] as u64;
                None
            }

            Opcode::Branch => {
                pc = target(op.args[0]);
                None
            }
            Opcode::BranchTrue | Opcode::BranchFalse => {
                if (x[0] != 0) == (op.opcode == Opcode::BranchTrue) {
                    pc = target(op.args[1]);
                }
                None
            }

            Opcode::LoadLocal => Some(locals[x[0] as usize]),
            Opcode::StoreLocal => {
                locals[x[0] as usize] = x[1];
                None
            }
            Opcode::LoadContext => {
                let ty = op.dest.map_or(TypeName::I64, |(_, ty)| ty);
                Some(thread.ctx.read(x[0] as usize, ty))
            }
            Opcode::StoreContext => {
                thread.ctx.write(x[0] as usize, op.args[1].ty(), x[1]);
                None
            }
            Opcode::Load => {
                let ty = op.dest.map_or(TypeName::I64, |(_, ty)| ty);
                let addr = x[0] as u32;
                match load(processor.memory(), addr, ty) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        thread.raise(ExceptionCode::ReadUnmapped, addr as u64);
                        return;
                    }
                }
            }
            Opcode::Store => {
                let addr = x[0] as u32;
                if store(processor.memory(), addr, op.args[1].ty(), x[1]).is_err() {
                    thread.raise(ExceptionCode::WriteUnmapped, addr as u64);
                    return;
                }
                None
            }

            _ => match op.dest {
                Some((_, ty)) => Some(evaluate(op, ty, x).unwrap_or(0)),
                None => None,
            },
        };

        if let (Some(value), Some((dest, _))) = (result, op.dest) {
            values[dest as usize] = value;
        }
    }
}

/// Compiles functions into `InterpreterFunction`s.
pub struct InterpreterBackend {
    table: Arc<OpcodeTable>,
}

impl InterpreterBackend {
    pub fn new(table: Arc<OpcodeTable>) -> Self {
        Self { table }
    }
}

impl Assembler for InterpreterBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Interpreter
    }

    fn initialize(&mut self) -> Result<(), AssembleError> {
        Ok(())
    }

    fn reset(&mut self) {}

    fn assemble(
        &mut self,
        func: &Function,
        _: &Arena,
        _: &mut Option<DebugInfo>,
    ) -> Result<EntryPoint, AssembleError> {
        let func = InterpreterFunction::new(func, &self.table)?;
        tracing::trace!("{:#x}: {} interpreter ops", func.address, func.len());
        Ok(EntryPoint::Interpreted(Arc::new(func)))
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use xenon_hir::{FunctionBuilder, ValueId};

    use super::*;
    use crate::{
        compiler::{CompilerPass, ConstantPropagationPass},
        context::gpr_offset,
        mem::FlatMemory,
        thread::Processor,
    };

    const BASE: u32 = 0x8200_0000;

    struct TestProcessor {
        memory: FlatMemory,
        calls: Mutex<Vec<u32>>,
    }

    impl Processor for TestProcessor {
        fn memory(&self) -> &dyn Memory {
            &self.memory
        }

        fn call(&self, thread: &mut ThreadState, address: u32) {
            self.calls.lock().unwrap().push(address);
            thread.ctx.r[3] += 1;
        }

        fn call_extern(&self, thread: &mut ThreadState, index: u32) {
            thread.ctx.r[3] = index as u64;
        }

        fn debug_break(&self, thread: &mut ThreadState, address: u32) {
            thread.raise(ExceptionCode::Breakpoint, address as u64);
        }
    }

    fn thread() -> (ThreadState, Arc<TestProcessor>) {
        let processor = Arc::new(TestProcessor {
            memory: FlatMemory::new(0x1000, 0x1000),
            calls: Mutex::new(vec![]),
        });
        (ThreadState::new(processor.clone(), 1), processor)
    }

    fn run(f: FunctionBuilder, thread: &mut ThreadState) {
        let func = InterpreterFunction::new(&f.finish(), &OpcodeTable::new()).unwrap();
        interpret(thread, &func);
    }

    #[test]
    fn add_registers() {
        let mut f = FunctionBuilder::new(BASE);
        let a = f.load_context(gpr_offset(3), TypeName::I64);
        let b = f.load_context(gpr_offset(4), TypeName::I64);
        let sum = f.add(a, b);
        f.store_context(gpr_offset(3), sum);
        f.ret();

        let (mut thread, _) = thread();
        thread.ctx.r[3] = 5;
        thread.ctx.r[4] = 7;
        run(f, &mut thread);
        assert_eq!(thread.ctx.r[3], 12);
        assert!(thread.exception.is_none());
    }

    #[test]
    fn memory_is_big_endian() {
        let mut f = FunctionBuilder::new(BASE);
        let addr = f.const_i64(0x1000);
        let value = f.load(addr, TypeName::I32);
        let next = f.add_imm(addr, 4);
        let value = f.add_imm(value, 1);
        f.store(next, value);
        f.ret();

        let (mut thread, processor) = thread();
        processor.memory.write_u32(0x1000, 0x1122_3344, Endian::Big).unwrap();
        run(f, &mut thread);
        assert_eq!(processor.memory.read::<4>(0x1004).unwrap(), [0x11, 0x22, 0x33, 0x45]);
    }

    #[test]
    fn unmapped_load_raises() {
        let mut f = FunctionBuilder::new(BASE);
        let addr = f.const_i64(0x10);
        let value = f.load(addr, TypeName::I64);
        f.store_context(gpr_offset(3), value);
        f.ret();

        let (mut thread, _) = thread();
        thread.ctx.r[3] = 99;
        run(f, &mut thread);
        assert_eq!(thread.exception.kind(), ExceptionCode::ReadUnmapped);
        assert_eq!(thread.exception.value, 0x10);
        assert_eq!(thread.ctx.r[3], 99);
    }

    #[test]
    fn counted_loop() {
        // r3 = 0; do { r3 += 2; r4 -= 1 } while r4 != 0
        let mut f = FunctionBuilder::new(BASE);
        let zero = f.const_i64(0);
        f.store_context(gpr_offset(3), zero);
        let head = f.new_label();
        f.mark_label(head);
        let r3 = f.load_context(gpr_offset(3), TypeName::I64);
        let r3 = f.add_imm(r3, 2);
        f.store_context(gpr_offset(3), r3);
        let r4 = f.load_context(gpr_offset(4), TypeName::I64);
        let r4 = f.add_imm(r4, u64::MAX);
        f.store_context(gpr_offset(4), r4);
        let zero = f.const_i64(0);
        let cond = f.compare_ne(r4, zero);
        f.branch_true(cond, head);
        f.ret();

        let (mut thread, _) = thread();
        thread.ctx.r[4] = 10;
        run(f, &mut thread);
        assert_eq!(thread.ctx.r[3], 20);
        assert_eq!(thread.ctx.r[4], 0);
    }

    #[test]
    fn calls_and_traps() {
        let mut f = FunctionBuilder::new(BASE);
        f.call(0x8200_1000);
        let target = f.const_i64(0x8200_2000);
        f.call_indirect(target);
        let no = f.const_i8(0);
        f.call_true(no, 0x8200_3000);
        f.trap(xenon_hir::trap_code::TRAP, BASE + 0x10);
        f.call(0x8200_4000);
        f.ret();

        let (mut thread, processor) = thread();
        run(f, &mut thread);
        assert_eq!(*processor.calls.lock().unwrap(), vec![0x8200_1000, 0x8200_2000]);
        assert_eq!(thread.ctx.r[3], 2);
        assert_eq!(thread.exception.kind(), ExceptionCode::Trap);
        assert_eq!(thread.exception.value, (BASE + 0x10) as u64);
    }

    #[test]
    fn debug_break_stops_execution() {
        let mut f = FunctionBuilder::new(BASE);
        f.debug_break(BASE + 4);
        f.call_extern(7);
        f.ret();

        let (mut thread, _) = thread();
        run(f, &mut thread);
        assert_eq!(thread.exception.kind(), ExceptionCode::Breakpoint);
        assert_eq!(thread.ctx.r[3], 0);
    }

    #[test]
    fn unsupported_operation_is_rejected() {
        let mut f = FunctionBuilder::new(BASE);
        let a = f.load_context(0x100, TypeName::F64);
        let b = f.append_value(Opcode::CountLeadingZeros, TypeName::I8, [
            a.into(),
            Operand::None,
            Operand::None,
        ]);
        f.store_context(0, b);
        f.ret();
        let err = InterpreterFunction::new(&f.finish(), &OpcodeTable::new()).unwrap_err();
        assert!(matches!(err, AssembleError::NoPattern { opcode: Opcode::CountLeadingZeros, .. }));
    }

    /// Builds `r5 = op(r3, r4)` either from registers or from constants.
    fn binary_function(
        op: Opcode,
        ty: TypeName,
        consts: Option<(u64, u64)>,
    ) -> (Function, ValueId) {
        let mut f = FunctionBuilder::new(BASE);
        let (a, b) = match consts {
            Some((a, b)) => {
                let a = f.load_constant(ty, a as u128 & ty.mask());
                let b = f.load_constant(ty, b as u128 & ty.mask());
                (a, b)
            }
            None => (f.load_context(gpr_offset(3), ty), f.load_context(gpr_offset(4), ty)),
        };
        let dest_ty = match op {
            Opcode::CompareSlt | Opcode::CompareUlt | Opcode::CompareEq => TypeName::I8,
            Opcode::AddCarryOut | Opcode::SubCarryOut | Opcode::AddOverflow => TypeName::I8,
            _ => ty,
        };
        let result = f.append_value(op, dest_ty, [a.into(), b.into(), Operand::None]);
        f.store_context(gpr_offset(5), result);
        f.ret();
        (f.finish(), result)
    }

    #[test]
    fn constant_folding_matches_interpreter() {
        const OPS: &[Opcode] = &[
            Opcode::Add,
            Opcode::Sub,
            Opcode::Mul,
            Opcode::MulHi,
            Opcode::Div,
            Opcode::DivUnsigned,
            Opcode::Shl,
            Opcode::Sha,
            Opcode::RotateLeft,
            Opcode::CompareSlt,
            Opcode::CompareUlt,
            Opcode::CompareEq,
            Opcode::AddCarryOut,
            Opcode::SubCarryOut,
            Opcode::AddOverflow,
        ];
        const TYPES: &[TypeName] = &[TypeName::I8, TypeName::I16, TypeName::I32, TypeName::I64];

        fn check(op: u8, ty: u8, a: u64, b: u64) -> bool {
            let op = OPS[op as usize % OPS.len()];
            let ty = TYPES[ty as usize % TYPES.len()];
            let table = OpcodeTable::new();

            let (mut folded, result) = binary_function(op, ty, Some((a, b)));
            ConstantPropagationPass.run(&mut folded, &table).unwrap();
            let Some(expected) = folded.value(result).const_bits() else { return false };

            let (func, _) = binary_function(op, ty, None);
            let (mut thread, _) = thread();
            thread.ctx.r[3] = a;
            thread.ctx.r[4] = b;
            let func = InterpreterFunction::new(&func, &table).unwrap();
            interpret(&mut thread, &func);

            let width = folded.ty(result).size();
            thread.ctx.read(gpr_offset(5), folded.ty(result)) == expected
                && (width == 8 || thread.ctx.r[5] >> (width * 8) == 0)
        }
        quickcheck::quickcheck(check as fn(u8, u8, u64, u64) -> bool);
    }
}
