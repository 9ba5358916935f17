//! Native backend: lowers optimized HIR to LIR, allocates host registers and generates machine code
//! with Cranelift.

mod debug;
pub mod lir;
pub mod lower;
pub mod regalloc;
pub mod runtime;
mod translate;

use std::sync::Arc;

use cranelift::{
    codegen::{isa::CallConv, Context as CodeContext},
    prelude::*,
};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module, ModuleError, ModuleResult};
use xenon_cpu::{
    AssembleError, Assembler, BackendKind, DebugInfo, DebugInfoFlags, EntryPoint, NativeFn,
    NativeFunction,
};
use xenon_hir::{Arena, Function, OpcodeTable};

pub use crate::{
    lower::{LowerError, LoweringTable, Shape},
    regalloc::NUM_HOST_REGS,
};
use crate::{lir::Lir, regalloc::Allocation};

pub(crate) struct MemHandler<T> {
    pub load8: T,
    pub load16: T,
    pub load32: T,
    pub load64: T,

    pub store8: T,
    pub store16: T,
    pub store32: T,
    pub store64: T,
}

pub(crate) struct RuntimeFunctions {
    pub mmu: MemHandler<FuncId>,
    pub call: FuncId,
    pub call_extern: FuncId,
    pub debug_break: FuncId,
}

struct Jit {
    /// The function builder context, which is reused across multiple FunctionBuilder instances.
    builder_ctx: FunctionBuilderContext,

    /// Cranelift codegen context.
    code_ctx: CodeContext,

    /// The module, with the jit backend, which manages the JIT'd functions.
    module: JITModule,

    functions: RuntimeFunctions,
}

// SAFETY: `JITModule` is only `!Send` because it holds raw pointers into the code memory it owns.
// It is only reachable through `&mut NativeBackend`, so it is never used by two threads at once.
unsafe impl Send for Jit {}

pub struct NativeBackend {
    table: Arc<OpcodeTable>,
    lowering: LoweringTable,
    host_regs: usize,
    jit: Option<Jit>,

    /// Number of functions compiled to machine code.
    pub compiled: usize,
}

impl NativeBackend {
    pub fn new(table: Arc<OpcodeTable>) -> Self {
        Self {
            table,
            lowering: LoweringTable::new(),
            host_regs: NUM_HOST_REGS,
            jit: None,
            compiled: 0,
        }
    }

    /// Limits the number of host registers given to the register allocator.
    pub fn with_host_regs(mut self, host_regs: usize) -> Self {
        self.host_regs = host_regs.max(1);
        self
    }

    pub fn lowering(&self) -> &LoweringTable {
        &self.lowering
    }
}

impl Assembler for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn initialize(&mut self) -> Result<(), AssembleError> {
        if !BackendKind::native_supported() {
            return Err(AssembleError::UnsupportedHost);
        }
        if self.jit.is_none() {
            let (module, functions) = init_module()?;
            self.jit = Some(Jit {
                builder_ctx: FunctionBuilderContext::new(),
                code_ctx: CodeContext::new(),
                module,
                functions,
            });
        }
        Ok(())
    }

    fn reset(&mut self) {
        if let Some(jit) = self.jit.as_mut() {
            jit.code_ctx.clear();
        }
    }

    fn assemble(
        &mut self,
        func: &Function,
        arena: &Arena,
        debug_info: &mut Option<DebugInfo>,
    ) -> Result<EntryPoint, AssembleError> {
        let Some(jit) = self.jit.as_mut() else {
            return Err(AssembleError::Unsupported("native backend is not initialized".into()));
        };

        let mut lir = self.lowering.lower(func, &self.table)?;
        for block in lir.block_ids() {
            lir.assert_no_cycles(block);
        }
        let alloc = regalloc::linear_scan(&mut lir, arena, self.host_regs);

        let info = debug_info.as_mut();
        if let Some(info) = info.filter(|x| x.wants(DebugInfoFlags::LIR)) {
            info.lir = Some(format!("{lir}\n{alloc}"));
        }
        let want_disasm =
            debug_info.as_ref().map_or(false, |x| x.wants(DebugInfoFlags::MACHINE_CODE));

        let (entry, code_size, disasm) =
            jit.compile(&lir, &alloc, want_disasm).map_err(codegen_error)?;
        if let (Some(info), Some(disasm)) = (debug_info.as_mut(), disasm) {
            info.machine_code = Some(disasm);
        }

        self.compiled += 1;
        tracing::debug!(
            "{:#x}: compiled to {code_size} bytes of native code, {} spill slots",
            func.address,
            alloc.spill_slots
        );
        Ok(EntryPoint::Native(NativeFunction {
            entry,
            spill_slots: alloc.spill_slots + lir.local_count,
            code_size,
        }))
    }
}

impl Jit {
    /// Translates `lir` to a new function in the module, returning its entry point, its size and
    /// optionally a dump of the generated code.
    fn compile(
        &mut self,
        lir: &Lir,
        alloc: &Allocation,
        want_disasm: bool,
    ) -> ModuleResult<(NativeFn, usize, Option<String>)> {
        self.module.clear_context(&mut self.code_ctx);
        self.code_ctx.want_disasm = want_disasm;

        let signature = &mut self.code_ctx.func.signature;
        signature.call_conv = CallConv::SystemV;
        signature.params.push(AbiParam::new(types::I64));
        signature.params.push(AbiParam::new(types::I64));

        let builder = FunctionBuilder::new(&mut self.code_ctx.func, &mut self.builder_ctx);
        translate::translate(&mut self.module, builder, &self.functions, lir, alloc);
        let il = want_disasm.then(|| debug::debug_il(&self.code_ctx, lir));

        let func = self.module.declare_anonymous_function(&self.code_ctx.func.signature)?;
        self.module.define_function(func, &mut self.code_ctx)?;

        let compiled = self.code_ctx.compiled_code();
        let size = compiled.map_or(0, |x| x.code_info().total_size as usize);
        let disasm = il.map(|il| {
            let vcode = compiled.and_then(|x| x.vcode.clone()).unwrap_or_default();
            format!("{il}\n{vcode}")
        });

        self.module.finalize_definitions()?;
        let ptr = self.module.get_finalized_function(func);
        // Safety: the function was generated with the `NativeFn` signature and calling convention.
        let entry: NativeFn = unsafe { std::mem::transmute(ptr) };
        Ok((entry, size, disasm))
    }
}

fn codegen_error(err: ModuleError) -> AssembleError {
    AssembleError::Codegen(err.to_string())
}

fn init_module() -> Result<(JITModule, RuntimeFunctions), AssembleError> {
    let setting_error = |e: settings::SetError| AssembleError::Codegen(e.to_string());

    let mut flag_builder = cranelift_codegen::settings::builder();

    // We will never relocate the JITed code, so we don't use position-independent-code to avoid
    // needing a GOT.
    flag_builder.set("is_pic", "false").map_err(setting_error)?;

    // Always enable frame pointers to make debugging easier.
    flag_builder.set("preserve_frame_pointers", "true").map_err(setting_error)?;

    let verifier = if cfg!(debug_assertions) { "true" } else { "false" };
    flag_builder.set("enable_verifier", verifier).map_err(setting_error)?;
    flag_builder.set("opt_level", "speed").map_err(setting_error)?;

    let flags = settings::Flags::new(flag_builder);
    tracing::trace!("cranelift flags: {}", flags.to_string());

    let isa_builder = cranelift_native::builder().map_err(|e| AssembleError::Codegen(e.into()))?;
    let isa = isa_builder.finish(flags).map_err(|e| AssembleError::Codegen(e.to_string()))?;
    if isa.triple().architecture != target_lexicon::Architecture::X86_64 {
        return Err(AssembleError::UnsupportedHost);
    }
    let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());

    macro_rules! define_fn_symbol {
        ($name:expr, $func:path) => {{
            builder.symbol($name, $func as *const u8);
        }};
    }

    define_fn_symbol!("load8", runtime::load8);
    define_fn_symbol!("load16", runtime::load16);
    define_fn_symbol!("load32", runtime::load32);
    define_fn_symbol!("load64", runtime::load64);
    define_fn_symbol!("store8", runtime::store8);
    define_fn_symbol!("store16", runtime::store16);
    define_fn_symbol!("store32", runtime::store32);
    define_fn_symbol!("store64", runtime::store64);
    define_fn_symbol!("call", runtime::call);
    define_fn_symbol!("call_extern", runtime::call_extern);
    define_fn_symbol!("debug_break", runtime::debug_break);

    let mut module = JITModule::new(builder);
    tracing::debug!("JIT module created with isa={:?}", module.isa());

    let functions = declare_runtime_functions(&mut module).map_err(codegen_error)?;
    Ok((module, functions))
}

fn declare_runtime_functions(module: &mut JITModule) -> ModuleResult<RuntimeFunctions> {
    use types::I64;

    macro_rules! import_fn {
        ($name:expr, ($($arg_ty:expr),*) -> ($($ret_ty:expr),*)) => {{
            let mut sig = Signature::new(CallConv::SystemV);
            for arg in &[$($arg_ty),*] {
                sig.params.push(AbiParam::new(*arg));
            }
            for ret in &[$($ret_ty),*] {
                sig.returns.push(AbiParam::new(*ret));
            }
            module.declare_function($name, Linkage::Import, &sig)?
        }};
    }

    Ok(RuntimeFunctions {
        mmu: MemHandler {
            load8: import_fn!("load8", (I64, I64) -> (I64)),
            load16: import_fn!("load16", (I64, I64) -> (I64)),
            load32: import_fn!("load32", (I64, I64) -> (I64)),
            load64: import_fn!("load64", (I64, I64) -> (I64)),
            store8: import_fn!("store8", (I64, I64, I64) -> ()),
            store16: import_fn!("store16", (I64, I64, I64) -> ()),
            store32: import_fn!("store32", (I64, I64, I64) -> ()),
            store64: import_fn!("store64", (I64, I64, I64) -> ()),
        },
        call: import_fn!("call", (I64, I64) -> ()),
        call_extern: import_fn!("call_extern", (I64, I64) -> ()),
        debug_break: import_fn!("debug_break", (I64, I64) -> ()),
    })
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use xenon_cpu::{
        context::{fpr_offset, gpr_offset},
        exec::InterpreterBackend,
        ExceptionCode, FlatMemory, Memory, Processor, ThreadState,
    };
    use xenon_hir::{trap_code, FunctionBuilder, Opcode, Operand, TypeName};

    use super::*;

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

    fn new_thread() -> (Arc<TestProcessor>, ThreadState) {
        let processor = Arc::new(TestProcessor {
            memory: FlatMemory::new(0x1000, 0x1000),
            calls: Mutex::new(vec![]),
        });
        let thread = ThreadState::new(processor.clone(), 0);
        (processor, thread)
    }

    fn compile(backend: &mut dyn Assembler, f: FunctionBuilder) -> EntryPoint {
        let func = f.finish();
        backend.initialize().unwrap();
        backend.assemble(&func, &Arena::new(), &mut None).unwrap()
    }

    fn native() -> Option<NativeBackend> {
        BackendKind::native_supported().then(|| NativeBackend::new(Arc::new(OpcodeTable::new())))
    }

    #[test]
    fn add_registers() {
        let Some(mut backend) = native() else { return };

        let mut f = FunctionBuilder::new(0x8200_0000);
        let a = f.load_context(gpr_offset(3), TypeName::I64);
        let b = f.load_context(gpr_offset(4), TypeName::I64);
        let sum = f.add(a, b);
        f.store_context(gpr_offset(3), sum);
        f.ret();
        let entry = compile(&mut backend, f);
        assert_eq!(entry.kind(), BackendKind::Native);

        let (_, mut thread) = new_thread();
        thread.ctx.r[3] = 5;
        thread.ctx.r[4] = 7;
        entry.call(&mut thread);
        assert_eq!(thread.ctx.r[3], 12);
        assert!(thread.exception.is_none());
    }

    #[test]
    fn memory_and_loops() {
        let Some(mut backend) = native() else { return };

        // Sums the big-endian words at [r4, r4 + 4 * r5) into r3.
        let mut f = FunctionBuilder::new(0x8200_0000);
        let head = f.new_label();
        let done = f.new_label();
        f.mark_label(head);
        let count = f.load_context(gpr_offset(5), TypeName::I64);
        let zero = f.const_i64(0);
        let finished = f.compare_eq(count, zero);
        f.branch_true(finished, done);
        let addr = f.load_context(gpr_offset(4), TypeName::I64);
        let word = f.load(addr, TypeName::I32);
        let word = f.zero_extend(word, TypeName::I64);
        let acc = f.load_context(gpr_offset(3), TypeName::I64);
        let acc = f.add(acc, word);
        f.store_context(gpr_offset(3), acc);
        let next = f.add_imm(addr, 4);
        f.store_context(gpr_offset(4), next);
        let count = f.add_imm(count, u64::MAX);
        f.store_context(gpr_offset(5), count);
        f.branch(head);
        f.mark_label(done);
        let out = f.load_context(gpr_offset(6), TypeName::I64);
        let total = f.load_context(gpr_offset(3), TypeName::I64);
        let total = f.truncate(total, TypeName::I16);
        f.store(out, total);
        f.ret();
        let entry = compile(&mut backend, f);

        let (processor, mut thread) = new_thread();
        for (i, value) in [1_u32, 2, 3, 0x1000].iter().enumerate() {
            processor.memory.write_bytes(0x1100 + i as u32 * 4, &value.to_be_bytes()).unwrap();
        }
        thread.ctx.r[4] = 0x1100;
        thread.ctx.r[5] = 4;
        thread.ctx.r[6] = 0x1200;
        entry.call(&mut thread);
        assert!(thread.exception.is_none());
        assert_eq!(thread.ctx.r[3], 0x1006);
        assert_eq!(processor.memory.read_u16(0x1200, xenon_cpu::Endian::Big).unwrap(), 0x1006);

        thread.ctx.r[4] = 0x3000;
        thread.ctx.r[5] = 1;
        entry.call(&mut thread);
        assert_eq!(thread.exception.kind(), ExceptionCode::ReadUnmapped);
        assert_eq!(thread.exception.value, 0x3000);
    }

    #[test]
    fn calls_and_traps() {
        let Some(mut backend) = native() else { return };

        let mut f = FunctionBuilder::new(0x8200_0000);
        f.call(0x8200_1000);
        let target = f.load_context(gpr_offset(4), TypeName::I64);
        f.call_indirect(target);
        let r3 = f.load_context(gpr_offset(3), TypeName::I64);
        let two = f.const_i64(2);
        let cond = f.compare_eq(r3, two);
        f.trap_true(cond, trap_code::TRAP, 0x8200_0010);
        f.ret();
        let entry = compile(&mut backend, f);

        let (processor, mut thread) = new_thread();
        thread.ctx.r[4] = 0x8200_2000;
        entry.call(&mut thread);
        assert_eq!(*processor.calls.lock().unwrap(), vec![0x8200_1000, 0x8200_2000]);
        assert_eq!(thread.exception.kind(), ExceptionCode::Trap);
        assert_eq!(thread.exception.value, 0x8200_0010);

        thread.take_exception();
        thread.ctx.r[3] = 5;
        entry.call(&mut thread);
        assert!(thread.exception.is_none());
        assert_eq!(thread.ctx.r[3], 7);
    }

    #[test]
    fn debug_break_stops_execution() {
        let Some(mut backend) = native() else { return };

        let mut f = FunctionBuilder::new(0x8200_0000);
        f.debug_break(0x8200_0000);
        let one = f.const_i64(1);
        f.store_context(gpr_offset(3), one);
        f.ret();
        let entry = compile(&mut backend, f);

        let (_, mut thread) = new_thread();
        entry.call(&mut thread);
        assert_eq!(thread.exception.kind(), ExceptionCode::Breakpoint);
        assert_eq!(thread.ctx.r[3], 0);
    }

    #[test]
    fn register_pressure_spills() {
        let Some(backend) = native() else { return };
        let mut backend = backend.with_host_regs(2);

        let mut f = FunctionBuilder::new(0x8200_0000);
        let values: Vec<_> =
            (3..11).map(|r| f.load_context(gpr_offset(r), TypeName::I64)).collect();
        let mut sum = f.const_i64(0);
        for value in values.iter().rev() {
            sum = f.add(sum, *value);
        }
        f.store_context(gpr_offset(3), sum);
        f.ret();
        let entry = compile(&mut backend, f);
        assert!(entry.spill_slots() > 0);

        let (_, mut thread) = new_thread();
        for r in 3..11 {
            thread.ctx.r[r] = r as u64;
        }
        entry.call(&mut thread);
        assert_eq!(thread.ctx.r[3], (3..11).sum::<u64>());
    }

    #[test]
    fn float_arithmetic_is_rejected() {
        let Some(mut backend) = native() else { return };

        let mut f = FunctionBuilder::new(0x8200_0000);
        let a = f.const_f64(1.5);
        let b = f.add(a, a);
        f.store_context(fpr_offset(1), b);
        f.ret();
        let func = f.finish();
        backend.initialize().unwrap();
        let err = backend.assemble(&func, &Arena::new(), &mut None).unwrap_err();
        assert!(matches!(err, AssembleError::NoPattern { opcode: Opcode::Add, .. }));
    }

    #[test]
    fn debug_info_is_collected() {
        let Some(mut backend) = native() else { return };

        let mut f = FunctionBuilder::new(0x8200_0000);
        let a = f.load_context(gpr_offset(3), TypeName::I32);
        let b = f.add_imm(a, 1);
        f.store_context(gpr_offset(3), b);
        f.ret();
        let func = f.finish();
        backend.initialize().unwrap();

        let mut info = Some(DebugInfo::new(DebugInfoFlags::LIR | DebugInfoFlags::MACHINE_CODE));
        backend.assemble(&func, &Arena::new(), &mut info).unwrap();
        let info = info.unwrap();
        assert!(info.lir.unwrap().contains("add.i32"));
        assert!(info.machine_code.unwrap().contains("; st.ctx.i32"));
    }

    const BINARY_OPS: [Opcode; 22] = [
        Opcode::Add,
        Opcode::Sub,
        Opcode::Mul,
        Opcode::MulHi,
        Opcode::MulHiUnsigned,
        Opcode::Div,
        Opcode::DivUnsigned,
        Opcode::And,
        Opcode::Or,
        Opcode::Xor,
        Opcode::Shl,
        Opcode::Shr,
        Opcode::Sha,
        Opcode::RotateLeft,
        Opcode::CompareNe,
        Opcode::CompareSlt,
        Opcode::CompareUgt,
        Opcode::CompareSge,
        Opcode::AddCarryOut,
        Opcode::SubCarryOut,
        Opcode::AddOverflow,
        Opcode::SubOverflow,
    ];
    const INT_TYPES: [TypeName; 4] = [TypeName::I8, TypeName::I16, TypeName::I32, TypeName::I64];

    /// Computes `r5 = op(r3, r4)` at type `ty` with `backend`.
    fn run_binary(backend: &mut dyn Assembler, op: Opcode, ty: TypeName, a: u64, b: u64) -> u64 {
        let dest = match BINARY_OPS.iter().position(|x| *x == op) {
            Some(i) if i >= 14 => TypeName::I8,
            _ => ty,
        };

        let mut f = FunctionBuilder::new(0x8200_0000);
        let x = f.load_context(gpr_offset(3), ty);
        let y = f.load_context(gpr_offset(4), ty);
        let r = f.append_value(op, dest, [x.into(), y.into(), Operand::None]);
        let r = match dest {
            TypeName::I64 => r,
            _ => f.zero_extend(r, TypeName::I64),
        };
        f.store_context(gpr_offset(5), r);
        f.ret();

        let entry = compile(backend, f);
        let (_, mut thread) = new_thread();
        thread.ctx.r[3] = a;
        thread.ctx.r[4] = b;
        entry.call(&mut thread);
        thread.ctx.r[5]
    }

    fn same_as_interpreter(op: Opcode, ty: TypeName, a: u64, b: u64) -> bool {
        let Some(mut native) = native() else { return true };
        let mut interpreter = InterpreterBackend::new(Arc::new(OpcodeTable::new()));

        let expected = run_binary(&mut interpreter, op, ty, a, b);
        let actual = run_binary(&mut native, op, ty, a, b);
        if expected != actual {
            eprintln!("{op:?}.{ty} {a:#x} {b:#x}: expected {expected:#x}, got {actual:#x}");
        }
        expected == actual
    }

    #[test]
    fn binary_ops_match_interpreter() {
        fn check(op: u8, ty: u8, a: u64, b: u64) -> bool {
            let op = BINARY_OPS[op as usize % BINARY_OPS.len()];
            let ty = INT_TYPES[ty as usize % INT_TYPES.len()];
            same_as_interpreter(op, ty, a, b)
        }
        quickcheck::quickcheck(check as fn(u8, u8, u64, u64) -> bool);
    }

    #[test]
    fn binary_op_edge_cases() {
        let edges =
            [(0, 0), (u64::MAX, 1), (0x80, u64::MAX), (1 << 63, u64::MAX), (0x7fff, 0x7fff)];
        for op in BINARY_OPS {
            for ty in INT_TYPES {
                for (a, b) in edges {
                    assert!(same_as_interpreter(op, ty, a, b), "{op:?}.{ty} {a:#x} {b:#x}");
                }
            }
        }
    }
}
