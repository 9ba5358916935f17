use std::sync::{Arc, Mutex};

use xenon_cpu::{
    exports::{NullExportResolver, SYSCALL_MODULE},
    BackendKind, Config, DebugInfoFlags, Endian, ExceptionCode, ExportResolver, ExportTable,
    FlatMemory, Memory, SymbolState, ThreadState,
};

use crate::{
    debugger::{Breakpoint, ContentSource, ExecutionState, Request},
    tracer::{TraceEvent, TraceReader},
    BuildError, ExecError, ResolveError, Runtime,
};

const BASE: u32 = 0x8200_0000;
const DATA: u32 = 0x8200_8000;
const BLR: u32 = 0x4e80_0020;

fn backends() -> Vec<BackendKind> {
    match BackendKind::native_supported() {
        true => vec![BackendKind::Interpreter, BackendKind::Native],
        false => vec![BackendKind::Interpreter],
    }
}

fn load_code(code: &[u32]) -> Arc<FlatMemory> {
    let memory = FlatMemory::new(BASE, 0x10000);
    let bytes: Vec<u8> = code.iter().flat_map(|x| x.to_be_bytes()).collect();
    memory.load(BASE, &bytes).unwrap();
    Arc::new(memory)
}

fn build_with(config: Config, code: &[u32], exports: Arc<dyn ExportResolver>) -> Arc<Runtime> {
    crate::build(config, load_code(code), exports).unwrap()
}

fn build(backend: BackendKind, code: &[u32]) -> Arc<Runtime> {
    let config = Config { backend, validate: true, ..Config::default() };
    build_with(config, code, Arc::new(NullExportResolver))
}

fn thread(runtime: &Arc<Runtime>) -> ThreadState {
    runtime.create_thread_state(1, DATA + 0x4000, 0x1000, DATA + 0x6000)
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn add_registers_on_every_backend() {
    // add r3, r3, r4; blr
    let code = [0x7c63_2214, BLR];
    for backend in backends() {
        let runtime = build(backend, &code);
        let mut thread = thread(&runtime);
        thread.ctx.r[3] = 5;
        thread.ctx.r[4] = 7;
        runtime.execute(&mut thread, BASE).unwrap();
        assert_eq!(thread.ctx.r[3], 12, "{backend}");
        assert_eq!(runtime.resolve(BASE).unwrap().backend, backend);
    }
}

#[test]
fn load_add_store_through_full_pipeline() {
    // lwz r7, 0(r6); add r3, r3, r4; stw r3, 4(r6); blr
    let code = [0x80e6_0000, 0x7c63_2214, 0x9066_0004, BLR];
    for backend in backends() {
        let config = Config {
            backend,
            validate: true,
            debug_info: DebugInfoFlags::HIR_BEFORE | DebugInfoFlags::HIR_AFTER,
            ..Config::default()
        };
        let runtime = build_with(config, &code, Arc::new(NullExportResolver));
        let mut thread = thread(&runtime);
        thread.ctx.r[3] = 5;
        thread.ctx.r[4] = 7;
        thread.ctx.r[6] = DATA as u64;
        runtime.execute(&mut thread, BASE).unwrap();

        assert_eq!(thread.ctx.r[3], 12, "{backend}");
        assert_eq!(runtime.memory().read_u32(DATA + 4, Endian::Big).unwrap(), 12, "{backend}");

        let func = runtime.resolve(BASE).unwrap();
        assert_eq!(func.backend, backend);
        let info = func.debug_info.as_ref().unwrap();
        assert!(info.hir_before.is_some() && info.hir_after.is_some());
    }
}

#[test]
fn concurrent_resolve_compiles_once() {
    let code = [
        0x3860_0000, // li r3, 0
        0x3863_0002, // addi r3, r3, 2
        0x3884_ffff, // addi r4, r4, -1
        0x2c04_0000, // cmpwi r4, 0
        0x4082_fff8, // bne -0x8
        BLR,
    ];
    for backend in backends() {
        let runtime = build(backend, &code);
        let results: Vec<_> = std::thread::scope(|s| {
            let workers: Vec<_> =
                (0..8).map(|_| s.spawn(|| runtime.resolve(BASE).unwrap())).collect();
            workers.into_iter().map(|x| x.join().unwrap()).collect()
        });

        assert_eq!(runtime.translation_count(BASE), 1);
        assert_eq!(runtime.compiled_count(), 1);
        assert!(results.iter().all(|x| Arc::ptr_eq(x, &results[0])));
        assert_eq!(runtime.symbols().lookup(BASE).unwrap().state(), SymbolState::Defined);
    }
}

/// Guest programs paired with their input registers.
fn corpus() -> Vec<(&'static str, Vec<u32>, Vec<(usize, u64)>)> {
    vec![
        (
            "loop",
            vec![0x3860_0000, 0x3863_0002, 0x3884_ffff, 0x2c04_0000, 0x4082_fff8, BLR],
            vec![(4, 10)],
        ),
        (
            "memory",
            // stw r3, 0(r5); lwz r6, 0(r5); lbz r7, 1(r5); add r3, r6, r7; blr
            vec![0x9065_0000, 0x80c5_0000, 0x88e5_0001, 0x7c66_3a14, BLR],
            vec![(3, 0x1122_3344), (5, DATA as u64)],
        ),
        (
            "logic",
            // rlwinm r3, r4, 8, 0, 23; srawi r5, r4, 4; subfc r6, r3, r4; and. r7, r3, r4;
            // or r8, r3, r4; extsh r9, r4; cntlzw r10, r3; slw r11, r3, r4; neg r12, r4; blr
            vec![
                0x5483_402e,
                0x7c85_2670,
                0x7cc3_2010,
                0x7c67_2039,
                0x7c68_2378,
                0x7c89_0734,
                0x7c6a_0034,
                0x7c6b_2030,
                0x7d84_00d0,
                BLR,
            ],
            vec![(3, 0x1234), (4, 0xffff_ffff_8765_4321)],
        ),
        (
            "arithmetic",
            // divw r5, r3, r4; mullw r6, r3, r4; mulhwu r7, r3, r4; blr
            vec![0x7ca3_23d6, 0x7cc3_21d6, 0x7ce3_2016, BLR],
            vec![(3, 0xffff_fff0), (4, 3)],
        ),
        (
            "divide_by_zero",
            vec![0x7ca3_23d6, 0x7cc3_21d6, 0x7ce3_2016, BLR],
            vec![(3, 1000), (4, 0)],
        ),
    ]
}

#[test]
fn native_matches_interpreter() {
    if !BackendKind::native_supported() {
        return;
    }

    for (name, code, inputs) in corpus() {
        let run = |backend: BackendKind| {
            let runtime = build(backend, &code);
            let mut thread = thread(&runtime);
            for &(reg, value) in &inputs {
                thread.ctx.r[reg] = value;
            }
            runtime.execute(&mut thread, BASE).unwrap();
            let mut data = [0; 16];
            runtime.memory().read_bytes(DATA, &mut data).unwrap();
            (thread, data, runtime.resolve(BASE).unwrap().backend)
        };

        let (expected, expected_data, _) = run(BackendKind::Interpreter);
        let (actual, actual_data, backend) = run(BackendKind::Native);
        assert_eq!(backend, BackendKind::Native, "{name}");
        assert_eq!(actual.ctx.r, expected.ctx.r, "{name}: gpr");
        assert_eq!(actual.ctx.cr, expected.ctx.cr, "{name}: cr");
        assert_eq!(actual.ctx.xer_value(), expected.ctx.xer_value(), "{name}: xer");
        assert_eq!(actual.ctx.lr, expected.ctx.lr, "{name}: lr");
        assert_eq!(actual_data, expected_data, "{name}: memory");
    }
}

#[test]
fn native_matches_interpreter_on_random_inputs() {
    if !BackendKind::native_supported() {
        return;
    }

    fn check(program: u8, r3: u64, r4: u64) -> bool {
        let corpus = corpus();
        let (_, code, _) = &corpus[2 + program as usize % 3];
        let run = |backend: BackendKind| {
            let runtime = build(backend, code);
            let mut thread = thread(&runtime);
            thread.ctx.r[3] = r3;
            thread.ctx.r[4] = r4;
            runtime.execute(&mut thread, BASE).unwrap();
            thread.ctx
        };
        let (expected, actual) = (run(BackendKind::Interpreter), run(BackendKind::Native));
        expected.r == actual.r
            && expected.cr == actual.cr
            && expected.xer_value() == actual.xer_value()
    }
    quickcheck::QuickCheck::new().tests(50).quickcheck(check as fn(u8, u64, u64) -> bool)
}

#[test]
fn corpus_results() {
    let (_, code, inputs) = &corpus()[0];
    let runtime = build(BackendKind::Interpreter, code);
    let mut thread = thread(&runtime);
    for &(reg, value) in inputs {
        thread.ctx.r[reg] = value;
    }
    runtime.execute(&mut thread, BASE).unwrap();
    assert_eq!(thread.ctx.r[3], 20);
    assert_eq!(thread.ctx.r[4], 0);
}

#[test]
fn wide_arithmetic_shifts_and_division_overflow() {
    let code = [
        0x7c83_2e34, // srad r3, r4, r5
        0x7cc7_47d2, // divdo r6, r7, r8
        BLR,
    ];
    const MIN: u64 = 1 << 63;
    // (r4, r5, r3, ca, r7, r8, ov)
    let cases = [
        (MIN, 64, u64::MAX, 1, MIN, u64::MAX, 1),
        (MIN, 127, u64::MAX, 1, 10, 2, 0),
        (MIN, 63, u64::MAX, 0, 10, 0, 1),
        (u64::MAX, 70, u64::MAX, 1, MIN, 1, 0),
        (u64::MAX - 1, 1, u64::MAX, 0, 7, u64::MAX, 0),
        (5, 100, 0, 0, 1, 1, 0),
    ];
    for backend in backends() {
        let runtime = build(backend, &code);
        for &(r4, r5, r3, ca, r7, r8, ov) in &cases {
            let mut thread = thread(&runtime);
            thread.ctx.r[4] = r4;
            thread.ctx.r[5] = r5;
            thread.ctx.r[7] = r7;
            thread.ctx.r[8] = r8;
            runtime.execute(&mut thread, BASE).unwrap();

            let case = format!("{backend}: r4={r4:#x} r5={r5} r7={r7:#x} r8={r8:#x}");
            assert_eq!(thread.ctx.r[3], r3, "{case}");
            assert_eq!(thread.ctx.xer_ca, ca, "{case}");
            assert_eq!(thread.ctx.xer_ov, ov, "{case}");
            assert_eq!(thread.ctx.xer_so, ov, "{case}");
        }
    }
}

#[test]
fn extent_ends_at_epilogue() {
    let code = [
        0x7d88_02a6, // mflr r12
        0x9181_fff8, // stw r12, -8(r1)
        0x9421_ffa0, // stwu r1, -0x60(r1)
        0x2c03_0000, // cmpwi r3, 0
        0x4182_000c, // beq +0xc
        0x3860_0001, // li r3, 1
        0x4800_0008, // b +0x8
        0x3860_0000, // li r3, 0
        0x3821_0060, // addi r1, r1, 0x60
        0x8181_fff8, // lwz r12, -8(r1)
        0x7d88_03a6, // mtlr r12
        BLR,
        0x3860_0002, // li r3, 2
        BLR,
    ];
    for backend in backends() {
        let runtime = build(backend, &code);
        let func = runtime.resolve(BASE).unwrap();
        assert_eq!(func.address, BASE);
        assert_eq!(func.end_address, BASE + 11 * 4);

        let mut thread = thread(&runtime);
        let sp = thread.ctx.r[1];
        thread.ctx.r[3] = 5;
        thread.ctx.lr = 0x1234;
        runtime.execute(&mut thread, BASE).unwrap();
        assert_eq!(thread.ctx.r[3], 1);
        assert_eq!(thread.ctx.r[1], sp);
        assert_eq!(thread.ctx.lr, 0x1234);
    }
}

#[test]
fn calls_between_functions() {
    let code = [
        0x4800_0011, // bl 0x82000010
        0x3863_0001, // addi r3, r3, 1
        BLR,
        0x0000_0000,
        0x1c63_0003, // mulli r3, r3, 3
        BLR,
    ];
    for backend in backends() {
        let runtime = build(backend, &code);
        let mut thread = thread(&runtime);
        thread.ctx.r[3] = 4;
        runtime.execute(&mut thread, BASE).unwrap();
        assert_eq!(thread.ctx.r[3], 13);
        assert_eq!(thread.ctx.lr, BASE as u64 + 4);
        assert_eq!(runtime.compiled_count(), 2);
        assert_eq!(runtime.resolve(BASE).unwrap().end_address, BASE + 8);
    }
}

#[test]
fn loops_across_functions_use_constant_stack() {
    let code = [
        0x3863_0001, // addi r3, r3, 1
        0x4800_000c, // b 0x82000010
        0x0000_0000,
        0x0000_0000,
        0x7c03_2000, // cmpw r3, r4
        0x4c80_0020, // bgelr
        0x4bff_ffe8, // b 0x82000000
    ];
    for backend in backends() {
        let runtime = build(backend, &code);
        let mut thread = thread(&runtime);
        thread.ctx.r[4] = 150_000;
        thread.ctx.lr = 0x1234;
        runtime.execute(&mut thread, BASE).unwrap();

        assert_eq!(thread.ctx.r[3], 150_000, "{backend}");
        assert_eq!(thread.ctx.jump_pending, 0);
        assert_eq!(runtime.resolve(BASE).unwrap().end_address, BASE + 4);
        assert_eq!(runtime.resolve(BASE + 0x10).unwrap().end_address, BASE + 0x18);
        assert_eq!(runtime.translation_count(BASE), 1);
        assert_eq!(runtime.compiled_count(), 2);
    }
}

#[test]
fn conditional_branch_out_of_function() {
    let code = [
        0x2c03_0000, // cmpwi r3, 0
        0x4182_0008, // beq 0x8200000c
        BLR,
        0x3860_0007, // li r3, 7
        BLR,
    ];
    // A tiny scan limit splits the code into single instruction functions.
    let config = Config { max_scan_instructions: 2, validate: true, ..Config::default() };
    for backend in backends() {
        let config = Config { backend, ..config.clone() };
        let runtime = build_with(config, &code, Arc::new(NullExportResolver));
        for (input, output) in [(0, 7), (1, 1)] {
            let mut thread = thread(&runtime);
            thread.ctx.r[3] = input;
            runtime.execute(&mut thread, BASE).unwrap();
            assert_eq!(thread.ctx.r[3], output, "{backend}");
        }
    }
}

#[test]
fn float_code_falls_back_to_interpreter() {
    // fadd f1, f1, f2; blr
    let code = [0xfc21_102a, BLR];
    for backend in backends() {
        let runtime = build(backend, &code);
        let mut thread = thread(&runtime);
        thread.ctx.f[1] = 1.5_f64.to_bits();
        thread.ctx.f[2] = 2.25_f64.to_bits();
        runtime.execute(&mut thread, BASE).unwrap();
        assert_eq!(f64::from_bits(thread.ctx.f[1]), 3.75);

        let func = runtime.resolve(BASE).unwrap();
        assert_eq!(func.backend, BackendKind::Interpreter);
        assert_eq!(runtime.translation_count(BASE), 1);
    }
}

#[test]
fn unimplemented_instruction_raises() {
    let code = [0x3860_0001, 0xffff_ffff, BLR];
    for backend in backends() {
        let runtime = build(backend, &code);
        let mut thread = thread(&runtime);
        let err = runtime.execute(&mut thread, BASE).unwrap_err();
        let ExecError::Exception(exception) = err else { panic!("unexpected error: {err}") };
        assert_eq!(exception.kind(), ExceptionCode::Unimplemented);
        assert_eq!(exception.value, BASE as u64 + 4);
        assert_eq!(thread.ctx.r[3], 1);
    }
}

#[test]
fn resolve_errors() {
    let runtime = build(BackendKind::Interpreter, &[BLR]);
    assert_eq!(runtime.resolve(BASE + 2).unwrap_err(), ResolveError::Misaligned(BASE + 2));

    let mut thread = thread(&runtime);
    let err = runtime.execute(&mut thread, 0x1000).unwrap_err();
    assert_eq!(err, ExecError::Resolve(ResolveError::Failed(0x1000)));
    assert_eq!(thread.exception.kind(), ExceptionCode::InvalidTarget);
    assert_eq!(runtime.resolve(0x1000).unwrap_err(), ResolveError::Failed(0x1000));
    assert_eq!(runtime.translation_count(0x1000), 1);
    assert_eq!(runtime.symbols().lookup(0x1000).unwrap().state(), SymbolState::Failed);
}

#[test]
fn system_calls_use_exports() {
    // li r3, 7; sc; blr
    let code = [0x3860_0007, 0x4400_0002, BLR];
    let mut table = ExportTable::new();
    table.insert(SYSCALL_MODULE, 0, |thread| thread.ctx.r[3] *= 6);
    let exports: Arc<dyn ExportResolver> = Arc::new(table);

    for backend in backends() {
        let config = Config { backend, ..Config::default() };
        let runtime = build_with(config, &code, exports.clone());
        let mut thread = thread(&runtime);
        runtime.execute(&mut thread, BASE).unwrap();
        assert_eq!(thread.ctx.r[3], 42);
    }

    let runtime = build(BackendKind::Interpreter, &code);
    let mut thread = thread(&runtime);
    let err = runtime.execute(&mut thread, BASE).unwrap_err();
    assert!(matches!(err, ExecError::Exception(e) if e.kind() == ExceptionCode::Syscall));
}

#[test]
fn imports_are_resolved_through_trampolines() {
    let mut table = ExportTable::new();
    table.insert("xboxkrnl.exe", 12, |thread| thread.ctx.r[3] = 0x600d);
    let exports: Arc<dyn ExportResolver> = Arc::new(table);

    for backend in backends() {
        let config = Config { backend, ..Config::default() };
        let runtime = build_with(config, &[0], exports.clone());
        runtime.symbols().declare_import(BASE, "xboxkrnl.exe", 12);
        runtime.symbols().declare_import(BASE + 4, "xboxkrnl.exe", 13);

        let mut thread = thread(&runtime);
        runtime.execute(&mut thread, BASE).unwrap();
        assert_eq!(thread.ctx.r[3], 0x600d);

        let err = runtime.execute(&mut thread, BASE + 4).unwrap_err();
        assert!(matches!(err, ExecError::Exception(e) if e.kind() == ExceptionCode::Unimplemented));
    }
}

#[test]
fn breakpoints_recompile_affected_functions() {
    // li r3, 1; addi r3, r3, 1; blr
    let code = [0x3860_0001, 0x3863_0001, BLR];
    for backend in backends() {
        let runtime = build(backend, &code);
        let first = runtime.resolve(BASE).unwrap();
        assert_eq!(runtime.translation_count(BASE), 1);

        runtime.add_breakpoint(Breakpoint::code(BASE + 4));
        assert_eq!(runtime.translation_count(BASE), 2);
        assert!(!Arc::ptr_eq(&first, &runtime.resolve(BASE).unwrap()));

        let mut thread = thread(&runtime);
        let err = runtime.execute(&mut thread, BASE).unwrap_err();
        let ExecError::Exception(exception) = err else { panic!("unexpected error: {err}") };
        assert_eq!(exception.kind(), ExceptionCode::Breakpoint);
        assert_eq!(exception.value, BASE as u64 + 4);
        assert_eq!(thread.ctx.r[3], 1);
        assert_eq!(runtime.debugger().execution_state(), ExecutionState::Paused);
        assert_eq!(runtime.debugger().last_break(), Some(BASE + 4));

        assert!(runtime.remove_breakpoint(BASE + 4));
        assert!(!runtime.remove_breakpoint(BASE + 4));
        assert_eq!(runtime.translation_count(BASE), 3);

        thread.exception.clear();
        runtime.execute(&mut thread, BASE).unwrap();
        assert_eq!(thread.ctx.r[3], 2);
    }
}

#[test]
fn step_breakpoints_are_removed_when_hit() {
    let code = [0x3860_0001, 0x3863_0001, BLR];
    let runtime = build(BackendKind::Interpreter, &code);
    runtime.add_breakpoint(Breakpoint::step(BASE + 8));

    let mut thread = thread(&runtime);
    let err = runtime.execute(&mut thread, BASE).unwrap_err();
    assert!(matches!(err, ExecError::Exception(e) if e.kind() == ExceptionCode::Breakpoint));
    assert_eq!(thread.ctx.r[3], 2);
    assert!(runtime.debugger().breakpoints().is_empty());

    thread.exception.clear();
    runtime.execute(&mut thread, BASE).unwrap();
}

#[test]
fn pause_stops_at_next_function_entry() {
    let runtime = build(BackendKind::Interpreter, &[0x3860_0001, BLR]);
    let mut thread = thread(&runtime);

    let response = runtime.handle_debug_request(Request::new(ContentSource::Execution, &[1]));
    assert_eq!(response.word(0), Some(ExecutionState::Running.as_u32()));

    let err = runtime.execute(&mut thread, BASE).unwrap_err();
    assert!(matches!(err, ExecError::Exception(e) if e.kind() == ExceptionCode::Breakpoint));
    assert_eq!(thread.ctx.r[3], 0);

    let response = runtime.handle_debug_request(Request::new(ContentSource::Execution, &[0]));
    assert_eq!(response.word(0), Some(ExecutionState::Paused.as_u32()));
    let response = runtime.handle_debug_request(Request::new(ContentSource::Execution, &[2]));
    assert_eq!(response.word(0), Some(ExecutionState::Running.as_u32()));

    thread.exception.clear();
    runtime.execute(&mut thread, BASE).unwrap();
    assert_eq!(thread.ctx.r[3], 1);
}

#[test]
fn debug_requests() {
    let code = [0x3860_0001, 0x3863_0001, BLR];
    let config = Config {
        backend: BackendKind::Interpreter,
        debug_info: DebugInfoFlags::all(),
        ..Config::default()
    };
    let runtime = build_with(config, &code, Arc::new(NullExportResolver));

    let response = runtime.handle_debug_request(Request::new(ContentSource::Function, &[BASE]));
    assert!(!response.is_ok());

    runtime.resolve(BASE).unwrap();
    let response = runtime.handle_debug_request(Request::new(ContentSource::Symbols, &[BASE + 4]));
    assert!(response.is_ok());
    assert_eq!(response.word(0), Some(SymbolState::Defined.as_u32()));
    assert_eq!(response.word(1), Some(BASE));
    assert_eq!(response.word(2), Some(BASE + 8));
    assert_eq!(&response.payload[12..], b"sub_82000000");

    let response = runtime.handle_debug_request(Request::new(ContentSource::Function, &[BASE]));
    assert!(response.is_ok());
    let dump = String::from_utf8(response.payload).unwrap();
    assert!(dump.contains("li r3, 0x1"), "{dump}");
    assert!(dump.contains("; hir\n"), "{dump}");

    let request = Request::new(ContentSource::Breakpoints, &[0, BASE + 4]);
    assert!(runtime.handle_debug_request(request).is_ok());
    assert!(runtime.debugger().has_breakpoint(BASE + 4));
    let request = Request::new(ContentSource::Breakpoints, &[1, BASE + 4]);
    assert!(runtime.handle_debug_request(request).is_ok());
    let request = Request::new(ContentSource::Breakpoints, &[1, BASE + 4]);
    assert!(!runtime.handle_debug_request(request).is_ok());

    let response = runtime.debugger().handle_raw_request(&runtime, 42, vec![]);
    assert!(!response.is_ok());
    let response = runtime.handle_debug_request(Request::new(ContentSource::Symbols, &[]));
    assert!(!response.is_ok());
}

#[test]
fn trace_events() {
    let code = [0x4800_0009, BLR, 0x3860_0001, BLR];
    let config = Config {
        backend: BackendKind::Interpreter,
        trace_functions: true,
        ..Config::default()
    };
    let runtime = build_with(config, &code, Arc::new(NullExportResolver));
    let buffer = SharedBuffer::default();
    runtime.tracer().set_output(Box::new(buffer.clone()));

    let mut thread = thread(&runtime);
    runtime.execute(&mut thread, BASE).unwrap();

    let data = buffer.0.lock().unwrap().clone();
    let events: Vec<_> = TraceReader::new(&data).map(|x| x.unwrap().event().unwrap()).collect();
    let interpreter = BackendKind::Interpreter.as_u32();
    assert_eq!(events, vec![
        TraceEvent::FunctionCompiled { address: BASE, end_address: BASE + 4, backend: interpreter },
        TraceEvent::FunctionEnter { address: BASE, thread_id: 1 },
        TraceEvent::FunctionCompiled {
            address: BASE + 8,
            end_address: BASE + 12,
            backend: interpreter
        },
        TraceEvent::FunctionEnter { address: BASE + 8, thread_id: 1 },
    ]);
}

#[test]
fn thread_state_layout() {
    let runtime = build(BackendKind::Interpreter, &[BLR]);
    let thread = runtime.create_thread_state(7, 0x7000_0000, 0x4000, 0x7fff_0000);
    assert_eq!(thread.id, 7);
    assert_eq!(thread.ctx.r[1], 0x7000_4000);
    assert_eq!(thread.ctx.r[13], 0x7fff_0000);
    assert_eq!(thread.processor().memory().read_u32(BASE, Endian::Big).unwrap(), BLR);
}

#[test]
fn invalid_config_is_rejected() {
    let memory: Arc<dyn Memory> = load_code(&[BLR]);
    let config = Config { arena_chunk_size: 0, ..Config::interpreter() };
    let err = crate::build(config, memory, Arc::new(NullExportResolver)).err().unwrap();
    assert!(matches!(err, BuildError::InvalidConfig(_)));
}
