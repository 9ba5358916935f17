//! The runtime: owns guest memory, the symbol database and the compiled function cache, and runs
//! guest functions on behalf of thread states.

mod builder;
pub mod debugger;
pub mod tracer;

#[cfg(test)]
mod tests;

pub use xenon_cpu as cpu;

pub use crate::builder::{build, BuildError};

use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};

use hashbrown::HashMap;
use xenon_cpu::{
    compiler::{Compiler, CompilerOptions, PassError},
    exec::InterpreterBackend,
    frontend::{Scanner, TranslateError, TranslationEnv, Translator},
    AssembleError, Assembler, BackendKind, Config, DebugInfo, DebugInfoFlags, EntryPoint,
    Exception, ExceptionCode, ExportFn, ExportResolver, FunctionSymbol, Memory, Processor,
    SymbolDatabase, ThreadState,
};
use xenon_hir::{Arena, FunctionBuilder, OpcodeTable};
use xenon_jit::NativeBackend;

use crate::{
    debugger::{Breakpoint, BreakpointKind, Debugger, Request, Response},
    tracer::{TraceEvent, Tracer},
};

/// A guest function that is ready to run.
#[derive(Debug)]
pub struct CompiledFunction {
    pub address: u32,
    /// Address of the last instruction.
    pub end_address: u32,
    pub backend: BackendKind,
    pub entry: EntryPoint,
    pub debug_info: Option<DebugInfo>,
    pub spill_slots: u32,
}

impl CompiledFunction {
    pub fn contains(&self, address: u32) -> bool {
        (self.address..=self.end_address).contains(&address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// Guest code is always 4 byte aligned.
    Misaligned(u32),
    /// Every attempt to compile the function failed.
    Failed(u32),
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Misaligned(addr) => write!(f, "misaligned function address: {addr:#x}"),
            Self::Failed(addr) => write!(f, "failed to compile function at {addr:#x}"),
        }
    }
}

impl std::error::Error for ResolveError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    Resolve(ResolveError),
    /// Execution stopped with an exception, which is also left in the thread state.
    Exception(Exception),
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolve(e) => write!(f, "{e}"),
            Self::Exception(e) => write!(f, "unhandled exception: {e}"),
        }
    }
}

impl std::error::Error for ExecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Resolve(e) => Some(e),
            Self::Exception(_) => None,
        }
    }
}

impl From<ResolveError> for ExecError {
    fn from(value: ResolveError) -> Self {
        Self::Resolve(value)
    }
}

/// Why a single compilation attempt failed.
#[derive(Debug)]
enum CompileError {
    Translate(TranslateError),
    Pass(PassError),
    Assemble(AssembleError),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Translate(e) => write!(f, "translation failed: {e}"),
            Self::Pass(e) => write!(f, "compiler pass failed: {e}"),
            Self::Assemble(e) => write!(f, "assembly failed: {e}"),
        }
    }
}

impl From<TranslateError> for CompileError {
    fn from(value: TranslateError) -> Self {
        Self::Translate(value)
    }
}

impl From<PassError> for CompileError {
    fn from(value: PassError) -> Self {
        Self::Pass(value)
    }
}

impl From<AssembleError> for CompileError {
    fn from(value: AssembleError) -> Self {
        Self::Assemble(value)
    }
}

enum CacheState {
    Unscanned,
    /// Claimed by a thread that will publish the result.
    Compiling,
    Compiled(Arc<CompiledFunction>),
    Failed,
}

struct CacheEntry {
    state: CacheState,
    compilations: usize,
}

impl CacheEntry {
    fn new() -> Self {
        Self { state: CacheState::Unscanned, compilations: 0 }
    }
}

/// Publishes a failure for a claimed entry if the claiming thread unwinds before publishing.
struct Claim<'a> {
    runtime: &'a Runtime,
    address: u32,
    published: bool,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.published {
            self.runtime.publish(self.address, None);
        }
    }
}

#[derive(Default)]
struct Trampolines {
    index: HashMap<(String, u32), u32>,
    functions: Vec<ExportFn>,
}

pub struct Runtime {
    pub config: Config,
    memory: Arc<dyn Memory>,
    exports: Arc<dyn ExportResolver>,
    symbols: SymbolDatabase,
    table: Arc<OpcodeTable>,
    scanner: Scanner,
    translator: Translator,
    compiler: Compiler,
    fallback_compiler: Compiler,
    native: Option<Mutex<NativeBackend>>,
    cache: Mutex<HashMap<u32, CacheEntry>>,
    cache_ready: Condvar,
    arenas: Mutex<Vec<Arena>>,
    trampolines: RwLock<Trampolines>,
    debugger: Debugger,
    tracer: Tracer,
}

impl Runtime {
    pub(crate) fn new(
        config: Config,
        table: Arc<OpcodeTable>,
        memory: Arc<dyn Memory>,
        exports: Arc<dyn ExportResolver>,
        native: Option<NativeBackend>,
    ) -> Self {
        let options = CompilerOptions { optimize: config.optimize, validate: config.validate };
        let fallback_options = CompilerOptions { optimize: false, validate: config.validate };
        Self {
            scanner: Scanner::new(memory.clone(), config.max_scan_instructions),
            translator: Translator::new(config.break_on_unimplemented),
            compiler: Compiler::new(&table, options),
            fallback_compiler: Compiler::new(&table, fallback_options),
            native: native.map(Mutex::new),
            table,
            memory,
            exports,
            symbols: SymbolDatabase::new(),
            cache: Mutex::new(HashMap::new()),
            cache_ready: Condvar::new(),
            arenas: Mutex::new(vec![]),
            trampolines: RwLock::new(Trampolines::default()),
            debugger: Debugger::new(),
            tracer: Tracer::new(),
            config,
        }
    }

    pub fn memory(&self) -> &Arc<dyn Memory> {
        &self.memory
    }

    pub fn symbols(&self) -> &SymbolDatabase {
        &self.symbols
    }

    pub fn opcode_table(&self) -> &Arc<OpcodeTable> {
        &self.table
    }

    pub fn debugger(&self) -> &Debugger {
        &self.debugger
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// Whether functions are compiled to native code when possible.
    pub fn has_native_backend(&self) -> bool {
        self.native.is_some()
    }

    /// Creates the state for a new guest thread. `r1` points at the top of the stack and `r13` at
    /// the processor control region.
    pub fn create_thread_state(
        self: &Arc<Self>,
        id: u32,
        stack_address: u32,
        stack_size: u32,
        pcr_address: u32,
    ) -> ThreadState {
        let mut thread = ThreadState::new(self.clone(), id);
        thread.stack_address = stack_address;
        thread.stack_size = stack_size;
        thread.pcr_address = pcr_address;
        thread.ctx.r[1] = stack_address.wrapping_add(stack_size) as u64;
        thread.ctx.r[13] = pcr_address as u64;
        thread
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<u32, CacheEntry>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the compiled function at `address`, compiling it if this is the first request.
    ///
    /// Concurrent requests for the same function compile it once: one thread claims the entry and
    /// the others wait for it to publish the result.
    pub fn resolve(&self, address: u32) -> Result<Arc<CompiledFunction>, ResolveError> {
        if address & 0b11 != 0 {
            return Err(ResolveError::Misaligned(address));
        }

        let mut cache = self.lock_cache();
        loop {
            let entry = cache.entry(address).or_insert_with(CacheEntry::new);
            match &entry.state {
                CacheState::Compiled(func) => return Ok(func.clone()),
                CacheState::Failed => return Err(ResolveError::Failed(address)),
                CacheState::Compiling => {
                    cache = self.cache_ready.wait(cache).unwrap_or_else(|e| e.into_inner());
                }
                CacheState::Unscanned => {
                    entry.state = CacheState::Compiling;
                    break;
                }
            }
        }
        drop(cache);

        self.compile_claimed(address)
    }

    /// Returns the function at `address` if it has already been compiled.
    pub fn lookup_compiled(&self, address: u32) -> Option<Arc<CompiledFunction>> {
        match &self.lock_cache().get(&address)?.state {
            CacheState::Compiled(func) => Some(func.clone()),
            _ => None,
        }
    }

    /// The number of functions that are currently compiled.
    pub fn compiled_count(&self) -> usize {
        let cache = self.lock_cache();
        cache.values().filter(|x| matches!(x.state, CacheState::Compiled(_))).count()
    }

    /// The number of times the function at `address` has been translated.
    pub fn translation_count(&self, address: u32) -> usize {
        self.lock_cache().get(&address).map_or(0, |x| x.compilations)
    }

    /// Compiles an entry this thread has moved to `Compiling` and publishes the result.
    fn compile_claimed(&self, address: u32) -> Result<Arc<CompiledFunction>, ResolveError> {
        let mut claim = Claim { runtime: self, address, published: false };
        let func = self.compile(address).ok().map(Arc::new);
        claim.published = true;
        self.publish(address, func.clone());
        func.ok_or(ResolveError::Failed(address))
    }

    fn publish(&self, address: u32, func: Option<Arc<CompiledFunction>>) {
        let mut cache = self.lock_cache();
        let entry = cache.entry(address).or_insert_with(CacheEntry::new);
        entry.compilations += 1;
        entry.state = match func {
            Some(func) => CacheState::Compiled(func),
            None => CacheState::Failed,
        };
        drop(cache);
        self.cache_ready.notify_all();
    }

    fn take_arena(&self) -> Arena {
        let arena = self.arenas.lock().unwrap_or_else(|e| e.into_inner()).pop();
        arena.unwrap_or_else(|| Arena::with_chunk_size(self.config.arena_chunk_size))
    }

    fn return_arena(&self, mut arena: Arena) {
        arena.reset();
        self.arenas.lock().unwrap_or_else(|e| e.into_inner()).push(arena);
    }

    fn compile(&self, address: u32) -> Result<CompiledFunction, CompileError> {
        let symbol = self.symbols.get_or_insert(address);
        if symbol.begin_scan() {
            self.scanner.find_extents(&self.symbols, &symbol);
        }

        let mut arena = self.take_arena();
        let result = self.compile_symbol(&symbol, &mut arena);
        self.return_arena(arena);

        match result {
            Ok(func) => {
                symbol.define();
                tracing::debug!(
                    "{address:#x}..={:#x}: compiled with the {} backend",
                    func.end_address,
                    func.backend
                );
                self.tracer.emit(TraceEvent::compiled(address, func.end_address, func.backend));
                Ok(func)
            }
            Err(e) => {
                symbol.fail();
                tracing::error!("{address:#x}: {e}");
                self.tracer.emit(TraceEvent::FunctionFailed { address });
                Err(e)
            }
        }
    }

    /// Compiles with the configured backend, retrying with the unoptimized interpreter path if
    /// any stage fails.
    fn compile_symbol(
        &self,
        symbol: &FunctionSymbol,
        arena: &mut Arena,
    ) -> Result<CompiledFunction, CompileError> {
        let backend = match self.native.is_some() {
            true => self.config.backend,
            false => BackendKind::Interpreter,
        };
        let can_retry = backend == BackendKind::Native || self.config.optimize;

        let err = match self.try_compile(symbol, arena, &self.compiler, backend) {
            Ok(func) => return Ok(func),
            Err(e) if !can_retry => return Err(e),
            Err(e) => e,
        };
        tracing::warn!("{:#x}: {err}, falling back to the interpreter", symbol.address);

        arena.reset();
        self.try_compile(symbol, arena, &self.fallback_compiler, BackendKind::Interpreter)
    }

    fn try_compile(
        &self,
        symbol: &FunctionSymbol,
        arena: &Arena,
        compiler: &Compiler,
        backend: BackendKind,
    ) -> Result<CompiledFunction, CompileError> {
        let flags = self.config.debug_info;
        let mut debug_info = (!flags.is_empty()).then(|| DebugInfo::new(flags));

        let mut f = FunctionBuilder::new(symbol.address);
        self.translator.translate(self, symbol, &mut f, arena, &mut debug_info)?;
        let mut func = f.finish();

        if let Some(info) = debug_info.as_mut().filter(|x| x.wants(DebugInfoFlags::HIR_BEFORE)) {
            info.hir_before = Some(func.display().to_string());
        }
        compiler.compile(&mut func)?;
        if let Some(info) = debug_info.as_mut().filter(|x| x.wants(DebugInfoFlags::HIR_AFTER)) {
            info.hir_after = Some(func.display().to_string());
        }

        let entry = match (backend, &self.native) {
            (BackendKind::Native, Some(native)) => {
                let mut native = native.lock().unwrap_or_else(|e| e.into_inner());
                let result = native.assemble(&func, arena, &mut debug_info);
                native.reset();
                result?
            }
            _ => InterpreterBackend::new(self.table.clone()).assemble(
                &func,
                arena,
                &mut debug_info,
            )?,
        };

        Ok(CompiledFunction {
            address: symbol.address,
            end_address: symbol.end_address(),
            backend: entry.kind(),
            spill_slots: entry.spill_slots(),
            entry,
            debug_info,
        })
    }

    /// Runs the function at `address` on `thread`, following branches into other functions until
    /// the guest returns.
    pub fn execute(&self, thread: &mut ThreadState, address: u32) -> Result<(), ExecError> {
        let mut address = address;
        loop {
            if let Err(e) = self.enter(thread, address) {
                thread.ctx.jump_pending = 0;
                return Err(e);
            }
            match thread.ctx.take_jump() {
                Some(next) => address = next,
                None => return Ok(()),
            }
        }
    }

    /// Runs the function at `address` once. Branches out of it are left pending in the context.
    fn enter(&self, thread: &mut ThreadState, address: u32) -> Result<(), ExecError> {
        if self.debugger.take_pause_request(address) {
            tracing::debug!("thread {}: paused at {address:#x}", thread.id);
            self.tracer.emit(TraceEvent::BreakpointHit { address });
            thread.raise(ExceptionCode::Breakpoint, address as u64);
            return Err(ExecError::Exception(thread.exception));
        }

        let func = match self.resolve(address) {
            Ok(func) => func,
            Err(e) => {
                thread.raise(ExceptionCode::InvalidTarget, address as u64);
                return Err(e.into());
            }
        };
        if self.config.trace_functions {
            self.tracer.emit(TraceEvent::FunctionEnter { address, thread_id: thread.id });
        }

        func.entry.call(thread);
        match thread.exception.is_none() {
            true => Ok(()),
            false => Err(ExecError::Exception(thread.exception)),
        }
    }

    pub fn add_breakpoint(&self, breakpoint: Breakpoint) {
        if self.debugger.insert(breakpoint) {
            self.invalidate(breakpoint.address);
        }
    }

    /// Returns false if there was no breakpoint at `address`.
    pub fn remove_breakpoint(&self, address: u32) -> bool {
        if self.debugger.remove(address).is_none() {
            return false;
        }
        self.invalidate(address);
        true
    }

    /// Recompiles every compiled function containing `address`. Threads already running the old
    /// code finish with it.
    fn invalidate(&self, address: u32) {
        let mut claimed = vec![];
        for (&start, entry) in self.lock_cache().iter_mut() {
            if matches!(&entry.state, CacheState::Compiled(func) if func.contains(address)) {
                entry.state = CacheState::Compiling;
                claimed.push(start);
            }
        }
        for start in claimed {
            tracing::debug!("{start:#x}: recompiling for breakpoint change at {address:#x}");
            let _ = self.compile_claimed(start);
        }
    }

    pub fn handle_debug_request(&self, request: Request) -> Response {
        self.debugger.handle_request(self, request)
    }

    /// Returns the trampoline slot of an import, resolving and registering it on first use.
    fn register_export(&self, module: &str, ordinal: u32) -> Option<u32> {
        let key = (module.to_ascii_lowercase(), ordinal);
        let trampolines = self.trampolines.read().unwrap_or_else(|e| e.into_inner());
        if let Some(&index) = trampolines.index.get(&key) {
            return Some(index);
        }
        drop(trampolines);

        let func = self.exports.resolve(module, ordinal)?;
        let mut trampolines = self.trampolines.write().unwrap_or_else(|e| e.into_inner());
        let Trampolines { index, functions } = &mut *trampolines;
        let slot = *index.entry(key).or_insert_with(|| {
            functions.push(func);
            (functions.len() - 1) as u32
        });
        tracing::trace!("{module}:{ordinal} registered as extern {slot}");
        Some(slot)
    }
}

impl TranslationEnv for Runtime {
    fn memory(&self) -> &dyn Memory {
        &*self.memory
    }

    fn has_breakpoint(&self, address: u32) -> bool {
        self.debugger.has_breakpoint(address)
    }

    fn extern_index(&self, module: &str, ordinal: u32) -> Option<u32> {
        self.register_export(module, ordinal)
    }
}

impl Processor for Runtime {
    fn memory(&self) -> &dyn Memory {
        &*self.memory
    }

    fn call(&self, thread: &mut ThreadState, address: u32) {
        if let Err(e) = self.execute(thread, address) {
            tracing::trace!("thread {}: call to {address:#x} stopped: {e}", thread.id);
        }
    }

    fn call_extern(&self, thread: &mut ThreadState, index: u32) {
        let trampolines = self.trampolines.read().unwrap_or_else(|e| e.into_inner());
        let func = trampolines.functions.get(index as usize).cloned();
        drop(trampolines);
        match func {
            Some(func) => func(thread),
            None => thread.raise(ExceptionCode::UnknownExtern, index as u64),
        }
    }

    fn debug_break(&self, thread: &mut ThreadState, address: u32) {
        tracing::debug!("thread {}: break at {address:#x}", thread.id);
        let hit = self.debugger.on_hit(address);
        if hit.map_or(false, |x| x.kind == BreakpointKind::Step) {
            self.remove_breakpoint(address);
        }
        self.tracer.emit(TraceEvent::BreakpointHit { address });
        thread.raise(ExceptionCode::Breakpoint, address as u64);
    }
}
