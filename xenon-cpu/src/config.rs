use crate::{backend::BackendKind, debug_info::DebugInfoFlags};

#[derive(Clone, Debug)]
pub struct Config {
    /// The backend used to compile functions. Functions that the native backend cannot handle are
    /// always compiled with the interpreter.
    pub backend: BackendKind,

    /// Run the optimization passes.
    pub optimize: bool,

    /// Run the HIR validation pass even in release builds.
    pub validate: bool,

    /// Dumps to keep for each compiled function.
    pub debug_info: DebugInfoFlags,

    /// Emit a trace event every time a function is entered.
    pub trace_functions: bool,

    /// Stop with a breakpoint instead of a trap when reaching untranslated code.
    pub break_on_unimplemented: bool,

    pub arena_chunk_size: usize,

    /// Functions longer than this are translated one instruction at a time.
    pub max_scan_instructions: usize,
}

impl Config {
    /// Returns a configuration that only uses the interpreter.
    pub fn interpreter() -> Self {
        Self { backend: BackendKind::Interpreter, ..Self::default() }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::default_for_host(),
            optimize: true,
            validate: false,
            debug_info: DebugInfoFlags::empty(),
            trace_functions: false,
            break_on_unimplemented: false,
            arena_chunk_size: xenon_hir::arena::DEFAULT_CHUNK_SIZE,
            max_scan_instructions: 0x4000,
        }
    }
}
