//! Guest CPU model of the translator: the PowerPC context and thread state, the frontend that
//! lifts guest code to HIR, the optimization pipeline and the interpreter backend.

pub mod backend;
pub mod compiler;
mod config;
pub mod context;
pub mod debug_info;
pub mod exec;
pub mod exports;
pub mod frontend;
pub mod mem;
pub mod sdb;
mod thread;

pub use crate::{
    backend::{AssembleError, Assembler, BackendKind, EntryPoint, NativeFn, NativeFunction},
    config::Config,
    context::PpcContext,
    debug_info::{DebugInfo, DebugInfoFlags},
    exports::{ExportFn, ExportResolver, ExportTable, NullExportResolver},
    mem::{Endian, FlatMemory, MemError, MemResult, Memory},
    sdb::{FunctionSymbol, SymbolDatabase, SymbolState},
    thread::{Exception, ExceptionCode, Processor, ThreadState},
};
