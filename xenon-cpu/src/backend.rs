use std::sync::Arc;

use xenon_hir::{Arena, Function, Opcode, TypeName};

use crate::{debug_info::DebugInfo, exec::InterpreterFunction, ThreadState};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Interpreter,
    Native,
}

impl BackendKind {
    /// The native backend emits `sysv64` code, so it is only available on x86-64 unix hosts.
    pub fn default_for_host() -> Self {
        match Self::native_supported() {
            true => Self::Native,
            false => Self::Interpreter,
        }
    }

    pub fn native_supported() -> bool {
        let host = target_lexicon::HOST;
        host.architecture == target_lexicon::Architecture::X86_64
            && matches!(
                host.operating_system,
                target_lexicon::OperatingSystem::Linux
                    | target_lexicon::OperatingSystem::Darwin
                    | target_lexicon::OperatingSystem::Freebsd
            )
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Interpreter => 0,
            Self::Native => 1,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interpreter => f.write_str("interpreter"),
            Self::Native => f.write_str("native"),
        }
    }
}

/// Signature of natively compiled functions: the thread state and a scratch area with room for
/// `NativeFunction::spill_slots` 64-bit values.
pub type NativeFn = unsafe extern "sysv64" fn(*mut ThreadState, *mut u64);

#[derive(Clone, Copy)]
pub struct NativeFunction {
    pub entry: NativeFn,
    pub spill_slots: u32,
    pub code_size: usize,
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunction")
            .field("entry", &(self.entry as usize as *const u8))
            .field("spill_slots", &self.spill_slots)
            .field("code_size", &self.code_size)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub enum EntryPoint {
    Interpreted(Arc<InterpreterFunction>),
    Native(NativeFunction),
}

impl EntryPoint {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Interpreted(_) => BackendKind::Interpreter,
            Self::Native(_) => BackendKind::Native,
        }
    }

    pub fn spill_slots(&self) -> u32 {
        match self {
            Self::Interpreted(_) => 0,
            Self::Native(f) => f.spill_slots,
        }
    }

    /// Runs the function on `thread`. Exceptions are left in `thread.exception`.
    pub fn call(&self, thread: &mut ThreadState) {
        match self {
            Self::Interpreted(func) => crate::exec::interpret(thread, func),
            Self::Native(func) => {
                let mut spill = vec![0_u64; func.spill_slots.max(1) as usize];
                // SAFETY: `entry` was produced by the native backend for a function with
                // `spill_slots` slots, and the backend outlives every entry point it creates.
                unsafe { (func.entry)(thread, spill.as_mut_ptr()) }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembleError {
    /// The backend has no lowering for an instruction.
    NoPattern { opcode: Opcode, ty: Option<TypeName> },
    /// The function uses a feature the backend does not support.
    Unsupported(String),
    /// The code generator rejected the function.
    Codegen(String),
    /// The backend is not available on this host.
    UnsupportedHost,
}

impl std::fmt::Display for AssembleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoPattern { opcode, ty: Some(ty) } => {
                write!(f, "no lowering for `{}` ({ty})", opcode.name())
            }
            Self::NoPattern { opcode, ty: None } => {
                write!(f, "no lowering for `{}`", opcode.name())
            }
            Self::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            Self::Codegen(msg) => write!(f, "code generation failed: {msg}"),
            Self::UnsupportedHost => write!(f, "backend is not supported on this host"),
        }
    }
}

impl std::error::Error for AssembleError {}

pub trait Assembler: Send {
    fn kind(&self) -> BackendKind;

    fn initialize(&mut self) -> Result<(), AssembleError>;

    /// Drops per-compilation state.
    fn reset(&mut self);

    /// Compiles an optimized function. `arena` is scratch space that is reset by the caller after
    /// the call returns.
    fn assemble(
        &mut self,
        func: &Function,
        arena: &Arena,
        debug_info: &mut Option<DebugInfo>,
    ) -> Result<EntryPoint, AssembleError>;
}
