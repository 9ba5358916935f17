use std::sync::Arc;

use crate::{context::PpcContext, mem::Memory};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ExceptionCode {
    None = 0,

    /// The frontend could not translate an instruction.
    Unimplemented = 1,
    /// A guest `tw`/`twi` trap was taken.
    Trap = 2,
    /// A system call with no handler.
    Syscall = 3,
    InvalidInstruction = 4,

    ReadUnmapped = 5,
    WriteUnmapped = 6,

    /// A debugger breakpoint was hit.
    Breakpoint = 7,
    /// A called function could not be compiled.
    InvalidTarget = 8,
    /// A `call_extern` referenced an unknown trampoline.
    UnknownExtern = 9,

    UnknownError = 0xff,
}

impl ExceptionCode {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0 => Self::None,
            1 => Self::Unimplemented,
            2 => Self::Trap,
            3 => Self::Syscall,
            4 => Self::InvalidInstruction,
            5 => Self::ReadUnmapped,
            6 => Self::WriteUnmapped,
            7 => Self::Breakpoint,
            8 => Self::InvalidTarget,
            9 => Self::UnknownExtern,
            _ => Self::UnknownError,
        }
    }

    /// Maps a `trap` instruction code to the exception it raises.
    pub fn from_trap_code(code: u64) -> Self {
        match code {
            xenon_hir::trap_code::UNIMPLEMENTED => Self::Unimplemented,
            xenon_hir::trap_code::TRAP => Self::Trap,
            xenon_hir::trap_code::SYSCALL => Self::Syscall,
            xenon_hir::trap_code::INVALID_INSTRUCTION => Self::InvalidInstruction,
            _ => Self::UnknownError,
        }
    }
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct Exception {
    pub code: u32,
    pub value: u64,
}

impl Exception {
    #[inline]
    pub fn new(code: ExceptionCode, value: u64) -> Self {
        Self { code: code as u32, value }
    }

    #[inline]
    pub fn none() -> Self {
        Self::new(ExceptionCode::None, 0)
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        self.code == ExceptionCode::None as u32
    }

    #[inline]
    pub fn clear(&mut self) {
        self.code = ExceptionCode::None as u32;
        self.value = 0;
    }

    #[inline]
    pub fn kind(&self) -> ExceptionCode {
        ExceptionCode::from_u32(self.code)
    }
}

impl std::fmt::Display for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} at {:#x}", self.kind(), self.value)
    }
}

/// Services that generated code needs from the runtime that owns it.
pub trait Processor: Send + Sync {
    fn memory(&self) -> &dyn Memory;

    /// Calls the guest function at `address`. Failures are reported through `thread.exception`.
    fn call(&self, thread: &mut ThreadState, address: u32);

    /// Calls the host function registered in trampoline slot `index`.
    fn call_extern(&self, thread: &mut ThreadState, index: u32);

    /// Invoked when a `debug_break` instruction is reached.
    fn debug_break(&self, thread: &mut ThreadState, address: u32);
}

/// Per guest thread state. Passed explicitly to generated code, which reaches the runtime
/// through `processor`.
#[repr(C)]
pub struct ThreadState {
    /// Must be the first field: context offsets are used as offsets into the thread state.
    pub ctx: PpcContext,
    pub exception: Exception,
    pub id: u32,
    pub stack_address: u32,
    pub stack_size: u32,
    pub pcr_address: u32,
    /// Set by `set_return_address`.
    pub return_address: u64,
    pub processor: Arc<dyn Processor>,
}

impl ThreadState {
    pub fn new(processor: Arc<dyn Processor>, id: u32) -> Self {
        Self {
            ctx: PpcContext::default(),
            exception: Exception::none(),
            id,
            stack_address: 0,
            stack_size: 0,
            pcr_address: 0,
            return_address: 0,
            processor,
        }
    }

    #[inline]
    pub fn processor(&self) -> &Arc<dyn Processor> {
        &self.processor
    }

    #[inline]
    pub fn raise(&mut self, code: ExceptionCode, value: u64) {
        self.exception = Exception::new(code, value);
    }

    /// Takes the pending exception, if any.
    pub fn take_exception(&mut self) -> Option<Exception> {
        if self.exception.is_none() {
            return None;
        }
        Some(std::mem::take(&mut self.exception))
    }
}

#[test]
fn context_is_first_field() {
    assert_eq!(memoffset::offset_of!(ThreadState, ctx), 0);
}
