//! Execution of HIR without native code generation.

mod interpreter;

pub use self::interpreter::{interpret, InterpreterBackend, InterpreterFunction};
