//! PowerPC decoding, function discovery and translation to HIR.

pub mod decode;
pub mod disasm;
pub mod scanner;

mod emit_altivec;
mod emit_alu;
mod emit_control;
mod emit_fpu;
mod emit_memory;
mod translator;

pub use self::{
    scanner::{BlockInfo, Scanner},
    translator::{TranslateError, TranslationEnv, Translator},
};
