//! High level intermediate representation used by the translator.

pub mod arena;
pub mod builder;
pub mod display;
pub mod eval;
mod function;
mod opcode;
mod value;

pub use crate::{
    arena::Arena,
    builder::{trap_code, FunctionBuilder},
    display::HirDisplay,
    function::{Block, BlockId, Function, Instr, InstrId, Label, LabelId, Operand, ValueId},
    opcode::{Opcode, OpcodeFlags, OpcodeInfo, OpcodeTable, OperandKind, Signature},
    value::{TypeName, Value},
};
