//! The fixed HIR optimization pipeline run on every translated function.

mod cfa;
mod cfs;
mod const_prop;
mod dce;
mod mem2reg;
mod simplify;
mod validate;
mod value_reduction;

use std::sync::Arc;

use xenon_hir::{Function, LabelId, OpcodeTable};

pub use self::{
    cfa::ControlFlowAnalysisPass, cfs::ControlFlowSimplificationPass,
    const_prop::ConstantPropagationPass, dce::DeadCodeEliminationPass, mem2reg::Mem2RegPass,
    simplify::SimplificationPass, validate::ValidationPass, value_reduction::ValueReductionPass,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassError {
    /// A branch refers to a label that was never bound to a block.
    UnboundLabel { address: u32, label: LabelId },
    /// The function has no blocks.
    Empty(u32),
}

impl std::fmt::Display for PassError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnboundLabel { address, label } => {
                write!(f, "{address:#x}: branch to unbound label {label}")
            }
            Self::Empty(address) => write!(f, "{address:#x}: function has no code"),
        }
    }
}

impl std::error::Error for PassError {}

pub trait CompilerPass: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, func: &mut Function, table: &OpcodeTable) -> Result<(), PassError>;
}

#[derive(Clone, Copy, Debug)]
pub struct CompilerOptions {
    /// Run the optimization passes. Without this only analysis passes are run.
    pub optimize: bool,

    /// Always run the validation pass (it always runs in debug builds).
    pub validate: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self { optimize: true, validate: false }
    }
}

pub struct Compiler {
    table: Arc<OpcodeTable>,
    passes: Vec<Box<dyn CompilerPass>>,
}

impl Compiler {
    pub fn new(table: &Arc<OpcodeTable>, options: CompilerOptions) -> Self {
        let mut passes: Vec<Box<dyn CompilerPass>> = vec![Box::new(ControlFlowAnalysisPass)];
        if options.optimize {
            passes.push(Box::new(ControlFlowSimplificationPass));
            passes.push(Box::new(Mem2RegPass));
            passes.push(Box::new(ConstantPropagationPass));
            passes.push(Box::new(SimplificationPass));
        }
        passes.push(Box::new(ValueReductionPass));
        if options.optimize {
            passes.push(Box::new(DeadCodeEliminationPass));
        }
        if cfg!(debug_assertions) || options.validate {
            passes.push(Box::new(ValidationPass));
        }
        Self { table: table.clone(), passes }
    }

    pub fn table(&self) -> &Arc<OpcodeTable> {
        &self.table
    }

    pub fn pass_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.passes.iter().map(|pass| pass.name())
    }

    /// Runs every registered pass over `func` in order, stopping at the first failure.
    pub fn compile(&self, func: &mut Function) -> Result<(), PassError> {
        if func.first_block().is_none() {
            return Err(PassError::Empty(func.address));
        }
        for pass in &self.passes {
            tracing::trace!("{:#x}: running {}", func.address, pass.name());
            pass.run(func, &self.table)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pipeline_order() {
        let table = Arc::new(OpcodeTable::new());
        let compiler = Compiler::new(&table, CompilerOptions { optimize: true, validate: true });
        assert_eq!(compiler.pass_names().collect::<Vec<_>>(), vec![
            "cfa",
            "cfs",
            "mem2reg",
            "const_prop",
            "simplify",
            "value_reduction",
            "dce",
            "validate",
        ]);

        let compiler = Compiler::new(&table, CompilerOptions { optimize: false, validate: true });
        assert_eq!(compiler.pass_names().collect::<Vec<_>>(), vec![
            "cfa",
            "value_reduction",
            "validate"
        ]);
    }

    #[test]
    fn empty_function_is_rejected() {
        let table = Arc::new(OpcodeTable::new());
        let compiler = Compiler::new(&table, CompilerOptions::default());
        let mut func = Function::new(0x8200_0000);
        assert_eq!(compiler.compile(&mut func), Err(PassError::Empty(0x8200_0000)));
    }
}
