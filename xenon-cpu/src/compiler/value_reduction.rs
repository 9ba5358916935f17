use xenon_hir::{Function, OpcodeTable, ValueId};

use crate::compiler::{CompilerPass, PassError};

/// Numbers instructions in program order and records the last use of every value.
pub struct ValueReductionPass;

impl CompilerPass for ValueReductionPass {
    fn name(&self) -> &'static str {
        "value_reduction"
    }

    fn run(&self, func: &mut Function, _: &OpcodeTable) -> Result<(), PassError> {
        for (ordinal, instr) in func.all_instrs().into_iter().enumerate() {
            func.instr_mut(instr).ordinal = ordinal as u32;
        }

        for index in 0..func.value_count() {
            let value = ValueId(index as u32);
            let last_use = func
                .value(value)
                .uses
                .iter()
                .copied()
                .filter(|x| !func.instr(*x).removed)
                .max_by_key(|x| func.instr(*x).ordinal);
            func.value_mut(value).last_use = last_use;
        }
        Ok(())
    }
}

#[test]
fn last_use_is_latest_user() {
    use xenon_hir::{FunctionBuilder, TypeName};

    let mut f = FunctionBuilder::new(0x8200_0000);
    let a = f.load_context(0x18, TypeName::I64);
    let b = f.add(a, a);
    f.store_context(0x20, b);
    f.store_context(0x28, a);
    let unused = f.load_context(0x30, TypeName::I64);
    f.ret();
    let mut f = f.finish();

    ValueReductionPass.run(&mut f, &OpcodeTable::new()).unwrap();
    let instrs = f.all_instrs();
    assert_eq!(f.instr(instrs[3]).ordinal, 3);
    assert_eq!(f.value(a).last_use, Some(instrs[3]));
    assert_eq!(f.value(b).last_use, Some(instrs[2]));
    assert_eq!(f.value(unused).last_use, None);
}
