use xenon_hir::{Function, InstrId, Opcode, OpcodeTable, Operand, OperandKind, ValueId};

use crate::compiler::{CompilerPass, PassError};

/// Checks the structural invariants of a function. Violations are bugs in the translator or a
/// pass, so they panic instead of failing the compilation.
pub struct ValidationPass;

impl CompilerPass for ValidationPass {
    fn name(&self) -> &'static str {
        "validate"
    }

    fn run(&self, func: &mut Function, table: &OpcodeTable) -> Result<(), PassError> {
        validate(func, table);
        Ok(())
    }
}

fn operand_matches(kind: OperandKind, operand: &Operand) -> bool {
    matches!(
        (kind, operand),
        (OperandKind::None, Operand::None)
            | (OperandKind::Value, Operand::Value(_))
            | (OperandKind::Label, Operand::Label(_))
            | (OperandKind::Offset, Operand::Offset(_))
            | (OperandKind::Symbol, Operand::Symbol(_))
            | (OperandKind::Extern, Operand::Extern(_))
            | (OperandKind::Comment, Operand::Comment(_))
    )
}

/// Opcodes where both value operands must have the same type.
fn requires_same_types(opcode: Opcode) -> bool {
    use Opcode::*;
    matches!(
        opcode,
        CompareEq
            | CompareNe
            | CompareSlt
            | CompareSle
            | CompareSgt
            | CompareSge
            | CompareUlt
            | CompareUle
            | CompareUgt
            | CompareUge
            | Add
            | AddWithCarry
            | Sub
            | Mul
            | MulHi
            | MulHiUnsigned
            | Div
            | DivUnsigned
            | MulAdd
            | MulSub
            | AddCarryOut
            | AdcCarryOut
            | SubCarryOut
            | AddOverflow
            | SubOverflow
            | And
            | Or
            | Xor
    )
}

pub fn validate(func: &Function, table: &OpcodeTable) {
    let address = func.address;
    func.assert_no_block_cycles();

    for block in func.block_ids() {
        func.assert_no_cycles(block);
        assert!(!func.block(block).removed, "{address:#x}: removed block {block} is still linked");

        for instr in func.instr_ids(block) {
            let i = func.instr(instr);
            let name = table.name(i.opcode);
            assert_eq!(
                i.block, block,
                "{address:#x}: {instr} ({name}) is linked into the wrong block"
            );
            assert!(!i.removed, "{address:#x}: removed instruction {instr} is still linked");

            let signature = table.info(i.opcode).signature;
            assert_eq!(
                i.dest.is_some(),
                signature.dest,
                "{address:#x}: {instr} ({name}) has the wrong destination"
            );
            for (slot, (kind, operand)) in signature.src.iter().zip(&i.src).enumerate() {
                assert!(
                    operand_matches(*kind, operand),
                    "{address:#x}: {instr} ({name}) operand {slot} is {operand:?}, \
                     expected {kind:?}"
                );
            }

            if let Some(dest) = i.dest {
                assert_eq!(
                    func.value(dest).def,
                    Some(instr),
                    "{address:#x}: {dest} is not defined by {instr} ({name})"
                );
            }

            if requires_same_types(i.opcode) {
                let (a, b) = (i.src_value(0), i.src_value(1));
                assert_eq!(
                    func.ty(a),
                    func.ty(b),
                    "{address:#x}: {instr} ({name}) operand types do not match"
                );
            }
            if i.opcode == Opcode::Select {
                let (a, b) = (i.src_value(1), i.src_value(2));
                assert_eq!(func.ty(a), func.ty(b), "{address:#x}: {instr} select types differ");
            }

            for value in i.value_operands() {
                check_use(func, value, instr);
            }
            if let Some(label) = i.src.iter().find_map(|x| x.as_label()) {
                let target = func.label(label).block;
                assert!(
                    target.map_or(false, |x| !func.block(x).removed),
                    "{address:#x}: {instr} ({name}) targets unbound label {label}"
                );
            }
        }
    }

    for value in func.values() {
        for user in &value.uses {
            let i = func.instr(*user);
            assert!(!i.removed, "{address:#x}: {} is used by removed instruction {user}", value.id);
            assert!(
                i.value_operands().any(|x| x == value.id),
                "{address:#x}: {user} is in the use list of {} but does not use it",
                value.id
            );
        }
    }
}

fn check_use(func: &Function, value: ValueId, instr: InstrId) {
    assert!(
        func.value(value).uses.contains(&instr),
        "{:#x}: {instr} uses {value} but is missing from its use list",
        func.address
    );
    assert!(
        func.value(value).is_constant() || func.value(value).def.is_some(),
        "{:#x}: {instr} uses {value} which has no definition",
        func.address
    );
}
