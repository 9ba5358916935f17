use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpcodeFlags: u32 {
        /// The instruction may transfer control out of the current block.
        const BRANCH = 1 << 0;
        /// The instruction has side effects and must never be removed.
        const VOLATILE = 1 << 1;
        /// The instruction may raise a guest exception.
        const MAY_TRAP = 1 << 2;
        /// The instruction only exists for debugging and generates no code.
        const IGNORE = 1 << 3;
        const COMMUTATIVE = 1 << 4;
        const DISALLOW_CONSTANT_FOLDING = 1 << 5;
        /// The instruction accesses guest memory.
        const MEMORY = 1 << 6;
    }
}

/// The kind of operand expected in a source slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    None,
    Value,
    Label,
    Offset,
    Symbol,
    Extern,
    Comment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature {
    pub dest: bool,
    pub src: [OperandKind; 3],
}

impl Signature {
    const fn new(dest: bool, src: [OperandKind; 3]) -> Self {
        Self { dest, src }
    }
}

#[derive(Debug, Clone)]
pub struct OpcodeInfo {
    pub opcode: Opcode,
    pub name: &'static str,
    pub signature: Signature,
    pub flags: OpcodeFlags,
}

macro_rules! opcodes {
    ($($name:ident),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u16)]
        pub enum Opcode {
            $($name,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];
        }
    };
}

opcodes! {
    Comment,
    Nop,
    SourceOffset,
    DebugBreak,
    DebugBreakTrue,
    Trap,
    TrapTrue,

    Call,
    CallTrue,
    CallIndirect,
    CallIndirectTrue,
    CallExtern,
    Return,
    ReturnTrue,
    SetReturnAddress,

    Branch,
    BranchTrue,
    BranchFalse,

    Assign,
    Cast,
    ZeroExtend,
    SignExtend,
    Truncate,
    Convert,

    LoadLocal,
    StoreLocal,
    LoadContext,
    StoreContext,
    Load,
    Store,

    Select,
    IsTrue,
    IsFalse,
    CompareEq,
    CompareNe,
    CompareSlt,
    CompareSle,
    CompareSgt,
    CompareSge,
    CompareUlt,
    CompareUle,
    CompareUgt,
    CompareUge,

    Add,
    AddWithCarry,
    Sub,
    Mul,
    MulHi,
    MulHiUnsigned,
    Div,
    DivUnsigned,
    MulAdd,
    MulSub,
    Neg,
    Abs,
    Sqrt,

    AddCarryOut,
    AdcCarryOut,
    SubCarryOut,
    AddOverflow,
    SubOverflow,

    And,
    Or,
    Xor,
    Not,
    Shl,
    Shr,
    Sha,
    RotateLeft,
    ByteSwap,
    CountLeadingZeros,
}

use OperandKind::{
    Comment as C, Extern as E, Label as L, None as N, Offset as O, Symbol as S, Value as V,
};

const fn describe(op: Opcode) -> (&'static str, Signature, OpcodeFlags) {
    const NONE: OpcodeFlags = OpcodeFlags::empty();
    const VOLATILE: OpcodeFlags = OpcodeFlags::VOLATILE;
    const BRANCH: OpcodeFlags = OpcodeFlags::BRANCH.union(OpcodeFlags::VOLATILE);
    const TRAP: OpcodeFlags = OpcodeFlags::VOLATILE.union(OpcodeFlags::MAY_TRAP);
    const COMM: OpcodeFlags = OpcodeFlags::COMMUTATIVE;

    let v_v = Signature::new(true, [V, N, N]);
    let v_vv = Signature::new(true, [V, V, N]);
    let v_vvv = Signature::new(true, [V, V, V]);

    match op {
        Opcode::Comment => ("comment", Signature::new(false, [C, N, N]), OpcodeFlags::IGNORE),
        Opcode::Nop => ("nop", Signature::new(false, [N, N, N]), OpcodeFlags::IGNORE),
        Opcode::SourceOffset => {
            ("source_offset", Signature::new(false, [O, N, N]), OpcodeFlags::IGNORE.union(VOLATILE))
        }
        Opcode::DebugBreak => ("debug_break", Signature::new(false, [O, N, N]), TRAP),
        Opcode::DebugBreakTrue => ("debug_break_true", Signature::new(false, [V, O, N]), TRAP),
        Opcode::Trap => ("trap", Signature::new(false, [O, O, N]), TRAP),
        Opcode::TrapTrue => ("trap_true", Signature::new(false, [V, O, O]), TRAP),

        Opcode::Call => ("call", Signature::new(false, [S, N, N]), TRAP),
        Opcode::CallTrue => ("call_true", Signature::new(false, [V, S, N]), TRAP),
        Opcode::CallIndirect => ("call_indirect", Signature::new(false, [V, N, N]), TRAP),
        Opcode::CallIndirectTrue => ("call_indirect_true", Signature::new(false, [V, V, N]), TRAP),
        Opcode::CallExtern => ("call_extern", Signature::new(false, [E, N, N]), TRAP),
        Opcode::Return => ("return", Signature::new(false, [N, N, N]), BRANCH),
        Opcode::ReturnTrue => ("return_true", Signature::new(false, [V, N, N]), BRANCH),
        Opcode::SetReturnAddress => {
            ("set_return_address", Signature::new(false, [V, N, N]), VOLATILE)
        }

        Opcode::Branch => ("branch", Signature::new(false, [L, N, N]), BRANCH),
        Opcode::BranchTrue => ("branch_true", Signature::new(false, [V, L, N]), BRANCH),
        Opcode::BranchFalse => ("branch_false", Signature::new(false, [V, L, N]), BRANCH),

        Opcode::Assign => ("assign", v_v, NONE),
        Opcode::Cast => ("cast", v_v, NONE),
        Opcode::ZeroExtend => ("zero_extend", v_v, NONE),
        Opcode::SignExtend => ("sign_extend", v_v, NONE),
        Opcode::Truncate => ("truncate", v_v, NONE),
        Opcode::Convert => ("convert", v_v, OpcodeFlags::DISALLOW_CONSTANT_FOLDING),

        Opcode::LoadLocal => ("load_local", Signature::new(true, [O, N, N]), NONE),
        Opcode::StoreLocal => ("store_local", Signature::new(false, [O, V, N]), VOLATILE),
        Opcode::LoadContext => ("load_context", Signature::new(true, [O, N, N]), NONE),
        Opcode::StoreContext => ("store_context", Signature::new(false, [O, V, N]), VOLATILE),
        Opcode::Load => ("load", v_v, OpcodeFlags::MEMORY.union(TRAP)),
        Opcode::Store => {
            ("store", Signature::new(false, [V, V, N]), OpcodeFlags::MEMORY.union(TRAP))
        }

        Opcode::Select => ("select", v_vvv, NONE),
        Opcode::IsTrue => ("is_true", v_v, NONE),
        Opcode::IsFalse => ("is_false", v_v, NONE),
        Opcode::CompareEq => ("compare_eq", v_vv, COMM),
        Opcode::CompareNe => ("compare_ne", v_vv, COMM),
        Opcode::CompareSlt => ("compare_slt", v_vv, NONE),
        Opcode::CompareSle => ("compare_sle", v_vv, NONE),
        Opcode::CompareSgt => ("compare_sgt", v_vv, NONE),
        Opcode::CompareSge => ("compare_sge", v_vv, NONE),
        Opcode::CompareUlt => ("compare_ult", v_vv, NONE),
        Opcode::CompareUle => ("compare_ule", v_vv, NONE),
        Opcode::CompareUgt => ("compare_ugt", v_vv, NONE),
        Opcode::CompareUge => ("compare_uge", v_vv, NONE),

        Opcode::Add => ("add", v_vv, COMM),
        Opcode::AddWithCarry => ("add_with_carry", v_vvv, NONE),
        Opcode::Sub => ("sub", v_vv, NONE),
        Opcode::Mul => ("mul", v_vv, COMM),
        Opcode::MulHi => ("mul_hi", v_vv, COMM),
        Opcode::MulHiUnsigned => ("mul_hi_unsigned", v_vv, COMM),
        Opcode::Div => ("div", v_vv, NONE),
        Opcode::DivUnsigned => ("div_unsigned", v_vv, NONE),
        Opcode::MulAdd => ("mul_add", v_vvv, OpcodeFlags::DISALLOW_CONSTANT_FOLDING),
        Opcode::MulSub => ("mul_sub", v_vvv, OpcodeFlags::DISALLOW_CONSTANT_FOLDING),
        Opcode::Neg => ("neg", v_v, NONE),
        Opcode::Abs => ("abs", v_v, NONE),
        Opcode::Sqrt => ("sqrt", v_v, OpcodeFlags::DISALLOW_CONSTANT_FOLDING),

        Opcode::AddCarryOut => ("add_carry_out", v_vv, COMM),
        Opcode::AdcCarryOut => ("adc_carry_out", v_vvv, NONE),
        Opcode::SubCarryOut => ("sub_carry_out", v_vv, NONE),
        Opcode::AddOverflow => ("add_overflow", v_vv, COMM),
        Opcode::SubOverflow => ("sub_overflow", v_vv, NONE),

        Opcode::And => ("and", v_vv, COMM),
        Opcode::Or => ("or", v_vv, COMM),
        Opcode::Xor => ("xor", v_vv, COMM),
        Opcode::Not => ("not", v_v, NONE),
        Opcode::Shl => ("shl", v_vv, NONE),
        Opcode::Shr => ("shr", v_vv, NONE),
        Opcode::Sha => ("sha", v_vv, NONE),
        Opcode::RotateLeft => ("rotate_left", v_vv, NONE),
        Opcode::ByteSwap => ("byte_swap", v_v, NONE),
        Opcode::CountLeadingZeros => ("count_leading_zeros", v_v, NONE),
    }
}

impl Opcode {
    pub const fn name(self) -> &'static str {
        describe(self).0
    }

    pub const fn signature(self) -> Signature {
        describe(self).1
    }
}

/// Static information about every opcode. Built once at startup and shared (read-only) by the
/// frontend, the compiler passes and the backends.
pub struct OpcodeTable {
    infos: Vec<OpcodeInfo>,
}

impl Default for OpcodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OpcodeTable {
    pub fn new() -> Self {
        let infos = Opcode::ALL
            .iter()
            .map(|&opcode| {
                let (name, signature, flags) = describe(opcode);
                OpcodeInfo { opcode, name, signature, flags }
            })
            .collect();
        Self { infos }
    }

    #[inline]
    pub fn info(&self, opcode: Opcode) -> &OpcodeInfo {
        &self.infos[opcode as usize]
    }

    #[inline]
    pub fn flags(&self, opcode: Opcode) -> OpcodeFlags {
        self.info(opcode).flags
    }

    #[inline]
    pub fn name(&self, opcode: Opcode) -> &'static str {
        self.info(opcode).name
    }

    pub fn iter(&self) -> impl Iterator<Item = &OpcodeInfo> {
        self.infos.iter()
    }

    pub fn lookup(&self, name: &str) -> Option<&OpcodeInfo> {
        self.infos.iter().find(|info| info.name == name)
    }
}

#[test]
fn table_is_indexed_by_opcode() {
    let table = OpcodeTable::new();
    assert_eq!(table.iter().count(), Opcode::ALL.len());
    for op in Opcode::ALL {
        assert_eq!(table.info(*op).opcode, *op);
    }
    assert_eq!(table.lookup("add").map(|x| x.opcode), Some(Opcode::Add));
    assert!(table.flags(Opcode::StoreContext).contains(OpcodeFlags::VOLATILE));
}
