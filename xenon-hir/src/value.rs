use crate::{InstrId, ValueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeName {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    V128,
}

impl TypeName {
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::I8 => 1,
            Self::I16 => 2,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
            Self::V128 => 16,
        }
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.size() as u32 * 8
    }

    #[inline]
    pub const fn is_int(self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    #[inline]
    pub const fn is_vec(self) -> bool {
        matches!(self, Self::V128)
    }

    /// Bit mask covering all bits of the type.
    #[inline]
    pub const fn mask(self) -> u128 {
        match self {
            Self::V128 => u128::MAX,
            _ => (1_u128 << self.bits()) - 1,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::V128 => "v128",
        }
    }

    pub const fn int_of_size(size: usize) -> Option<Self> {
        match size {
            1 => Some(Self::I8),
            2 => Some(Self::I16),
            4 => Some(Self::I32),
            8 => Some(Self::I64),
            _ => None,
        }
    }
}

impl std::fmt::Display for TypeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// An SSA value. Values are owned by the function that defined them.
#[derive(Debug, Clone)]
pub struct Value {
    pub id: ValueId,
    pub ty: TypeName,

    /// The raw bits of the value if it is known to be constant (floats are stored as their bit
    /// pattern).
    pub constant: Option<u128>,

    /// The instruction that defines this value, `None` for constants.
    pub def: Option<InstrId>,

    /// Instructions that read this value. May contain duplicates if an instruction uses the
    /// value for multiple operands.
    pub uses: Vec<InstrId>,

    /// The final instruction that reads this value (computed by value reduction).
    pub last_use: Option<InstrId>,
}

impl Value {
    pub fn new(id: ValueId, ty: TypeName) -> Self {
        Self { id, ty, constant: None, def: None, uses: vec![], last_use: None }
    }

    #[inline]
    pub fn is_constant(&self) -> bool {
        self.constant.is_some()
    }

    /// Returns the constant value truncated to the width of the value.
    #[inline]
    pub fn const_bits(&self) -> Option<u128> {
        self.constant.map(|x| x & self.ty.mask())
    }

    #[inline]
    pub fn const_u64(&self) -> Option<u64> {
        self.const_bits().map(|x| x as u64)
    }

    #[inline]
    pub fn is_constant_zero(&self) -> bool {
        self.const_bits() == Some(0)
    }

    #[inline]
    pub fn is_constant_true(&self) -> bool {
        self.const_bits().map_or(false, |x| x != 0)
    }

    #[inline]
    pub fn is_constant_false(&self) -> bool {
        self.is_constant_zero()
    }

    pub fn set_constant(&mut self, bits: u128) {
        self.constant = Some(bits & self.ty.mask());
    }
}
