//! Guest register state.

use memoffset::offset_of;
use xenon_hir::TypeName;

/// The register file of a guest thread.
///
/// Generated code accesses fields directly by byte offset (see the `*_offset` helpers), so the
/// layout must not change without updating the frontend.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct PpcContext {
    /// General purpose registers.
    pub r: [u64; 32],
    /// Floating point registers (stored as `f64` bit patterns).
    pub f: [u64; 32],
    /// Vector registers (VMX128 has 128 of them).
    pub v: [u128; 128],
    pub lr: u64,
    pub ctr: u64,
    /// Address reserved by the last `lwarx`.
    pub reserved_val: u64,
    pub fpscr: u32,
    /// Condition register, one byte per bit: `cr[4 * field + {0: lt, 1: gt, 2: eq, 3: so}]`.
    pub cr: [u8; 32],
    pub xer_ca: u8,
    pub xer_ov: u8,
    pub xer_so: u8,
    pub vscr_sat: u8,
    /// Where execution continues after a branch out of the current function.
    pub jump_target: u64,
    /// Non-zero when `jump_target` is waiting to be taken by the runtime.
    pub jump_pending: u8,
    _pad: [u8; 7],
}

// SAFETY: all fields are plain integers and the layout has no padding (see `context_layout`).
unsafe impl bytemuck::Zeroable for PpcContext {}
unsafe impl bytemuck::Pod for PpcContext {}

impl Default for PpcContext {
    fn default() -> Self {
        bytemuck::Zeroable::zeroed()
    }
}

pub const CR_LT: usize = 0;
pub const CR_GT: usize = 1;
pub const CR_EQ: usize = 2;
pub const CR_SO: usize = 3;

#[inline]
pub const fn gpr_offset(index: u32) -> usize {
    offset_of!(PpcContext, r) + index as usize * 8
}

#[inline]
pub const fn fpr_offset(index: u32) -> usize {
    offset_of!(PpcContext, f) + index as usize * 8
}

#[inline]
pub const fn vr_offset(index: u32) -> usize {
    offset_of!(PpcContext, v) + index as usize * 16
}

/// Offset of a single condition register bit.
#[inline]
pub const fn cr_bit_offset(bit: u32) -> usize {
    offset_of!(PpcContext, cr) + bit as usize
}

pub const LR_OFFSET: usize = offset_of!(PpcContext, lr);
pub const CTR_OFFSET: usize = offset_of!(PpcContext, ctr);
pub const RESERVED_OFFSET: usize = offset_of!(PpcContext, reserved_val);
pub const FPSCR_OFFSET: usize = offset_of!(PpcContext, fpscr);
pub const XER_CA_OFFSET: usize = offset_of!(PpcContext, xer_ca);
pub const XER_OV_OFFSET: usize = offset_of!(PpcContext, xer_ov);
pub const XER_SO_OFFSET: usize = offset_of!(PpcContext, xer_so);
pub const VSCR_SAT_OFFSET: usize = offset_of!(PpcContext, vscr_sat);
pub const JUMP_TARGET_OFFSET: usize = offset_of!(PpcContext, jump_target);
pub const JUMP_PENDING_OFFSET: usize = offset_of!(PpcContext, jump_pending);

/// A named guest register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegInfo {
    pub offset: usize,
    pub ty: TypeName,
}

impl PpcContext {
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::bytes_of_mut(self)
    }

    /// Reads `ty` sized bits at `offset` (little-endian host layout).
    pub fn read(&self, offset: usize, ty: TypeName) -> u128 {
        let mut buf = [0; 16];
        buf[..ty.size()].copy_from_slice(&self.as_bytes()[offset..offset + ty.size()]);
        u128::from_le_bytes(buf)
    }

    pub fn write(&mut self, offset: usize, ty: TypeName, value: u128) {
        let size = ty.size();
        self.as_bytes_mut()[offset..offset + size].copy_from_slice(&value.to_le_bytes()[..size]);
    }

    /// Packs the per-bit condition register into its architectural 32-bit form.
    pub fn cr_value(&self) -> u32 {
        self.cr.iter().fold(0, |acc, bit| (acc << 1) | (*bit & 1) as u32)
    }

    pub fn set_cr_value(&mut self, value: u32) {
        for (i, bit) in self.cr.iter_mut().enumerate() {
            *bit = ((value >> (31 - i)) & 1) as u8;
        }
    }

    pub fn xer_value(&self) -> u32 {
        ((self.xer_so as u32) << 31) | ((self.xer_ov as u32) << 30) | ((self.xer_ca as u32) << 29)
    }

    /// Takes the target of a branch out of the function that last ran, if there was one.
    pub fn take_jump(&mut self) -> Option<u32> {
        if self.jump_pending == 0 {
            return None;
        }
        self.jump_pending = 0;
        Some(self.jump_target as u32)
    }

    pub fn set_xer_value(&mut self, value: u32) {
        self.xer_so = ((value >> 31) & 1) as u8;
        self.xer_ov = ((value >> 30) & 1) as u8;
        self.xer_ca = ((value >> 29) & 1) as u8;
    }
}

/// Looks up a register by its assembler name (e.g. `r3`, `f1`, `v12`, `lr`, `cr6`).
///
/// `crN` names a whole condition register field as 4 consecutive bytes.
pub fn reg_by_name(name: &str) -> Option<RegInfo> {
    let reg = |offset, ty| Some(RegInfo { offset, ty });
    let indexed = |prefix: &str, max: u32| -> Option<u32> {
        let index: u32 = name.strip_prefix(prefix)?.parse().ok()?;
        (index < max).then_some(index)
    };

    match name {
        "lr" => return reg(LR_OFFSET, TypeName::I64),
        "ctr" => return reg(CTR_OFFSET, TypeName::I64),
        "fpscr" => return reg(FPSCR_OFFSET, TypeName::I32),
        "ca" | "xer_ca" => return reg(XER_CA_OFFSET, TypeName::I8),
        "ov" | "xer_ov" => return reg(XER_OV_OFFSET, TypeName::I8),
        "so" | "xer_so" => return reg(XER_SO_OFFSET, TypeName::I8),
        "sat" | "vscr_sat" => return reg(VSCR_SAT_OFFSET, TypeName::I8),
        "reserve" => return reg(RESERVED_OFFSET, TypeName::I64),
        _ => {}
    }

    if let Some(index) = indexed("cr", 8) {
        return reg(cr_bit_offset(index * 4), TypeName::I32);
    }
    if let Some(index) = indexed("r", 32) {
        return reg(gpr_offset(index), TypeName::I64);
    }
    if let Some(index) = indexed("f", 32) {
        return reg(fpr_offset(index), TypeName::F64);
    }
    if let Some(index) = indexed("v", 128) {
        return reg(vr_offset(index), TypeName::V128);
    }
    None
}

impl std::fmt::Debug for PpcContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, value) in self.r.iter().enumerate().filter(|(_, x)| **x != 0) {
            writeln!(f, "r{i:<2} = {value:#018x}")?;
        }
        for (i, value) in self.f.iter().enumerate().filter(|(_, x)| **x != 0) {
            writeln!(f, "f{i:<2} = {:?}", f64::from_bits(*value))?;
        }
        for (i, value) in self.v.iter().enumerate().filter(|(_, x)| **x != 0) {
            writeln!(f, "v{i:<3} = {value:#034x}")?;
        }
        writeln!(f, "lr  = {:#018x}", self.lr)?;
        writeln!(f, "ctr = {:#018x}", self.ctr)?;
        writeln!(f, "cr  = {:#010x}", self.cr_value())?;
        write!(f, "xer = {:#010x}", self.xer_value())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn context_layout() {
        assert_eq!(gpr_offset(0), 0);
        assert_eq!(fpr_offset(0), 256);
        assert_eq!(vr_offset(0), 512);
        assert_eq!(LR_OFFSET, 2560);
        assert_eq!(CTR_OFFSET, 2568);
        assert_eq!(FPSCR_OFFSET, 2584);
        assert_eq!(cr_bit_offset(0), 2588);
        assert_eq!(VSCR_SAT_OFFSET, 2623);
        assert_eq!(JUMP_TARGET_OFFSET, 2624);
        assert_eq!(JUMP_PENDING_OFFSET, 2632);
        assert_eq!(std::mem::size_of::<PpcContext>(), 2640);
    }

    #[test]
    fn cr_packing() {
        let mut ctx = PpcContext::default();
        ctx.set_cr_value(0x8000_0002);
        assert_eq!(ctx.cr[0], 1);
        assert_eq!(ctx.cr[30], 1);
        assert_eq!(ctx.cr_value(), 0x8000_0002);
    }

    #[test]
    fn named_access() {
        let mut ctx = PpcContext::default();
        let r3 = reg_by_name("r3").unwrap();
        ctx.write(r3.offset, r3.ty, 0x1234);
        assert_eq!(ctx.r[3], 0x1234);
        assert_eq!(ctx.read(r3.offset, TypeName::I32), 0x1234);
        assert_eq!(reg_by_name("cr6").unwrap().offset, cr_bit_offset(24));
        assert!(reg_by_name("r32").is_none());
    }
}
