//! PowerPC instruction decoding.

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    Alu,
    Control,
    Memory,
    Fpu,
    Altivec,
}

macro_rules! ppc_opcodes {
    ($($category:ident { $($name:ident => $text:literal),* $(,)? })*) => {
        #[allow(non_camel_case_types)]
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub enum PpcOpcode {
            $($($name,)*)*
        }

        impl PpcOpcode {
            pub fn category(self) -> Category {
                match self {
                    $($(Self::$name => Category::$category,)*)*
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $($(Self::$name => $text,)*)*
                }
            }
        }
    };
}

ppc_opcodes! {
    Alu {
        addx => "add", addcx => "addc", addex => "adde", addi => "addi", addic => "addic",
        addicx => "addic.", addis => "addis", addmex => "addme", addzex => "addze",
        subfx => "subf", subfcx => "subfc", subfex => "subfe", subficx => "subfic",
        subfmex => "subfme", subfzex => "subfze", negx => "neg",
        mullwx => "mullw", mulhwx => "mulhw", mulhwux => "mulhwu", mulldx => "mulld",
        mulhdx => "mulhd", mulhdux => "mulhdu", mulli => "mulli",
        divwx => "divw", divwux => "divwu", divdx => "divd", divdux => "divdu",
        cmp => "cmp", cmpi => "cmpi", cmpl => "cmpl", cmpli => "cmpli",
        andx => "and", andcx => "andc", andix => "andi.", andisx => "andis.",
        orx => "or", orcx => "orc", ori => "ori", oris => "oris",
        xorx => "xor", xori => "xori", xoris => "xoris", nandx => "nand", norx => "nor",
        eqvx => "eqv",
        extsbx => "extsb", extshx => "extsh", extswx => "extsw",
        cntlzwx => "cntlzw", cntlzdx => "cntlzd",
        rlwinmx => "rlwinm", rlwimix => "rlwimi", rlwnmx => "rlwnm",
        rldiclx => "rldicl", rldicrx => "rldicr",
        slwx => "slw", srwx => "srw", srawx => "sraw", srawix => "srawi",
        sldx => "sld", srdx => "srd", sradx => "srad", sradix => "sradi",
    }
    Control {
        bx => "b", bcx => "bc", bclrx => "bclr", bcctrx => "bcctr",
        sc => "sc", tw => "tw", twi => "twi", td => "td", tdi => "tdi",
        mfspr => "mfspr", mtspr => "mtspr", mfcr => "mfcr", mtcrf => "mtcrf", mcrf => "mcrf",
        crand => "crand", crandc => "crandc", creqv => "creqv", crnand => "crnand",
        crnor => "crnor", cror => "cror", crorc => "crorc", crxor => "crxor",
        isync => "isync", sync => "sync", eieio => "eieio",
    }
    Memory {
        lbz => "lbz", lbzu => "lbzu", lbzx => "lbzx", lbzux => "lbzux",
        lhz => "lhz", lhzu => "lhzu", lhzx => "lhzx", lhzux => "lhzux",
        lha => "lha", lhau => "lhau", lhax => "lhax", lhaux => "lhaux",
        lwz => "lwz", lwzu => "lwzu", lwzx => "lwzx", lwzux => "lwzux",
        lwa => "lwa", lwax => "lwax",
        ld => "ld", ldu => "ldu", ldx => "ldx", ldux => "ldux",
        stb => "stb", stbu => "stbu", stbx => "stbx", stbux => "stbux",
        sth => "sth", sthu => "sthu", sthx => "sthx", sthux => "sthux",
        stw => "stw", stwu => "stwu", stwx => "stwx", stwux => "stwux",
        std_ => "std", stdu => "stdu", stdx => "stdx", stdux => "stdux",
        lhbrx => "lhbrx", lwbrx => "lwbrx", sthbrx => "sthbrx", stwbrx => "stwbrx",
        lmw => "lmw", stmw => "stmw",
        lwarx => "lwarx", ldarx => "ldarx", stwcx => "stwcx.", stdcx => "stdcx.",
        dcbf => "dcbf", dcbst => "dcbst", dcbt => "dcbt", dcbtst => "dcbtst", dcbz => "dcbz",
    }
    Fpu {
        lfs => "lfs", lfsu => "lfsu", lfsx => "lfsx", lfsux => "lfsux",
        lfd => "lfd", lfdu => "lfdu", lfdx => "lfdx", lfdux => "lfdux",
        stfs => "stfs", stfsu => "stfsu", stfsx => "stfsx", stfsux => "stfsux",
        stfd => "stfd", stfdu => "stfdu", stfdx => "stfdx", stfdux => "stfdux",
        faddx => "fadd", fsubx => "fsub", fmulx => "fmul", fdivx => "fdiv",
        fmaddx => "fmadd", fmsubx => "fmsub", fsqrtx => "fsqrt",
        faddsx => "fadds", fsubsx => "fsubs", fmulsx => "fmuls", fdivsx => "fdivs",
        fmaddsx => "fmadds", fmsubsx => "fmsubs", fsqrtsx => "fsqrts",
        fmrx => "fmr", fnegx => "fneg", fabsx => "fabs", fcmpu => "fcmpu",
        frspx => "frsp", fctiwzx => "fctiwz", fctidzx => "fctidz", fcfidx => "fcfid",
    }
    Altivec {
        lvx => "lvx", stvx => "stvx",
        vand => "vand", vandc => "vandc", vor => "vor", vxor => "vxor", vnor => "vnor",
    }
}

#[inline]
const fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// A decoded instruction word. Field accessors use IBM bit numbering (bit 0 is the MSB).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Instr {
    pub address: u32,
    pub code: u32,
    pub opcode: PpcOpcode,
}

impl Instr {
    #[inline]
    pub const fn field(&self, start: u32, len: u32) -> u32 {
        field(self.code, start, len)
    }

    #[inline]
    pub const fn rd(&self) -> u32 {
        self.field(6, 5)
    }

    #[inline]
    pub const fn rs(&self) -> u32 {
        self.field(6, 5)
    }

    #[inline]
    pub const fn ra(&self) -> u32 {
        self.field(11, 5)
    }

    #[inline]
    pub const fn rb(&self) -> u32 {
        self.field(16, 5)
    }

    /// The fourth register operand of A-form floating point instructions.
    #[inline]
    pub const fn frc(&self) -> u32 {
        self.field(21, 5)
    }

    #[inline]
    pub const fn simm(&self) -> i64 {
        self.field(16, 16) as u16 as i16 as i64
    }

    #[inline]
    pub const fn uimm(&self) -> u64 {
        self.field(16, 16) as u64
    }

    /// Displacement of DS-form instructions (`ld`, `std`).
    #[inline]
    pub const fn ds(&self) -> i64 {
        sign_extend(self.field(16, 14) << 2, 16) as i64
    }

    #[inline]
    pub const fn oe(&self) -> bool {
        self.field(21, 1) != 0
    }

    /// The record bit: update CR0 (or CR1 for floating point instructions).
    #[inline]
    pub const fn rc(&self) -> bool {
        self.code & 1 != 0
    }

    #[inline]
    pub const fn lk(&self) -> bool {
        self.code & 1 != 0
    }

    #[inline]
    pub const fn aa(&self) -> bool {
        self.code & 2 != 0
    }

    #[inline]
    pub const fn bo(&self) -> u32 {
        self.field(6, 5)
    }

    #[inline]
    pub const fn bi(&self) -> u32 {
        self.field(11, 5)
    }

    #[inline]
    pub const fn crfd(&self) -> u32 {
        self.field(6, 3)
    }

    #[inline]
    pub const fn crfs(&self) -> u32 {
        self.field(11, 3)
    }

    /// The `L` bit of compare instructions: 64-bit comparison when set.
    #[inline]
    pub const fn l(&self) -> bool {
        self.field(10, 1) != 0
    }

    #[inline]
    pub const fn crbd(&self) -> u32 {
        self.field(6, 5)
    }

    #[inline]
    pub const fn crba(&self) -> u32 {
        self.field(11, 5)
    }

    #[inline]
    pub const fn crbb(&self) -> u32 {
        self.field(16, 5)
    }

    #[inline]
    pub const fn crm(&self) -> u32 {
        self.field(12, 8)
    }

    /// Special purpose register number (the two halves are swapped in the encoding).
    #[inline]
    pub const fn spr(&self) -> u32 {
        let raw = self.field(11, 10);
        ((raw & 0x1f) << 5) | (raw >> 5)
    }

    #[inline]
    pub const fn to(&self) -> u32 {
        self.field(6, 5)
    }

    /// Shift amount / rotate fields of M-form instructions.
    #[inline]
    pub const fn sh(&self) -> u32 {
        self.field(16, 5)
    }

    #[inline]
    pub const fn mb(&self) -> u32 {
        self.field(21, 5)
    }

    #[inline]
    pub const fn me(&self) -> u32 {
        self.field(26, 5)
    }

    /// 6-bit shift amount of MD/XS-form instructions.
    #[inline]
    pub const fn sh64(&self) -> u32 {
        self.field(16, 5) | (self.field(30, 1) << 5)
    }

    /// 6-bit mask boundary of MD-form instructions (stored rotated in the encoding).
    #[inline]
    pub const fn mb64(&self) -> u32 {
        let raw = self.field(21, 6);
        ((raw & 1) << 5) | (raw >> 1)
    }

    /// The `LEV` field of `sc`.
    #[inline]
    pub const fn lev(&self) -> u32 {
        self.field(20, 7)
    }

    /// Target of an I-form branch.
    #[inline]
    pub const fn branch_target(&self) -> u32 {
        let offset = sign_extend(self.field(6, 24) << 2, 26) as u32;
        if self.aa() { offset } else { self.address.wrapping_add(offset) }
    }

    /// Target of a B-form conditional branch.
    #[inline]
    pub const fn cond_branch_target(&self) -> u32 {
        let offset = sign_extend(self.field(16, 14) << 2, 16) as u32;
        if self.aa() { offset } else { self.address.wrapping_add(offset) }
    }
}

#[inline]
const fn field(code: u32, start: u32, len: u32) -> u32 {
    (code >> (32 - start - len)) & ((1 << len) - 1)
}

pub const BLR: u32 = 0x4e80_0020;
pub const BCTR: u32 = 0x4e80_0420;

/// `mfspr r12, lr`
pub const MFLR_R12: u32 = 0x7d88_02a6;
/// `mtspr lr, r12`
pub const MTLR_R12: u32 = 0x7d88_03a6;

pub fn decode(address: u32, code: u32) -> Option<Instr> {
    lookup(code).map(|opcode| Instr { address, code, opcode })
}

/// Finds the opcode for an instruction word.
pub fn lookup(code: u32) -> Option<PpcOpcode> {
    use PpcOpcode::*;

    Some(match field(code, 0, 6) {
        2 => tdi,
        3 => twi,
        4 => return lookup_4(code),
        7 => mulli,
        8 => subficx,
        10 => cmpli,
        11 => cmpi,
        12 => addic,
        13 => addicx,
        14 => addi,
        15 => addis,
        16 => bcx,
        17 if code & 2 != 0 => sc,
        18 => bx,
        19 => return lookup_19(code),
        20 => rlwimix,
        21 => rlwinmx,
        23 => rlwnmx,
        24 => ori,
        25 => oris,
        26 => xori,
        27 => xoris,
        28 => andix,
        29 => andisx,
        30 => match field(code, 27, 3) {
            0 => rldiclx,
            1 => rldicrx,
            _ => return None,
        },
        31 => return lookup_31(code),
        32 => lwz,
        33 => lwzu,
        34 => lbz,
        35 => lbzu,
        36 => stw,
        37 => stwu,
        38 => stb,
        39 => stbu,
        40 => lhz,
        41 => lhzu,
        42 => lha,
        43 => lhau,
        44 => sth,
        45 => sthu,
        46 => lmw,
        47 => stmw,
        48 => lfs,
        49 => lfsu,
        50 => lfd,
        51 => lfdu,
        52 => stfs,
        53 => stfsu,
        54 => stfd,
        55 => stfdu,
        58 => match code & 3 {
            0 => ld,
            1 => ldu,
            2 => lwa,
            _ => return None,
        },
        59 => match field(code, 26, 5) {
            18 => fdivsx,
            20 => fsubsx,
            21 => faddsx,
            22 => fsqrtsx,
            25 => fmulsx,
            28 => fmsubsx,
            29 => fmaddsx,
            _ => return None,
        },
        62 => match code & 3 {
            0 => std_,
            1 => stdu,
            _ => return None,
        },
        63 => return lookup_63(code),
        _ => return None,
    })
}

fn lookup_4(code: u32) -> Option<PpcOpcode> {
    use PpcOpcode::*;
    Some(match field(code, 21, 11) {
        1028 => vand,
        1092 => vandc,
        1156 => vor,
        1220 => vxor,
        1284 => vnor,
        _ => return None,
    })
}

fn lookup_19(code: u32) -> Option<PpcOpcode> {
    use PpcOpcode::*;
    Some(match field(code, 21, 10) {
        0 => mcrf,
        16 => bclrx,
        33 => crnor,
        129 => crandc,
        150 => isync,
        193 => crxor,
        225 => crnand,
        257 => crand,
        289 => creqv,
        417 => crorc,
        449 => cror,
        528 => bcctrx,
        _ => return None,
    })
}

fn lookup_31(code: u32) -> Option<PpcOpcode> {
    use PpcOpcode::*;

    // XS-form: 9-bit extended opcode followed by the high bit of the shift amount.
    if field(code, 21, 9) == 413 {
        return Some(sradix);
    }

    let op = match field(code, 21, 10) {
        0 => Some(cmp),
        4 => Some(tw),
        19 => Some(mfcr),
        20 => Some(lwarx),
        21 => Some(ldx),
        23 => Some(lwzx),
        24 => Some(slwx),
        26 => Some(cntlzwx),
        27 => Some(sldx),
        28 => Some(andx),
        32 => Some(cmpl),
        53 => Some(ldux),
        54 => Some(dcbst),
        55 => Some(lwzux),
        58 => Some(cntlzdx),
        60 => Some(andcx),
        68 => Some(td),
        84 => Some(ldarx),
        86 => Some(dcbf),
        87 => Some(lbzx),
        103 => Some(lvx),
        119 => Some(lbzux),
        124 => Some(norx),
        144 => Some(mtcrf),
        149 => Some(stdx),
        150 => Some(stwcx),
        151 => Some(stwx),
        181 => Some(stdux),
        183 => Some(stwux),
        214 => Some(stdcx),
        215 => Some(stbx),
        231 => Some(stvx),
        246 => Some(dcbtst),
        247 => Some(stbux),
        278 => Some(dcbt),
        279 => Some(lhzx),
        284 => Some(eqvx),
        311 => Some(lhzux),
        316 => Some(xorx),
        339 => Some(mfspr),
        341 => Some(lwax),
        343 => Some(lhax),
        375 => Some(lhaux),
        407 => Some(sthx),
        412 => Some(orcx),
        439 => Some(sthux),
        444 => Some(orx),
        467 => Some(mtspr),
        476 => Some(nandx),
        534 => Some(lwbrx),
        535 => Some(lfsx),
        536 => Some(srwx),
        539 => Some(srdx),
        567 => Some(lfsux),
        598 => Some(sync),
        599 => Some(lfdx),
        631 => Some(lfdux),
        662 => Some(stwbrx),
        663 => Some(stfsx),
        695 => Some(stfsux),
        727 => Some(stfdx),
        759 => Some(stfdux),
        790 => Some(lhbrx),
        792 => Some(srawx),
        794 => Some(sradx),
        824 => Some(srawix),
        854 => Some(eieio),
        918 => Some(sthbrx),
        922 => Some(extshx),
        954 => Some(extsbx),
        986 => Some(extswx),
        1014 => Some(dcbz),
        _ => None,
    };
    if op.is_some() {
        return op;
    }

    // XO-form: 9-bit extended opcode, bit 21 is the overflow enable flag.
    Some(match field(code, 22, 9) {
        8 => subfcx,
        9 => mulhdux,
        10 => addcx,
        11 => mulhwux,
        40 => subfx,
        73 => mulhdx,
        75 => mulhwx,
        104 => negx,
        136 => subfex,
        138 => addex,
        200 => subfzex,
        202 => addzex,
        232 => subfmex,
        233 => mulldx,
        234 => addmex,
        235 => mullwx,
        266 => addx,
        457 => divdux,
        459 => divwux,
        489 => divdx,
        491 => divwx,
        _ => return None,
    })
}

fn lookup_63(code: u32) -> Option<PpcOpcode> {
    use PpcOpcode::*;
    match field(code, 26, 5) {
        18 => return Some(fdivx),
        20 => return Some(fsubx),
        21 => return Some(faddx),
        22 => return Some(fsqrtx),
        25 => return Some(fmulx),
        28 => return Some(fmsubx),
        29 => return Some(fmaddx),
        _ => {}
    }
    Some(match field(code, 21, 10) {
        0 => fcmpu,
        12 => frspx,
        15 => fctiwzx,
        40 => fnegx,
        72 => fmrx,
        264 => fabsx,
        815 => fctidzx,
        846 => fcfidx,
        _ => return None,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode_common_instructions() {
        let check = |code: u32, expected: PpcOpcode| {
            assert_eq!(lookup(code), Some(expected), "{code:#010x}");
        };
        check(0x7c63_2214, PpcOpcode::addx); // add r3, r3, r4
        check(0x7c63_2614, PpcOpcode::addx); // addo r3, r3, r4
        check(0x3860_0005, PpcOpcode::addi); // li r3, 5
        check(BLR, PpcOpcode::bclrx);
        check(BCTR, PpcOpcode::bcctrx);
        check(MFLR_R12, PpcOpcode::mfspr);
        check(MTLR_R12, PpcOpcode::mtspr);
        check(0x8061_0008, PpcOpcode::lwz); // lwz r3, 8(r1)
        check(0x9061_0008, PpcOpcode::stw); // stw r3, 8(r1)
        check(0x4800_0010, PpcOpcode::bx);
        check(0x7c63_fe76, PpcOpcode::sradix); // sradi r3, r3, 63
        check(0x7c64_1838, PpcOpcode::andx);
        check(0x5463_103a, PpcOpcode::rlwinmx); // slwi r3, r3, 2
        check(0xfc20_1090, PpcOpcode::fmrx);
        check(0xfc21_102a, PpcOpcode::faddx);
        check(0x1000_1404, PpcOpcode::vand);
        assert_eq!(lookup(0), None);
    }

    #[test]
    fn fields() {
        // stwu r1, -0x60(r1)
        let i = decode(0x8200_0000, 0x9421_ffa0).unwrap();
        assert_eq!(i.opcode, PpcOpcode::stwu);
        assert_eq!((i.rs(), i.ra(), i.simm()), (1, 1, -0x60));

        // mflr r12
        let i = decode(0x8200_0000, MFLR_R12).unwrap();
        assert_eq!((i.rd(), i.spr()), (12, 8));

        // b -0x10
        let i = decode(0x8200_0010, 0x4bff_fff0).unwrap();
        assert_eq!(i.branch_target(), 0x8200_0000);

        // beq cr6, +0x8
        let i = decode(0x8200_0000, 0x419a_0008).unwrap();
        assert_eq!((i.bo(), i.bi(), i.cond_branch_target()), (12, 26, 0x8200_0008));

        // ld r3, 8(r1)
        let i = decode(0x8200_0000, 0xe861_0008).unwrap();
        assert_eq!((i.opcode, i.ds()), (PpcOpcode::ld, 8));

        // rldicl r3, r3, 0, 32 (clrldi)
        let i = decode(0x8200_0000, 0x7863_0020).unwrap();
        assert_eq!((i.opcode, i.sh64(), i.mb64()), (PpcOpcode::rldiclx, 0, 32));
    }
}
