//! Text rendering of decoded instructions, used for source dumps.

use std::fmt::Write;

use crate::frontend::decode::{Instr, PpcOpcode, BCTR, BLR};

fn hex(value: i64) -> String {
    match value < 0 {
        true => format!("-{:#x}", value.unsigned_abs()),
        false => format!("{value:#x}"),
    }
}

fn suffix(set: bool, value: &str) -> &str {
    if set { value } else { "" }
}

fn spr_name(spr: u32) -> Option<&'static str> {
    Some(match spr {
        1 => "xer",
        8 => "lr",
        9 => "ctr",
        _ => return None,
    })
}

/// Formats `instr` using assembler syntax, including the common simplified mnemonics.
pub fn disasm(instr: &Instr) -> String {
    use PpcOpcode::*;

    let mut out = String::new();
    let i = instr;
    let (rd, ra, rb) = (i.rd(), i.ra(), i.rb());
    let rc = |name: &str| match i.rc() {
        true => format!("{name}."),
        false => name.to_owned(),
    };
    let oe_rc = |name: &str| {
        let mut name = name.to_owned();
        if i.oe() {
            name.push('o');
        }
        if i.rc() {
            name.push('.');
        }
        name
    };

    let _ = match i.opcode {
        _ if i.code == BLR => write!(out, "blr"),
        _ if i.code == BCTR => write!(out, "bctr"),
        ori if i.code == 0x6000_0000 => write!(out, "nop"),

        addi if ra == 0 => write!(out, "li r{rd}, {}", hex(i.simm())),
        addis if ra == 0 => write!(out, "lis r{rd}, {}", hex(i.simm())),
        orx if i.rs() == rb => write!(out, "{} r{ra}, r{}", rc("mr"), i.rs()),
        mfspr => match spr_name(i.spr()) {
            Some(name) => write!(out, "mf{name} r{rd}"),
            None => write!(out, "mfspr r{rd}, {}", i.spr()),
        },
        mtspr => match spr_name(i.spr()) {
            Some(name) => write!(out, "mt{name} r{rd}"),
            None => write!(out, "mtspr {}, r{rd}", i.spr()),
        },

        bx => {
            let name = format!("b{}{}", suffix(i.lk(), "l"), suffix(i.aa(), "a"));
            write!(out, "{name} {:#x}", i.branch_target())
        }
        bcx => {
            let name = format!("bc{}{}", suffix(i.lk(), "l"), suffix(i.aa(), "a"));
            write!(out, "{name} {}, {}, {:#x}", i.bo(), i.bi(), i.cond_branch_target())
        }
        bclrx | bcctrx => {
            let base = if i.opcode == bclrx { "bclr" } else { "bcctr" };
            let name = format!("{base}{}", if i.lk() { "l" } else { "" });
            write!(out, "{name} {}, {}", i.bo(), i.bi())
        }
        sc => write!(out, "sc {}", i.lev()),
        tw | td => write!(out, "{} {}, r{ra}, r{rb}", i.opcode.name(), i.to()),
        twi | tdi => write!(out, "{} {}, r{ra}, {}", i.opcode.name(), i.to(), hex(i.simm())),
        mfcr => write!(out, "mfcr r{rd}"),
        mtcrf => write!(out, "mtcrf {:#x}, r{rd}", i.crm()),
        mcrf => write!(out, "mcrf cr{}, cr{}", i.crfd(), i.crfs()),
        crand | crandc | creqv | crnand | crnor | cror | crorc | crxor => {
            write!(out, "{} {}, {}, {}", i.opcode.name(), i.crbd(), i.crba(), i.crbb())
        }
        isync | sync | eieio => write!(out, "{}", i.opcode.name()),

        cmp | cmpl => {
            write!(out, "{} cr{}, {}, r{ra}, r{rb}", i.opcode.name(), i.crfd(), i.l() as u8)
        }
        cmpi => write!(out, "cmpi cr{}, {}, r{ra}, {}", i.crfd(), i.l() as u8, hex(i.simm())),
        cmpli => write!(out, "cmpli cr{}, {}, r{ra}, {:#x}", i.crfd(), i.l() as u8, i.uimm()),

        addi | addis | addic | addicx | mulli | subficx => {
            write!(out, "{} r{rd}, r{ra}, {}", i.opcode.name(), hex(i.simm()))
        }
        ori | oris | xori | xoris | andix | andisx => {
            write!(out, "{} r{ra}, r{}, {:#x}", i.opcode.name(), i.rs(), i.uimm())
        }
        addx | addcx | addex | subfx | subfcx | subfex | mullwx | mulldx | divwx | divwux
        | divdx | divdux => write!(out, "{} r{rd}, r{ra}, r{rb}", oe_rc(i.opcode.name())),
        mulhwx | mulhwux | mulhdx | mulhdux => {
            write!(out, "{} r{rd}, r{ra}, r{rb}", rc(i.opcode.name()))
        }
        addmex | addzex | subfmex | subfzex | negx => {
            write!(out, "{} r{rd}, r{ra}", oe_rc(i.opcode.name()))
        }
        andx | andcx | orx | orcx | xorx | nandx | norx | eqvx | slwx | srwx | srawx | sldx
        | srdx | sradx => write!(out, "{} r{ra}, r{}, r{rb}", rc(i.opcode.name()), i.rs()),
        extsbx | extshx | extswx | cntlzwx | cntlzdx => {
            write!(out, "{} r{ra}, r{}", rc(i.opcode.name()), i.rs())
        }
        srawix => write!(out, "{} r{ra}, r{}, {}", rc("srawi"), i.rs(), i.sh()),
        sradix => write!(out, "{} r{ra}, r{}, {}", rc("sradi"), i.rs(), i.sh64()),
        rlwinmx | rlwimix => write!(
            out,
            "{} r{ra}, r{}, {}, {}, {}",
            rc(i.opcode.name()),
            i.rs(),
            i.sh(),
            i.mb(),
            i.me()
        ),
        rlwnmx => {
            write!(out, "{} r{ra}, r{}, r{rb}, {}, {}", rc("rlwnm"), i.rs(), i.mb(), i.me())
        }
        rldiclx | rldicrx => {
            write!(out, "{} r{ra}, r{}, {}, {}", rc(i.opcode.name()), i.rs(), i.sh64(), i.mb64())
        }

        lwa | ld | ldu | std_ | stdu => {
            write!(out, "{} r{rd}, {}(r{ra})", i.opcode.name(), hex(i.ds()))
        }
        lbz | lbzu | lhz | lhzu | lha | lhau | lwz | lwzu | stb | stbu | sth | sthu | stw
        | stwu | lmw | stmw => write!(out, "{} r{rd}, {}(r{ra})", i.opcode.name(), hex(i.simm())),
        lfs | lfsu | lfd | lfdu | stfs | stfsu | stfd | stfdu => {
            write!(out, "{} f{rd}, {}(r{ra})", i.opcode.name(), hex(i.simm()))
        }
        lfsx | lfsux | lfdx | lfdux | stfsx | stfsux | stfdx | stfdux => {
            write!(out, "{} f{rd}, r{ra}, r{rb}", i.opcode.name())
        }
        dcbf | dcbst | dcbt | dcbtst | dcbz => write!(out, "{} r{ra}, r{rb}", i.opcode.name()),
        lvx | stvx => write!(out, "{} v{rd}, r{ra}, r{rb}", i.opcode.name()),
        vand | vandc | vor | vxor | vnor => {
            write!(out, "{} v{rd}, v{ra}, v{rb}", i.opcode.name())
        }

        faddx | fsubx | fdivx | faddsx | fsubsx | fdivsx => {
            write!(out, "{} f{rd}, f{ra}, f{rb}", rc(i.opcode.name()))
        }
        fmulx | fmulsx => write!(out, "{} f{rd}, f{ra}, f{}", rc(i.opcode.name()), i.frc()),
        fmaddx | fmsubx | fmaddsx | fmsubsx => write!(
            out,
            "{} f{rd}, f{ra}, f{}, f{rb}",
            rc(i.opcode.name()),
            i.frc()
        ),
        fsqrtx | fsqrtsx | fmrx | fnegx | fabsx | frspx | fctiwzx | fctidzx | fcfidx => {
            write!(out, "{} f{rd}, f{rb}", rc(i.opcode.name()))
        }
        fcmpu => write!(out, "fcmpu cr{}, f{ra}, f{rb}", i.crfd()),

        // Remaining X-form loads and stores.
        _ => write!(out, "{} r{rd}, r{ra}, r{rb}", i.opcode.name()),
    };
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frontend::decode::decode;

    fn check(code: u32, expected: &str) {
        let instr = decode(0x8200_0000, code).unwrap();
        assert_eq!(disasm(&instr), expected, "{code:#010x}");
    }

    #[test]
    fn simplified_mnemonics() {
        check(0x3860_0001, "li r3, 0x1");
        check(0x7c83_2378, "mr r3, r4");
        check(0x7d88_02a6, "mflr r12");
        check(0x6000_0000, "nop");
        check(BLR, "blr");
    }

    #[test]
    fn operand_forms() {
        check(0x3821_ffa0, "addi r1, r1, -0x60");
        check(0x8181_fff8, "lwz r12, -0x8(r1)");
        check(0x7c63_2214, "add r3, r3, r4");
        check(0x4800_0011, "bl 0x82000010");
        check(0x2c03_0000, "cmpi cr0, 0, r3, 0x0");
    }
}
