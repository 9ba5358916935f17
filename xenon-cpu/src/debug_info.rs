use bitflags::bitflags;

bitflags! {
    /// Selects which dumps are collected while compiling a function.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DebugInfoFlags: u32 {
        const SOURCE_DISASM = 1 << 0;
        const HIR_BEFORE = 1 << 1;
        const HIR_AFTER = 1 << 2;
        const LIR = 1 << 3;
        const MACHINE_CODE = 1 << 4;
    }
}

impl DebugInfoFlags {
    /// Parses a comma separated list of dump names (e.g. `hir_after,lir`).
    pub fn parse(value: &str) -> Option<Self> {
        let mut flags = Self::empty();
        for name in value.split(',').map(str::trim).filter(|x| !x.is_empty()) {
            flags |= match name {
                "source" | "source_disasm" => Self::SOURCE_DISASM,
                "hir_before" => Self::HIR_BEFORE,
                "hir" | "hir_after" => Self::HIR_AFTER,
                "lir" => Self::LIR,
                "machine_code" | "asm" => Self::MACHINE_CODE,
                "all" => Self::all(),
                _ => return None,
            };
        }
        Some(flags)
    }
}

/// Text dumps produced while compiling a function. Never read on the execution path.
#[derive(Clone, Debug, Default)]
pub struct DebugInfo {
    pub flags: DebugInfoFlags,
    pub source_disasm: Option<String>,
    pub hir_before: Option<String>,
    pub hir_after: Option<String>,
    pub lir: Option<String>,
    pub machine_code: Option<String>,
}

impl DebugInfo {
    pub fn new(flags: DebugInfoFlags) -> Self {
        Self { flags, ..Self::default() }
    }

    #[inline]
    pub fn wants(&self, flag: DebugInfoFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Renders every collected dump.
    pub fn dump(&self) -> String {
        let sections = [
            ("source", &self.source_disasm),
            ("hir (before optimization)", &self.hir_before),
            ("hir", &self.hir_after),
            ("lir", &self.lir),
            ("machine code", &self.machine_code),
        ];

        let mut out = String::new();
        for (name, text) in sections {
            if let Some(text) = text {
                out.push_str(&format!("; {name}\n{text}"));
                if !text.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
        out
    }
}

#[test]
fn parse_flags() {
    assert_eq!(
        DebugInfoFlags::parse("hir, lir"),
        Some(DebugInfoFlags::HIR_AFTER | DebugInfoFlags::LIR)
    );
    assert_eq!(DebugInfoFlags::parse(""), Some(DebugInfoFlags::empty()));
    assert_eq!(DebugInfoFlags::parse("bogus"), None);
}
