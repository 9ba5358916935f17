use std::sync::Arc;

use anyhow::Context;
use xenon_vm::{
    cpu::{
        context, BackendKind, Config, FlatMemory, Memory, NullExportResolver, PpcContext,
        ThreadState,
    },
    Runtime,
};

use crate::parser::{Assignment, Suite, TestCase};

/// Address the first suite instruction is loaded at.
pub const CODE_BASE: u32 = 0x8200_0000;

/// Value of `lr` on entry to every case.
pub const RETURN_SENTINEL: u64 = 0xBEBE_BEBE;

const MEMORY_BASE: u32 = 0x8000_0000;
const MEMORY_SIZE: usize = 64 * 1024 * 1024;

const STACK_SIZE: u32 = 64 * 1024;
const STACK_ADDRESS: u32 = CODE_BASE - STACK_SIZE;
const PCR_ADDRESS: u32 = STACK_ADDRESS - 0x1000;

const THREAD_ID: u32 = 0x100;

pub trait Tester {
    fn init(&mut self, test: &TestCase) -> anyhow::Result<()>;
    fn run(&mut self, test: &TestCase) -> anyhow::Result<()>;
    fn write_assignment(&mut self, assignment: &Assignment) -> anyhow::Result<()>;
    fn check_assignment(&mut self, assignment: &Assignment) -> anyhow::Result<()>;
}

/// Runs the cases of one suite on a single backend.
pub struct Harness {
    pub backend: BackendKind,
    runtime: Arc<Runtime>,
    memory: Arc<FlatMemory>,
    thread: ThreadState,
}

impl Harness {
    pub fn new(config: Config, suite: &Suite) -> anyhow::Result<Self> {
        let code = suite.code_bytes();
        let code_limit = MEMORY_BASE as usize + MEMORY_SIZE - CODE_BASE as usize;
        anyhow::ensure!(code.len() <= code_limit, "suite code does not fit in guest memory");

        let memory = Arc::new(FlatMemory::new(MEMORY_BASE, MEMORY_SIZE));
        memory.load(CODE_BASE, &code)?;

        let backend = config.backend;
        let runtime = xenon_vm::build(config, memory.clone(), Arc::new(NullExportResolver))
            .with_context(|| format!("failed to build {backend} runtime"))?;
        let thread = new_thread(&runtime);
        Ok(Self { backend, runtime, memory, thread })
    }

    pub fn context(&self) -> &PpcContext {
        &self.thread.ctx
    }

    /// Returns the debug dumps of the function at the entry point of `test`.
    pub fn debug_dump(&self, test: &TestCase) -> Option<String> {
        let func = self.runtime.lookup_compiled(CODE_BASE + test.offset)?;
        func.debug_info.as_ref().map(|info| info.dump())
    }
}

fn new_thread(runtime: &Arc<Runtime>) -> ThreadState {
    runtime.create_thread_state(THREAD_ID, STACK_ADDRESS, STACK_SIZE, PCR_ADDRESS)
}

impl Tester for Harness {
    fn init(&mut self, _: &TestCase) -> anyhow::Result<()> {
        self.thread = new_thread(&self.runtime);
        self.thread.ctx.lr = RETURN_SENTINEL;
        Ok(())
    }

    fn run(&mut self, test: &TestCase) -> anyhow::Result<()> {
        let address = CODE_BASE + test.offset;
        tracing::debug!("{}: running test_{} at {address:#x}", self.backend, test.name);
        self.runtime
            .execute(&mut self.thread, address)
            .with_context(|| format!("test_{} did not complete", test.name))
    }

    fn write_assignment(&mut self, assignment: &Assignment) -> anyhow::Result<()> {
        match assignment {
            Assignment::Mem { addr, value } => self
                .memory
                .write_bytes(*addr, value)
                .with_context(|| format!("failed to write {assignment}")),
            Assignment::Register { name, value } => {
                write_register(&mut self.thread.ctx, name, *value)
            }
        }
    }

    fn check_assignment(&mut self, assignment: &Assignment) -> anyhow::Result<()> {
        match assignment {
            Assignment::Mem { addr, value } => {
                let mut actual = vec![0; value.len()];
                self.memory
                    .read_bytes(*addr, &mut actual)
                    .with_context(|| format!("failed to read {assignment}"))?;
                let actual = Assignment::Mem { addr: *addr, value: actual };
                anyhow::ensure!(actual == *assignment, "expected {assignment}, got {actual}");
            }
            Assignment::Register { name, value } => {
                let actual = read_register(&self.thread.ctx, name)?;
                anyhow::ensure!(
                    actual == *value,
                    "expected {assignment}, got {name} = {actual:#x}"
                );
            }
        }
        Ok(())
    }
}

/// Returns the index of a condition register field name (`cr0` to `cr7`).
fn cr_field(name: &str) -> Option<usize> {
    let field: usize = name.strip_prefix("cr")?.parse().ok()?;
    (field < 8).then_some(field)
}

pub fn write_register(ctx: &mut PpcContext, name: &str, value: u128) -> anyhow::Result<()> {
    match name {
        "cr" => ctx.set_cr_value(value as u32),
        "xer" => ctx.set_xer_value(value as u32),
        _ => match cr_field(name) {
            Some(field) => {
                for (i, bit) in ctx.cr[field * 4..field * 4 + 4].iter_mut().enumerate() {
                    *bit = ((value >> (3 - i)) & 1) as u8;
                }
            }
            None => {
                let reg = context::reg_by_name(name)
                    .with_context(|| format!("unknown register: {name}"))?;
                ctx.write(reg.offset, reg.ty, value);
            }
        },
    }
    Ok(())
}

pub fn read_register(ctx: &PpcContext, name: &str) -> anyhow::Result<u128> {
    Ok(match name {
        "cr" => ctx.cr_value() as u128,
        "xer" => ctx.xer_value() as u128,
        _ => match cr_field(name) {
            Some(field) => {
                let bits = &ctx.cr[field * 4..field * 4 + 4];
                bits.iter().fold(0, |acc, x| (acc << 1) | (*x & 1) as u128)
            }
            None => {
                let reg = context::reg_by_name(name)
                    .with_context(|| format!("unknown register: {name}"))?;
                ctx.read(reg.offset, reg.ty)
            }
        },
    })
}

/// Lists every architectural register that differs between `a` and `b`.
pub fn diff_contexts(a: &PpcContext, b: &PpcContext) -> Vec<String> {
    let mut diff = vec![];
    let mut check = |name: String, left: u128, right: u128| {
        if left != right {
            diff.push(format!("{name}: {left:#x} != {right:#x}"));
        }
    };

    for i in 0..32 {
        check(format!("r{i}"), a.r[i] as u128, b.r[i] as u128);
    }
    for i in 0..32 {
        check(format!("f{i}"), a.f[i] as u128, b.f[i] as u128);
    }
    for i in 0..a.v.len() {
        check(format!("v{i}"), a.v[i], b.v[i]);
    }
    check("lr".into(), a.lr as u128, b.lr as u128);
    check("ctr".into(), a.ctr as u128, b.ctr as u128);
    check("cr".into(), a.cr_value() as u128, b.cr_value() as u128);
    check("xer".into(), a.xer_value() as u128, b.xer_value() as u128);

    diff
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn named_registers() {
        let mut ctx = PpcContext::default();
        write_register(&mut ctx, "r3", 0x1234).unwrap();
        write_register(&mut ctx, "cr6", 0b0010).unwrap();
        write_register(&mut ctx, "xer", 0x2000_0000).unwrap();
        write_register(&mut ctx, "f1", 2.5_f64.to_bits() as u128).unwrap();

        assert_eq!(ctx.r[3], 0x1234);
        assert_eq!(ctx.cr[26], 1);
        assert_eq!(ctx.cr_value(), 0x0000_0020);
        assert_eq!(ctx.xer_ca, 1);
        assert_eq!(f64::from_bits(ctx.f[1]), 2.5);

        assert_eq!(read_register(&ctx, "cr6").unwrap(), 0b0010);
        assert_eq!(read_register(&ctx, "ca").unwrap(), 1);
        assert!(read_register(&ctx, "r40").is_err());
        assert!(write_register(&mut ctx, "cr8", 1).is_err());
    }

    #[test]
    fn context_diff() {
        let a = PpcContext::default();
        let mut b = a;
        assert!(diff_contexts(&a, &b).is_empty());

        b.r[3] = 12;
        b.xer_ov = 1;
        assert_eq!(diff_contexts(&a, &b), ["r3: 0x0 != 0xc", "xer: 0x0 != 0x40000000"]);
    }

    #[test]
    fn add_case_on_interpreter() {
        let suite = crate::parser::parse(
            "test_add:\n#_ REGISTER_IN r3 5\n#_ REGISTER_IN r4 7\n\
             .long 0x7c632214\n.long 0x4e800020\n#_ REGISTER_OUT r3 12\n",
        )
        .unwrap();
        let case = &suite.cases[0];

        let mut harness = Harness::new(Config::interpreter(), &suite).unwrap();
        harness.init(case).unwrap();
        for input in &case.inputs {
            harness.write_assignment(input).unwrap();
        }
        harness.run(case).unwrap();
        harness.check_assignment(&case.outputs[0]).unwrap();
        let wrong = Assignment::Register { name: "r3".into(), value: 13 };
        assert!(harness.check_assignment(&wrong).is_err());
        assert_eq!(harness.context().lr, RETURN_SENTINEL);
    }
}
