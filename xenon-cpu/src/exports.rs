use std::sync::Arc;

use hashbrown::HashMap;

use crate::ThreadState;

/// A host implementation of a guest import.
pub type ExportFn = Arc<dyn Fn(&mut ThreadState) + Send + Sync>;

/// Resolves guest imports (a module name and an ordinal) to host functions.
pub trait ExportResolver: Send + Sync {
    fn resolve(&self, module: &str, ordinal: u32) -> Option<ExportFn>;
}

/// Resolves nothing.
pub struct NullExportResolver;

impl ExportResolver for NullExportResolver {
    fn resolve(&self, _: &str, _: u32) -> Option<ExportFn> {
        None
    }
}

/// Name of the pseudo module used to resolve `sc` instructions, the ordinal is the value of the
/// `LEV` field.
pub const SYSCALL_MODULE: &str = "syscall";

#[derive(Default)]
pub struct ExportTable {
    entries: HashMap<(String, u32), ExportFn>,
}

impl ExportTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<F>(&mut self, module: &str, ordinal: u32, func: F)
    where
        F: Fn(&mut ThreadState) + Send + Sync + 'static,
    {
        self.entries.insert((module.to_ascii_lowercase(), ordinal), Arc::new(func));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ExportResolver for ExportTable {
    fn resolve(&self, module: &str, ordinal: u32) -> Option<ExportFn> {
        self.entries.get(&(module.to_ascii_lowercase(), ordinal)).cloned()
    }
}

#[test]
fn module_names_are_case_insensitive() {
    let mut table = ExportTable::new();
    table.insert("xboxkrnl.exe", 12, |thread| thread.ctx.r[3] = 0);
    assert!(table.resolve("XBOXKRNL.EXE", 12).is_some());
    assert!(table.resolve("xboxkrnl.exe", 13).is_none());
    assert!(NullExportResolver.resolve("xboxkrnl.exe", 12).is_none());
}
