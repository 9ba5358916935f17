use std::sync::Arc;

use xenon_cpu::{AssembleError, Assembler, BackendKind, Config, ExportResolver, Memory};
use xenon_hir::OpcodeTable;
use xenon_jit::NativeBackend;

use crate::Runtime;

#[derive(Debug)]
pub enum BuildError {
    /// The native backend was requested on a host it cannot generate code for.
    UnsupportedHost(target_lexicon::Triple),
    FailedToInitBackend(AssembleError),
    InvalidConfig(&'static str),
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedHost(host) => write!(f, "Native backend not supported on {host}"),
            Self::FailedToInitBackend(err) => write!(f, "Failed to initialize backend: {err}"),
            Self::InvalidConfig(msg) => write!(f, "Invalid config: {msg}"),
        }
    }
}

impl std::error::Error for BuildError {}

/// Creates a runtime that executes guest code stored in `memory`, resolving imports through
/// `exports`.
pub fn build(
    config: Config,
    memory: Arc<dyn Memory>,
    exports: Arc<dyn ExportResolver>,
) -> Result<Arc<Runtime>, BuildError> {
    if config.arena_chunk_size == 0 {
        return Err(BuildError::InvalidConfig("arena chunk size must be non-zero"));
    }
    if config.max_scan_instructions == 0 {
        return Err(BuildError::InvalidConfig("scan limit must be non-zero"));
    }

    let table = Arc::new(OpcodeTable::new());
    let native = match config.backend {
        BackendKind::Native => {
            if !BackendKind::native_supported() {
                return Err(BuildError::UnsupportedHost(target_lexicon::HOST));
            }
            let mut native = NativeBackend::new(table.clone());
            native.initialize().map_err(BuildError::FailedToInitBackend)?;
            Some(native)
        }
        BackendKind::Interpreter => None,
    };

    tracing::debug!(
        "building runtime: backend={}, optimize={}, debug_info={:?}",
        config.backend,
        config.optimize,
        config.debug_info
    );
    Ok(Arc::new(Runtime::new(config, table, memory, exports, native)))
}
