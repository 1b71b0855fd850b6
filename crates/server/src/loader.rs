use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use gemma_vlm_core::{PromptSettings, VisionLanguageRunner, load_tokenizer};

use crate::state::DynBackend;

/// Opens an exported program file as a backend. This is where a runtime
/// binding plugs into the server.
pub type ProgramOpener = dyn Fn(&Path) -> Result<DynBackend> + Send + Sync;

/// Builds a runner from a program file and the processor's tokenizer.
pub fn load_runner(
    program: &Path,
    tokenizer: &Path,
    prompt: &PromptSettings,
    open_program: &ProgramOpener,
) -> Result<VisionLanguageRunner<DynBackend>> {
    let tokenizer = load_tokenizer(tokenizer)?;
    let backend = open_program(program)
        .with_context(|| format!("failed to open program {}", program.display()))?;
    VisionLanguageRunner::new(backend, Arc::new(tokenizer), prompt)
}
