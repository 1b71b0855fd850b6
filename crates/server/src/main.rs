use std::path::Path;

use anyhow::{Result, bail};
use clap::Parser;
use gemma_vlm_server::{DynBackend, ServerArgs, serve};
use tracing::error;

#[rocket::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();
    match serve(args, open_program).await {
        Ok(()) => Ok(()),
        Err(err) => {
            error!(error = %format!("{err:#}"), "Server failed");
            Err(err)
        }
    }
}

/// This binary links no runtime for exported programs, so the startup load
/// fails and inference answers 503 while health and status keep working.
/// Embedders call `gemma_vlm_server::serve` with an opener for their runtime.
fn open_program(path: &Path) -> Result<DynBackend> {
    bail!(
        "no program runtime is linked into this binary (cannot open {})",
        path.display()
    )
}
