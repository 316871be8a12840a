//! Index generation command

use std::path::Path;

use anyhow::Result;
use gotya::core::generator::{self, GenerateOptions};

/// Generate an index over a directory of bundles.
pub fn generate(
    artifacts_dir: &Path,
    output: &Path,
    base_path: Option<String>,
    force: bool,
) -> Result<()> {
    let index = generator::generate(&GenerateOptions {
        artifacts_dir: artifacts_dir.to_path_buf(),
        output: output.to_path_buf(),
        base_path,
        force,
    })?;

    println!(
        "Generated index with {} artifact(s): {}",
        index.artifacts.len(),
        output.display()
    );
    Ok(())
}
