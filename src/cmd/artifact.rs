//! Artifact authoring commands

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use gotya::core::artifact::{self, PackOptions};
use gotya::core::platform;

/// Pack a source tree into a `.gotya` bundle.
#[allow(clippy::too_many_arguments)]
pub fn create(
    source_dir: &Path,
    output_dir: &Path,
    name: &str,
    version: &str,
    os: Option<&str>,
    arch: Option<&str>,
    maintainer: &str,
    description: &str,
    dependencies: &[String],
    hooks: &[String],
) -> Result<()> {
    let mut hook_map = BTreeMap::new();
    for spec in hooks {
        let Some((hook, script)) = spec.split_once('=') else {
            bail!("invalid hook '{spec}': expected <hook-name>=<script-path>");
        };
        hook_map.insert(hook.to_string(), script.to_string());
    }

    let path = artifact::pack(&PackOptions {
        source_dir: source_dir.to_path_buf(),
        output_dir: output_dir.to_path_buf(),
        name: name.to_string(),
        version: version.to_string(),
        os: os.unwrap_or(platform::current_os()).to_string(),
        arch: arch.unwrap_or(platform::current_arch()).to_string(),
        maintainer: maintainer.to_string(),
        description: description.to_string(),
        dependencies: dependencies.to_vec(),
        hooks: hook_map,
    })
    .context("failed to create artifact")?;

    println!("Successfully created artifact: {}", path.display());
    Ok(())
}

/// Verify a bundle's manifest and payload checksums.
pub fn verify(path: &Path) -> Result<()> {
    let manifest = artifact::verify(path)?;
    println!(
        "Artifact OK: {} {} ({} files)",
        manifest.name,
        manifest.version,
        manifest.files.len()
    );
    Ok(())
}
