//! Index generation from a directory of bundles
//!
//! Walks a tree of `.gotya` files, reads each bundle's manifest and
//! emits an index whose entry urls are relative to the artifacts
//! directory (optionally under a base path).

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::core::artifact::{self, ArtifactError};
use crate::core::hash;
use crate::core::index::{Index, IndexEntry, IndexError};

/// Errors from generating an index.
#[derive(Error, Debug)]
pub enum GeneratorError {
    /// Underlying filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A bundle's manifest could not be read.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    /// Index model failure.
    #[error(transparent)]
    Index(#[from] IndexError),

    /// Bad inputs (missing source, output collision).
    #[error("{0}")]
    Validation(String),
}

/// Inputs to [`generate`].
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Directory containing `.gotya` bundles (searched recursively).
    pub artifacts_dir: PathBuf,
    /// Index file to write.
    pub output: PathBuf,
    /// Optional prefix prepended to every entry url.
    pub base_path: Option<String>,
    /// Overwrite an existing output file.
    pub force: bool,
}

/// Generate an index over every bundle under the artifacts directory
/// and write it atomically. Returns the generated index.
pub fn generate(opts: &GenerateOptions) -> Result<Index, GeneratorError> {
    if !opts.artifacts_dir.is_dir() {
        return Err(GeneratorError::Validation(format!(
            "source directory does not exist: {}",
            opts.artifacts_dir.display()
        )));
    }
    if opts.output.exists() && !opts.force {
        return Err(GeneratorError::Validation(format!(
            "output file exists: {} (pass --force to overwrite)",
            opts.output.display()
        )));
    }

    let mut bundles: Vec<PathBuf> = walkdir::WalkDir::new(&opts.artifacts_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(artifact::BUNDLE_EXT))
        })
        .map(|e| e.into_path())
        .collect();
    bundles.sort();

    let mut index = Index::new();
    for bundle in bundles {
        let entry = index_entry(&bundle, &opts.artifacts_dir, opts.base_path.as_deref())?;
        tracing::debug!(name = %entry.name, version = %entry.version, "indexed bundle");
        index.artifacts.push(entry);
    }

    index
        .artifacts
        .sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));
    index.write_to_file(&opts.output)?;

    Ok(index)
}

fn index_entry(
    bundle: &Path,
    artifacts_dir: &Path,
    base_path: Option<&str>,
) -> Result<IndexEntry, GeneratorError> {
    let manifest = artifact::read_manifest(bundle)?;
    manifest.validate()?;

    let checksum = hash::sha256_file(bundle)?;
    let size = std::fs::metadata(bundle)?.len();

    let rel = bundle
        .strip_prefix(artifacts_dir)
        .map_err(std::io::Error::other)?;
    let mut url = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if let Some(base) = base_path {
        let base = base.trim_end_matches('/');
        if !base.is_empty() {
            url = format!("{base}/{url}");
        }
    }

    let entry = IndexEntry {
        name: manifest.name,
        version: manifest.version,
        os: manifest.os,
        arch: manifest.arch,
        description: manifest.description,
        url,
        checksum,
        size,
        dependencies: manifest.dependencies,
    };
    entry.validate()?;
    Ok(entry)
}
