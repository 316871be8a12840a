//! Artifact manifest, packer and verifier
//!
//! A bundle contains exactly two top-level directories: `meta/`
//! (required, holds `artifact.json` and hook scripts) and `data/`
//! (optional payload installed verbatim). The manifest enumerates every
//! regular file under `data/` with its size and SHA-256.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::archive::{self, ArchiveError};
use crate::core::hash;
use crate::core::platform;
use crate::core::version::Request;

/// Path of the manifest inside a bundle.
pub const MANIFEST_PATH: &str = "meta/artifact.json";

/// Bundle file extension (without the dot).
pub const BUNDLE_EXT: &str = "gotya";

/// The closed set of recognized hook names.
pub const HOOK_NAMES: &[&str] = &[
    "pre-install",
    "post-install",
    "pre-update",
    "post-update",
    "pre-uninstall",
    "post-uninstall",
];

/// Errors from packing or verifying a bundle.
#[derive(Error, Debug)]
pub enum ArtifactError {
    /// Underlying filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Archive codec failure (includes a missing archive file).
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// The manifest is not valid JSON.
    #[error("malformed manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    /// Bad source layout or manifest contents.
    #[error("{0}")]
    Validation(String),

    /// The archived file set differs from the manifest.
    #[error("file set mismatch: missing {missing:?}, unexpected {unexpected:?}")]
    FileSetMismatch {
        /// Listed in the manifest but absent from `data/`.
        missing: Vec<String>,
        /// Present under `data/` but not listed.
        unexpected: Vec<String>,
    },

    /// A payload file's SHA-256 disagrees with the manifest.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Payload path relative to `data/`.
        path: String,
        /// Manifest digest.
        expected: String,
        /// Recomputed digest.
        actual: String,
    },

    /// A payload file's size disagrees with the manifest.
    #[error("size mismatch for {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Payload path relative to `data/`.
        path: String,
        /// Manifest size.
        expected: u64,
        /// Actual size on disk.
        actual: u64,
    },
}

/// One tracked payload file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to `data/`, forward slashes.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Hex SHA-256 of the contents.
    pub checksum: String,
}

/// The bundle manifest (`meta/artifact.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Artifact name.
    pub name: String,
    /// Semver version string.
    pub version: String,
    /// Target operating system token.
    pub os: String,
    /// Target architecture token.
    pub arch: String,
    /// Maintainer contact line.
    #[serde(default)]
    pub maintainer: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Declared dependencies, each `name[:constraint]`.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Hook name to script path relative to `meta/`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hooks: BTreeMap<String, String>,
    /// Every regular file under `data/`.
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

impl Manifest {
    /// Canonical bundle filename: `<name>_<version>_<os>_<arch>.gotya`.
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}_{}.{BUNDLE_EXT}",
            self.name, self.version, self.os, self.arch
        )
    }

    /// Parsed semver version.
    pub fn semver(&self) -> Result<Version, ArtifactError> {
        Version::from_str(&self.version).map_err(|e| {
            ArtifactError::Validation(format!("invalid version '{}': {e}", self.version))
        })
    }

    /// Check the manifest invariants (§field validity, closed hook
    /// set, parseable dependencies).
    pub fn validate(&self) -> Result<(), ArtifactError> {
        if self.name.is_empty() {
            return Err(ArtifactError::Validation(
                "artifact name must not be empty".into(),
            ));
        }
        if self.name.contains(['_', '/', '\\']) {
            return Err(ArtifactError::Validation(format!(
                "artifact name '{}' must not contain '_' or path separators",
                self.name
            )));
        }
        if self.version.is_empty() {
            return Err(ArtifactError::Validation(
                "artifact version must not be empty".into(),
            ));
        }
        self.semver()?;
        if !platform::is_valid_os(&self.os) {
            return Err(ArtifactError::Validation(format!(
                "unknown os token '{}'",
                self.os
            )));
        }
        if !platform::is_valid_arch(&self.arch) {
            return Err(ArtifactError::Validation(format!(
                "unknown arch token '{}'",
                self.arch
            )));
        }
        for (hook, script) in &self.hooks {
            if !HOOK_NAMES.contains(&hook.as_str()) {
                return Err(ArtifactError::Validation(format!(
                    "unknown hook name '{hook}'"
                )));
            }
            validate_meta_relative(script)?;
        }
        for dep in &self.dependencies {
            Request::parse(dep)
                .map_err(|e| ArtifactError::Validation(e.to_string()))?;
        }
        for entry in &self.files {
            if !hash::is_sha256_hex(&entry.checksum) {
                return Err(ArtifactError::Validation(format!(
                    "file '{}' has an invalid SHA-256 checksum",
                    entry.path
                )));
            }
        }
        Ok(())
    }
}

/// Read and parse the manifest out of a bundle without extracting it.
pub fn read_manifest(archive_path: &Path) -> Result<Manifest, ArtifactError> {
    let bytes = archive::read_file(archive_path, MANIFEST_PATH)?;
    let manifest: Manifest = serde_json::from_slice(&bytes)?;
    Ok(manifest)
}

/// Inputs to [`pack`].
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// Directory holding `meta/` and optionally `data/`.
    pub source_dir: PathBuf,
    /// Directory the bundle is written into.
    pub output_dir: PathBuf,
    /// Artifact name.
    pub name: String,
    /// Semver version string.
    pub version: String,
    /// Target os token.
    pub os: String,
    /// Target arch token.
    pub arch: String,
    /// Maintainer contact line.
    pub maintainer: String,
    /// Human-readable description.
    pub description: String,
    /// Declared dependencies, each `name[:constraint]`.
    pub dependencies: Vec<String>,
    /// Hook name to script path relative to `meta/`.
    pub hooks: BTreeMap<String, String>,
}

/// Pack a source tree into a `.gotya` bundle.
///
/// Writes the generated manifest into `meta/artifact.json` (replacing
/// any user-supplied one) and returns the bundle path.
pub fn pack(opts: &PackOptions) -> Result<PathBuf, ArtifactError> {
    let source = &opts.source_dir;
    if !source.is_dir() {
        return Err(ArtifactError::Validation(format!(
            "source directory does not exist: {}",
            source.display()
        )));
    }

    check_top_level(source)?;

    let meta_dir = source.join("meta");
    if !meta_dir.is_dir() {
        return Err(ArtifactError::Validation(
            "bundle source must contain a meta/ directory".into(),
        ));
    }

    let files = enumerate_payload(&source.join("data"))?;

    let manifest = Manifest {
        name: opts.name.clone(),
        version: opts.version.clone(),
        os: opts.os.clone(),
        arch: opts.arch.clone(),
        maintainer: opts.maintainer.clone(),
        description: opts.description.clone(),
        dependencies: opts.dependencies.clone(),
        hooks: opts.hooks.clone(),
        files,
    };
    manifest.validate()?;

    for script in manifest.hooks.values() {
        let script_path = meta_dir.join(script);
        if !script_path.is_file() {
            return Err(ArtifactError::Validation(format!(
                "hook script '{script}' not found under meta/"
            )));
        }
    }

    let json = serde_json::to_vec_pretty(&manifest)?;
    std::fs::write(meta_dir.join("artifact.json"), json)?;

    std::fs::create_dir_all(&opts.output_dir)?;
    let out_path = opts.output_dir.join(manifest.file_name());
    archive::create(source, &out_path)?;

    tracing::debug!(artifact = %manifest.name, path = %out_path.display(), "packed bundle");
    Ok(out_path)
}

/// Verify a bundle: parse its manifest, re-enumerate `data/` and
/// recompute every checksum. Returns the verified manifest.
pub fn verify(archive_path: &Path) -> Result<Manifest, ArtifactError> {
    if !archive_path.exists() {
        return Err(ArtifactError::Archive(ArchiveError::NotFound(
            archive_path.to_path_buf(),
        )));
    }

    let staging = tempfile::tempdir()?;
    archive::extract(archive_path, staging.path())?;

    let manifest_path = staging.path().join(MANIFEST_PATH);
    if !manifest_path.is_file() {
        return Err(ArtifactError::Validation(
            "bundle has no meta/artifact.json".into(),
        ));
    }
    let manifest: Manifest = serde_json::from_slice(&std::fs::read(&manifest_path)?)?;
    manifest.validate()?;

    check_top_level(staging.path())?;

    let actual = enumerate_payload(&staging.path().join("data"))?;
    let listed: BTreeSet<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
    let present: BTreeSet<&str> = actual.iter().map(|f| f.path.as_str()).collect();

    if listed != present {
        let missing = listed
            .difference(&present)
            .map(|s| (*s).to_string())
            .collect();
        let unexpected = present
            .difference(&listed)
            .map(|s| (*s).to_string())
            .collect();
        return Err(ArtifactError::FileSetMismatch { missing, unexpected });
    }

    for entry in &manifest.files {
        let Some(on_disk) = actual.iter().find(|f| f.path == entry.path) else {
            continue;
        };
        if on_disk.size != entry.size {
            return Err(ArtifactError::SizeMismatch {
                path: entry.path.clone(),
                expected: entry.size,
                actual: on_disk.size,
            });
        }
        if on_disk.checksum != entry.checksum {
            return Err(ArtifactError::ChecksumMismatch {
                path: entry.path.clone(),
                expected: entry.checksum.clone(),
                actual: on_disk.checksum.clone(),
            });
        }
    }

    Ok(manifest)
}

/// Reject any top-level entry other than `meta/` and `data/`.
fn check_top_level(source: &Path) -> Result<(), ArtifactError> {
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let name = entry.file_name();
        let is_dir = entry.file_type()?.is_dir();
        match (name.to_string_lossy().as_ref(), is_dir) {
            ("meta" | "data", true) => {}
            (other, _) => {
                return Err(ArtifactError::Validation(format!(
                    "top-level entry '{other}' is not allowed (expected only meta/ and data/)"
                )));
            }
        }
    }
    Ok(())
}

/// Regular files under `data/`, sorted by relative path.
fn enumerate_payload(data_dir: &Path) -> Result<Vec<FileEntry>, ArtifactError> {
    let mut files = Vec::new();
    if !data_dir.is_dir() {
        return Ok(files);
    }

    let mut paths: Vec<PathBuf> = walkdir::WalkDir::new(data_dir)
        .min_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    paths.sort();

    for path in paths {
        let rel = path
            .strip_prefix(data_dir)
            .map_err(io::Error::other)?
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");
        let size = std::fs::metadata(&path)?.len();
        let checksum = hash::sha256_file(&path)?;
        files.push(FileEntry {
            path: rel,
            size,
            checksum,
        });
    }

    Ok(files)
}

fn validate_meta_relative(script: &str) -> Result<(), ArtifactError> {
    let path = Path::new(script);
    let escapes = path.components().any(|c| {
        !matches!(c, Component::Normal(_) | Component::CurDir)
    });
    if script.is_empty() || escapes {
        return Err(ArtifactError::Validation(format!(
            "hook script path '{script}' must be relative to meta/"
        )));
    }
    Ok(())
}
