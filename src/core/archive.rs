//! Bundle archive codec
//!
//! `.gotya` bundles are gzip-compressed tar archives. File mode (lower
//! nine bits) and modification time survive a round-trip; symlinks are
//! preserved where the host supports them.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

/// Errors from creating or unpacking a bundle archive.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Underlying filesystem or stream failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The archive file itself does not exist.
    #[error("archive not found: {}", .0.display())]
    NotFound(PathBuf),

    /// An entry escapes the extraction root.
    #[error("Invalid path in archive: {0}")]
    InvalidPath(String),

    /// A named entry is absent from the archive.
    #[error("entry not found in archive: {0}")]
    EntryNotFound(String),

    /// The entry cannot be represented on this platform.
    #[error("unsupported archive entry: {0}")]
    Unsupported(String),
}

/// A regular file written during extraction.
#[derive(Debug, Clone)]
pub struct ExtractedFile {
    /// Path relative to the extraction root, with forward slashes.
    pub relative_path: PathBuf,
    /// Absolute path on disk.
    pub absolute_path: PathBuf,
}

/// Create a gzip tar archive of `source_dir` at `out_path`.
///
/// Entries are added in lexicographic path order so the same tree
/// always produces the same archive layout.
pub fn create(source_dir: &Path, out_path: &Path) -> Result<(), ArchiveError> {
    if !source_dir.is_dir() {
        return Err(ArchiveError::NotFound(source_dir.to_path_buf()));
    }
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = File::create(out_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut entries: Vec<_> = walkdir::WalkDir::new(source_dir)
        .min_depth(1)
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .map_err(io::Error::other)?;
    entries.sort_by(|a, b| a.path().cmp(b.path()));

    for entry in entries {
        let rel = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(io::Error::other)?;
        if entry.file_type().is_dir() {
            builder.append_dir(rel, entry.path())?;
        } else {
            // Regular files and symlinks; with follow_symlinks(false)
            // a symlink is archived as a link entry.
            builder.append_path_with_name(entry.path(), rel)?;
        }
    }

    let encoder = builder.into_inner()?;
    encoder.finish()?;
    Ok(())
}

/// Extract every entry of `archive_path` under `dest_dir`.
///
/// Parent directories are created with mode `0o755`, existing files are
/// overwritten, and entries that are absolute or contain `..` segments
/// are rejected. Returns the regular files written.
pub fn extract(archive_path: &Path, dest_dir: &Path) -> Result<Vec<ExtractedFile>, ArchiveError> {
    let mut archive = open(archive_path)?;
    create_dir_0755(dest_dir)?;

    let mut extracted = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = sanitize(&entry.path()?)?;
        let dest = dest_dir.join(&rel);

        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            create_dir_0755(&dest)?;
            continue;
        }
        if entry_type.is_symlink() && !cfg!(unix) {
            return Err(ArchiveError::Unsupported(format!(
                "symbolic link {} cannot be extracted on this platform",
                rel.display()
            )));
        }

        if let Some(parent) = dest.parent() {
            create_dir_0755(parent)?;
        }
        // Overwrite whatever is already there.
        match fs::symlink_metadata(&dest) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&dest)?,
            Ok(_) => fs::remove_file(&dest)?,
            Err(_) => {}
        }
        entry.unpack(&dest)?;

        if entry_type.is_file() {
            extracted.push(ExtractedFile {
                relative_path: rel,
                absolute_path: dest,
            });
        }
    }

    Ok(extracted)
}

/// Extract the single entry `entry_path` to `dest_path`.
pub fn extract_file(
    archive_path: &Path,
    entry_path: &str,
    dest_path: &Path,
) -> Result<(), ArchiveError> {
    let mut archive = open(archive_path)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry_name(&entry.path()?) != entry_path {
            continue;
        }
        sanitize(&entry.path()?)?;
        if let Some(parent) = dest_path.parent() {
            create_dir_0755(parent)?;
        }
        if fs::symlink_metadata(dest_path).is_ok() {
            fs::remove_file(dest_path)?;
        }
        entry.unpack(dest_path)?;
        return Ok(());
    }
    Err(ArchiveError::EntryNotFound(entry_path.to_string()))
}

/// Read the single entry `entry_path` into memory.
pub fn read_file(archive_path: &Path, entry_path: &str) -> Result<Vec<u8>, ArchiveError> {
    let mut archive = open(archive_path)?;
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry_name(&entry.path()?) != entry_path {
            continue;
        }
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf)?;
        return Ok(buf);
    }
    Err(ArchiveError::EntryNotFound(entry_path.to_string()))
}

fn open(archive_path: &Path) -> Result<tar::Archive<GzDecoder<BufReader<File>>>, ArchiveError> {
    if !archive_path.exists() {
        return Err(ArchiveError::NotFound(archive_path.to_path_buf()));
    }
    let file = File::open(archive_path)?;
    let decoder = GzDecoder::new(BufReader::new(file));
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    Ok(archive)
}

/// Normalized entry name with forward slashes and no leading `./`.
fn entry_name(path: &Path) -> String {
    let mut parts = Vec::new();
    for comp in path.components() {
        if let Component::Normal(c) = comp {
            parts.push(c.to_string_lossy().into_owned());
        }
    }
    parts.join("/")
}

/// Reject absolute entries and `..` segments.
fn sanitize(path: &Path) -> Result<PathBuf, ArchiveError> {
    let mut clean = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Normal(c) => clean.push(c),
            Component::CurDir => {}
            _ => {
                return Err(ArchiveError::InvalidPath(path.display().to_string()));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(ArchiveError::InvalidPath(path.display().to_string()));
    }
    Ok(clean)
}

fn create_dir_0755(dir: &Path) -> io::Result<()> {
    if dir.as_os_str().is_empty() || dir.is_dir() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o755).create(dir)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)
    }
}
