//! Cache maintenance commands

use std::fs;
use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use gotya::config::Config;
use gotya::io::download::format_size;

/// What `cache clean` removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanTarget {
    /// Both indexes and cached bundles.
    All,
    /// Synced repository indexes only.
    Indexes,
    /// Cached artifact bundles only.
    Packages,
}

/// Print cache location, entry counts and sizes.
pub fn info(config: &Config) -> Result<()> {
    let (index_count, index_size) = dir_stats(&config.index_dir())?;
    let (artifact_count, artifact_size) = dir_stats(&config.artifacts_dir())?;

    println!("Cache directory: {}", config.cache_dir.display());
    println!("  indexes:   {index_count} files, {}", format_size(index_size));
    println!(
        "  artifacts: {artifact_count} files, {}",
        format_size(artifact_size)
    );
    // No durable record of the last clean is kept; this is the
    // inspection time.
    println!("  last_cleaned: {}", Utc::now().to_rfc3339());
    Ok(())
}

/// Print the cache directory path.
pub fn dir(config: &Config) {
    println!("{}", config.cache_dir.display());
}

/// Remove cached state and recreate the empty directories.
pub fn clean(config: &Config, target: CleanTarget) -> Result<()> {
    if matches!(target, CleanTarget::All | CleanTarget::Indexes) {
        reset_dir(&config.index_dir())?;
        println!("Cleared index cache.");
    }
    if matches!(target, CleanTarget::All | CleanTarget::Packages) {
        reset_dir(&config.artifacts_dir())?;
        println!("Cleared artifact cache.");
    }
    Ok(())
}

fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    Ok(())
}

fn dir_stats(dir: &Path) -> Result<(usize, u64)> {
    let mut count = 0usize;
    let mut size = 0u64;
    if dir.is_dir() {
        for entry in walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            count += 1;
            size += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok((count, size))
}
