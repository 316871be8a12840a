//! Search command

use anyhow::{bail, Result};
use gotya::config::Config;
use gotya::core::index::MergedIndex;

/// Search the merged index view of every enabled repository.
pub fn search(config: &Config, query: &str) -> Result<()> {
    let merged = MergedIndex::load(&config.index_dir(), &config.repositories)?;
    if merged.is_empty() {
        bail!("no repository indexes found; run 'gotya sync' first");
    }

    let hits = merged.search(query);
    if hits.is_empty() {
        println!("No artifacts found matching '{query}'");
        return Ok(());
    }

    for hit in hits {
        println!(
            "{:<24} {:<12} {:<12} {}",
            hit.entry.name, hit.entry.version, hit.repository, hit.entry.description
        );
    }
    Ok(())
}
