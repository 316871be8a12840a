//! Configuration commands

use std::path::Path;

use anyhow::{bail, Result};
use gotya::config::Config;

/// Print the whole configuration as TOML.
pub fn show(config: &Config) -> Result<()> {
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

/// Print one enumerated key.
pub fn get(config: &Config, key: &str) -> Result<()> {
    println!("{}", config.get(key)?);
    Ok(())
}

/// Set one enumerated key and persist the file.
pub fn set(config: &mut Config, path: &Path, key: &str, value: &str) -> Result<()> {
    config.set(key, value)?;
    config.save(path)?;
    println!("Set {key} = {value}");
    Ok(())
}

/// Write a fresh default configuration file.
pub fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "configuration file exists: {} (pass --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
