//! List command

use anyhow::Result;
use gotya::config::Config;
use gotya::store::db::{InstallReason, InstallStatus, InstalledDb};

/// List installed artifacts, optionally filtered by name prefix.
pub fn list(config: &Config, name_filter: Option<&str>) -> Result<()> {
    let db = InstalledDb::load(&config.db_path())?;
    let records = db.filter(name_filter.unwrap_or(""));

    if records.is_empty() {
        println!("No artifacts installed.");
        return Ok(());
    }

    for record in records {
        let reason = match record.reason {
            InstallReason::Manual => "manual",
            InstallReason::Automatic => "automatic",
        };
        let status = match record.status {
            InstallStatus::Installed => "",
            InstallStatus::Missing => " (missing files)",
        };
        println!(
            "{:<24} {:<12} {}{}",
            record.name, record.version, reason, status
        );
    }
    Ok(())
}
