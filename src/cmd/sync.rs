//! Sync command

use anyhow::Result;
use gotya::config::Config;
use gotya::Orchestrator;

/// Sync every enabled repository's index into the cache.
pub async fn sync(config: Config) -> Result<()> {
    if config.enabled_repositories().is_empty() {
        println!("No repositories configured.");
        return Ok(());
    }

    let (events, printer) = super::event_printer();
    let orch = Orchestrator::new(config, events)?;
    let results = orch.sync().await;
    drop(orch);
    printer.await.ok();

    let results = results?;
    for result in &results {
        if result.updated {
            println!("{}: index updated", result.repository);
        } else {
            println!("{}: already up to date", result.repository);
        }
    }
    Ok(())
}
