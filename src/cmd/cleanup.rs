//! Cleanup command

use anyhow::Result;
use gotya::config::Config;
use gotya::ops::orchestrator::CleanupOptions;
use gotya::Orchestrator;

/// Remove orphaned automatic artifacts.
pub async fn cleanup(config: Config, dry_run: bool) -> Result<()> {
    let (events, printer) = super::event_printer();
    let orch = Orchestrator::new(config, events)?;
    let outcome = orch.cleanup(CleanupOptions { dry_run }).await;
    drop(orch);
    printer.await.ok();

    let plan = outcome?;
    if plan.is_empty() {
        println!("No orphaned artifacts.");
    } else if dry_run {
        println!("Would remove {} orphaned artifact(s).", plan.steps.len());
    } else {
        println!("Removed {} orphaned artifact(s).", plan.steps.len());
    }
    Ok(())
}
