//! Uninstall command

use anyhow::Result;
use gotya::config::Config;
use gotya::ops::orchestrator::UninstallOptions;
use gotya::Orchestrator;

/// Remove installed artifacts; dependencies stay behind for cleanup.
pub async fn uninstall(config: Config, names: &[String], purge: bool) -> Result<()> {
    let (events, printer) = super::event_printer();
    let orch = Orchestrator::new(config, events)?;
    let outcome = orch
        .uninstall(UninstallOptions {
            names: names.to_vec(),
            purge,
        })
        .await;
    drop(orch);
    printer.await.ok();

    let plan = outcome?;
    println!("Uninstalled {} artifact(s).", plan.steps.len());
    Ok(())
}
