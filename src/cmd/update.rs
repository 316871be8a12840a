//! Update command

use anyhow::Result;
use gotya::config::Config;
use gotya::ops::orchestrator::UpdateOptions;
use gotya::Orchestrator;

/// Update the named artifacts, or everything with `--all`.
pub async fn update(
    config: Config,
    names: &[String],
    all: bool,
    dry_run: bool,
    concurrency: usize,
) -> Result<()> {
    let (events, printer) = super::event_printer();
    let orch = Orchestrator::new(config, events)?;
    let outcome = orch
        .update(UpdateOptions {
            names: names.to_vec(),
            all,
            dry_run,
            concurrency,
        })
        .await;
    drop(orch);
    printer.await.ok();

    let plan = outcome?;
    if plan.is_empty() {
        println!("Everything is up to date.");
    } else if dry_run {
        println!("Planned {} steps (dry run).", plan.steps.len());
    } else {
        println!("Updated {} artifact(s).", plan.steps.len());
    }
    Ok(())
}
