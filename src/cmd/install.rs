//! Install command

use std::path::PathBuf;

use anyhow::Result;
use gotya::config::Config;
use gotya::ops::orchestrator::InstallOptions;
use gotya::Orchestrator;

/// Install the requested artifacts and their dependencies.
pub async fn install(
    mut config: Config,
    requests: &[String],
    dry_run: bool,
    cache_dir: Option<PathBuf>,
    concurrency: usize,
) -> Result<()> {
    if let Some(dir) = cache_dir {
        config.cache_dir = dir;
    }

    let (events, printer) = super::event_printer();
    let orch = Orchestrator::new(config, events)?;
    let outcome = orch
        .install(InstallOptions {
            requests: requests.to_vec(),
            dry_run,
            concurrency,
        })
        .await;
    drop(orch);
    printer.await.ok();

    let plan = outcome?;
    if plan.is_empty() {
        println!("Nothing to install.");
    } else if dry_run {
        println!("Planned {} steps (dry run).", plan.steps.len());
    } else {
        println!("Installed {} steps successfully.", plan.steps.len());
    }
    Ok(())
}
