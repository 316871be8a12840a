//! Operation orchestration
//!
//! Drives each user-facing operation through the same phases:
//! `Plan -> Fetch -> Verify -> Apply -> Finalize`, emitting an
//! [`Event`] at every step boundary. Apply is strictly sequential in
//! dependency order; a step failure stops the run and leaves the
//! already-applied steps in place as a consistent, smaller set.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::artifact;
use crate::core::index::MergedIndex;
use crate::core::resolver::{self, Plan, ResolvedEntry, Step};
use crate::core::version::Request;
use crate::io::download::{self, DownloadSpec};
use crate::io::http::{self, HttpClient, ReqwestClient};
use crate::io::sync::{self, SyncResult};
use crate::ops::error::{Error, Result};
use crate::ops::manager::ArtifactManager;
use crate::store::db::InstalledDb;

/// Phases of an operation, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Resolving the plan.
    Plan,
    /// Downloading bundles into the cache.
    Fetch,
    /// Verifying cached bundles.
    Verify,
    /// Applying steps to the filesystem and database.
    Apply,
    /// Flushing state and summarizing.
    Finalize,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Plan => "plan",
            Phase::Fetch => "fetch",
            Phase::Verify => "verify",
            Phase::Apply => "apply",
            Phase::Finalize => "finalize",
        };
        f.write_str(s)
    }
}

/// A progress event. `id` is the artifact name when the event concerns
/// one artifact, empty otherwise.
#[derive(Debug, Clone)]
pub struct Event {
    /// Phase the event belongs to.
    pub phase: Phase,
    /// Human-readable message.
    pub msg: String,
    /// Concerned artifact name, or empty.
    pub id: String,
}

/// Options for [`Orchestrator::install`].
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Requested artifacts, each `name[:constraint]`.
    pub requests: Vec<String>,
    /// Resolve and report without applying.
    pub dry_run: bool,
    /// Download parallelism; 0 picks a default.
    pub concurrency: usize,
}

/// Options for [`Orchestrator::update`].
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Names to update; empty requires `all`.
    pub names: Vec<String>,
    /// Update every installed artifact.
    pub all: bool,
    /// Resolve and report without applying.
    pub dry_run: bool,
    /// Download parallelism; 0 picks a default.
    pub concurrency: usize,
}

/// Options for [`Orchestrator::uninstall`].
#[derive(Debug, Clone, Default)]
pub struct UninstallOptions {
    /// Names to uninstall.
    pub names: Vec<String>,
    /// Also remove meta directories and emptied payload directories.
    pub purge: bool,
}

/// Options for [`Orchestrator::cleanup`].
#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    /// Resolve and report without applying.
    pub dry_run: bool,
}

/// Drives operations over the core subsystems.
pub struct Orchestrator {
    config: Config,
    client: Arc<dyn HttpClient>,
    events: UnboundedSender<Event>,
    cancel: CancellationToken,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build an orchestrator with the production HTTP client.
    pub fn new(config: Config, events: UnboundedSender<Event>) -> Result<Self> {
        let client = ReqwestClient::new(config.http_timeout)?;
        Ok(Self::with_client(config, events, Arc::new(client)))
    }

    /// Build an orchestrator over a caller-supplied HTTP client.
    pub fn with_client(
        config: Config,
        events: UnboundedSender<Event>,
        client: Arc<dyn HttpClient>,
    ) -> Self {
        Self {
            config,
            client,
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Token callers may cancel to stop the run at the next await
    /// point.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Sync every enabled repository's index.
    pub async fn sync(&self) -> Result<Vec<SyncResult>> {
        let results = sync::sync_repositories(
            self.client.as_ref(),
            &self.config.repositories,
            &self.config.index_dir(),
            self.config.max_concurrent_syncs,
            &self.cancel,
        )
        .await?;
        Ok(results)
    }

    /// Install the requested artifacts and their dependencies.
    pub async fn install(&self, opts: InstallOptions) -> Result<Plan> {
        if opts.requests.is_empty() {
            return Err(Error::Validation("no packages specified".into()));
        }
        let requests = opts
            .requests
            .iter()
            .map(|s| Request::parse(s))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        self.emit(Phase::Plan, "", "resolving install plan".into());
        let db = InstalledDb::load(&self.config.db_path())?;
        let merged = MergedIndex::load(&self.config.index_dir(), &self.config.repositories)?;
        let plan = resolver::resolve_install(
            &db,
            &merged,
            &requests,
            &self.config.resolve_platform(),
        )?;

        self.run_plan(db, plan, opts.dry_run, opts.concurrency, false)
            .await
    }

    /// Update the named artifacts (or all installed with `all`).
    pub async fn update(&self, opts: UpdateOptions) -> Result<Plan> {
        self.emit(Phase::Plan, "", "resolving update plan".into());
        let db = InstalledDb::load(&self.config.db_path())?;
        let merged = MergedIndex::load(&self.config.index_dir(), &self.config.repositories)?;
        let plan = resolver::resolve_update(
            &db,
            &merged,
            &opts.names,
            opts.all,
            &self.config.resolve_platform(),
        )?;

        self.run_plan(db, plan, opts.dry_run, opts.concurrency, false)
            .await
    }

    /// Uninstall the named artifacts.
    pub async fn uninstall(&self, opts: UninstallOptions) -> Result<Plan> {
        if opts.names.is_empty() {
            return Err(Error::Validation("no packages specified".into()));
        }
        self.emit(Phase::Plan, "", "resolving uninstall plan".into());
        let db = InstalledDb::load(&self.config.db_path())?;
        let plan = resolver::resolve_uninstall(&db, &opts.names)?;

        self.run_plan(db, plan, false, 0, opts.purge).await
    }

    /// Remove orphaned automatic artifacts.
    pub async fn cleanup(&self, opts: CleanupOptions) -> Result<Plan> {
        self.emit(Phase::Plan, "", "resolving cleanup plan".into());
        let db = InstalledDb::load(&self.config.db_path())?;
        let plan = resolver::resolve_cleanup(&db);

        self.run_plan(db, plan, opts.dry_run, 0, false).await
    }

    /// Fetch, verify and apply a resolved plan.
    async fn run_plan(
        &self,
        mut db: InstalledDb,
        plan: Plan,
        dry_run: bool,
        concurrency: usize,
        purge: bool,
    ) -> Result<Plan> {
        for step in &plan.steps {
            self.emit(Phase::Plan, step.name(), step.describe());
        }
        if plan.is_empty() {
            self.emit(Phase::Finalize, "", "nothing to do".into());
            return Ok(plan);
        }
        if dry_run {
            self.emit(Phase::Finalize, "", "dry run, no changes applied".into());
            return Ok(plan);
        }

        let bundles = self.fetch(&plan, concurrency).await?;
        self.verify(&bundles).await?;

        let manager = ArtifactManager::new(&self.config);
        for step in &plan.steps {
            self.ensure_live()?;
            self.emit(Phase::Apply, step.name(), step.describe());

            let step_owned = step.clone();
            let manager_owned = manager.clone();
            let cancel = self.cancel.clone();
            let bundle = self.bundle_path(step);
            let db_owned = db;
            let (db_back, outcome) = tokio::task::spawn_blocking(move || {
                let mut db = db_owned;
                let result = match &step_owned {
                    Step::Install(entry) => {
                        manager_owned.install(&mut db, entry, &bundle, &cancel)
                    }
                    Step::Upgrade { to, .. } => {
                        manager_owned.upgrade(&mut db, to, &bundle, &cancel)
                    }
                    Step::Uninstall(name) => {
                        manager_owned.uninstall(&mut db, name, purge, &cancel)
                    }
                    Step::MarkManual(name) => manager_owned.mark_manual(&mut db, name),
                };
                (db, result)
            })
            .await
            .map_err(|e| Error::Io(format!("apply task failed: {e}")))?;
            db = db_back;

            if let Err(e) = outcome {
                self.emit(Phase::Apply, step.name(), format!("failed: {e}"));
                return Err(e);
            }
        }

        db.save()?;
        self.emit(
            Phase::Finalize,
            "",
            format!("applied {} steps", plan.steps.len()),
        );
        Ok(plan)
    }

    /// Download every bundle the plan needs into the cache.
    async fn fetch(&self, plan: &Plan, concurrency: usize) -> Result<Vec<(String, PathBuf)>> {
        let targets: Vec<&ResolvedEntry> = plan
            .steps
            .iter()
            .filter_map(|step| match step {
                Step::Install(entry) | Step::Upgrade { to: entry, .. } => Some(entry),
                _ => None,
            })
            .collect();
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        self.ensure_live()?;
        self.emit(
            Phase::Fetch,
            "",
            format!("fetching {} artifacts", targets.len()),
        );

        let artifacts_dir = self.config.artifacts_dir();
        let mut specs = Vec::with_capacity(targets.len());
        for entry in &targets {
            let auth = self
                .config
                .repositories
                .iter()
                .find(|r| r.name == entry.repository)
                .and_then(|r| r.auth.as_ref());
            specs.push(DownloadSpec {
                url: entry.url.clone(),
                headers: http::auth_headers(auth)?,
                size: entry.size,
                checksum: entry.checksum.clone(),
                dest: artifacts_dir.join(entry.file_name()),
            });
        }

        let concurrency = effective_concurrency(concurrency);
        let paths = download::fetch_all(self.client.as_ref(), &specs, concurrency, &self.cancel)
            .await?;

        let mut bundles = Vec::with_capacity(paths.len());
        for (entry, path) in targets.iter().zip(paths) {
            self.emit(
                Phase::Fetch,
                &entry.name,
                format!(
                    "fetched {} {} ({})",
                    entry.name,
                    entry.version,
                    download::format_size(entry.size)
                ),
            );
            bundles.push((entry.name.clone(), path));
        }
        Ok(bundles)
    }

    /// Re-verify every cached bundle before applying.
    async fn verify(&self, bundles: &[(String, PathBuf)]) -> Result<()> {
        for (name, path) in bundles {
            self.ensure_live()?;
            let path_owned = path.clone();
            tokio::task::spawn_blocking(move || artifact::verify(&path_owned))
                .await
                .map_err(|e| Error::Io(format!("verify task failed: {e}")))??;
            self.emit(Phase::Verify, name, format!("verified {name}"));
        }
        Ok(())
    }

    fn bundle_path(&self, step: &Step) -> PathBuf {
        match step {
            Step::Install(entry) | Step::Upgrade { to: entry, .. } => {
                self.config.artifacts_dir().join(entry.file_name())
            }
            _ => PathBuf::new(),
        }
    }

    fn emit(&self, phase: Phase, id: &str, msg: String) {
        let _ = self.events.send(Event {
            phase,
            msg,
            id: id.to_string(),
        });
    }

    fn ensure_live(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

/// Download parallelism: the caller's choice, or `min(4, cores)`.
fn effective_concurrency(requested: usize) -> usize {
    if requested > 0 {
        requested
    } else {
        num_cpus::get().clamp(1, 4)
    }
}
