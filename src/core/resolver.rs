//! Dependency resolution and planning
//!
//! Given the installed database, the merged index view and a set of
//! user requests, the resolver produces an ordered [`Plan`]. Selection
//! accumulates constraints per name to a fixpoint: installed versions
//! are kept while they satisfy every constraint, otherwise the highest
//! index version that satisfies them all (and matches the platform) is
//! picked. Steps are emitted dependencies-first.

use std::collections::{BTreeMap, BTreeSet};

use semver::Version;
use thiserror::Error;

use crate::core::index::{IndexError, MergedIndex};
use crate::core::platform::Platform;
use crate::core::version::{Constraint, Request, VersionError};
use crate::store::db::{InstallReason, InstalledDb};

/// Ceiling on constraint-propagation rounds; real dependency graphs
/// settle in a handful.
const MAX_ROUNDS: usize = 64;

/// Errors from planning.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// A requested or depended-on artifact exists nowhere.
    #[error("artifact '{0}' not found in any repository")]
    NotFound(String),

    /// A requested artifact has no installed record.
    #[error("artifact '{0}' is not installed")]
    NotInstalled(String),

    /// An update was requested without names or `--all`.
    #[error("no packages specified (pass names or --all)")]
    NoPackages,

    /// No version satisfies the accumulated constraints.
    #[error("dependency conflict for {name}: {details}")]
    Conflict {
        /// The artifact the constraints collide on.
        name: String,
        /// The colliding constraints with their origins.
        details: String,
    },

    /// The dependency graph contains a cycle.
    #[error("circular dependency detected involving artifact '{0}'")]
    Cycle(String),

    /// Constraint propagation failed to settle.
    #[error("dependency resolution did not converge")]
    DidNotConverge,

    /// A malformed request or dependency string.
    #[error(transparent)]
    Version(#[from] VersionError),

    /// Merged index failure (bad entry url, unparsable version).
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// A fully resolved artifact selected from the merged index.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEntry {
    /// Artifact name.
    pub name: String,
    /// Selected version.
    pub version: String,
    /// Os token of the selected bundle.
    pub os: String,
    /// Arch token of the selected bundle.
    pub arch: String,
    /// Absolute download URL.
    pub url: String,
    /// Expected bundle SHA-256.
    pub checksum: String,
    /// Expected bundle size in bytes.
    pub size: u64,
    /// Declared dependencies (`name[:constraint]`).
    pub dependencies: Vec<String>,
    /// Repository the entry came from.
    pub repository: String,
    /// Install reason the record will carry.
    pub reason: InstallReason,
}

impl ResolvedEntry {
    /// Canonical cache filename of the bundle.
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}_{}.gotya",
            self.name, self.version, self.os, self.arch
        )
    }
}

/// One operation of a plan.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Install a new artifact.
    Install(ResolvedEntry),
    /// Replace an installed version.
    Upgrade {
        /// Version currently installed.
        from_version: String,
        /// Replacement.
        to: ResolvedEntry,
    },
    /// Remove an installed artifact.
    Uninstall(String),
    /// Promote an already-installed automatic artifact to manual.
    MarkManual(String),
}

impl Step {
    /// Name of the artifact the step concerns.
    pub fn name(&self) -> &str {
        match self {
            Step::Install(e) => &e.name,
            Step::Upgrade { to, .. } => &to.name,
            Step::Uninstall(name) | Step::MarkManual(name) => name,
        }
    }

    /// One-line human description.
    pub fn describe(&self) -> String {
        match self {
            Step::Install(e) => format!("install {} {}", e.name, e.version),
            Step::Upgrade { from_version, to } => {
                format!("upgrade {} {} -> {}", to.name, from_version, to.version)
            }
            Step::Uninstall(name) => format!("uninstall {name}"),
            Step::MarkManual(name) => format!("mark {name} manually installed"),
        }
    }
}

/// The resolver's ordered output.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Steps in application order (dependencies first).
    pub steps: Vec<Step>,
    /// Every entry selected from the index, for telemetry.
    pub resolved: Vec<ResolvedEntry>,
}

impl Plan {
    /// Whether the plan changes nothing.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// What the solver decided for one name.
#[derive(Debug, Clone)]
enum Selection {
    /// Keep the installed record.
    Installed {
        version: Version,
        dependencies: Vec<String>,
    },
    /// Install or upgrade to an index candidate.
    Picked { entry: ResolvedEntry, version: Version },
}

impl Selection {
    fn version(&self) -> &Version {
        match self {
            Selection::Installed { version, .. } | Selection::Picked { version, .. } => version,
        }
    }

    fn dependencies(&self) -> &[String] {
        match self {
            Selection::Installed { dependencies, .. } => dependencies,
            Selection::Picked { entry, .. } => &entry.dependencies,
        }
    }
}

/// Resolve an `install` invocation into a plan.
pub fn resolve_install(
    db: &InstalledDb,
    merged: &MergedIndex,
    requests: &[Request],
    platform: &Platform,
) -> Result<Plan, ResolveError> {
    let requested: BTreeSet<String> = requests.iter().map(|r| r.name.clone()).collect();
    let chosen = solve(db, merged, requests, &BTreeSet::new(), platform)?;
    build_plan(db, &chosen, &requested, true)
}

/// Resolve an `update` invocation. With `all`, every installed
/// artifact is a target; otherwise the given names (which must be
/// installed) and their transitive requirements.
pub fn resolve_update(
    db: &InstalledDb,
    merged: &MergedIndex,
    names: &[String],
    all: bool,
    platform: &Platform,
) -> Result<Plan, ResolveError> {
    let targets: BTreeSet<String> = if all {
        db.all().iter().map(|r| r.name.clone()).collect()
    } else {
        if names.is_empty() {
            return Err(ResolveError::NoPackages);
        }
        for name in names {
            if db.get(name).is_none() {
                return Err(ResolveError::NotInstalled(name.clone()));
            }
        }
        names.iter().cloned().collect()
    };

    let requests: Vec<Request> = targets
        .iter()
        .map(|name| Request {
            name: name.clone(),
            constraint: None,
        })
        .collect();

    let chosen = solve(db, merged, &requests, &targets, platform)?;
    build_plan(db, &chosen, &BTreeSet::new(), false)
}

/// Resolve an `uninstall` invocation: the requested names only,
/// dependents removed before their dependencies.
pub fn resolve_uninstall(db: &InstalledDb, names: &[String]) -> Result<Plan, ResolveError> {
    let mut unique: Vec<String> = Vec::new();
    for name in names {
        if db.get(name).is_none() {
            return Err(ResolveError::NotInstalled(name.clone()));
        }
        if !unique.contains(name) {
            unique.push(name.clone());
        }
    }

    // Order dependents before their dependencies within the removal
    // set: depth-first over installed dependency edges, reversed.
    let set: BTreeSet<String> = unique.iter().cloned().collect();
    let mut order: Vec<String> = Vec::new();
    let mut visited: BTreeSet<String> = BTreeSet::new();
    for name in &unique {
        visit_installed(db, name, &set, &mut visited, &mut order);
    }
    order.reverse();

    Ok(Plan {
        steps: order.into_iter().map(Step::Uninstall).collect(),
        resolved: Vec::new(),
    })
}

fn visit_installed(
    db: &InstalledDb,
    name: &str,
    set: &BTreeSet<String>,
    visited: &mut BTreeSet<String>,
    order: &mut Vec<String>,
) {
    if !set.contains(name) || !visited.insert(name.to_string()) {
        return;
    }
    if let Some(record) = db.get(name) {
        for dep in record.dependency_names() {
            visit_installed(db, &dep, set, visited, order);
        }
    }
    order.push(name.to_string());
}

/// Resolve a `cleanup` invocation: the reverse-dependency closure of
/// orphaned automatic records. Manual records are never cleaned.
pub fn resolve_cleanup(db: &InstalledDb) -> Plan {
    let mut remaining: BTreeMap<String, (InstallReason, Vec<String>)> = db
        .all()
        .iter()
        .map(|r| (r.name.clone(), (r.reason, r.dependency_names())))
        .collect();

    let mut steps = Vec::new();
    loop {
        let held: BTreeSet<String> = remaining
            .values()
            .flat_map(|(_, deps)| deps.iter().cloned())
            .collect();

        let orphans: Vec<String> = remaining
            .iter()
            .filter(|(name, (reason, _))| {
                *reason == InstallReason::Automatic && !held.contains(*name)
            })
            .map(|(name, _)| name.clone())
            .collect();

        if orphans.is_empty() {
            break;
        }
        for name in orphans {
            remaining.remove(&name);
            steps.push(Step::Uninstall(name));
        }
    }

    Plan {
        steps,
        resolved: Vec::new(),
    }
}

/// Constraint-propagation fixpoint shared by install and update.
fn solve(
    db: &InstalledDb,
    merged: &MergedIndex,
    requests: &[Request],
    upgrade_targets: &BTreeSet<String>,
    platform: &Platform,
) -> Result<BTreeMap<String, Selection>, ResolveError> {
    let mut chosen: BTreeMap<String, Selection> = BTreeMap::new();
    for record in db.all() {
        let version = Version::parse(&record.version).map_err(|e| {
            IndexError::Validation(format!(
                "installed record '{}' has invalid version '{}': {e}",
                record.name, record.version
            ))
        })?;
        chosen.insert(
            record.name.clone(),
            Selection::Installed {
                version,
                dependencies: record.dependencies.clone(),
            },
        );
    }

    for _ in 0..MAX_ROUNDS {
        // Gather constraints from the requests and from the deps of
        // every current selection.
        let mut constraints: BTreeMap<String, Vec<(Option<Constraint>, String)>> = BTreeMap::new();
        for req in requests {
            constraints
                .entry(req.name.clone())
                .or_default()
                .push((req.constraint.clone(), "requested".to_string()));
        }
        for (name, sel) in &chosen {
            for dep_str in sel.dependencies() {
                let dep = Request::parse(dep_str)?;
                constraints
                    .entry(dep.name)
                    .or_default()
                    .push((dep.constraint, format!("{name} {}", sel.version())));
            }
        }

        let mut changed = false;
        for (name, cons) in &constraints {
            if selection_ok(merged, &chosen, name, cons, upgrade_targets, platform)? {
                continue;
            }
            match best_candidate(merged, name, cons, platform)? {
                Some(sel) => {
                    chosen.insert(name.clone(), sel);
                    changed = true;
                }
                None => return Err(conflict(db, merged, name, cons)),
            }
        }

        if !changed {
            return Ok(chosen);
        }
    }

    Err(ResolveError::DidNotConverge)
}

/// Whether the current selection for `name` (if any) satisfies every
/// constraint and, for upgrade targets, is not outdated.
fn selection_ok(
    merged: &MergedIndex,
    chosen: &BTreeMap<String, Selection>,
    name: &str,
    cons: &[(Option<Constraint>, String)],
    upgrade_targets: &BTreeSet<String>,
    platform: &Platform,
) -> Result<bool, ResolveError> {
    let Some(sel) = chosen.get(name) else {
        return Ok(false);
    };
    let version = sel.version();
    let satisfied = cons
        .iter()
        .all(|(c, _)| c.as_ref().is_none_or(|c| c.matches(version)));
    if !satisfied {
        return Ok(false);
    }
    if upgrade_targets.contains(name) {
        if let Some(best) = best_candidate(merged, name, cons, platform)? {
            if best.version() > version {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Highest platform-matching index version satisfying every
/// constraint.
fn best_candidate(
    merged: &MergedIndex,
    name: &str,
    cons: &[(Option<Constraint>, String)],
    platform: &Platform,
) -> Result<Option<Selection>, ResolveError> {
    for candidate in merged.candidates_for(name) {
        if !platform.matches(&candidate.entry.os, &candidate.entry.arch) {
            continue;
        }
        let version = candidate.semver()?;
        let ok = cons
            .iter()
            .all(|(c, _)| c.as_ref().is_none_or(|c| c.matches(&version)));
        if !ok {
            continue;
        }
        let url = candidate.url()?;
        let entry = ResolvedEntry {
            name: candidate.entry.name.clone(),
            version: candidate.entry.version.clone(),
            os: candidate.entry.os.clone(),
            arch: candidate.entry.arch.clone(),
            url,
            checksum: candidate.entry.checksum.clone(),
            size: candidate.entry.size,
            dependencies: candidate.entry.dependencies.clone(),
            repository: candidate.repository.clone(),
            reason: InstallReason::Automatic,
        };
        return Ok(Some(Selection::Picked { entry, version }));
    }
    Ok(None)
}

fn conflict(
    db: &InstalledDb,
    merged: &MergedIndex,
    name: &str,
    cons: &[(Option<Constraint>, String)],
) -> ResolveError {
    if merged.candidates_for(name).is_empty() && db.get(name).is_none() {
        return ResolveError::NotFound(name.to_string());
    }

    let mut parts: Vec<String> = cons
        .iter()
        .map(|(c, origin)| match c {
            Some(c) => format!("{origin} requires {c}"),
            None => format!("{origin} requires any version"),
        })
        .collect();
    if let Some(installed) = db.get(name) {
        parts.push(format!("installed version is {}", installed.version));
    }
    ResolveError::Conflict {
        name: name.to_string(),
        details: parts.join("; "),
    }
}

/// Turn the fixpoint result into ordered steps.
fn build_plan(
    db: &InstalledDb,
    chosen: &BTreeMap<String, Selection>,
    requested: &BTreeSet<String>,
    promote_requested: bool,
) -> Result<Plan, ResolveError> {
    let mut changes: BTreeMap<String, ResolvedEntry> = BTreeMap::new();
    let mut resolved = Vec::new();

    for (name, sel) in chosen {
        if let Selection::Picked { entry, .. } = sel {
            let mut entry = entry.clone();
            entry.reason = if requested.contains(name) {
                InstallReason::Manual
            } else {
                db.get(name).map_or(InstallReason::Automatic, |r| r.reason)
            };
            resolved.push(entry.clone());
            changes.insert(name.clone(), entry);
        }
    }

    // Dependencies first among the changed names.
    let mut order: Vec<String> = Vec::new();
    let mut visited: BTreeSet<String> = BTreeSet::new();
    let mut visiting: BTreeSet<String> = BTreeSet::new();
    for name in changes.keys() {
        topo_visit(name, &changes, &mut visited, &mut visiting, &mut order)?;
    }

    let mut steps = Vec::new();
    for name in &order {
        let entry = changes[name].clone();
        match db.get(name) {
            Some(record) if record.version != entry.version => steps.push(Step::Upgrade {
                from_version: record.version.clone(),
                to: entry,
            }),
            Some(_) => {}
            None => steps.push(Step::Install(entry)),
        }
    }

    if promote_requested {
        for name in requested {
            if changes.contains_key(name) {
                continue;
            }
            if let Some(record) = db.get(name) {
                if record.reason == InstallReason::Automatic {
                    steps.push(Step::MarkManual(name.clone()));
                }
            }
        }
    }

    Ok(Plan { steps, resolved })
}

fn topo_visit(
    name: &str,
    changes: &BTreeMap<String, ResolvedEntry>,
    visited: &mut BTreeSet<String>,
    visiting: &mut BTreeSet<String>,
    order: &mut Vec<String>,
) -> Result<(), ResolveError> {
    if visited.contains(name) {
        return Ok(());
    }
    if !visiting.insert(name.to_string()) {
        return Err(ResolveError::Cycle(name.to_string()));
    }

    if let Some(entry) = changes.get(name) {
        for dep_str in &entry.dependencies {
            let dep = Request::parse(dep_str)?;
            if changes.contains_key(&dep.name) {
                topo_visit(&dep.name, changes, visited, visiting, order)?;
            }
        }
        order.push(name.to_string());
    }

    visiting.remove(name);
    visited.insert(name.to_string());
    Ok(())
}
