//! Applying plan steps to the filesystem and database
//!
//! Each step is applied atomically: payload files are written through
//! sibling temp files, anything displaced is renamed aside first, and
//! a failure before the database save rolls the filesystem back to the
//! pre-step state. Hooks run around each mutation; their own side
//! effects are not rolled back.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::config::Config;
use crate::core::archive;
use crate::core::artifact::{self, Manifest};
use crate::core::resolver::ResolvedEntry;
use crate::hooks::{HookContext, HookRunner};
use crate::ops::error::{Error, Result};
use crate::store::db::{DbError, InstallStatus, InstalledArtifact, InstalledDb};

/// Suffix for files and directories renamed aside during a step.
const BACKUP_SUFFIX: &str = ".gotya-backup";

/// Applies individual plan steps.
#[derive(Debug, Clone)]
pub struct ArtifactManager {
    install_dir: PathBuf,
    meta_dir: PathBuf,
    hooks: HookRunner,
}

/// Filesystem changes of an in-flight step, for rollback.
#[derive(Debug, Default)]
struct Deployment {
    /// Newly written files and symlinks.
    written: Vec<PathBuf>,
    /// Newly created directories (removed wholesale on rollback).
    created_dirs: Vec<PathBuf>,
    /// Pre-existing entries renamed aside: `(original, backup)`.
    displaced: Vec<(PathBuf, PathBuf)>,
}

impl Deployment {
    /// Undo everything: delete what was written, restore what was
    /// renamed aside.
    fn rollback(&self) {
        for path in self.written.iter().rev() {
            let _ = fs::remove_file(path);
        }
        for dir in self.created_dirs.iter().rev() {
            let _ = fs::remove_dir_all(dir);
        }
        for (original, backup) in self.displaced.iter().rev() {
            let _ = remove_entry(original);
            let _ = fs::rename(backup, original);
        }
    }

    /// Drop the backups after a successful step.
    fn discard_backups(&self) {
        for (_, backup) in &self.displaced {
            let _ = remove_entry(backup);
        }
    }

    /// Rename `path` aside if it exists.
    fn displace(&mut self, path: &Path) -> io::Result<()> {
        if fs::symlink_metadata(path).is_err() {
            return Ok(());
        }
        let backup = backup_path(path);
        let _ = remove_entry(&backup);
        fs::rename(path, &backup)?;
        self.displaced.push((path.to_path_buf(), backup));
        Ok(())
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(BACKUP_SUFFIX);
    path.with_file_name(name)
}

fn remove_entry(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

impl ArtifactManager {
    /// Build a manager over the configured directories.
    pub fn new(config: &Config) -> Self {
        Self {
            install_dir: config.install_dir.clone(),
            meta_dir: config.meta_dir.clone(),
            hooks: HookRunner::new(config.hook_timeout),
        }
    }

    /// Install a resolved artifact from its verified cached bundle.
    pub fn install(
        &self,
        db: &mut InstalledDb,
        entry: &ResolvedEntry,
        bundle: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let manifest = artifact::verify(bundle)?;
        let staging = tempfile::tempdir()?;
        archive::extract(bundle, staging.path())?;

        let artifact_meta = self.meta_dir.join(&entry.name);
        let ctx = HookContext {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            os: manifest.os.clone(),
            arch: manifest.arch.clone(),
            old_version: String::new(),
            install_path: self.install_dir.clone(),
            meta_dir: artifact_meta.clone(),
            temp_meta_dir: staging.path().join("meta"),
        };

        // Nothing has been written yet; a failing pre-install aborts
        // the whole step.
        self.run_hook(&manifest, "pre-install", staging.path().join("meta"), &ctx, cancel)?;

        let mut deployment = Deployment::default();
        let outcome = self.deploy(staging.path(), &artifact_meta, &mut deployment);
        let files = match outcome {
            Ok(files) => files,
            Err(e) => {
                deployment.rollback();
                return Err(e);
            }
        };

        if let Err(e) = self.run_hook(&manifest, "post-install", artifact_meta.clone(), &ctx, cancel)
        {
            deployment.rollback();
            return Err(e);
        }

        let record = InstalledArtifact {
            name: entry.name.clone(),
            version: entry.version.clone(),
            os: manifest.os.clone(),
            arch: manifest.arch.clone(),
            reason: entry.reason,
            repository: entry.repository.clone(),
            files,
            dependencies: manifest.dependencies.clone(),
            installed_at: Utc::now(),
            status: InstallStatus::Installed,
        };
        if let Err(e) = db.add(record).and_then(|()| db.save()) {
            let _ = db.remove(&entry.name);
            deployment.rollback();
            return Err(e.into());
        }

        deployment.discard_backups();
        tracing::info!(artifact = %entry.name, version = %entry.version, "installed");
        Ok(())
    }

    /// Replace an installed version with a new bundle. The new
    /// version's hooks run with `context.old_version` set.
    pub fn upgrade(
        &self,
        db: &mut InstalledDb,
        to: &ResolvedEntry,
        bundle: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let manifest = artifact::verify(bundle)?;
        let old = db
            .get(&to.name)
            .cloned()
            .ok_or_else(|| DbError::NotInstalled(to.name.clone()))?;

        let staging = tempfile::tempdir()?;
        archive::extract(bundle, staging.path())?;

        let artifact_meta = self.meta_dir.join(&to.name);
        let ctx = HookContext {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            os: manifest.os.clone(),
            arch: manifest.arch.clone(),
            old_version: old.version.clone(),
            install_path: self.install_dir.clone(),
            meta_dir: artifact_meta.clone(),
            temp_meta_dir: staging.path().join("meta"),
        };

        self.run_hook(&manifest, "pre-update", staging.path().join("meta"), &ctx, cancel)?;

        let mut deployment = Deployment::default();
        let outcome = (|| -> Result<Vec<PathBuf>> {
            // The old payload is renamed aside rather than deleted so
            // a failure can restore it.
            for file in &old.files {
                deployment.displace(file)?;
            }
            self.deploy(staging.path(), &artifact_meta, &mut deployment)
        })();
        let files = match outcome {
            Ok(files) => files,
            Err(e) => {
                deployment.rollback();
                return Err(e);
            }
        };

        if let Err(e) = self.run_hook(&manifest, "post-update", artifact_meta.clone(), &ctx, cancel)
        {
            deployment.rollback();
            return Err(e);
        }

        let record = InstalledArtifact {
            name: to.name.clone(),
            version: to.version.clone(),
            os: manifest.os.clone(),
            arch: manifest.arch.clone(),
            reason: to.reason,
            repository: to.repository.clone(),
            files,
            dependencies: manifest.dependencies.clone(),
            installed_at: Utc::now(),
            status: InstallStatus::Installed,
        };

        // Replace-and-save is one transactional update: any failure
        // restores both the database memory state and the filesystem.
        let _ = db.remove(&to.name);
        if let Err(e) = db.add(record).and_then(|()| db.save()) {
            let _ = db.remove(&to.name);
            let _ = db.add(old);
            deployment.rollback();
            return Err(e.into());
        }

        deployment.discard_backups();
        tracing::info!(artifact = %to.name, from = %old.version, to = %to.version, "upgraded");
        Ok(())
    }

    /// Remove an installed artifact. Missing tracked files are
    /// ignored; permission failures surface. With `purge`, the meta
    /// directory and emptied payload directories are removed too.
    pub fn uninstall(
        &self,
        db: &mut InstalledDb,
        name: &str,
        purge: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let record = db
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::NotInstalled(name.to_string()))?;

        let artifact_meta = self.meta_dir.join(name);
        let manifest = read_meta_manifest(&artifact_meta);

        // With purge the meta dir disappears before post-uninstall
        // runs, so keep a staged copy for the hook.
        let staged_meta = if purge && manifest.is_some() {
            let staged = tempfile::tempdir()?;
            copy_tree(&artifact_meta, staged.path())?;
            Some(staged)
        } else {
            None
        };

        let ctx = HookContext {
            name: record.name.clone(),
            version: record.version.clone(),
            os: record.os.clone(),
            arch: record.arch.clone(),
            old_version: String::new(),
            install_path: self.install_dir.clone(),
            meta_dir: artifact_meta.clone(),
            temp_meta_dir: staged_meta
                .as_ref()
                .map_or_else(|| artifact_meta.clone(), |t| t.path().to_path_buf()),
        };

        if let Some(manifest) = &manifest {
            self.run_hook(manifest, "pre-uninstall", artifact_meta.clone(), &ctx, cancel)?;
        }

        for file in &record.files {
            match fs::remove_file(file) {
                Ok(()) => {}
                // Already gone is fine; permission and other failures
                // surface.
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::Io(format!("cannot remove {}: {e}", file.display())));
                }
            }
        }

        if purge {
            let _ = fs::remove_dir_all(&artifact_meta);
            self.prune_empty_dirs(&record.files);
        }

        if let Some(manifest) = &manifest {
            let root = staged_meta
                .as_ref()
                .map_or_else(|| artifact_meta.clone(), |t| t.path().to_path_buf());
            self.run_hook(manifest, "post-uninstall", root, &ctx, cancel)?;
        }

        let _ = db.remove(name);
        db.save()?;
        tracing::info!(artifact = name, "uninstalled");
        Ok(())
    }

    /// Promote an installed artifact to manual and persist.
    pub fn mark_manual(&self, db: &mut InstalledDb, name: &str) -> Result<()> {
        db.mark_manual(name)?;
        db.save()?;
        Ok(())
    }

    /// Extract `data/` and `meta/` from a staged bundle into their
    /// destinations, returning the sorted tracked payload paths.
    fn deploy(
        &self,
        staging: &Path,
        artifact_meta: &Path,
        deployment: &mut Deployment,
    ) -> Result<Vec<PathBuf>> {
        let mut files = self.deploy_data(&staging.join("data"), deployment)?;
        files.sort();

        deployment.displace(artifact_meta).map_err(Error::from)?;
        copy_tree(&staging.join("meta"), artifact_meta)?;
        deployment.created_dirs.push(artifact_meta.to_path_buf());

        Ok(files)
    }

    fn deploy_data(&self, data: &Path, deployment: &mut Deployment) -> Result<Vec<PathBuf>> {
        let mut installed = Vec::new();
        if !data.is_dir() {
            return Ok(installed);
        }

        let mut entries: Vec<_> = WalkDir::new(data)
            .min_depth(1)
            .into_iter()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Io(format!("cannot walk bundle payload: {e}")))?;
        entries.sort_by(|a, b| a.path().cmp(b.path()));

        for entry in entries {
            let rel = entry
                .path()
                .strip_prefix(data)
                .map_err(io::Error::other)
                .map_err(Error::from)?;
            let dest = self.install_dir.join(rel);

            if entry.file_type().is_dir() {
                if !dest.is_dir() {
                    fs::create_dir_all(&dest)?;
                }
                continue;
            }

            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            deployment.displace(&dest)?;

            if entry.file_type().is_symlink() {
                deploy_symlink(entry.path(), &dest)?;
            } else {
                deploy_file(entry.path(), &dest)?;
            }
            deployment.written.push(dest.clone());
            installed.push(dest);
        }

        Ok(installed)
    }

    /// Best-effort removal of payload directories emptied by an
    /// uninstall, up to (but excluding) the install dir itself.
    fn prune_empty_dirs(&self, removed: &[PathBuf]) {
        for file in removed {
            let mut dir = file.parent();
            while let Some(d) = dir {
                if d == self.install_dir || !d.starts_with(&self.install_dir) {
                    break;
                }
                if fs::remove_dir(d).is_err() {
                    break;
                }
                dir = d.parent();
            }
        }
    }

    fn run_hook(
        &self,
        manifest: &Manifest,
        hook: &str,
        script_root: PathBuf,
        ctx: &HookContext,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(script) = manifest.hooks.get(hook) else {
            return Ok(());
        };
        self.hooks
            .run(hook, &script_root.join(script), ctx, cancel)
            .map_err(Error::from)
    }
}

/// Read the manifest of an installed artifact's meta directory, if
/// present.
fn read_meta_manifest(artifact_meta: &Path) -> Option<Manifest> {
    let bytes = fs::read(artifact_meta.join("artifact.json")).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Write `src` to `dest` through a sibling temp file; permission bits
/// travel with the copy.
fn deploy_file(src: &Path, dest: &Path) -> Result<()> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    fs::copy(src, tmp.path())?;
    tmp.persist(dest).map_err(|e| Error::from(e.error))?;
    Ok(())
}

fn deploy_symlink(src: &Path, dest: &Path) -> Result<()> {
    let target = fs::read_link(src)?;
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(&target, dest)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = target;
        Err(Error::Validation(format!(
            "symbolic link {} cannot be installed on this platform",
            dest.display()
        )))
    }
}

/// Recursively copy a directory tree (files, directories, symlinks).
fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    if !src.is_dir() {
        fs::create_dir_all(dest)?;
        return Ok(());
    }
    fs::create_dir_all(dest)?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| Error::Io(format!("cannot copy tree: {e}")))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)
            .map_err(Error::from)?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_symlink() {
            deploy_symlink(entry.path(), &target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
