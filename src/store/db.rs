//! Installed artifact database
//!
//! A single JSON file under the state directory records every
//! installed artifact: its version, install reason, tracked payload
//! files and declared dependencies. Saves are atomic and fsync'd; a
//! missing file loads as an empty database.

use std::collections::BTreeSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::version::Request;

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Errors from loading or mutating the database.
#[derive(Error, Debug)]
pub enum DbError {
    /// Underlying filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed database JSON.
    #[error("malformed installed database: {0}")]
    Json(#[from] serde_json::Error),

    /// The database was written by a newer gotya.
    #[error("unsupported installed database schema version {0}")]
    UnsupportedSchema(u32),

    /// The named artifact has no record.
    #[error("artifact '{0}' is not installed")]
    NotInstalled(String),

    /// A second record for the same name was rejected.
    #[error("artifact '{0}' is already installed")]
    AlreadyInstalled(String),
}

/// Why an artifact is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallReason {
    /// Requested directly by the user.
    Manual,
    /// Pulled in as a dependency.
    Automatic,
}

/// Health of a record's tracked files, computed at load time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallStatus {
    /// All tracked files are present.
    #[default]
    Installed,
    /// At least one tracked file is absent.
    Missing,
}

/// One installed artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledArtifact {
    /// Artifact name (unique in the database).
    pub name: String,
    /// Installed semver version string.
    pub version: String,
    /// Os token the bundle was built for.
    pub os: String,
    /// Arch token the bundle was built for.
    pub arch: String,
    /// Manual or automatic.
    pub reason: InstallReason,
    /// Name of the repository the bundle came from.
    pub repository: String,
    /// Absolute installed payload paths.
    pub files: Vec<PathBuf>,
    /// Dependencies as declared at install time (`name[:constraint]`).
    pub dependencies: Vec<String>,
    /// When the record was created or last upgraded.
    pub installed_at: DateTime<Utc>,
    /// File health, recomputed at load.
    #[serde(default)]
    pub status: InstallStatus,
}

impl InstalledArtifact {
    /// Names of the declared dependencies, constraints stripped.
    pub fn dependency_names(&self) -> Vec<String> {
        self.dependencies
            .iter()
            .filter_map(|d| Request::parse(d).ok())
            .map(|r| r.name)
            .collect()
    }
}

#[derive(Serialize, Deserialize)]
struct DbFile {
    schema_version: u32,
    artifacts: Vec<InstalledArtifact>,
}

/// The installed database: an ordered mapping of name to record.
#[derive(Debug, Clone)]
pub struct InstalledDb {
    path: PathBuf,
    artifacts: Vec<InstalledArtifact>,
}

impl InstalledDb {
    /// Load the database, yielding an empty one when the file does
    /// not exist. Records whose tracked files are absent are flagged
    /// [`InstallStatus::Missing`] but kept.
    pub fn load(path: &Path) -> Result<Self, DbError> {
        if !path.exists() {
            return Ok(Self {
                path: path.to_path_buf(),
                artifacts: Vec::new(),
            });
        }

        let bytes = std::fs::read(path)?;
        let file: DbFile = serde_json::from_slice(&bytes)?;
        if file.schema_version > SCHEMA_VERSION {
            return Err(DbError::UnsupportedSchema(file.schema_version));
        }

        let mut artifacts = file.artifacts;
        for record in &mut artifacts {
            let all_present = record.files.iter().all(|f| f.exists());
            record.status = if all_present {
                InstallStatus::Installed
            } else {
                tracing::warn!(artifact = %record.name, "tracked files missing on disk");
                InstallStatus::Missing
            };
        }
        artifacts.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Self {
            path: path.to_path_buf(),
            artifacts,
        })
    }

    /// Save the database atomically (sibling temp, fsync, rename).
    pub fn save(&self) -> Result<(), DbError> {
        let file = DbFile {
            schema_version: SCHEMA_VERSION,
            artifacts: self.artifacts.clone(),
        };
        let json = serde_json::to_vec_pretty(&file)?;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    /// The file this database loads from and saves to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The record for `name`, if installed.
    pub fn get(&self, name: &str) -> Option<&InstalledArtifact> {
        self.artifacts.iter().find(|a| a.name == name)
    }

    /// All records, ordered by name.
    pub fn all(&self) -> &[InstalledArtifact] {
        &self.artifacts
    }

    /// Records whose name starts with `prefix`, ordered by name.
    pub fn filter(&self, prefix: &str) -> Vec<&InstalledArtifact> {
        self.artifacts
            .iter()
            .filter(|a| a.name.starts_with(prefix))
            .collect()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    /// Whether the database has no records.
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Insert a new record. At most one record per name may exist.
    pub fn add(&mut self, record: InstalledArtifact) -> Result<(), DbError> {
        if self.get(&record.name).is_some() {
            return Err(DbError::AlreadyInstalled(record.name));
        }
        let pos = self
            .artifacts
            .partition_point(|a| a.name < record.name);
        self.artifacts.insert(pos, record);
        Ok(())
    }

    /// Remove and return the record for `name`.
    pub fn remove(&mut self, name: &str) -> Option<InstalledArtifact> {
        let pos = self.artifacts.iter().position(|a| a.name == name)?;
        Some(self.artifacts.remove(pos))
    }

    /// Promote a record to manually installed.
    pub fn mark_manual(&mut self, name: &str) -> Result<(), DbError> {
        self.mark(name, InstallReason::Manual)
    }

    /// Demote a record to automatically installed.
    pub fn mark_automatic(&mut self, name: &str) -> Result<(), DbError> {
        self.mark(name, InstallReason::Automatic)
    }

    fn mark(&mut self, name: &str, reason: InstallReason) -> Result<(), DbError> {
        let record = self
            .artifacts
            .iter_mut()
            .find(|a| a.name == name)
            .ok_or_else(|| DbError::NotInstalled(name.to_string()))?;
        record.reason = reason;
        Ok(())
    }

    /// Names of the records that declare `name` as a dependency.
    pub fn reverse_dependencies(&self, name: &str) -> BTreeSet<String> {
        self.artifacts
            .iter()
            .filter(|a| a.dependency_names().iter().any(|d| d == name))
            .map(|a| a.name.clone())
            .collect()
    }

    /// Automatic records nothing depends on (one round; cleanup
    /// iterates this to a fixpoint over a simulated removal set).
    pub fn orphaned_automatic(&self) -> Vec<String> {
        self.artifacts
            .iter()
            .filter(|a| a.reason == InstallReason::Automatic)
            .filter(|a| self.reverse_dependencies(&a.name).is_empty())
            .map(|a| a.name.clone())
            .collect()
    }
}
