//! Repository index model
//!
//! A repository serves a single `index.json` listing its artifacts
//! with relative download URLs, sizes and SHA-256 checksums. The
//! merged view unions the indexes of every enabled repository, with
//! higher-priority repositories winning duplicate entries.

use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Repository;
use crate::core::hash;
use crate::core::version::Request;

/// Current index wire format version.
pub const FORMAT_VERSION: &str = "1";

/// Errors from parsing, validating or writing an index.
#[derive(Error, Debug)]
pub enum IndexError {
    /// Underlying filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed index JSON.
    #[error("malformed index: {0}")]
    Json(#[from] serde_json::Error),

    /// An index or entry violates a format invariant.
    #[error("{0}")]
    Validation(String),
}

/// One artifact listed by a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Artifact name.
    pub name: String,
    /// Semver version string.
    pub version: String,
    /// Target os token.
    pub os: String,
    /// Target arch token.
    pub arch: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Bundle URL relative to the index location.
    pub url: String,
    /// Hex SHA-256 of the bundle file.
    pub checksum: String,
    /// Bundle size in bytes.
    pub size: u64,
    /// Declared dependencies, each `name[:constraint]`.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl IndexEntry {
    /// Parsed semver version.
    pub fn semver(&self) -> Result<Version, IndexError> {
        Version::from_str(&self.version).map_err(|e| {
            IndexError::Validation(format!(
                "entry '{}' has invalid version '{}': {e}",
                self.name, self.version
            ))
        })
    }

    /// Check the entry invariants: relative `.gotya` url, well-formed
    /// checksum, non-zero size, parseable version and dependencies.
    pub fn validate(&self) -> Result<(), IndexError> {
        if self.name.is_empty() {
            return Err(IndexError::Validation("entry with empty name".into()));
        }
        self.semver()?;
        if self.url.contains("://") || self.url.starts_with('/') {
            return Err(IndexError::Validation(format!(
                "entry '{}' url must be relative: {}",
                self.name, self.url
            )));
        }
        if !self.url.to_lowercase().ends_with(".gotya") {
            return Err(IndexError::Validation(format!(
                "entry '{}' url must end in .gotya: {}",
                self.name, self.url
            )));
        }
        if !hash::is_sha256_hex(&self.checksum) {
            return Err(IndexError::Validation(format!(
                "entry '{}' has an invalid SHA-256 checksum",
                self.name
            )));
        }
        if self.size == 0 {
            return Err(IndexError::Validation(format!(
                "entry '{}' has zero size",
                self.name
            )));
        }
        for dep in &self.dependencies {
            Request::parse(dep)
                .map_err(|e| IndexError::Validation(e.to_string()))?;
        }
        Ok(())
    }
}

/// A repository index file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    /// Wire format version.
    pub format_version: String,
    /// When the index was generated.
    pub last_update: DateTime<Utc>,
    /// Artifact entries, in repository order.
    pub artifacts: Vec<IndexEntry>,
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

impl Index {
    /// Create a new empty index stamped now.
    pub fn new() -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            last_update: Utc::now(),
            artifacts: Vec::new(),
        }
    }

    /// Parse an index from JSON bytes and validate every entry.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IndexError> {
        let index: Self = serde_json::from_slice(bytes)?;
        index.validate()?;
        Ok(index)
    }

    /// Load an index file from disk.
    pub fn parse_from_file(path: &Path) -> Result<Self, IndexError> {
        Self::from_bytes(&fs::read(path)?)
    }

    /// Write the index as indented JSON with stable key order,
    /// atomically (sibling temp file + rename).
    pub fn write_to_file(&self, path: &Path) -> Result<(), IndexError> {
        let json = serde_json::to_vec_pretty(self)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        fs::write(tmp.path(), &json)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Validate all entries.
    pub fn validate(&self) -> Result<(), IndexError> {
        for entry in &self.artifacts {
            entry.validate()?;
        }
        Ok(())
    }

    /// All entries with the given name, any version or platform.
    pub fn find_by_name(&self, name: &str) -> Vec<&IndexEntry> {
        self.artifacts.iter().filter(|e| e.name == name).collect()
    }

    /// Search entries by relevance; excluded entries score zero.
    pub fn search(&self, query: &str) -> Vec<&IndexEntry> {
        let mut hits: Vec<(&IndexEntry, i64)> = self
            .artifacts
            .iter()
            .map(|e| (e, relevance(e, query)))
            .filter(|(_, score)| *score > 0)
            .collect();
        hits.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.name.cmp(&b.0.name)));
        hits.into_iter().map(|(e, _)| e).collect()
    }
}

/// Deterministic relevance score of `entry` against `query`.
///
/// Exact name match 1000; case-insensitive name prefix 500 plus the
/// query length; name substring 200; description substring 50;
/// everything else 0 (excluded).
pub fn relevance(entry: &IndexEntry, query: &str) -> i64 {
    if entry.name == query {
        return 1000;
    }
    let q = query.to_lowercase();
    let name = entry.name.to_lowercase();
    if name.starts_with(&q) {
        return 500 + q.len() as i64;
    }
    if name.contains(&q) {
        return 200;
    }
    if entry.description.to_lowercase().contains(&q) {
        return 50;
    }
    0
}

/// An index together with the repository it came from.
#[derive(Debug, Clone)]
pub struct RepositoryIndex {
    /// Repository name from the configuration.
    pub repository: String,
    /// Repository priority (higher wins duplicate entries).
    pub priority: u32,
    /// The repository's index URL (base for relative entry urls).
    pub index_url: String,
    /// The parsed index.
    pub index: Index,
}

/// A deduplicated entry of the merged view.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The index entry.
    pub entry: IndexEntry,
    /// Owning repository name.
    pub repository: String,
    /// Owning repository priority.
    pub priority: u32,
    /// The repository's index URL.
    pub index_url: String,
}

impl Candidate {
    /// Parsed semver version of the entry.
    pub fn semver(&self) -> Result<Version, IndexError> {
        self.entry.semver()
    }

    /// Absolute download URL, resolved against the index URL.
    pub fn url(&self) -> Result<String, IndexError> {
        let base = reqwest::Url::parse(&self.index_url).map_err(|e| {
            IndexError::Validation(format!("invalid repository url '{}': {e}", self.index_url))
        })?;
        let joined = base.join(&self.entry.url).map_err(|e| {
            IndexError::Validation(format!("invalid entry url '{}': {e}", self.entry.url))
        })?;
        Ok(joined.to_string())
    }
}

/// A search hit from the merged view.
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// The matching entry (highest version of its name).
    pub entry: IndexEntry,
    /// Owning repository name.
    pub repository: String,
    /// Relevance score.
    pub score: i64,
}

/// Priority-resolved union of the enabled repositories' indexes.
#[derive(Debug, Clone, Default)]
pub struct MergedIndex {
    repos: Vec<RepositoryIndex>,
}

impl MergedIndex {
    /// Build a merged view over repository indexes in configuration
    /// order.
    pub fn new(repos: Vec<RepositoryIndex>) -> Self {
        Self { repos }
    }

    /// Load the synced index of every enabled repository from
    /// `index_dir`. Repositories without a synced index are skipped.
    pub fn load(index_dir: &Path, repositories: &[Repository]) -> Result<Self, IndexError> {
        let mut repos = Vec::new();
        for repo in repositories.iter().filter(|r| r.enabled) {
            let path = index_dir.join(format!("{}.json", repo.name));
            if !path.exists() {
                tracing::debug!(repo = %repo.name, "no synced index, skipping");
                continue;
            }
            repos.push(RepositoryIndex {
                repository: repo.name.clone(),
                priority: repo.priority,
                index_url: repo.url.clone(),
                index: Index::parse_from_file(&path)?,
            });
        }
        Ok(Self::new(repos))
    }

    /// Whether the view has no loaded repositories.
    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }

    /// All deduplicated candidates, priority-resolved.
    ///
    /// For a `(name, version, os, arch)` tuple appearing in several
    /// repositories, the highest-priority repository wins; ties go to
    /// the repository listed first in the configuration.
    pub fn candidates(&self) -> Vec<Candidate> {
        let mut best: Vec<Candidate> = Vec::new();
        for repo in &self.repos {
            for entry in &repo.index.artifacts {
                let key = |e: &IndexEntry| {
                    (
                        e.name.clone(),
                        e.version.clone(),
                        e.os.clone(),
                        e.arch.clone(),
                    )
                };
                match best.iter_mut().find(|c| key(&c.entry) == key(entry)) {
                    Some(existing) if repo.priority > existing.priority => {
                        *existing = Candidate {
                            entry: entry.clone(),
                            repository: repo.repository.clone(),
                            priority: repo.priority,
                            index_url: repo.index_url.clone(),
                        };
                    }
                    Some(_) => {}
                    None => best.push(Candidate {
                        entry: entry.clone(),
                        repository: repo.repository.clone(),
                        priority: repo.priority,
                        index_url: repo.index_url.clone(),
                    }),
                }
            }
        }
        best
    }

    /// Candidates with the given name, highest version first.
    pub fn candidates_for(&self, name: &str) -> Vec<Candidate> {
        let mut named: Vec<Candidate> = self
            .candidates()
            .into_iter()
            .filter(|c| c.entry.name == name)
            .collect();
        named.sort_by(|a, b| {
            let va = a.semver().ok();
            let vb = b.semver().ok();
            vb.cmp(&va)
        });
        named
    }

    /// Search the merged view; one hit per artifact name, ordered by
    /// score descending, then name ascending, then repository
    /// priority descending.
    pub fn search(&self, query: &str) -> Vec<SearchHit> {
        let mut per_name: Vec<SearchHit> = Vec::new();
        for cand in self.candidates() {
            let score = relevance(&cand.entry, query);
            if score == 0 {
                continue;
            }
            let newer = |hit: &SearchHit| {
                let old = Version::from_str(&hit.entry.version).ok();
                let new = Version::from_str(&cand.entry.version).ok();
                new > old
            };
            match per_name.iter_mut().find(|h| h.entry.name == cand.entry.name) {
                Some(hit) if newer(hit) => {
                    *hit = SearchHit {
                        entry: cand.entry.clone(),
                        repository: cand.repository.clone(),
                        score,
                    };
                }
                Some(_) => {}
                None => per_name.push(SearchHit {
                    entry: cand.entry.clone(),
                    repository: cand.repository.clone(),
                    score,
                }),
            }
        }

        let priority_of = |hit: &SearchHit| {
            self.repos
                .iter()
                .find(|r| r.repository == hit.repository)
                .map_or(0, |r| r.priority)
        };
        per_name.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.entry.name.cmp(&b.entry.name))
                .then_with(|| priority_of(b).cmp(&priority_of(a)))
        });
        per_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(name: &str, version: &str) -> IndexEntry {
        IndexEntry {
            name: name.into(),
            version: version.into(),
            os: "linux".into(),
            arch: "amd64".into(),
            description: format!("{name} description"),
            url: format!("packages/{name}_{version}_linux_amd64.gotya"),
            checksum: "a".repeat(64),
            size: 128,
            dependencies: vec![],
        }
    }

    fn repo_index(repo: &str, priority: u32, entries: Vec<IndexEntry>) -> RepositoryIndex {
        RepositoryIndex {
            repository: repo.into(),
            priority,
            index_url: format!("http://example.com/{repo}/index.json"),
            index: Index {
                format_version: FORMAT_VERSION.into(),
                last_update: Utc::now(),
                artifacts: entries,
            },
        }
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.json");

        let index = Index {
            format_version: FORMAT_VERSION.into(),
            last_update: Utc::now(),
            artifacts: vec![entry("alpha", "1.0.0"), entry("beta", "2.1.0")],
        };
        index.write_to_file(&path).unwrap();

        let restored = Index::parse_from_file(&path).unwrap();
        assert_eq!(restored, index);
    }

    #[test]
    fn test_entry_validation() {
        let mut e = entry("alpha", "1.0.0");
        e.validate().unwrap();

        e.url = "http://example.com/abs.gotya".into();
        assert!(e.validate().unwrap_err().to_string().contains("relative"));

        e.url = "packages/alpha.tar.gz".into();
        assert!(e.validate().is_err());

        e.url = "packages/ALPHA.GOTYA".into();
        e.validate().unwrap();

        e.size = 0;
        assert!(e.validate().is_err());

        e.size = 1;
        e.checksum = "abc".into();
        assert!(e.validate().is_err());
    }

    #[test]
    fn test_find_by_name() {
        let index = Index {
            format_version: FORMAT_VERSION.into(),
            last_update: Utc::now(),
            artifacts: vec![
                entry("alpha", "1.0.0"),
                entry("alpha", "2.0.0"),
                entry("beta", "1.0.0"),
            ],
        };
        assert_eq!(index.find_by_name("alpha").len(), 2);
        assert_eq!(index.find_by_name("gamma").len(), 0);
    }

    #[test]
    fn test_relevance_policy() {
        let e = entry("ripgrep", "1.0.0");
        assert_eq!(relevance(&e, "ripgrep"), 1000);
        assert_eq!(relevance(&e, "Rip"), 503);
        assert_eq!(relevance(&e, "grep"), 200);
        assert_eq!(relevance(&e, "description"), 50);
        assert_eq!(relevance(&e, "zzz"), 0);
    }

    #[test]
    fn test_search_ordering() {
        let index = Index {
            format_version: FORMAT_VERSION.into(),
            last_update: Utc::now(),
            artifacts: vec![
                entry("grep-like", "1.0.0"),
                entry("ripgrep", "1.0.0"),
                entry("grep", "1.0.0"),
            ],
        };
        let names: Vec<&str> = index.search("grep").iter().map(|e| e.name.as_str()).collect();
        // exact > prefix > substring
        assert_eq!(names, vec!["grep", "grep-like", "ripgrep"]);
    }

    #[test]
    fn test_merged_priority_wins() {
        let mut high = entry("alpha", "1.0.0");
        high.description = "from high".into();
        let mut low = entry("alpha", "1.0.0");
        low.description = "from low".into();

        let merged = MergedIndex::new(vec![
            repo_index("low", 0, vec![low]),
            repo_index("high", 10, vec![high]),
        ]);

        let cands = merged.candidates_for("alpha");
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].repository, "high");
        assert_eq!(cands[0].entry.description, "from high");
    }

    #[test]
    fn test_merged_tie_insertion_order() {
        let merged = MergedIndex::new(vec![
            repo_index("first", 5, vec![entry("alpha", "1.0.0")]),
            repo_index("second", 5, vec![entry("alpha", "1.0.0")]),
        ]);
        let cands = merged.candidates_for("alpha");
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].repository, "first");
    }

    #[test]
    fn test_candidates_sorted_by_version_desc() {
        let merged = MergedIndex::new(vec![repo_index(
            "main",
            0,
            vec![entry("alpha", "1.0.0"), entry("alpha", "2.0.0")],
        )]);
        let candidates = merged.candidates_for("alpha");
        let versions: Vec<&str> = candidates.iter().map(|c| c.entry.version.as_str()).collect();
        assert_eq!(versions, vec!["2.0.0", "1.0.0"]);
    }

    #[test]
    fn test_candidate_url_resolution() {
        let merged = MergedIndex::new(vec![repo_index("main", 0, vec![entry("alpha", "1.0.0")])]);
        let cand = &merged.candidates_for("alpha")[0];
        assert_eq!(
            cand.url().unwrap(),
            "http://example.com/main/packages/alpha_1.0.0_linux_amd64.gotya"
        );
    }
}
