//! Repository index synchronization
//!
//! Each enabled repository's `index.json` is fetched with conditional
//! headers from a sidecar (`<repo>.meta.json` carrying the previous
//! ETag / Last-Modified) and replaced atomically on change. Fan-out is
//! bounded; one failing repository does not stop the others, but any
//! failure fails the overall call.

use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use reqwest::header::{IF_MODIFIED_SINCE, IF_NONE_MATCH};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::Repository;
use crate::core::index::{Index, IndexError};
use crate::io::http::{self, HttpClient, HttpError};

/// Errors from syncing repositories.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Underlying filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Request failure.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// The fetched body is not a valid index.
    #[error(transparent)]
    Index(#[from] IndexError),

    /// One or more repositories failed to sync.
    #[error("{}", format_failures(.0))]
    Failed(Vec<(String, String)>),

    /// The caller cancelled the sync.
    #[error("sync cancelled")]
    Cancelled,
}

fn format_failures(failures: &[(String, String)]) -> String {
    let details: Vec<String> = failures
        .iter()
        .map(|(repo, error)| format!("{repo}: {error}"))
        .collect();
    format!(
        "sync failed for {} repositories: {}",
        failures.len(),
        details.join("; ")
    )
}

/// Sidecar metadata persisted next to each synced index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoMeta {
    /// ETag of the last 200 response, if the server sent one.
    #[serde(default)]
    pub etag: String,
    /// Last-Modified of the last 200 response, if sent.
    #[serde(default)]
    pub last_modified: String,
    /// When the index was last fetched or confirmed fresh.
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
}

impl RepoMeta {
    fn load(path: &Path) -> Option<Self> {
        let bytes = std::fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::fs::write(tmp.path(), json)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Outcome of syncing one repository.
#[derive(Debug, Clone)]
pub struct SyncResult {
    /// Repository name.
    pub repository: String,
    /// False when the server answered 304 and the index was kept.
    pub updated: bool,
}

/// Sync every enabled repository's index into `index_dir`.
///
/// With no enabled repositories this succeeds without touching the
/// filesystem. Fan-out is bounded by `max_concurrent`; the call waits
/// for all repositories and fails if any of them failed.
pub async fn sync_repositories(
    client: &dyn HttpClient,
    repositories: &[Repository],
    index_dir: &Path,
    max_concurrent: usize,
    cancel: &CancellationToken,
) -> Result<Vec<SyncResult>, SyncError> {
    let enabled: Vec<&Repository> = repositories.iter().filter(|r| r.enabled).collect();
    if enabled.is_empty() {
        return Ok(Vec::new());
    }
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }

    std::fs::create_dir_all(index_dir)?;

    let cap = max_concurrent.max(1);
    let outcomes: Vec<(String, Result<SyncResult, SyncError>)> = stream::iter(enabled)
        .map(|repo| async move {
            let result = sync_one(client, repo, index_dir, cancel).await;
            (repo.name.clone(), result)
        })
        .buffer_unordered(cap)
        .collect()
        .await;

    let mut results = Vec::new();
    let mut failures = Vec::new();
    for (name, outcome) in outcomes {
        match outcome {
            Ok(result) => results.push(result),
            Err(e) => {
                tracing::warn!(repo = %name, error = %e, "repository sync failed");
                failures.push((name, e.to_string()));
            }
        }
    }

    if !failures.is_empty() {
        failures.sort();
        return Err(SyncError::Failed(failures));
    }

    // Stable output order regardless of completion order.
    results.sort_by(|a, b| a.repository.cmp(&b.repository));
    Ok(results)
}

async fn sync_one(
    client: &dyn HttpClient,
    repo: &Repository,
    index_dir: &Path,
    cancel: &CancellationToken,
) -> Result<SyncResult, SyncError> {
    let index_path = index_dir.join(format!("{}.json", repo.name));
    let meta_path = index_dir.join(format!("{}.meta.json", repo.name));

    let mut headers = http::auth_headers(repo.auth.as_ref())?;
    if index_path.exists() {
        if let Some(meta) = RepoMeta::load(&meta_path) {
            if !meta.etag.is_empty() {
                if let Ok(v) = meta.etag.parse() {
                    headers.insert(IF_NONE_MATCH, v);
                }
            }
            if !meta.last_modified.is_empty() {
                if let Ok(v) = meta.last_modified.parse() {
                    headers.insert(IF_MODIFIED_SINCE, v);
                }
            }
        }
    }

    let response = client.get(cancel, &repo.url, headers).await?;

    match response.status {
        304 => {
            tracing::debug!(repo = %repo.name, "index unchanged (304)");
            let mut meta = RepoMeta::load(&meta_path).unwrap_or_default();
            meta.synced_at = Some(Utc::now());
            meta.save(&meta_path)?;
            Ok(SyncResult {
                repository: repo.name.clone(),
                updated: false,
            })
        }
        status if (200..300).contains(&status) => {
            // Parse and validate before the index is put in place.
            Index::from_bytes(&response.body)?;

            write_atomic(&index_path, &response.body)?;

            let header_str = |name: reqwest::header::HeaderName| {
                response
                    .headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            };
            let meta = RepoMeta {
                etag: header_str(reqwest::header::ETAG),
                last_modified: header_str(reqwest::header::LAST_MODIFIED),
                synced_at: Some(Utc::now()),
            };
            meta.save(&meta_path)?;

            tracing::info!(repo = %repo.name, "index updated");
            Ok(SyncResult {
                repository: repo.name.clone(),
                updated: true,
            })
        }
        status => Err(SyncError::Http(HttpError::Status {
            url: repo.url.clone(),
            status,
        })),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::fs::write(tmp.path(), bytes)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    use crate::core::index::FORMAT_VERSION;
    use crate::io::http::ReqwestClient;

    fn index_body() -> String {
        serde_json::json!({
            "format_version": FORMAT_VERSION,
            "last_update": "2024-01-01T00:00:00Z",
            "artifacts": [{
                "name": "alpha",
                "version": "1.0.0",
                "os": "linux",
                "arch": "amd64",
                "description": "",
                "url": "packages/alpha_1.0.0_linux_amd64.gotya",
                "checksum": "a".repeat(64),
                "size": 42,
                "dependencies": []
            }]
        })
        .to_string()
    }

    fn repo(name: &str, url: String) -> Repository {
        Repository {
            name: name.into(),
            url,
            enabled: true,
            priority: 0,
            auth: None,
        }
    }

    fn client() -> ReqwestClient {
        ReqwestClient::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_empty_repository_list_creates_nothing() {
        let dir = tempdir().unwrap();
        let index_dir = dir.path().join("indexes");

        let results = sync_repositories(
            &client(),
            &[],
            &index_dir,
            4,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(results.is_empty());
        assert!(!index_dir.exists());
    }

    #[tokio::test]
    async fn test_sync_writes_index_and_sidecar() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/index.json")
            .with_status(200)
            .with_header("etag", "\"v1\"")
            .with_body(index_body())
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let index_dir = dir.path().join("indexes");
        let repos = vec![repo("testrepo", format!("{}/index.json", server.url()))];

        let results = sync_repositories(
            &client(),
            &repos,
            &index_dir,
            4,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 1);
        assert!(results[0].updated);

        let index = Index::parse_from_file(&index_dir.join("testrepo.json")).unwrap();
        assert_eq!(index.artifacts.len(), 1);

        let meta = RepoMeta::load(&index_dir.join("testrepo.meta.json")).unwrap();
        assert_eq!(meta.etag, "\"v1\"");
    }

    #[tokio::test]
    async fn test_second_sync_is_conditional_and_idempotent() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("GET", "/index.json")
            .with_status(200)
            .with_header("etag", "\"v1\"")
            .with_body(index_body())
            .create_async()
            .await;
        let conditional = server
            .mock("GET", "/index.json")
            .match_header("if-none-match", "\"v1\"")
            .with_status(304)
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let index_dir = dir.path().join("indexes");
        let repos = vec![repo("testrepo", format!("{}/index.json", server.url()))];
        let cancel = CancellationToken::new();

        sync_repositories(&client(), &repos, &index_dir, 4, &cancel)
            .await
            .unwrap();
        let bytes_before = std::fs::read(index_dir.join("testrepo.json")).unwrap();

        let results = sync_repositories(&client(), &repos, &index_dir, 4, &cancel)
            .await
            .unwrap();
        assert!(!results[0].updated);

        let bytes_after = std::fs::read(index_dir.join("testrepo.json")).unwrap();
        assert_eq!(bytes_before, bytes_after);

        first.assert_async().await;
        conditional.assert_async().await;
    }

    #[tokio::test]
    async fn test_one_failure_fails_the_call_but_not_other_repos() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/good/index.json")
            .with_status(200)
            .with_body(index_body())
            .create_async()
            .await;
        server
            .mock("GET", "/bad/index.json")
            .with_status(404)
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let index_dir = dir.path().join("indexes");
        let repos = vec![
            repo("good", format!("{}/good/index.json", server.url())),
            repo("bad", format!("{}/bad/index.json", server.url())),
        ];

        let err = sync_repositories(
            &client(),
            &repos,
            &index_dir,
            4,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("bad"));
        // The healthy repo still landed on disk.
        assert!(index_dir.join("good.json").exists());
        assert!(!index_dir.join("bad.json").exists());
    }

    #[tokio::test]
    async fn test_malformed_body_fails_repo() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/index.json")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let index_dir = dir.path().join("indexes");
        let repos = vec![repo("broken", format!("{}/index.json", server.url()))];

        let err = sync_repositories(
            &client(),
            &repos,
            &index_dir,
            4,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::Failed(_)));
        assert!(!index_dir.join("broken.json").exists());
    }

    #[tokio::test]
    async fn test_disabled_repositories_are_skipped() {
        let dir = tempdir().unwrap();
        let index_dir = dir.path().join("indexes");
        let mut r = repo("off", "http://127.0.0.1:1/index.json".into());
        r.enabled = false;

        let results = sync_repositories(
            &client(),
            &[r],
            &index_dir,
            4,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(results.is_empty());
        assert!(!index_dir.exists());
    }
}
