//! Parallel artifact download with checksum verification
//!
//! Bundles are fetched into the cache through sibling temp files and
//! renamed only after both size and SHA-256 check out. A bundle
//! already in the cache that matches its expected size and checksum is
//! not fetched again.

use std::io;
use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt};
use reqwest::header::HeaderMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::hash;
use crate::io::http::{HttpClient, HttpError};

/// Errors from fetching artifacts.
#[derive(Error, Debug)]
pub enum DownloadError {
    /// Underlying filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Request failure.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// The downloaded bytes hash differently than the index promised.
    #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Source URL.
        url: String,
        /// Expected hex SHA-256.
        expected: String,
        /// Actual hex SHA-256.
        actual: String,
    },

    /// The downloaded size differs from the index.
    #[error("size mismatch for {url}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Source URL.
        url: String,
        /// Expected size in bytes.
        expected: u64,
        /// Actual size in bytes.
        actual: u64,
    },

    /// The caller cancelled the download.
    #[error("download cancelled")]
    Cancelled,
}

/// One artifact to fetch.
#[derive(Debug, Clone)]
pub struct DownloadSpec {
    /// Absolute source URL.
    pub url: String,
    /// Extra request headers (repository auth).
    pub headers: HeaderMap,
    /// Expected size in bytes.
    pub size: u64,
    /// Expected hex SHA-256.
    pub checksum: String,
    /// Final cache path.
    pub dest: PathBuf,
}

/// Fetch every spec into its cache path, at most `concurrency` at a
/// time. Returns the local paths in input order.
pub async fn fetch_all(
    client: &dyn HttpClient,
    specs: &[DownloadSpec],
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<Vec<PathBuf>, DownloadError> {
    let cap = concurrency.max(1);

    let mut outcomes: Vec<(usize, Result<PathBuf, DownloadError>)> =
        stream::iter(specs.iter().enumerate())
            .map(|(i, spec)| async move { (i, fetch_one(client, spec, cancel).await) })
            .buffer_unordered(cap)
            .collect()
            .await;
    outcomes.sort_by_key(|(i, _)| *i);

    let mut paths = Vec::with_capacity(outcomes.len());
    for (_, outcome) in outcomes {
        paths.push(outcome?);
    }
    Ok(paths)
}

async fn fetch_one(
    client: &dyn HttpClient,
    spec: &DownloadSpec,
    cancel: &CancellationToken,
) -> Result<PathBuf, DownloadError> {
    if cancel.is_cancelled() {
        return Err(DownloadError::Cancelled);
    }

    if is_cached(&spec.dest, spec.size, &spec.checksum).await? {
        tracing::debug!(url = %spec.url, "bundle already cached");
        return Ok(spec.dest.clone());
    }

    let dir = spec
        .dest
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir)?;

    // The temp file is deleted on drop, so every failure path below
    // cleans up after itself.
    let tmp = tempfile::NamedTempFile::new_in(&dir)?;

    let written = client
        .get_to_file(cancel, &spec.url, spec.headers.clone(), tmp.path())
        .await
        .map_err(|e| match e {
            HttpError::Cancelled => DownloadError::Cancelled,
            other => DownloadError::Http(other),
        })?;

    if written != spec.size {
        return Err(DownloadError::SizeMismatch {
            url: spec.url.clone(),
            expected: spec.size,
            actual: written,
        });
    }

    let actual = hash_file(tmp.path().to_path_buf()).await?;
    if actual != spec.checksum {
        return Err(DownloadError::ChecksumMismatch {
            url: spec.url.clone(),
            expected: spec.checksum.clone(),
            actual,
        });
    }

    tmp.persist(&spec.dest).map_err(|e| e.error)?;
    tracing::info!(url = %spec.url, dest = %spec.dest.display(), "bundle downloaded");
    Ok(spec.dest.clone())
}

async fn is_cached(dest: &Path, size: u64, checksum: &str) -> Result<bool, DownloadError> {
    let Ok(meta) = std::fs::metadata(dest) else {
        return Ok(false);
    };
    if !meta.is_file() || meta.len() != size {
        return Ok(false);
    }
    Ok(hash_file(dest.to_path_buf()).await? == checksum)
}

async fn hash_file(path: PathBuf) -> Result<String, DownloadError> {
    let digest = tokio::task::spawn_blocking(move || hash::sha256_file(&path))
        .await
        .map_err(io::Error::other)??;
    Ok(digest)
}

/// Format bytes as human readable.
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    use crate::io::http::ReqwestClient;

    fn client() -> ReqwestClient {
        ReqwestClient::new(Duration::from_secs(5)).unwrap()
    }

    fn spec_for(url: String, body: &[u8], dest: PathBuf) -> DownloadSpec {
        DownloadSpec {
            url,
            headers: HeaderMap::new(),
            size: body.len() as u64,
            checksum: hash::sha256_hex(body),
            dest,
        }
    }

    #[tokio::test]
    async fn test_fetch_all_in_input_order() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/a.gotya")
            .with_body("aaaa")
            .create_async()
            .await;
        server
            .mock("GET", "/b.gotya")
            .with_body("bb")
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let specs = vec![
            spec_for(
                format!("{}/a.gotya", server.url()),
                b"aaaa",
                dir.path().join("a.gotya"),
            ),
            spec_for(
                format!("{}/b.gotya", server.url()),
                b"bb",
                dir.path().join("b.gotya"),
            ),
        ];

        let paths = fetch_all(&client(), &specs, 4, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(paths, vec![specs[0].dest.clone(), specs[1].dest.clone()]);
        assert_eq!(std::fs::read(&paths[0]).unwrap(), b"aaaa");
        assert_eq!(std::fs::read(&paths[1]).unwrap(), b"bb");
    }

    #[tokio::test]
    async fn test_cached_file_is_not_refetched() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/a.gotya")
            .with_body("payload")
            .expect(0)
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("a.gotya");
        std::fs::write(&dest, b"payload").unwrap();

        let specs = vec![spec_for(
            format!("{}/a.gotya", server.url()),
            b"payload",
            dest,
        )];

        fetch_all(&client(), &specs, 1, &CancellationToken::new())
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_stale_cache_entry_is_replaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/a.gotya")
            .with_body("fresh-bytes")
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("a.gotya");
        std::fs::write(&dest, b"stale").unwrap();

        let specs = vec![spec_for(
            format!("{}/a.gotya", server.url()),
            b"fresh-bytes",
            dest.clone(),
        )];

        fetch_all(&client(), &specs, 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"fresh-bytes");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_leaves_no_file() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/a.gotya")
            .with_body("tampered")
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("a.gotya");
        let mut spec = spec_for(format!("{}/a.gotya", server.url()), b"tampered", dest.clone());
        spec.checksum = "0".repeat(64);

        let err = fetch_all(&client(), &[spec], 1, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::ChecksumMismatch { .. }));
        assert!(!dest.exists());
        // No temp leftovers either.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_size_mismatch_detected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/a.gotya")
            .with_body("short")
            .create_async()
            .await;

        let dir = tempdir().unwrap();
        let mut spec = spec_for(
            format!("{}/a.gotya", server.url()),
            b"short",
            dir.path().join("a.gotya"),
        );
        spec.size = 9999;

        let err = fetch_all(&client(), &[spec], 1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::SizeMismatch { .. }));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KiB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MiB");
    }
}
