//! HTTP client contract
//!
//! The core consumes [`HttpClient`]; [`ReqwestClient`] is the
//! production implementation with a total per-request timeout, a
//! five-redirect cap and per-repository authentication headers.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::Auth;

/// Errors from issuing requests.
#[derive(Error, Debug)]
pub enum HttpError {
    /// Connection, TLS or timeout failure talking to `host`.
    #[error("network error talking to {host}: {source}")]
    Network {
        /// Host of the failing request.
        host: String,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status {
        /// Request URL.
        url: String,
        /// Response status code.
        status: u16,
    },

    /// The URL could not be parsed.
    #[error("invalid url '{0}'")]
    InvalidUrl(String),

    /// An auth header value is not representable.
    #[error("invalid header value: {0}")]
    InvalidHeader(String),

    /// Local write failure while streaming a response body.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,
}

/// A buffered HTTP response.
#[derive(Debug)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Full response body.
    pub body: Bytes,
}

/// The GET contract the core consumes.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Timed GET with caller-supplied headers. Non-success statuses
    /// are returned, not mapped to errors (the caller interprets 304
    /// and friends).
    async fn get(
        &self,
        cancel: &CancellationToken,
        url: &str,
        headers: HeaderMap,
    ) -> Result<HttpResponse, HttpError>;

    /// Timed GET streamed to `dest`. Fails on non-success statuses;
    /// returns the number of bytes written.
    async fn get_to_file(
        &self,
        cancel: &CancellationToken,
        url: &str,
        headers: HeaderMap,
        dest: &Path,
    ) -> Result<u64, HttpError>;
}

/// Authentication headers for a repository, if any.
pub fn auth_headers(auth: Option<&Auth>) -> Result<HeaderMap, HttpError> {
    let mut headers = HeaderMap::new();
    let Some(auth) = auth else {
        return Ok(headers);
    };
    match auth {
        Auth::Basic { username, password } => {
            let encoded =
                base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
            headers.insert(
                reqwest::header::AUTHORIZATION,
                header_value(&format!("Basic {encoded}"))?,
            );
        }
        Auth::Bearer { token } => {
            headers.insert(
                reqwest::header::AUTHORIZATION,
                header_value(&format!("Bearer {token}"))?,
            );
        }
        Auth::Headers { headers: map } => {
            for (name, value) in map {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| HttpError::InvalidHeader(e.to_string()))?;
                headers.insert(name, header_value(value)?);
            }
        }
    }
    Ok(headers)
}

fn header_value(value: &str) -> Result<HeaderValue, HttpError> {
    HeaderValue::from_str(value).map_err(|e| HttpError::InvalidHeader(e.to_string()))
}

fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
        .unwrap_or_else(|| url.to_string())
}

/// Production [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Build a client with the given total per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| HttpError::Network {
                host: String::new(),
                source: e,
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(
        &self,
        cancel: &CancellationToken,
        url: &str,
        headers: HeaderMap,
    ) -> Result<HttpResponse, HttpError> {
        let request = self.client.get(url).headers(headers).send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HttpError::Cancelled),
            r = request => r.map_err(|e| HttpError::Network { host: host_of(url), source: e })?,
        };

        let status = response.status().as_u16();
        let resp_headers = response.headers().clone();
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HttpError::Cancelled),
            b = response.bytes() => b.map_err(|e| HttpError::Network { host: host_of(url), source: e })?,
        };

        Ok(HttpResponse {
            status,
            headers: resp_headers,
            body,
        })
    }

    async fn get_to_file(
        &self,
        cancel: &CancellationToken,
        url: &str,
        headers: HeaderMap,
        dest: &Path,
    ) -> Result<u64, HttpError> {
        let request = self.client.get(url).headers(headers).send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HttpError::Cancelled),
            r = request => r.map_err(|e| HttpError::Network { host: host_of(url), source: e })?,
        };

        if !response.status().is_success() {
            return Err(HttpError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(HttpError::Cancelled),
                c = stream.next() => c,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| HttpError::Network {
                host: host_of(url),
                source: e,
            })?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.flush().await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_buffers_body_and_status() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/hello")
            .with_status(200)
            .with_body("world")
            .create_async()
            .await;

        let client = ReqwestClient::new(Duration::from_secs(5)).unwrap();
        let cancel = CancellationToken::new();
        let resp = client
            .get(&cancel, &format!("{}/hello", server.url()), HeaderMap::new())
            .await
            .unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(resp.body.as_ref(), b"world");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_passes_non_success_status_through() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/missing")
            .with_status(404)
            .create_async()
            .await;

        let client = ReqwestClient::new(Duration::from_secs(5)).unwrap();
        let cancel = CancellationToken::new();
        let resp = client
            .get(
                &cancel,
                &format!("{}/missing", server.url()),
                HeaderMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 404);
    }

    #[tokio::test]
    async fn test_get_to_file_streams_and_rejects_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/blob")
            .with_status(200)
            .with_body(vec![7u8; 1024])
            .create_async()
            .await;
        server
            .mock("GET", "/gone")
            .with_status(500)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = ReqwestClient::new(Duration::from_secs(5)).unwrap();
        let cancel = CancellationToken::new();

        let dest = dir.path().join("blob.bin");
        let written = client
            .get_to_file(
                &cancel,
                &format!("{}/blob", server.url()),
                HeaderMap::new(),
                &dest,
            )
            .await
            .unwrap();
        assert_eq!(written, 1024);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 1024);

        let err = client
            .get_to_file(
                &cancel,
                &format!("{}/gone", server.url()),
                HeaderMap::new(),
                &dir.path().join("gone.bin"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_auth_headers() {
        let headers = auth_headers(Some(&Auth::Bearer {
            token: "tok".into(),
        }))
        .unwrap();
        assert_eq!(
            headers.get(reqwest::header::AUTHORIZATION).unwrap(),
            "Bearer tok"
        );

        let headers = auth_headers(Some(&Auth::Basic {
            username: "user".into(),
            password: "pass".into(),
        }))
        .unwrap();
        // base64("user:pass")
        assert_eq!(
            headers.get(reqwest::header::AUTHORIZATION).unwrap(),
            "Basic dXNlcjpwYXNz"
        );

        let mut map = std::collections::BTreeMap::new();
        map.insert("x-api-key".to_string(), "k".to_string());
        let headers = auth_headers(Some(&Auth::Headers { headers: map })).unwrap();
        assert_eq!(headers.get("x-api-key").unwrap(), "k");

        assert!(auth_headers(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_request() {
        let client = ReqwestClient::new(Duration::from_secs(5)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client
            .get(&cancel, "http://127.0.0.1:1/none", HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Cancelled));
    }
}
