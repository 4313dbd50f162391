// Copyright (c) 2026 Personal Server contributors
// SPDX-License-Identifier: MIT

//! URL-typed content downloads.
//!
//! Three source families, each with its own failure handling:
//! content-addressed URLs walk an ordered gateway list with exponential
//! backoff, cloud-drive links are resolved to direct-download URLs (and
//! the "virus scan" interstitial is replayed with its confirm token),
//! plain HTTP is a single streamed GET. Every path streams the body in
//! chunks and aborts as soon as the size cap is crossed.

use std::sync::LazyLock;
use std::time::Duration;

use futures::StreamExt;
use regex::Regex;
use url::Url;

use crate::config::FetchConfig;
use crate::domain::error::{ContentFailure, ServerError};

static DRIVE_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/file/d/([A-Za-z0-9_-]+)").expect("static regex"));
static DRIVE_CONFIRM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"confirm=([0-9A-Za-z_-]+)").expect("static regex"));

const USER_AGENT: &str = concat!("personal-server/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlKind {
    ContentAddressed,
    CloudDrive,
    Http,
}

/// Classify a URL for download routing.
pub fn classify(url: &str) -> UrlKind {
    if url.starts_with("ipfs://") || url.contains("/ipfs/") {
        UrlKind::ContentAddressed
    } else if url.contains("drive.google.com") || url.contains("docs.google.com") {
        UrlKind::CloudDrive
    } else {
        UrlKind::Http
    }
}

/// Extract the content hash from a content-addressed URL.
pub fn content_hash(url: &str) -> Option<&str> {
    if let Some(rest) = url.strip_prefix("ipfs://") {
        let rest = rest.strip_prefix("ipfs/").unwrap_or(rest);
        return Some(rest.trim_start_matches('/')).filter(|h| !h.is_empty());
    }
    url.split_once("/ipfs/")
        .map(|(_, hash)| hash)
        .filter(|h| !h.is_empty())
}

/// Extract the file id from the known cloud-drive URL shapes.
pub fn drive_file_id(url: &str) -> Option<String> {
    if let Some(captures) = DRIVE_FILE_RE.captures(url) {
        return Some(captures[1].to_string());
    }
    let parsed = Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k == "id")
        .map(|(_, v)| v.into_owned())
}

/// Attempt-level failure, classified for the final error and for the
/// decision whether to back off before the next source.
#[derive(Debug)]
enum AttemptError {
    NotFound,
    RateLimited,
    Timeout,
    TooLarge,
    Transport(String),
}

impl AttemptError {
    fn failure(&self) -> ContentFailure {
        match self {
            AttemptError::NotFound => ContentFailure::NotFound,
            AttemptError::RateLimited => ContentFailure::RateLimited,
            AttemptError::Timeout => ContentFailure::Timeout,
            AttemptError::TooLarge => ContentFailure::TooLarge,
            AttemptError::Transport(_) => ContentFailure::Transport,
        }
    }

    /// 404 means the next gateway should be tried immediately; anything
    /// else deserves a backoff pause first.
    fn backs_off(&self) -> bool {
        !matches!(self, AttemptError::NotFound)
    }

    fn message(&self) -> String {
        match self {
            AttemptError::NotFound => "not found".into(),
            AttemptError::RateLimited => "rate limited".into(),
            AttemptError::Timeout => "timed out".into(),
            AttemptError::TooLarge => "size cap exceeded".into(),
            AttemptError::Transport(msg) => msg.clone(),
        }
    }
}

pub struct ContentFetcher {
    client: reqwest::Client,
    config: FetchConfig,
}

impl ContentFetcher {
    pub fn new(config: FetchConfig) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .build()
            .expect("reqwest client construction is infallible with these options");
        Self { client, config }
    }

    /// Download `url`, capping the body at `max_bytes`.
    pub async fn fetch(&self, url: &str, max_bytes: usize) -> Result<Vec<u8>, ServerError> {
        if url.is_empty() {
            return Err(ServerError::Validation("file URL cannot be empty".into()));
        }
        if max_bytes == 0 {
            return Err(ServerError::Validation("max size must be positive".into()));
        }

        match classify(url) {
            UrlKind::ContentAddressed => self.fetch_content_addressed(url, max_bytes).await,
            UrlKind::CloudDrive => self.fetch_cloud_drive(url, max_bytes).await,
            UrlKind::Http => self
                .attempt(url, max_bytes)
                .await
                .map_err(|e| ServerError::content(e.failure(), format!("{url}: {}", e.message()))),
        }
    }

    async fn fetch_content_addressed(
        &self,
        url: &str,
        max_bytes: usize,
    ) -> Result<Vec<u8>, ServerError> {
        let hash = content_hash(url).ok_or_else(|| {
            ServerError::Validation(format!("no content hash in URL: {url}"))
        })?;

        let targets: Vec<String> = self
            .config
            .gateways
            .iter()
            .map(|gateway| format!("{}{hash}", gateway))
            .collect();

        tracing::debug!(%hash, gateways = targets.len(), "content-addressed download");

        let mut last_error = AttemptError::Transport("no gateways configured".into());
        for (i, target) in targets.iter().enumerate() {
            match self.attempt(target, max_bytes).await {
                Ok(bytes) => {
                    tracing::info!(%target, size = bytes.len(), "gateway download succeeded");
                    return Ok(bytes);
                }
                Err(err) => {
                    tracing::warn!(%target, error = %err.message(), "gateway attempt failed");
                    let backs_off = err.backs_off();
                    last_error = err;
                    if backs_off && i + 1 < targets.len() {
                        tokio::time::sleep(self.backoff(i)).await;
                    }
                }
            }
        }

        Err(ServerError::content(
            last_error.failure(),
            format!(
                "all gateways failed for {url}; last error: {}",
                last_error.message()
            ),
        ))
    }

    async fn fetch_cloud_drive(&self, url: &str, max_bytes: usize) -> Result<Vec<u8>, ServerError> {
        let file_id = drive_file_id(url).ok_or_else(|| {
            ServerError::Validation(format!("could not extract file id from drive URL: {url}"))
        })?;

        let targets = [
            format!("https://drive.google.com/file/d/{file_id}/download"),
            format!("https://drive.google.com/uc?export=download&id={file_id}"),
        ];

        let mut last_error = AttemptError::Transport("no download URLs".into());
        for (i, target) in targets.iter().enumerate() {
            match self.drive_attempt(target, max_bytes).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    tracing::warn!(%target, error = %err.message(), "drive attempt failed");
                    let backs_off = err.backs_off();
                    last_error = err;
                    if backs_off && i + 1 < targets.len() {
                        tokio::time::sleep(self.backoff(i)).await;
                    }
                }
            }
        }

        Err(ServerError::content(
            last_error.failure(),
            format!(
                "all drive download URLs failed for {url}; last error: {}",
                last_error.message()
            ),
        ))
    }

    /// One drive download, retrying once through the virus-scan
    /// interstitial when the response is HTML carrying a confirm token.
    async fn drive_attempt(&self, target: &str, max_bytes: usize) -> Result<Vec<u8>, AttemptError> {
        let bytes = self.attempt(target, max_bytes).await?;

        let looks_html = bytes.starts_with(b"<") || bytes.starts_with(b"\n<");
        if looks_html {
            let body = String::from_utf8_lossy(&bytes);
            if body.to_lowercase().contains("virus scan warning") {
                if let Some(captures) = DRIVE_CONFIRM_RE.captures(&body) {
                    let confirm_url = format!("{target}&confirm={}", &captures[1]);
                    tracing::debug!(%confirm_url, "replaying drive download with confirm token");
                    return self.attempt(&confirm_url, max_bytes).await;
                }
            }
        }

        Ok(bytes)
    }

    /// One streamed GET with the size cap enforced mid-stream.
    async fn attempt(&self, target: &str, max_bytes: usize) -> Result<Vec<u8>, AttemptError> {
        let response = self.client.get(target).send().await.map_err(|e| {
            if e.is_timeout() {
                AttemptError::Timeout
            } else {
                AttemptError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                404 => AttemptError::NotFound,
                429 => AttemptError::RateLimited,
                other => AttemptError::Transport(format!("HTTP {other}")),
            });
        }

        if let Some(len) = response.content_length() {
            if len as usize > max_bytes {
                return Err(AttemptError::TooLarge);
            }
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                if e.is_timeout() {
                    AttemptError::Timeout
                } else {
                    AttemptError::Transport(e.to_string())
                }
            })?;
            if body.len() + chunk.len() > max_bytes {
                // Dropping the stream aborts the request.
                return Err(AttemptError::TooLarge);
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }

    fn backoff(&self, attempt: usize) -> Duration {
        let base = self.config.retry_base.as_millis() as u64;
        let delay = base.saturating_mul(1u64 << attempt.min(16));
        Duration::from_millis(delay).min(self.config.retry_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher_for(server_url: &str) -> ContentFetcher {
        ContentFetcher::new(FetchConfig {
            gateways: vec![format!("{server_url}/ipfs/")],
            timeout: Duration::from_secs(5),
            retry_base: Duration::from_millis(1),
            retry_cap: Duration::from_millis(4),
            max_file_bytes: 1024,
        })
    }

    #[test]
    fn classifies_urls() {
        assert_eq!(classify("ipfs://QmHash"), UrlKind::ContentAddressed);
        assert_eq!(
            classify("https://gw.example/ipfs/QmHash"),
            UrlKind::ContentAddressed
        );
        assert_eq!(
            classify("https://drive.google.com/file/d/abc/view"),
            UrlKind::CloudDrive
        );
        assert_eq!(classify("https://example.com/x.bin"), UrlKind::Http);
    }

    #[test]
    fn extracts_content_hash() {
        assert_eq!(content_hash("ipfs://QmAbc"), Some("QmAbc"));
        assert_eq!(content_hash("ipfs://ipfs/QmAbc"), Some("QmAbc"));
        assert_eq!(content_hash("https://gw/ipfs/QmAbc"), Some("QmAbc"));
        assert_eq!(content_hash("https://example.com/file"), None);
    }

    #[test]
    fn extracts_drive_file_id() {
        assert_eq!(
            drive_file_id("https://drive.google.com/file/d/1Mb2JjYVwQVj-a8W3Uf8u8uZcwKCC4Ytk/view"),
            Some("1Mb2JjYVwQVj-a8W3Uf8u8uZcwKCC4Ytk".to_string())
        );
        assert_eq!(
            drive_file_id("https://drive.google.com/open?id=1Mb2JjYVwQVj-a8W3Uf8u8uZcwKCC4Ytk"),
            Some("1Mb2JjYVwQVj-a8W3Uf8u8uZcwKCC4Ytk".to_string())
        );
        assert_eq!(drive_file_id("https://drive.google.com/"), None);
    }

    #[tokio::test]
    async fn plain_http_fetch() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/file.txt")
            .with_status(200)
            .with_body("hello")
            .create_async()
            .await;

        let fetcher = fetcher_for(&server.url());
        let bytes = fetcher
            .fetch(&format!("{}/file.txt", server.url()), 1024)
            .await
            .unwrap();

        assert_eq!(bytes, b"hello");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn repeated_fetches_are_byte_identical() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/stable")
            .with_body("same bytes")
            .expect(2)
            .create_async()
            .await;

        let fetcher = fetcher_for(&server.url());
        let url = format!("{}/stable", server.url());
        let a = fetcher.fetch(&url, 1024).await.unwrap();
        let b = fetcher.fetch(&url, 1024).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn size_cap_is_enforced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/big")
            .with_body(vec![0u8; 32])
            .create_async()
            .await;

        let fetcher = fetcher_for(&server.url());
        let err = fetcher
            .fetch(&format!("{}/big", server.url()), 31)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ServerError::Content {
                failure: ContentFailure::TooLarge,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn gateway_fallback_after_404() {
        let mut server = mockito::Server::new_async().await;
        // First gateway path 404s, second succeeds.
        server
            .mock("GET", "/gw1/ipfs/QmX")
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("GET", "/gw2/ipfs/QmX")
            .with_body("from gateway two")
            .create_async()
            .await;

        let fetcher = ContentFetcher::new(FetchConfig {
            gateways: vec![
                format!("{}/gw1/ipfs/", server.url()),
                format!("{}/gw2/ipfs/", server.url()),
            ],
            timeout: Duration::from_secs(5),
            retry_base: Duration::from_millis(1),
            retry_cap: Duration::from_millis(4),
            max_file_bytes: 1024,
        });

        let bytes = fetcher.fetch("ipfs://QmX", 1024).await.unwrap();
        assert_eq!(bytes, b"from gateway two");
    }

    #[tokio::test]
    async fn exhausted_gateways_classify_last_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/ipfs/QmMissing")
            .with_status(404)
            .create_async()
            .await;

        let fetcher = fetcher_for(&server.url());
        let err = fetcher.fetch("ipfs://QmMissing", 1024).await.unwrap_err();
        assert!(matches!(
            err,
            ServerError::Content {
                failure: ContentFailure::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn empty_url_is_a_validation_error() {
        let fetcher = fetcher_for("http://127.0.0.1:1");
        assert!(matches!(
            fetcher.fetch("", 10).await,
            Err(ServerError::Validation(_))
        ));
    }
}
