// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Fetch collaborators
//!
//! The loader never touches the network or the file system itself; it asks a
//! [`Fetcher`]. Retry and timeout policy live here, not in the discovery
//! engine.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, trace};
use url::Url;

use crate::error::{LoaderError, Result};

/// Options for a single fetch
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Extra request headers
    pub headers: BTreeMap<String, String>,
}

/// Response to a fetch
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Final address after redirects
    pub url: String,
    /// Status code (200 for successful local reads)
    pub status: u16,
    /// Whether the status signals success
    pub ok: bool,
    /// Response headers, lower-cased names
    pub headers: BTreeMap<String, String>,
    /// Response body
    pub body: String,
}

impl FetchResponse {
    /// Successful response with `body`
    pub fn ok(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: 200,
            ok: true,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Response for a missing resource
    pub fn not_found(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: 404,
            ok: false,
            headers: BTreeMap::new(),
            body: String::new(),
        }
    }

    /// Response body as text
    pub fn text(&self) -> &str {
        &self.body
    }

    /// A response header
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Retrieves raw source text for an address
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `address`. Non-success statuses are returned as responses with
    /// `ok == false`; transport failures are errors.
    async fn fetch(&self, address: &str, options: &FetchOptions) -> Result<FetchResponse>;

    /// Check whether `address` exists. Used for extension probing and
    /// manifest lookups.
    async fn exists(&self, address: &str) -> bool {
        matches!(
            self.fetch(address, &FetchOptions::default()).await,
            Ok(response) if response.ok
        )
    }
}

/// Fetcher for `file:` and `http(s):` addresses
pub struct DefaultFetcher {
    client: reqwest::Client,
}

impl DefaultFetcher {
    /// Create a fetcher with a request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("spacey-loader/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LoaderError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    async fn fetch_file(&self, url: &Url) -> Result<FetchResponse> {
        let path = url
            .to_file_path()
            .map_err(|_| LoaderError::fetch(url.as_str(), "not a local path"))?;

        match tokio::fs::read_to_string(&path).await {
            Ok(body) => Ok(FetchResponse::ok(url.as_str(), body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(FetchResponse::not_found(url.as_str()))
            }
            Err(e) => Err(LoaderError::fetch(url.as_str(), e.to_string())),
        }
    }

    async fn fetch_http(&self, url: &Url, options: &FetchOptions) -> Result<FetchResponse> {
        let mut request = self.client.get(url.clone());
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| LoaderError::fetch(url.as_str(), e.to_string()))?;

        let final_url = response.url().to_string();
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| LoaderError::fetch(url.as_str(), e.to_string()))?;

        Ok(FetchResponse {
            url: final_url,
            status: status.as_u16(),
            ok: status.is_success(),
            headers,
            body,
        })
    }
}

#[async_trait]
impl Fetcher for DefaultFetcher {
    async fn fetch(&self, address: &str, options: &FetchOptions) -> Result<FetchResponse> {
        let url = Url::parse(address).map_err(|e| LoaderError::fetch(address, e.to_string()))?;
        debug!("Fetching {}", url);

        match url.scheme() {
            "file" => self.fetch_file(&url).await,
            "http" | "https" => self.fetch_http(&url, options).await,
            scheme => Err(LoaderError::fetch(
                address,
                format!("unsupported scheme '{}'", scheme),
            )),
        }
    }

    async fn exists(&self, address: &str) -> bool {
        let Ok(url) = Url::parse(address) else {
            return false;
        };

        match url.scheme() {
            "file" => match url.to_file_path() {
                Ok(path) => tokio::fs::metadata(&path)
                    .await
                    .map(|meta| meta.is_file())
                    .unwrap_or(false),
                Err(_) => false,
            },
            "http" | "https" => self
                .client
                .head(url)
                .send()
                .await
                .map(|response| response.status().is_success())
                .unwrap_or(false),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
enum MemoryEntry {
    File(String),
    Redirect(String),
}

/// In-memory fetcher for virtual files
///
/// Counts every `fetch` call per address; `exists` checks are not counted.
#[derive(Default)]
pub struct MemoryFetcher {
    entries: DashMap<String, MemoryEntry>,
    counts: DashMap<String, usize>,
    total: AtomicUsize,
}

impl MemoryFetcher {
    /// Create an empty fetcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file
    pub fn with_file(self, address: impl Into<String>, body: impl Into<String>) -> Self {
        self.insert(address, body);
        self
    }

    /// Add or replace a file
    pub fn insert(&self, address: impl Into<String>, body: impl Into<String>) {
        self.entries
            .insert(address.into(), MemoryEntry::File(body.into()));
    }

    /// Make `from` redirect to `to`
    pub fn redirect(&self, from: impl Into<String>, to: impl Into<String>) {
        self.entries
            .insert(from.into(), MemoryEntry::Redirect(to.into()));
    }

    /// Number of fetches of one address
    pub fn fetch_count(&self, address: &str) -> usize {
        self.counts.get(address).map(|count| *count).unwrap_or(0)
    }

    /// Number of fetches of all addresses
    pub fn total_fetches(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, address: &str, _options: &FetchOptions) -> Result<FetchResponse> {
        *self.counts.entry(address.to_string()).or_insert(0) += 1;
        self.total.fetch_add(1, Ordering::SeqCst);

        let mut current = address.to_string();
        // Bounded so a redirect cycle cannot hang a test
        for _ in 0..16 {
            let entry = self.entries.get(&current).map(|e| e.value().clone());
            match entry {
                Some(MemoryEntry::File(body)) => {
                    trace!("memory fetch {} -> {}", address, current);
                    return Ok(FetchResponse::ok(current, body));
                }
                Some(MemoryEntry::Redirect(target)) => current = target,
                None => return Ok(FetchResponse::not_found(current)),
            }
        }

        Err(LoaderError::fetch(address, "too many redirects"))
    }

    async fn exists(&self, address: &str) -> bool {
        self.entries.contains_key(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_fetcher_counts() {
        let fetcher = MemoryFetcher::new().with_file("file:///a.js", "1");

        assert!(fetcher.exists("file:///a.js").await);
        assert!(!fetcher.exists("file:///b.js").await);
        assert_eq!(fetcher.total_fetches(), 0);

        let response = fetcher
            .fetch("file:///a.js", &FetchOptions::default())
            .await
            .unwrap();
        assert!(response.ok);
        assert_eq!(response.text(), "1");

        let missing = fetcher
            .fetch("file:///b.js", &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(missing.status, 404);
        assert_eq!(fetcher.fetch_count("file:///a.js"), 1);
        assert_eq!(fetcher.total_fetches(), 2);
    }

    #[tokio::test]
    async fn test_memory_fetcher_redirect() {
        let fetcher = MemoryFetcher::new().with_file("https://cdn.test/lib@2.0.0/index.js", "");
        fetcher.redirect("https://cdn.test/lib", "https://cdn.test/lib@2.0.0/index.js");

        let response = fetcher
            .fetch("https://cdn.test/lib", &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(response.url, "https://cdn.test/lib@2.0.0/index.js");
    }

    #[tokio::test]
    async fn test_default_fetcher_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.js");
        std::fs::write(&path, "exports.x = 1;").unwrap();
        let address = Url::from_file_path(&path).unwrap().to_string();

        let fetcher = DefaultFetcher::new(Duration::from_secs(5)).unwrap();
        assert!(fetcher.exists(&address).await);

        let response = fetcher
            .fetch(&address, &FetchOptions::default())
            .await
            .unwrap();
        assert!(response.ok);
        assert_eq!(response.text(), "exports.x = 1;");

        let missing = Url::from_file_path(dir.path().join("nope.js"))
            .unwrap()
            .to_string();
        assert!(!fetcher.exists(&missing).await);
        let response = fetcher
            .fetch(&missing, &FetchOptions::default())
            .await
            .unwrap();
        assert!(!response.ok);
    }
}
