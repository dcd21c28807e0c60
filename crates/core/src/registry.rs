//! Crate registry lookups
//!
//! Tools requested as `name@latest` are pinned to a concrete version before
//! anything is restored or installed, so that the cache key changes whenever
//! a new release is published.

use crate::errors::ToolError;
use crate::retry::{retry_async, RetryPolicy};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, instrument};

/// Default crates.io API endpoint
pub const CRATES_IO_URL: &str = "https://crates.io";

const USER_AGENT: &str = concat!("rax/", env!("CARGO_PKG_VERSION"));

/// Resolves the latest published version of a crate
#[async_trait]
pub trait VersionResolver: Send + Sync {
    async fn latest_version(&self, name: &str) -> Result<String, ToolError>;
}

#[derive(Debug, Deserialize)]
struct CrateResponse {
    #[serde(rename = "crate")]
    krate: CrateInfo,
}

#[derive(Debug, Deserialize)]
struct CrateInfo {
    max_stable_version: Option<String>,
    newest_version: Option<String>,
    max_version: Option<String>,
}

impl CrateInfo {
    fn best_version(self) -> Option<String> {
        self.max_stable_version
            .or(self.newest_version)
            .or(self.max_version)
    }
}

#[derive(Debug)]
enum FetchError {
    Status(u16),
    Transport(reqwest::Error),
    Body(String),
}

impl FetchError {
    fn is_transient(&self) -> bool {
        match self {
            FetchError::Status(status) => *status == 429 || *status >= 500,
            FetchError::Transport(e) => e.is_timeout() || e.is_connect(),
            FetchError::Body(_) => false,
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Status(404) => write!(f, "crate not found (HTTP 404)"),
            FetchError::Status(status) => write!(f, "registry returned HTTP {}", status),
            FetchError::Transport(e) if e.is_timeout() => write!(f, "request timed out"),
            FetchError::Transport(e) => write!(f, "request failed: {}", e),
            FetchError::Body(message) => write!(f, "invalid registry response: {}", message),
        }
    }
}

/// [`VersionResolver`] querying the crates.io HTTP API
#[derive(Debug, Clone)]
pub struct CratesIoResolver {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl CratesIoResolver {
    /// Resolver against the public registry
    pub fn new() -> Result<Self, ToolError> {
        Self::with_base_url(CRATES_IO_URL)
    }

    /// Resolver against an alternative endpoint such as a mirror or test server
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, ToolError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ToolError::VersionResolution {
                name: String::new(),
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(FetchError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body: CrateResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Body(e.to_string()))?;
        body.krate
            .best_version()
            .ok_or_else(|| FetchError::Body("no published version".to_string()))
    }
}

#[async_trait]
impl VersionResolver for CratesIoResolver {
    #[instrument(level = "debug", skip(self))]
    async fn latest_version(&self, name: &str) -> Result<String, ToolError> {
        let url = format!("{}/api/v1/crates/{}", self.base_url, name);
        debug!("Querying {}", url);

        let version = retry_async(&self.retry, || self.fetch(&url), FetchError::is_transient)
            .await
            .map_err(|e| ToolError::VersionResolution {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        debug!("Latest version of {} is {}", name, version);
        Ok(version)
    }
}

/// In-memory resolver for tests
#[derive(Debug, Clone, Default)]
pub struct MockVersionResolver {
    versions: Arc<Mutex<HashMap<String, String>>>,
    lookups: Arc<Mutex<Vec<String>>>,
}

impl MockVersionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(self, name: &str, version: &str) -> Self {
        self.versions
            .lock()
            .unwrap()
            .insert(name.to_string(), version.to_string());
        self
    }

    /// Crate names looked up so far
    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().unwrap().clone()
    }
}

#[async_trait]
impl VersionResolver for MockVersionResolver {
    async fn latest_version(&self, name: &str) -> Result<String, ToolError> {
        self.lookups.lock().unwrap().push(name.to_string());
        self.versions
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::VersionResolution {
                name: name.to_string(),
                message: "crate not found (HTTP 404)".to_string(),
            })
    }
}
