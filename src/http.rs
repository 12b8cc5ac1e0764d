//! HTTP Fetcher - remote source for JSON content
//!
//! Thin reqwest wrapper that turns content paths under a base URL into
//! [`FetchFn`]s for the orchestrator and the progressive loader.

use std::sync::Arc;
use std::time::Duration;

use futures::future::FutureExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::entry::CacheKey;
use crate::error::{Error, Result};
use crate::loader::{FetchFn, LoadItem};

/// Remote source configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Base URL content paths are resolved against
    pub base_url: String,
    /// Whole-request timeout
    #[serde(rename = "request_timeout_ms", with = "crate::config::duration_ms")]
    pub request_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Fetches JSON documents over HTTP
pub struct HttpFetcher {
    config: HttpConfig,
    client: Client,
}

impl HttpFetcher {
    /// Create a fetcher with its own connection pool
    pub fn new(config: HttpConfig) -> Result<Arc<Self>> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Arc::new(Self { config, client }))
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Absolute URL for a content path
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// GET a path and parse the body as JSON
    #[instrument(skip(self))]
    pub async fn fetch_json(&self, path: &str) -> Result<serde_json::Value> {
        let url = self.url_for(path);
        let failed = |reason: String| Error::FetchFailed {
            key: url.clone(),
            reason,
        };

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(failed(format!("HTTP {}", response.status())));
        }

        let body = response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| failed(format!("invalid JSON body: {}", e)))?;
        debug!(%url, "Fetched remote content");
        Ok(body)
    }

    /// Fetcher for one path, suitable for the orchestrator or loader
    pub fn fetcher(self: &Arc<Self>, path: impl Into<String>) -> FetchFn {
        let this = Arc::clone(self);
        let path: String = path.into();
        Arc::new(move || {
            let this = Arc::clone(&this);
            let path = path.clone();
            async move { this.fetch_json(&path).await.map_err(anyhow::Error::from) }.boxed()
        })
    }

    /// Load item fetching `path` into `key`
    pub fn load_item(self: &Arc<Self>, key: CacheKey, path: impl Into<String>) -> LoadItem {
        LoadItem::from_fn(key, self.fetcher(path))
    }
}

// =============================================================================
// Tests
// =============================================================================
