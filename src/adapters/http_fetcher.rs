//! HTTP Fetcher Adapter
//!
//! Implements the `Fetcher` port with a reqwest client. Relative request
//! URLs are resolved against an optional base URL; parameters become the
//! query string.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::cache::entry::render_param;
use crate::cache::FetchRequest;
use crate::domain::ports::Fetcher;
use crate::error::{Error, Result};

/// Default request timeout
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON-over-HTTP fetcher
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    base_url: Option<String>,
}

impl HttpFetcher {
    /// Create a fetcher with the given request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: None,
        })
    }

    /// Resolve relative URLs against `base_url`
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    fn resolve(&self, url: &str) -> String {
        match &self.base_url {
            Some(base) if !url.starts_with("http://") && !url.starts_with("https://") => {
                format!("{}/{}", base, url.trim_start_matches('/'))
            }
            _ => url.to_string(),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self, request), fields(url = %request.url))]
    async fn fetch(&self, request: &FetchRequest) -> Result<Value> {
        let url = self.resolve(&request.url);
        let query: Vec<(&str, String)> = request
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), render_param(v)))
            .collect();

        let fetch_error = |reason: String| Error::Fetch {
            url: url.clone(),
            reason,
        };

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(fetch_error(format!("HTTP {}", status)));
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        debug!(%status, "Fetched");
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_resolve_relative_urls() {
        let fetcher = HttpFetcher::new(DEFAULT_FETCH_TIMEOUT)
            .unwrap()
            .with_base_url("http://api.local/");

        assert_eq!(fetcher.resolve("/api/tasks"), "http://api.local/api/tasks");
        assert_eq!(fetcher.resolve("https://other/x"), "https://other/x");
    }

    #[test]
    fn test_resolve_without_base() {
        let fetcher = HttpFetcher::new(DEFAULT_FETCH_TIMEOUT).unwrap();
        assert_eq!(fetcher.resolve("/api/tasks"), "/api/tasks");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_fetch_error() {
        let fetcher = HttpFetcher::new(Duration::from_millis(500))
            .unwrap()
            .with_base_url("http://127.0.0.1:9");

        let result = fetcher.fetch(&FetchRequest::new("/nothing")).await;
        assert_matches!(result, Err(Error::Fetch { .. }));
    }
}
