//! HTTP dynamic value fetcher
//!
//! Implements [`DynamicValueFetcher`] over `reqwest`. Fetch instructions
//! usually carry paths relative to the application's API root; those are
//! resolved against the configured base URL.

#![warn(unreachable_pub)]

use async_trait::async_trait;
use formeval_core::{DynamicValueFetcher, FetchConfig, FetchError};
use reqwest::{Client, Url};
use serde_json::Value;
use std::time::Duration;

/// Errors building an [`HttpDynamicValueFetcher`]
#[derive(Debug, thiserror::Error)]
pub enum HttpFetcherError {
    /// HTTP client could not be constructed
    #[error("failed to create HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    /// Base URL is not a valid absolute URL
    #[error("invalid base url {url}: {reason}")]
    BaseUrl {
        /// Configured base URL
        url: String,
        /// Parse failure
        reason: String,
    },
}

/// Fetches dynamic values with `GET` requests
#[derive(Debug, Clone)]
pub struct HttpDynamicValueFetcher {
    client: Client,
    base_url: Option<Url>,
}

impl HttpDynamicValueFetcher {
    /// Create fetcher from configuration
    ///
    /// # Errors
    /// - `HttpFetcherError::BaseUrl` if `base_url` does not parse
    /// - `HttpFetcherError::Client` if the client cannot be built
    pub fn new(config: &FetchConfig) -> Result<Self, HttpFetcherError> {
        Self::with_timeout(config.base_url.as_deref(), config.timeout())
    }

    /// Create fetcher with an explicit timeout
    ///
    /// # Errors
    /// As [`new`](Self::new).
    pub fn with_timeout(base_url: Option<&str>, timeout: Duration) -> Result<Self, HttpFetcherError> {
        let client = Client::builder().timeout(timeout).build()?;
        let base_url = base_url.map(parse_base_url).transpose()?;
        Ok(Self { client, base_url })
    }

    /// Base URL relative fetch URLs are resolved against
    #[must_use]
    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    /// Resolve a fetch instruction URL
    ///
    /// Absolute URLs are used as given. Anything else is appended to the
    /// base URL, with a leading `/` treated as relative to the base path.
    ///
    /// # Errors
    /// `FetchError::InvalidUrl` if the URL is relative and there is no base
    /// URL, or if joining fails.
    pub fn resolve(&self, url: &str) -> Result<Url, FetchError> {
        if let Ok(absolute) = Url::parse(url) {
            return Ok(absolute);
        }

        let base = self.base_url.as_ref().ok_or_else(|| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: "relative url without a base url".to_string(),
        })?;

        base.join(url.trim_start_matches('/'))
            .map_err(|e| FetchError::InvalidUrl {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }
}

fn parse_base_url(raw: &str) -> Result<Url, HttpFetcherError> {
    // Url::join replaces the last segment unless the base ends with a slash.
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Url::parse(&normalized).map_err(|e| HttpFetcherError::BaseUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl DynamicValueFetcher for HttpDynamicValueFetcher {
    async fn fetch(&self, url: &str) -> Result<Option<Value>, FetchError> {
        let resolved = self.resolve(url)?;
        tracing::debug!(url = %resolved, "GET dynamic values");

        let response = self
            .client
            .get(resolved)
            .send()
            .await
            .map_err(|e| FetchError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await.map_err(|e| FetchError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let value: Value = serde_json::from_slice(&body).map_err(|e| FetchError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        Ok((!value.is_null()).then_some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher(base: Option<&str>) -> HttpDynamicValueFetcher {
        HttpDynamicValueFetcher::with_timeout(base, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn relative_urls_append_to_base_path() {
        let fetcher = fetcher(Some("https://app.example.com/api"));

        assert_eq!(
            fetcher.resolve("/v1/plugins/values").unwrap().as_str(),
            "https://app.example.com/api/v1/plugins/values"
        );
        assert_eq!(
            fetcher.resolve("v1/plugins/values?page=2").unwrap().as_str(),
            "https://app.example.com/api/v1/plugins/values?page=2"
        );
    }

    #[test]
    fn absolute_urls_ignore_base() {
        let fetcher = fetcher(Some("https://app.example.com/api/"));
        assert_eq!(
            fetcher.resolve("http://other.example.com/values").unwrap().as_str(),
            "http://other.example.com/values"
        );
    }

    #[test]
    fn relative_url_without_base_is_invalid() {
        let fetcher = fetcher(None);
        assert!(matches!(
            fetcher.resolve("/v1/values"),
            Err(FetchError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn bad_base_url_is_rejected() {
        let result = HttpDynamicValueFetcher::with_timeout(Some("not a url"), Duration::from_secs(1));
        assert!(matches!(result, Err(HttpFetcherError::BaseUrl { .. })));
    }

    #[test]
    fn built_from_config() {
        let config = FetchConfig {
            base_url: Some("http://localhost:8080".to_string()),
            timeout_secs: 3,
        };
        let fetcher = HttpDynamicValueFetcher::new(&config).unwrap();
        assert_eq!(fetcher.base_url().unwrap().as_str(), "http://localhost:8080/");
    }
}
