//! Dynamic value fetch collaborator

use crate::error::FetchError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Retrieves dynamically-sourced field values by URL
#[async_trait]
pub trait DynamicValueFetcher: Send + Sync {
    /// Fetch the data behind `url`
    ///
    /// # Returns
    /// `Ok(None)` for an empty response. Callers also treat `Some(Value::Null)`
    /// as empty.
    ///
    /// # Errors
    /// Transport, status and decode failures. The fetch phase logs and skips
    /// them.
    async fn fetch(&self, url: &str) -> Result<Option<Value>, FetchError>;
}

#[async_trait]
impl<F: DynamicValueFetcher + ?Sized> DynamicValueFetcher for Arc<F> {
    async fn fetch(&self, url: &str) -> Result<Option<Value>, FetchError> {
        (**self).fetch(url).await
    }
}

/// Fetcher for setups with no dynamic values
///
/// Every fetch yields an empty response, so fields stay loading.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFetcher;

#[async_trait]
impl DynamicValueFetcher for NoopFetcher {
    async fn fetch(&self, _url: &str) -> Result<Option<Value>, FetchError> {
        Ok(None)
    }
}
