//! Configuration
//!
//! Loaded from TOML. Every field has a default so an empty file is valid.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default broadcast buffer for evaluation updates
pub const DEFAULT_UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Default per-request fetch timeout
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormEvalConfig {
    /// Updates a subscriber may lag behind before missing some
    pub update_channel_capacity: usize,
    /// `tracing` filter directive used when `RUST_LOG` is unset
    pub log_filter: String,
    /// Dynamic value fetching
    pub fetch: FetchConfig,
}

impl FormEvalConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With update channel capacity
    #[inline]
    #[must_use]
    pub fn with_update_channel_capacity(mut self, capacity: usize) -> Self {
        self.update_channel_capacity = capacity;
        self
    }

    /// With log filter
    #[inline]
    #[must_use]
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// With fetch base URL
    #[inline]
    #[must_use]
    pub fn with_fetch_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.fetch.base_url = Some(base_url.into());
        self
    }

    /// Parse and validate TOML
    ///
    /// # Errors
    /// - `ConfigError::Parse` on malformed TOML
    /// - `ConfigError::InvalidValue` if validation fails
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    ///
    /// # Errors
    /// `ConfigError::Io` if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    /// Render as TOML
    ///
    /// # Errors
    /// `ConfigError::Render` if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// `ConfigError::InvalidValue` naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.update_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "update_channel_capacity",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.fetch.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "fetch.timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if let Some(base_url) = &self.fetch.base_url {
            if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
                return Err(ConfigError::InvalidValue {
                    field: "fetch.base_url",
                    reason: format!("{base_url} is not an http(s) URL"),
                });
            }
        }
        Ok(())
    }
}

impl Default for FormEvalConfig {
    fn default() -> Self {
        Self {
            update_channel_capacity: DEFAULT_UPDATE_CHANNEL_CAPACITY,
            log_filter: "info".to_string(),
            fetch: FetchConfig::default(),
        }
    }
}

/// Dynamic value fetch settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Base URL that relative fetch URLs are resolved against
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl FetchConfig {
    /// Timeout as a duration
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
        }
    }
}
