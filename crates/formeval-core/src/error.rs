//! Error types for form evaluation
//!
//! Evaluation and fetch failures never escape the coalescer; they are logged
//! and counted. These types describe them at the collaborator boundary.

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum FormEvalError {
    /// Evaluator failed
    #[error("evaluation failed: {0}")]
    Eval(#[from] EvalError),

    /// Dynamic value fetch failed
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Event channel closed
    #[error("event channel closed")]
    ChannelClosed,
}

/// Errors raised by a [`FormEvaluator`](crate::evaluator::FormEvaluator)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    /// The evaluator rejected the request
    #[error("evaluator error for form {form_id}: {message}")]
    Evaluator {
        /// Form being evaluated
        form_id: String,
        /// Error message
        message: String,
    },

    /// The background worker panicked
    #[error("evaluation worker panicked: {0}")]
    WorkerPanicked(String),

    /// The background worker was cancelled before producing a result
    #[error("evaluation worker cancelled")]
    WorkerCancelled,
}

impl EvalError {
    /// Create evaluator error
    #[inline]
    pub fn evaluator(form_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Evaluator {
            form_id: form_id.into(),
            message: message.into(),
        }
    }
}

/// Errors raised by a [`DynamicValueFetcher`](crate::fetcher::DynamicValueFetcher)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// URL could not be resolved
    #[error("invalid url {url}: {reason}")]
    InvalidUrl {
        /// URL as given by the fetch instructions
        url: String,
        /// Why it is invalid
        reason: String,
    },

    /// Request could not be sent or timed out
    #[error("transport error fetching {url}: {message}")]
    Transport {
        /// Requested URL
        url: String,
        /// Error message
        message: String,
    },

    /// Server answered with a non-success status
    #[error("{url} returned status {status}: {body}")]
    Status {
        /// Requested URL
        url: String,
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// Response body was not valid JSON
    #[error("failed to decode response from {url}: {message}")]
    Decode {
        /// Requested URL
        url: String,
        /// Error message
        message: String,
    },
}

impl FetchError {
    /// URL the failed fetch was for
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::InvalidUrl { url, .. }
            | Self::Transport { url, .. }
            | Self::Status { url, .. }
            | Self::Decode { url, .. } => url,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Path of the config file
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config could not be rendered
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    /// A value is out of range
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Offending field
        field: &'static str,
        /// Why it is invalid
        reason: String,
    },
}
