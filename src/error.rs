//! Error types for the reconciliation pipeline
//!
//! Errors are classified by how the pipeline reacts to them:
//! - Backpressure: HTTP 429 and write-API rate limits, retried in place
//! - Transport: timeouts and connection failures, surfaced to the job
//! - Data shape: missing or malformed fields, logged and skipped
//! - Configuration: fatal at startup, before any pipeline work

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the resilient fetch layer.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request to {url} timed out after {secs} seconds")]
    Timeout { url: String, secs: u64 },

    #[error("Network error for {url}: {message}")]
    Network { url: String, message: String },

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to parse response from {url}: {message}")]
    Parse { url: String, message: String },
}

impl FetchError {
    /// Returns true if the request was cancelled by the hard timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout { .. })
    }
}

/// Errors from the remote record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The write API asked us to slow down (distinct from an HTTP 429).
    #[error("Record store rate limit: {0}")]
    TooManyRequests(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("API error {code}: {info}")]
    Api { code: String, info: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Unexpected store response: {0}")]
    Malformed(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl StoreError {
    /// Returns true if this error should be retried after the fixed backoff
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, StoreError::TooManyRequests(_))
    }
}

/// Errors raised while loading configuration. All of them are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found at {0}. Create it with: {{ \"store\": {{ \"apiUrl\": \"https://example.org/w/api.php\" }} }}")]
    NotFound(PathBuf),

    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Could not find home directory")]
    NoHomeDir,
}

/// Failure of a single queued job. Logged by the queue, never propagated
/// to sibling jobs.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Unexpected data shape: {0}")]
    DataShape(String),
}
