//! Error types for the playback proxy

use std::io;
use thiserror::Error;

/// Result type for playback proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur while recording or replaying
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL could not be parsed as an absolute URL
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl {
        /// The offending URL
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// Persisted index file could not be parsed
    #[error("Index file {path} is corrupted: {reason}")]
    IndexCorrupted {
        /// Path of the index file
        path: String,
        /// Parser message
        reason: String,
    },

    /// No recording (or no recorded body) for the request
    #[error("No recording for {method} {url}")]
    NotFound {
        /// Request method
        method: String,
        /// Request URL
        url: String,
    },

    /// Origin server could not be reached or failed mid-response
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// HTTP protocol error
    #[error("HTTP error: {0}")]
    Http(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl ProxyError {
    /// Build a `NotFound` error for a request
    pub fn not_found(method: &str, url: &str) -> Self {
        Self::NotFound {
            method: method.to_string(),
            url: url.to_string(),
        }
    }

    /// Whether this error means "nothing cached for this request"
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<hyper::http::Error> for ProxyError {
    fn from(e: hyper::http::Error) -> Self {
        Self::Http(e.to_string())
    }
}
