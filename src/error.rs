//! Error types for the harvest crate

use thiserror::Error;

/// Result type for harvest operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for harvest operations
#[derive(Debug, Error)]
pub enum Error {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error outside the record store
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Fetching a catalog page failed
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Record store error
    #[error("Store error: {0}")]
    Store(String),

    /// The crawl halted
    #[error("Crawl error: {0}")]
    Crawl(String),

    /// Writing the consolidated dataset failed
    #[error("Export error: {0}")]
    Export(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}
