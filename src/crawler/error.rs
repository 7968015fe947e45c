//! Error types for the crawler module

use std::time::Duration;

use crate::crawler::storage::StoreError;
use crate::error::Error as CrateError;
use reqwest::StatusCode;
use thiserror::Error;

/// Error type for fetching a single catalog page
#[derive(Debug, Error)]
pub enum FetchError {
    /// The catalog answered 429
    #[error("Rate limited{}", describe_retry_after(.retry_after))]
    RateLimited {
        /// Delay requested by the server, if any
        retry_after: Option<Duration>,
    },

    /// The id has no catalog page
    #[error("Not found: {url}")]
    NotFound {
        /// Requested URL
        url: String,
    },

    /// Any other non-success status
    #[error("HTTP status {status} for {url}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Requested URL
        url: String,
    },

    /// HTTP client error
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
}

fn describe_retry_after(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(", retry after {}s", d.as_secs()))
        .unwrap_or_default()
}

impl FetchError {
    /// Whether backing off and resuming may get past this failure
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::RateLimited { .. } => true,
            FetchError::Status { status, .. } => {
                *status >= 500 || *status == StatusCode::REQUEST_TIMEOUT.as_u16()
            }
            FetchError::Transport(e) => e.is_timeout() || e.is_connect(),
            FetchError::NotFound { .. } | FetchError::UrlParse(_) => false,
        }
    }

    /// Delay the server asked for, if it sent one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Error type for crawler operations
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Genre vocabulary could not be loaded
    #[error("Vocabulary error: {0}")]
    Vocabulary(String),

    /// Non-retryable fetch failure
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Record store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Transient failures kept coming after the retry ceiling
    #[error("Giving up after {rounds} backoff rounds without progress, last error: {last}")]
    RetriesExhausted {
        /// Consecutive rounds that made no progress
        rounds: u32,
        /// Last transient error seen
        last: String,
    },

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl From<FetchError> for CrateError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Transport(e) => CrateError::Http(e),
            _ => CrateError::Fetch(err.to_string()),
        }
    }
}

impl From<CrawlError> for CrateError {
    fn from(err: CrawlError) -> Self {
        match err {
            CrawlError::Config(msg) | CrawlError::Vocabulary(msg) => CrateError::Config(msg),
            CrawlError::Store(e) => e.into(),
            _ => CrateError::Crawl(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::RateLimited { retry_after: None }.is_transient());
        assert!(
            FetchError::Status {
                status: 503,
                url: "u".to_string()
            }
            .is_transient()
        );
        assert!(
            !FetchError::Status {
                status: 403,
                url: "u".to_string()
            }
            .is_transient()
        );
        assert!(
            !FetchError::NotFound {
                url: "u".to_string()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_rate_limited_message_includes_delay() {
        let err = FetchError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(err.to_string(), "Rate limited, retry after 30s");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));

        let bare = FetchError::RateLimited { retry_after: None };
        assert_eq!(bare.to_string(), "Rate limited");
    }
}
