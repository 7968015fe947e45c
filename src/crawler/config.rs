//! # Harvest Configuration Module
//!
//! This module provides configuration options for the catalog crawl: where
//! records land, which slice of the id space to visit, how politely to fetch
//! and how hard to retry when the catalog pushes back. It uses a builder
//! pattern for flexible configuration.
//!
//! ## Key Components
//!
//! - `HarvestConfig`: The main configuration struct with crawl parameters
//! - `HarvestConfigBuilder`: Builder pattern implementation for easier configuration

use std::path::PathBuf;
use std::time::Duration;

use super::error::CrawlError;
use super::BookId;

/// Configuration for a harvest run
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Directory holding one JSON file per record plus the aggregate files
    pub output_dir: PathBuf,

    /// First id of the catalog space (inclusive)
    pub start_id: u64,

    /// Upper bound of the catalog space (exclusive)
    pub max_id: u64,

    /// Base URL, the book id is appended to it
    pub base_url: String,

    /// Optional genre allow-list file, one label per line
    pub genres_path: Option<PathBuf>,

    /// Number of ids fetched concurrently
    pub concurrency: usize,

    /// Maximum number of requests per second
    pub requests_per_second: u32,

    /// Consecutive backoff rounds without progress before giving up
    pub max_retries: u32,

    /// First backoff delay in seconds
    pub backoff_secs: u64,

    /// Ceiling for the escalating backoff delay in seconds
    pub max_backoff_secs: u64,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    /// User agent to use for requests
    pub user_agent: String,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            start_id: 1,
            max_id: 10_000,
            base_url: "https://www.goodreads.com/book/show/".to_string(),
            genres_path: None,
            concurrency: 1,
            requests_per_second: 1,
            max_retries: 5,
            backoff_secs: 60,
            max_backoff_secs: 900,
            timeout_secs: 30,
            user_agent: format!("bookshelf-harvest/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Builder for HarvestConfig
#[derive(Debug, Default)]
pub struct HarvestConfigBuilder {
    config: HarvestConfig,
}

impl HarvestConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: HarvestConfig::default(),
        }
    }

    /// Set the output directory
    pub fn output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = output_dir.into();
        self
    }

    /// Set the first id to crawl
    pub fn start_id(mut self, start_id: u64) -> Self {
        self.config.start_id = start_id;
        self
    }

    /// Set the exclusive upper bound of the id space
    pub fn max_id(mut self, max_id: u64) -> Self {
        self.config.max_id = max_id;
        self
    }

    /// Set the base URL
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = base_url.into();
        self
    }

    /// Set the genre allow-list file
    pub fn genres_path(mut self, genres_path: Option<PathBuf>) -> Self {
        self.config.genres_path = genres_path;
        self
    }

    /// Set the number of concurrent fetches
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    /// Set the request rate cap
    pub fn requests_per_second(mut self, requests_per_second: u32) -> Self {
        self.config.requests_per_second = requests_per_second;
        self
    }

    /// Set the retry ceiling
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    /// Set the first backoff delay in seconds
    pub fn backoff_secs(mut self, backoff_secs: u64) -> Self {
        self.config.backoff_secs = backoff_secs;
        self
    }

    /// Set the backoff ceiling in seconds
    pub fn max_backoff_secs(mut self, max_backoff_secs: u64) -> Self {
        self.config.max_backoff_secs = max_backoff_secs;
        self
    }

    /// Set the per-request timeout in seconds
    pub fn timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.config.timeout_secs = timeout_secs;
        self
    }

    /// Set the user agent to use for requests
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Build the configuration
    pub fn build(self) -> HarvestConfig {
        self.config
    }
}

impl HarvestConfig {
    /// Create a new builder
    pub fn builder() -> HarvestConfigBuilder {
        HarvestConfigBuilder::new()
    }

    /// Check the configuration for values the crawl cannot run with
    pub fn validate(&self) -> Result<(), CrawlError> {
        if self.max_id <= self.start_id {
            return Err(CrawlError::Config(format!(
                "max_id ({}) must be greater than start_id ({})",
                self.max_id, self.start_id
            )));
        }
        if self.concurrency == 0 {
            return Err(CrawlError::Config("concurrency must be at least 1".to_string()));
        }
        if self.requests_per_second == 0 {
            return Err(CrawlError::Config(
                "requests_per_second must be at least 1".to_string(),
            ));
        }
        if self.max_backoff_secs < self.backoff_secs {
            return Err(CrawlError::Config(format!(
                "max_backoff_secs ({}) is below backoff_secs ({})",
                self.max_backoff_secs, self.backoff_secs
            )));
        }
        Ok(())
    }

    /// The full id space in ascending order
    pub fn id_space(&self) -> impl Iterator<Item = BookId> + Clone {
        (self.start_id..self.max_id).map(BookId)
    }

    /// Number of ids in the id space
    pub fn id_count(&self) -> u64 {
        self.max_id.saturating_sub(self.start_id)
    }

    /// Get the request timeout as a Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides_defaults() {
        let config = HarvestConfig::builder()
            .output_dir("/tmp/books")
            .max_id(50)
            .concurrency(4)
            .backoff_secs(1)
            .max_backoff_secs(8)
            .build();

        assert_eq!(config.output_dir, PathBuf::from("/tmp/books"));
        assert_eq!(config.start_id, 1);
        assert_eq!(config.max_id, 50);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.id_count(), 49);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_id_space_is_half_open() {
        let config = HarvestConfig::builder().start_id(3).max_id(6).build();
        let ids: Vec<BookId> = config.id_space().collect();
        assert_eq!(ids, vec![BookId(3), BookId(4), BookId(5)]);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let empty = HarvestConfig::builder().start_id(5).max_id(5).build();
        assert!(matches!(empty.validate(), Err(CrawlError::Config(_))));

        let no_workers = HarvestConfig::builder().concurrency(0).build();
        assert!(matches!(no_workers.validate(), Err(CrawlError::Config(_))));

        let inverted = HarvestConfig::builder()
            .backoff_secs(10)
            .max_backoff_secs(5)
            .build();
        assert!(matches!(inverted.validate(), Err(CrawlError::Config(_))));
    }
}
