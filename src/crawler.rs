//! # Catalog Crawler Module
//!
//! This module drives the resumable harvest of book records from a numbered
//! catalog. It is the first stage of the pipeline: every catalog id is fetched,
//! the interesting fields are extracted and each record is persisted on its own
//! so that an interrupted crawl picks up where it stopped.
//!
//! ## Key Components
//!
//! - `HarvestConfig`: Configuration for the crawl (id space, output directory, retry policy)
//! - `Fetcher` / `HttpFetcher`: Retrieval of one catalog page per id
//! - `GenreVocabulary`: The allow-list of genre labels recognised during extraction
//! - `extract_record` and friends: Field extraction from a parsed page
//! - `RecordStore` / `FileRecordStore`: One JSON file per harvested record
//! - `CrawlScheduler`: Resume filter, per-id attempts, backoff and retry
//!
//! ## Features
//!
//! - Safe to kill and restart at any point, records are written atomically
//! - Bounded, escalating backoff when the catalog rate limits us
//! - Optional bounded worker pool with a shared, global pause on rate limits

mod config;
mod content_extraction;
mod error;
mod fetcher;
mod scheduler;
pub mod storage;
mod vocabulary;

// Re-export important types and functions
pub use config::{HarvestConfig, HarvestConfigBuilder};
pub use content_extraction::{
    extract_description, extract_genres, extract_record, extract_title, normalize_whitespace,
    Document,
};
pub use error::{CrawlError, FetchError};
pub use fetcher::{FetchedPage, Fetcher, HttpFetcher};
pub use scheduler::{CrawlProgress, CrawlScheduler, CrawlSummary, RetryPolicy};
pub use storage::{FileRecordStore, RecordStore, StoreError};
pub use vocabulary::GenreVocabulary;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Identifier of one catalog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BookId(pub u64);

impl fmt::Display for BookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BookId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(BookId)
    }
}

impl From<u64> for BookId {
    fn from(id: u64) -> Self {
        BookId(id)
    }
}

// Record files carry the id as a string, e.g. `"book_id": "42"`.
impl Serialize for BookId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BookId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Number(n) => Ok(BookId(n)),
        }
    }
}

/// A harvested book, as persisted in `<id>.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookRecord {
    /// Catalog id of the book
    pub book_id: BookId,

    /// Title of the book, never empty
    pub book_title: String,

    /// Recognised genre labels; `None` when the page has no genre section
    pub genres: Option<Vec<String>>,

    /// Whitespace-normalized description
    pub description: Option<String>,
}

/// Result of one attempt at a single catalog id
#[derive(Debug)]
pub enum CrawlOutcome {
    /// The record was extracted and written to the store
    Persisted(BookRecord),

    /// The page has no title (or does not exist); nothing was written
    SkippedNoTitle(BookId),

    /// Retryable fetch failure, handled by backing off and resuming
    TransientFailure(BookId, FetchError),

    /// Non-retryable failure, halts the crawl
    FatalFailure(BookId, CrawlError),
}

impl CrawlOutcome {
    /// The id this outcome belongs to
    pub fn book_id(&self) -> BookId {
        match self {
            CrawlOutcome::Persisted(record) => record.book_id,
            CrawlOutcome::SkippedNoTitle(id)
            | CrawlOutcome::TransientFailure(id, _)
            | CrawlOutcome::FatalFailure(id, _) => *id,
        }
    }
}
