//! # Bookshelf Harvest - Resumable Catalog Crawler
//!
//! This crate harvests book records (title, genre tags, description) from a
//! numbered web catalog, one page per id. Every record is persisted on its own
//! the moment it is extracted, so a crawl can be interrupted and restarted
//! without losing or duplicating work, and all records are periodically
//! consolidated into a single dataset for downstream analysis.
//!
//! ## Features
//!
//! - Resume filter over the id space, already stored ids are never fetched again
//! - Pluggable page fetcher with a rate-limited reqwest implementation
//! - Field extraction with well-defined "absent" semantics
//! - Genre classification against an allow-list of labels
//! - Atomic, write-once record files
//! - Bounded, escalating backoff on rate limiting, with a global pause when
//!   crawling with several workers
//! - JSON and CSV export of the consolidated dataset
//!
//! ## Example
//!
//! ```rust,no_run
//! use bookshelf_harvest::aggregate::{Aggregator, FileDatasetSink};
//! use bookshelf_harvest::crawler::{
//!     CrawlScheduler, FileRecordStore, GenreVocabulary, HarvestConfig, HttpFetcher,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HarvestConfig::builder()
//!         .output_dir("data")
//!         .max_id(100)
//!         .build();
//!     config.validate()?;
//!
//!     let store = FileRecordStore::at(&config.output_dir);
//!     let fetcher = HttpFetcher::new(&config)?;
//!     let scheduler =
//!         CrawlScheduler::new(fetcher, store.clone(), GenreVocabulary::default(), &config);
//!     let summary = scheduler.run().await?;
//!     println!("Stored {} new records", summary.persisted);
//!
//!     let dataset = Aggregator::run(&store).await?;
//!     Aggregator::export(&dataset, &FileDatasetSink::new(store)).await?;
//!     Ok(())
//! }
//! ```

mod error;

pub mod aggregate;
pub mod crawler;

pub use error::Error;

/// Re-export of types module for public use
pub mod prelude {
    pub use crate::error::Error;
    pub use crate::error::Result;
}
