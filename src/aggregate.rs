//! # Aggregation Module
//!
//! Consolidates every persisted record into one dataset and hands it to a
//! sink. The dataset is rebuilt from the record store on every run; nothing
//! is maintained incrementally.
//!
//! `FileDatasetSink` writes the two aggregate files next to the records:
//! `all_books.json` (an array of record mappings) and `all_books.csv`
//! (one column per field, genres rendered as a JSON array).

use std::io::{self, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{info, instrument, warn};

use crate::crawler::storage::{write_atomic, AGGREGATE_STEM};
use crate::crawler::{BookRecord, FileRecordStore, RecordStore, StoreError};
use crate::error::{Error, Result};

/// All persisted records, ordered by book id
pub type ConsolidatedDataset = Vec<BookRecord>;

const CSV_HEADERS: [&str; 4] = ["book_id", "book_title", "genres", "description"];

/// Downstream consumer of the consolidated dataset
#[async_trait]
pub trait DatasetSink: Send + Sync {
    /// Write the dataset, returning the paths written
    async fn write(&self, dataset: &[BookRecord]) -> Result<Vec<PathBuf>>;
}

/// Builds the consolidated dataset from a record store
#[derive(Debug, Default, Clone, Copy)]
pub struct Aggregator;

impl Aggregator {
    /// Collect every persisted record
    ///
    /// Unreadable record files are logged and left out; any other store
    /// failure aborts the aggregation.
    #[instrument(skip_all)]
    pub async fn run<S: RecordStore + ?Sized>(store: &S) -> Result<ConsolidatedDataset> {
        let mut dataset = Vec::new();
        let mut records = store.enumerate();

        while let Some(record) = records.next().await {
            match record {
                Ok(record) => dataset.push(record),
                Err(StoreError::Corrupt { path, source }) => {
                    warn!("Skipping unreadable record {}: {}", path.display(), source);
                }
                Err(e) => return Err(e.into()),
            }
        }

        dataset.sort_by_key(|record| record.book_id);
        info!("Consolidated {} records", dataset.len());
        Ok(dataset)
    }

    /// Hand the dataset to a sink
    pub async fn export<K: DatasetSink + ?Sized>(
        dataset: &[BookRecord],
        sink: &K,
    ) -> Result<Vec<PathBuf>> {
        let written = sink.write(dataset).await?;
        for path in &written {
            info!("Wrote {}", path.display());
        }
        Ok(written)
    }
}

/// Writes `all_books.json` and `all_books.csv` into the store directory
#[derive(Debug, Clone)]
pub struct FileDatasetSink {
    store: FileRecordStore,
}

impl FileDatasetSink {
    /// Create a sink writing next to the records of `store`
    pub fn new(store: FileRecordStore) -> Self {
        Self { store }
    }

    async fn write_file(&self, extension: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.store.aggregate_path(extension);
        let staging = self
            .store
            .base_path()
            .join(format!(".{}.{}.tmp", AGGREGATE_STEM, extension));
        write_atomic(&staging, &path, bytes)
            .await
            .map_err(|e| Error::Export(format!("Failed to write {}: {}", path.display(), e)))?;
        Ok(path)
    }
}

#[async_trait]
impl DatasetSink for FileDatasetSink {
    async fn write(&self, dataset: &[BookRecord]) -> Result<Vec<PathBuf>> {
        self.store.ensure_directories().await?;

        let json = serde_json::to_vec(dataset)?;
        let json_path = self.write_file("json", &json).await?;

        let csv = to_csv(dataset)?;
        let csv_path = self.write_file("csv", &csv).await?;

        Ok(vec![json_path, csv_path])
    }
}

/// Render the dataset as CSV, one column per field
pub fn to_csv(dataset: &[BookRecord]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let headers: Vec<String> = CSV_HEADERS.iter().map(|h| h.to_string()).collect();
    write_row(&mut buf, &headers)?;

    for record in dataset {
        let genres = match &record.genres {
            Some(genres) => serde_json::to_string(genres)?,
            None => String::new(),
        };
        let row = [
            record.book_id.to_string(),
            record.book_title.clone(),
            genres,
            record.description.clone().unwrap_or_default(),
        ];
        write_row(&mut buf, &row)?;
    }

    Ok(buf)
}

fn needs_quotes(field: &str) -> bool {
    field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r')
}

/// Write a single CSV row to any writer
fn write_row<W: Write>(mut w: W, row: &[String]) -> io::Result<()> {
    let mut first = true;
    for cell in row {
        if !first {
            write!(w, ",")?;
        } else {
            first = false;
        }
        if needs_quotes(cell) {
            write!(w, "\"{}\"", cell.replace('"', "\"\""))?;
        } else {
            write!(w, "{}", cell)?;
        }
    }
    writeln!(w)
}
