use async_stream::stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::{fs, io::AsyncWriteExt};
use tokio_stream::wrappers::ReadDirStream;
use tracing::{debug, instrument, warn};

use super::{BookId, BookRecord};

/// File stem reserved for the consolidated dataset
pub const AGGREGATE_STEM: &str = "all_books";

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Base path for storage
    pub base_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("data"),
        }
    }
}

/// Error type for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corrupt record file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Record {0} already exists")]
    AlreadyExists(BookId),

    #[error("Not found: {0}")]
    NotFound(BookId),
}

type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for crate::error::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io(e) => crate::error::Error::Io(e),
            _ => crate::error::Error::Store(err.to_string()),
        }
    }
}

/// Durable, write-once mapping from book id to record
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Whether a record for `book_id` has been persisted
    async fn exists(&self, book_id: BookId) -> Result<bool>;

    /// Read a persisted record
    async fn read(&self, book_id: BookId) -> Result<BookRecord>;

    /// Persist a record; a crash never leaves a partial record visible
    async fn write(&self, record: &BookRecord) -> Result<()>;

    /// Every persisted record, in no particular order
    fn enumerate(&self) -> BoxStream<'_, Result<BookRecord>>;
}

/// Record store keeping one JSON file per book
#[derive(Debug, Clone)]
pub struct FileRecordStore {
    config: StorageConfig,
}

impl Default for FileRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FileRecordStore {
    /// Create a new storage with default configuration
    pub fn new() -> Self {
        Self {
            config: StorageConfig::default(),
        }
    }

    /// Create a new storage with custom configuration
    pub fn with_config(config: StorageConfig) -> Self {
        Self { config }
    }

    /// Create a storage rooted at `base_path`
    pub fn at(base_path: impl Into<PathBuf>) -> Self {
        Self::with_config(StorageConfig {
            base_path: base_path.into(),
        })
    }

    /// Directory holding the records
    pub fn base_path(&self) -> &Path {
        &self.config.base_path
    }

    /// Gets the storage path for a given id
    fn record_path(&self, book_id: BookId) -> PathBuf {
        self.config.base_path.join(format!("{}.json", book_id))
    }

    /// Hidden sibling the record is staged in before the rename
    fn staging_path(&self, book_id: BookId) -> PathBuf {
        self.config.base_path.join(format!(".{}.json.tmp", book_id))
    }

    /// Path of an aggregate file, e.g. `all_books.csv`
    pub fn aggregate_path(&self, extension: &str) -> PathBuf {
        self.config
            .base_path
            .join(format!("{}.{}", AGGREGATE_STEM, extension))
    }

    /// Creates the storage directory
    pub async fn ensure_directories(&self) -> io::Result<()> {
        fs::create_dir_all(&self.config.base_path).await
    }

    /// Whether `path` names a record file; hidden, staging and aggregate files are not
    pub fn is_record_file(path: &Path) -> bool {
        let Some(file_name) = path.file_name().and_then(|f| f.to_str()) else {
            return false;
        };
        if file_name.starts_with('.') {
            return false;
        }
        path.extension().is_some_and(|ext| ext == "json")
            && path.file_stem().is_some_and(|stem| stem != AGGREGATE_STEM)
    }
}

/// Write `bytes` to `path` through a staging file and a rename
pub async fn write_atomic(staging: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    let result = async {
        let mut file = fs::File::create(staging).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(staging, path).await
    }
    .await;

    if result.is_err() && fs::try_exists(staging).await.unwrap_or(false) {
        let _ = fs::remove_file(staging).await;
    }

    result
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn exists(&self, book_id: BookId) -> Result<bool> {
        Ok(fs::try_exists(self.record_path(book_id)).await?)
    }

    async fn read(&self, book_id: BookId) -> Result<BookRecord> {
        let path = self.record_path(book_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(book_id));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt { path, source })
    }

    #[instrument(skip(self, record), fields(book_id = %record.book_id))]
    async fn write(&self, record: &BookRecord) -> Result<()> {
        if self.exists(record.book_id).await? {
            return Err(StoreError::AlreadyExists(record.book_id));
        }
        self.ensure_directories().await?;

        let bytes = serde_json::to_vec(record)?;
        let path = self.record_path(record.book_id);
        write_atomic(&self.staging_path(record.book_id), &path, &bytes).await?;

        debug!("Stored record at {}", path.display());
        Ok(())
    }

    fn enumerate(&self) -> BoxStream<'_, Result<BookRecord>> {
        let base_path = self.config.base_path.clone();

        stream! {
            let dir = match fs::read_dir(&base_path).await {
                Ok(dir) => dir,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!("Storage directory {} does not exist", base_path.display());
                    return;
                }
                Err(e) => {
                    yield Err(StoreError::Io(e));
                    return;
                }
            };

            let mut entries = ReadDirStream::new(dir);
            while let Some(entry) = entries.next().await {
                let path = match entry {
                    Ok(entry) => entry.path(),
                    Err(e) => {
                        yield Err(StoreError::Io(e));
                        continue;
                    }
                };
                if !FileRecordStore::is_record_file(&path) {
                    continue;
                }

                match fs::read(&path).await {
                    Ok(bytes) => match serde_json::from_slice::<BookRecord>(&bytes) {
                        Ok(record) => {
                            yield Ok(record);
                        }
                        Err(source) => {
                            yield Err(StoreError::Corrupt { path, source });
                        }
                    },
                    Err(e) => {
                        yield Err(StoreError::Io(e));
                    }
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn record(id: u64, title: &str) -> BookRecord {
        BookRecord {
            book_id: BookId(id),
            book_title: title.to_string(),
            genres: Some(vec!["Fantasy".to_string()]),
            description: Some("desc".to_string()),
        }
    }

    #[test]
    fn test_record_paths() {
        let storage = FileRecordStore::at("/tmp/books");
        assert_eq!(storage.record_path(BookId(12)), Path::new("/tmp/books/12.json"));
        assert_eq!(
            storage.staging_path(BookId(12)),
            Path::new("/tmp/books/.12.json.tmp")
        );
        assert_eq!(
            storage.aggregate_path("csv"),
            Path::new("/tmp/books/all_books.csv")
        );
    }

    #[test]
    fn test_is_record_file() {
        assert!(FileRecordStore::is_record_file(Path::new("d/1.json")));
        assert!(!FileRecordStore::is_record_file(Path::new("d/all_books.json")));
        assert!(!FileRecordStore::is_record_file(Path::new("d/.1.json.tmp")));
        assert!(!FileRecordStore::is_record_file(Path::new("d/.hidden.json")));
        assert!(!FileRecordStore::is_record_file(Path::new("d/all_books.csv")));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileRecordStore::at(dir.path().join("nested"));

        assert!(!storage.exists(BookId(1)).await.unwrap());
        storage.write(&record(1, "One")).await.unwrap();
        assert!(storage.exists(BookId(1)).await.unwrap());
        assert_eq!(storage.read(BookId(1)).await.unwrap(), record(1, "One"));

        // nothing left behind from staging
        assert!(!storage.staging_path(BookId(1)).exists());
    }

    #[tokio::test]
    async fn test_records_are_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileRecordStore::at(dir.path());

        storage.write(&record(3, "Original")).await.unwrap();
        let second = storage.write(&record(3, "Replacement")).await;
        assert!(matches!(second, Err(StoreError::AlreadyExists(BookId(3)))));
        assert_eq!(storage.read(BookId(3)).await.unwrap().book_title, "Original");
    }

    #[tokio::test]
    async fn test_read_missing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileRecordStore::at(dir.path());
        assert!(matches!(
            storage.read(BookId(9)).await,
            Err(StoreError::NotFound(BookId(9)))
        ));
    }

    #[tokio::test]
    async fn test_interrupted_write_is_not_visible() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileRecordStore::at(dir.path());

        // a crash between staging and rename leaves only the hidden file
        fs::write(storage.staging_path(BookId(5)), b"{\"book_id\": \"5\", \"book_ti")
            .await
            .unwrap();

        assert!(!storage.exists(BookId(5)).await.unwrap());
        let records: Vec<BookRecord> = storage.enumerate().try_collect().await.unwrap();
        assert!(records.is_empty());

        // and the id can still be written afterwards
        storage.write(&record(5, "Five")).await.unwrap();
        assert!(storage.exists(BookId(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_enumerate_skips_aggregate_and_reports_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileRecordStore::at(dir.path());

        storage.write(&record(1, "One")).await.unwrap();
        storage.write(&record(2, "Two")).await.unwrap();
        fs::write(storage.aggregate_path("json"), b"[]").await.unwrap();
        fs::write(dir.path().join("notes.txt"), b"hello").await.unwrap();
        fs::write(dir.path().join("7.json"), b"not json").await.unwrap();

        let results: Vec<_> = storage.enumerate().collect().await;
        assert_eq!(results.len(), 3);

        let mut titles: Vec<String> = results
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .map(|r| r.book_title.clone())
            .collect();
        titles.sort();
        assert_eq!(titles, vec!["One", "Two"]);

        assert!(results
            .iter()
            .any(|r| matches!(r, Err(StoreError::Corrupt { .. }))));
    }

    #[tokio::test]
    async fn test_enumerate_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileRecordStore::at(dir.path().join("absent"));
        let records: Vec<_> = storage.enumerate().collect().await;
        assert!(records.is_empty());
    }
}
