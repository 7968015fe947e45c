//! Resumable crawl over the catalog id space
//!
//! A run repeatedly computes the ids that are not yet stored and works through
//! them in ascending order. A transient failure pauses dispatch for everyone,
//! lets in-flight attempts finish, sleeps and starts over from the resume
//! filter. Because the only durable side effect is the atomic per-id write,
//! a run can be killed and restarted at any point.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use super::config::HarvestConfig;
use super::content_extraction::{extract_record, Document};
use super::error::{CrawlError, FetchError};
use super::fetcher::Fetcher;
use super::storage::{RecordStore, StoreError};
use super::vocabulary::GenreVocabulary;
use super::{BookId, CrawlOutcome};

/// Bounded, escalating backoff for transient failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive backoff rounds without progress before giving up
    pub max_retries: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Ceiling for the delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(900),
        }
    }
}

impl RetryPolicy {
    /// Retry policy from the harvest configuration
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_secs(config.backoff_secs),
            max_delay: Duration::from_secs(config.max_backoff_secs),
        }
    }

    /// Delay before retry `round` (1-based), doubling each round up to `max_delay`
    pub fn delay(&self, round: u32) -> Duration {
        let exponent = round.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

/// Progress updates sent while crawling
#[derive(Debug, Clone, PartialEq)]
pub enum CrawlProgress {
    /// A (re)started pass over the pending ids
    Resumed {
        /// Ids still to visit
        pending: u64,
        /// Size of the whole id space
        total: u64,
    },

    /// One id was handled
    Processed {
        /// The id
        book_id: BookId,
        /// Ids handled so far, stored ones included
        position: u64,
        /// Size of the whole id space
        total: u64,
        /// Whether a record was written
        persisted: bool,
    },

    /// Dispatch is paused after a transient failure
    BackingOff {
        /// Consecutive round without progress
        round: u32,
        /// How long the crawl sleeps
        delay: Duration,
    },
}

/// Totals reported at the end of a run
#[derive(Debug, Clone)]
pub struct CrawlSummary {
    /// Size of the id space
    pub total: u64,

    /// Records written during this run
    pub persisted: u64,

    /// Ids without a title (or page), nothing written
    pub skipped: u64,

    /// Ids already stored when the run started
    pub already_stored: u64,

    /// Backoff rounds taken
    pub retry_rounds: u32,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// Wall-clock duration of the run
    pub elapsed: Duration,
}

/// How a pass over the pending ids ended
enum PassEnd {
    Exhausted,
    Transient { cause: FetchError, persisted: u64 },
    Fatal(BookId, CrawlError),
}

/// Drives the crawl over an id range
pub struct CrawlScheduler<F, S> {
    fetcher: F,
    store: S,
    vocabulary: GenreVocabulary,
    ids: Range<u64>,
    concurrency: usize,
    retry: RetryPolicy,
    progress: Option<mpsc::Sender<CrawlProgress>>,
}

impl<F: Fetcher, S: RecordStore> CrawlScheduler<F, S> {
    /// Create a scheduler for the id space and retry policy in `config`
    pub fn new(fetcher: F, store: S, vocabulary: GenreVocabulary, config: &HarvestConfig) -> Self {
        Self {
            fetcher,
            store,
            vocabulary,
            ids: config.start_id..config.max_id,
            concurrency: config.concurrency.max(1),
            retry: RetryPolicy::from_config(config),
            progress: None,
        }
    }

    /// Replace the retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Send progress updates to `sender`
    pub fn with_progress(mut self, sender: mpsc::Sender<CrawlProgress>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// The record store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run the crawl until the id space is exhausted
    #[instrument(skip(self), fields(start = self.ids.start, end = self.ids.end))]
    pub async fn run(&self) -> Result<CrawlSummary, CrawlError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let total = self.ids.end.saturating_sub(self.ids.start);

        let mut summary = CrawlSummary {
            total,
            persisted: 0,
            skipped: 0,
            already_stored: 0,
            retry_rounds: 0,
            started_at,
            elapsed: Duration::ZERO,
        };
        let mut skipped = HashSet::new();
        let mut stalled_rounds = 0u32;
        let mut first_pass = true;

        loop {
            let pending = self.pending(&skipped).await?;
            if first_pass {
                summary.already_stored = total - pending.len() as u64;
                first_pass = false;
            }
            info!("{} of {} ids pending", pending.len(), total);
            self.report(CrawlProgress::Resumed {
                pending: pending.len() as u64,
                total,
            })
            .await;

            match self.crawl_pass(&pending, &mut skipped, &mut summary).await {
                PassEnd::Exhausted => break,
                PassEnd::Fatal(book_id, err) => {
                    error!(%book_id, "Halting crawl: {}", err);
                    return Err(err);
                }
                PassEnd::Transient { cause, persisted } => {
                    if persisted > 0 {
                        stalled_rounds = 0;
                    }
                    stalled_rounds += 1;
                    if stalled_rounds > self.retry.max_retries {
                        error!("Retry ceiling reached after {} rounds", stalled_rounds - 1);
                        return Err(CrawlError::RetriesExhausted {
                            rounds: stalled_rounds - 1,
                            last: cause.to_string(),
                        });
                    }

                    let delay = self
                        .retry
                        .delay(stalled_rounds)
                        .max(cause.retry_after().unwrap_or_default());
                    summary.retry_rounds += 1;
                    warn!(
                        "{}; backing off for {}s (round {} of {})",
                        cause,
                        delay.as_secs(),
                        stalled_rounds,
                        self.retry.max_retries
                    );
                    self.report(CrawlProgress::BackingOff {
                        round: stalled_rounds,
                        delay,
                    })
                    .await;
                    tokio::time::sleep(delay).await;
                }
            }
        }

        summary.elapsed = clock.elapsed();
        info!(
            "Crawl finished: {} stored, {} skipped, {} already present in {:?}",
            summary.persisted, summary.skipped, summary.already_stored, summary.elapsed
        );
        Ok(summary)
    }

    /// Ascending ids with no stored record, minus ids already skipped this run
    async fn pending(&self, skipped: &HashSet<BookId>) -> Result<Vec<BookId>, CrawlError> {
        let mut pending = Vec::new();
        for book_id in self.ids.clone().map(BookId) {
            if skipped.contains(&book_id) {
                continue;
            }
            if !self.store.exists(book_id).await? {
                pending.push(book_id);
            }
        }
        Ok(pending)
    }

    /// One pass over `pending`, stopping dispatch at the first failure
    async fn crawl_pass(
        &self,
        pending: &[BookId],
        skipped: &mut HashSet<BookId>,
        summary: &mut CrawlSummary,
    ) -> PassEnd {
        let halted = AtomicBool::new(false);
        let halted_ref = &halted;
        let persisted_before = summary.persisted;

        let mut attempts = stream::iter(pending.iter().copied())
            .map(move |book_id| async move {
                if halted_ref.load(Ordering::Acquire) {
                    return None;
                }
                self.attempt(book_id)
                    .instrument(info_span!("attempt", %book_id))
                    .await
            })
            .buffer_unordered(self.concurrency);

        let mut transient = None;
        let mut fatal = None;

        while let Some(outcome) = attempts.next().await {
            let Some(outcome) = outcome else {
                continue;
            };
            let book_id = outcome.book_id();

            match outcome {
                CrawlOutcome::Persisted(record) => {
                    summary.persisted += 1;
                    let position = summary.already_stored + summary.persisted + summary.skipped;
                    info!(
                        "#{} out of {}: stored {} ({})",
                        position, summary.total, book_id, record.book_title
                    );
                    self.report(CrawlProgress::Processed {
                        book_id,
                        position,
                        total: summary.total,
                        persisted: true,
                    })
                    .await;
                }
                CrawlOutcome::SkippedNoTitle(book_id) => {
                    skipped.insert(book_id);
                    summary.skipped += 1;
                    let position = summary.already_stored + summary.persisted + summary.skipped;
                    info!(
                        "#{} out of {}: not enough info on {}, moving on",
                        position, summary.total, book_id
                    );
                    self.report(CrawlProgress::Processed {
                        book_id,
                        position,
                        total: summary.total,
                        persisted: false,
                    })
                    .await;
                }
                CrawlOutcome::TransientFailure(book_id, cause) => {
                    warn!(%book_id, "Transient failure: {}", cause);
                    halted.store(true, Ordering::Release);
                    if transient.is_none() {
                        transient = Some(cause);
                    }
                }
                CrawlOutcome::FatalFailure(book_id, err) => {
                    error!(%book_id, "Fatal failure: {}", err);
                    halted.store(true, Ordering::Release);
                    if fatal.is_none() {
                        fatal = Some((book_id, err));
                    }
                }
            }
        }

        if let Some((book_id, err)) = fatal {
            PassEnd::Fatal(book_id, err)
        } else if let Some(cause) = transient {
            PassEnd::Transient {
                cause,
                persisted: summary.persisted - persisted_before,
            }
        } else {
            PassEnd::Exhausted
        }
    }

    /// Fetch, extract and store one id; `None` if it was already stored
    async fn attempt(&self, book_id: BookId) -> Option<CrawlOutcome> {
        match self.store.exists(book_id).await {
            Ok(true) => {
                debug!("Already stored");
                return None;
            }
            Ok(false) => {}
            Err(e) => return Some(CrawlOutcome::FatalFailure(book_id, e.into())),
        }

        debug!("Fetching");
        let page = match self.fetcher.fetch(book_id).await {
            Ok(page) => page,
            Err(FetchError::NotFound { url }) => {
                debug!("No catalog page at {}", url);
                return Some(CrawlOutcome::SkippedNoTitle(book_id));
            }
            Err(e) if e.is_transient() => return Some(CrawlOutcome::TransientFailure(book_id, e)),
            Err(e) => return Some(CrawlOutcome::FatalFailure(book_id, e.into())),
        };

        let record = {
            let doc = Document::parse(&page.html);
            extract_record(book_id, &doc, &self.vocabulary)
        };
        let Some(record) = record else {
            return Some(CrawlOutcome::SkippedNoTitle(book_id));
        };

        match self.store.write(&record).await {
            Ok(()) => Some(CrawlOutcome::Persisted(record)),
            Err(StoreError::AlreadyExists(_)) => None,
            Err(e) => Some(CrawlOutcome::FatalFailure(book_id, e.into())),
        }
    }

    async fn report(&self, update: CrawlProgress) {
        if let Some(sender) = &self.progress {
            // a closed receiver only means nobody is watching
            let _ = sender.send(update).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::fetcher::FetchedPage;
    use crate::crawler::storage::FileRecordStore;
    use crate::crawler::BookRecord;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Clone)]
    enum Reply {
        Page(String),
        NotFound,
        Forbidden,
        RateLimited,
    }

    #[derive(Default)]
    struct ScriptedFetcher {
        replies: HashMap<BookId, Reply>,
        rate_limit_once: Mutex<HashSet<BookId>>,
        calls: Mutex<Vec<BookId>>,
    }

    impl ScriptedFetcher {
        fn with_titles(ids: Range<u64>) -> Self {
            let replies = ids
                .map(|id| (BookId(id), Reply::Page(page(&format!("Book {}", id)))))
                .collect();
            Self {
                replies,
                ..Default::default()
            }
        }

        fn reply(mut self, id: u64, reply: Reply) -> Self {
            self.replies.insert(BookId(id), reply);
            self
        }

        fn rate_limit_once(self, id: u64) -> Self {
            self.rate_limit_once.lock().unwrap().insert(BookId(id));
            self
        }

        fn calls(&self) -> Vec<BookId> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, book_id: BookId) -> Result<FetchedPage, FetchError> {
            self.calls.lock().unwrap().push(book_id);
            if self.rate_limit_once.lock().unwrap().remove(&book_id) {
                return Err(FetchError::RateLimited { retry_after: None });
            }
            let url = format!("https://catalog.test/{}", book_id);
            match self.replies.get(&book_id).cloned() {
                Some(Reply::Page(html)) => Ok(FetchedPage { book_id, url, html }),
                Some(Reply::RateLimited) => Err(FetchError::RateLimited { retry_after: None }),
                Some(Reply::Forbidden) => Err(FetchError::Status { status: 403, url }),
                Some(Reply::NotFound) | None => Err(FetchError::NotFound { url }),
            }
        }
    }

    fn page(title: &str) -> String {
        format!(
            r#"<h1 data-testid="bookTitle">{}</h1><div data-testid="genresList">Fantasy</div>"#,
            title
        )
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    fn config(max_id: u64) -> HarvestConfig {
        HarvestConfig::builder().start_id(1).max_id(max_id).build()
    }

    fn scheduler<'a>(
        fetcher: &'a ScriptedFetcher,
        store: &FileRecordStore,
        config: &HarvestConfig,
    ) -> CrawlScheduler<&'a ScriptedFetcher, FileRecordStore> {
        CrawlScheduler::new(
            fetcher,
            store.clone(),
            GenreVocabulary::new(["Fantasy"]),
            config,
        )
        .with_retry_policy(fast_retry(2))
    }

    async fn stored_ids(store: &FileRecordStore) -> Vec<BookId> {
        let mut ids: Vec<BookId> = store
            .enumerate()
            .filter_map(|r| async move { r.ok().map(|record: BookRecord| record.book_id) })
            .collect()
            .await;
        ids.sort();
        ids
    }

    #[test]
    fn test_retry_policy_escalates_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(300),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(60));
        assert_eq!(policy.delay(2), Duration::from_secs(120));
        assert_eq!(policy.delay(3), Duration::from_secs(240));
        assert_eq!(policy.delay(4), Duration::from_secs(300));
        assert_eq!(policy.delay(40), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_persists_and_skips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecordStore::at(dir.path());
        let fetcher = ScriptedFetcher::with_titles(1..6)
            .reply(2, Reply::Page("<p>no title here</p>".to_string()))
            .reply(4, Reply::NotFound);

        let summary = scheduler(&fetcher, &store, &config(6)).run().await.unwrap();

        assert_eq!(summary.total, 5);
        assert_eq!(summary.persisted, 3);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.already_stored, 0);
        assert_eq!(summary.retry_rounds, 0);
        assert_eq!(stored_ids(&store).await, vec![BookId(1), BookId(3), BookId(5)]);

        let record = store.read(BookId(3)).await.unwrap();
        assert_eq!(record.book_title, "Book 3");
        assert_eq!(record.genres, Some(vec!["Fantasy".to_string()]));
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecordStore::at(dir.path());
        let fetcher = ScriptedFetcher::with_titles(1..5).reply(3, Reply::NotFound);

        scheduler(&fetcher, &store, &config(5)).run().await.unwrap();
        let first = stored_ids(&store).await;
        let first_record = store.read(BookId(1)).await.unwrap();

        let again = ScriptedFetcher::with_titles(1..5).reply(3, Reply::NotFound);
        let summary = scheduler(&again, &store, &config(5)).run().await.unwrap();

        assert_eq!(summary.persisted, 0);
        assert_eq!(summary.already_stored, 3);
        // only the never-persisted id is looked at again
        assert_eq!(again.calls(), vec![BookId(3)]);
        assert_eq!(stored_ids(&store).await, first);
        assert_eq!(store.read(BookId(1)).await.unwrap(), first_record);
    }

    #[tokio::test]
    async fn test_resumes_after_stored_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecordStore::at(dir.path());

        let prefix = ScriptedFetcher::with_titles(1..4);
        scheduler(&prefix, &store, &config(4)).run().await.unwrap();

        let fetcher = ScriptedFetcher::with_titles(1..8);
        let summary = scheduler(&fetcher, &store, &config(8)).run().await.unwrap();

        assert_eq!(summary.already_stored, 3);
        assert_eq!(summary.persisted, 4);
        assert_eq!(
            fetcher.calls(),
            vec![BookId(4), BookId(5), BookId(6), BookId(7)]
        );
    }

    #[tokio::test]
    async fn test_transient_failure_backs_off_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecordStore::at(dir.path());
        let fetcher = ScriptedFetcher::with_titles(1..6)
            .reply(2, Reply::NotFound)
            .rate_limit_once(4);
        let (tx, mut rx) = mpsc::channel(64);

        let summary = scheduler(&fetcher, &store, &config(6))
            .with_progress(tx)
            .run()
            .await
            .unwrap();

        assert_eq!(summary.retry_rounds, 1);
        assert_eq!(summary.persisted, 4);
        assert_eq!(summary.skipped, 1);
        // the skipped id is not retried within the run, stored ids are not refetched
        assert_eq!(
            fetcher.calls(),
            vec![BookId(1), BookId(2), BookId(3), BookId(4), BookId(4), BookId(5)]
        );

        let mut backoffs = 0;
        while let Ok(update) = rx.try_recv() {
            if matches!(update, CrawlProgress::BackingOff { round: 1, .. }) {
                backoffs += 1;
            }
        }
        assert_eq!(backoffs, 1);
    }

    #[tokio::test]
    async fn test_persistent_transient_failure_hits_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecordStore::at(dir.path());
        let fetcher = ScriptedFetcher::default()
            .reply(1, Reply::RateLimited)
            .reply(2, Reply::RateLimited);

        let result = scheduler(&fetcher, &store, &config(3))
            .with_retry_policy(fast_retry(3))
            .run()
            .await;

        match result {
            Err(CrawlError::RetriesExhausted { rounds, .. }) => assert_eq!(rounds, 3),
            other => panic!("Expected RetriesExhausted, got {:?}", other.map(|s| s.persisted)),
        }
        // one attempt per round, the first id every time
        assert_eq!(fetcher.calls(), vec![BookId(1); 4]);
        assert!(stored_ids(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_fatal_failure_halts() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecordStore::at(dir.path());
        let fetcher = ScriptedFetcher::with_titles(1..6).reply(3, Reply::Forbidden);

        let result = scheduler(&fetcher, &store, &config(6)).run().await;

        assert!(matches!(
            result,
            Err(CrawlError::Fetch(FetchError::Status { status: 403, .. }))
        ));
        assert_eq!(fetcher.calls(), vec![BookId(1), BookId(2), BookId(3)]);
        assert_eq!(stored_ids(&store).await, vec![BookId(1), BookId(2)]);
    }

    #[tokio::test]
    async fn test_concurrent_workers_fetch_each_id_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecordStore::at(dir.path());
        let fetcher = ScriptedFetcher::with_titles(1..21).rate_limit_once(10);
        let config = HarvestConfig::builder()
            .start_id(1)
            .max_id(21)
            .concurrency(4)
            .build();

        let summary = scheduler(&fetcher, &store, &config).run().await.unwrap();

        assert_eq!(summary.persisted, 20);
        assert_eq!(stored_ids(&store).await.len(), 20);

        let calls = fetcher.calls();
        let distinct: HashSet<BookId> = calls.iter().copied().collect();
        assert_eq!(distinct.len(), 20);
        // only the rate-limited id is fetched twice
        assert_eq!(calls.len(), 21);
    }
}
