//! # Bookshelf Harvest CLI
//!
//! Command-line entry point for the catalog crawler. Without a subcommand it
//! crawls the configured id space and then consolidates every stored record
//! into `all_books.json` and `all_books.csv`.
//!
//! ## Key Components
//!
//! - CLI argument parsing with clap, every option also read from `HARVEST_*`
//!   environment variables
//! - Subcommands to run only one half of the pipeline:
//!   - `crawl`: Fetch and store records, no consolidation
//!   - `aggregate`: Consolidate already stored records
//! - Progress bar fed by the scheduler's progress channel
//! - Telemetry integration for monitoring
//!
//! Any fatal failure (configuration, storage, a non-retryable HTTP error or an
//! exhausted retry budget) ends the process with a non-zero exit code.

mod telemetry;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use bookshelf_harvest::aggregate::{Aggregator, FileDatasetSink};
use bookshelf_harvest::crawler::{
    CrawlProgress, CrawlScheduler, CrawlSummary, FileRecordStore, GenreVocabulary,
    HarvestConfig, HttpFetcher,
};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tracing::{info, instrument};

#[derive(Parser)]
#[command(author, version, about = "Resumable crawler for book titles, genres and descriptions", long_about = None)]
struct Cli {
    #[command(flatten)]
    harvest: HarvestArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Crawl the id space and store records, without consolidating
    Crawl,

    /// Consolidate stored records into all_books.json and all_books.csv
    Aggregate,
}

#[derive(Args, Debug)]
struct HarvestArgs {
    /// Directory for record files and the consolidated dataset
    #[arg(short, long, global = true, env = "HARVEST_OUTPUT_DIR", default_value = "data")]
    output_dir: PathBuf,

    /// Exclusive upper bound of the id space
    #[arg(short, long, global = true, env = "HARVEST_MAX_ID", default_value = "10000")]
    max_id: u64,

    /// First id to crawl
    #[arg(long, global = true, env = "HARVEST_START_ID", default_value = "1")]
    start_id: u64,

    /// Catalog URL the book id is appended to
    #[arg(
        long,
        global = true,
        env = "HARVEST_BASE_URL",
        default_value = "https://www.goodreads.com/book/show/"
    )]
    base_url: String,

    /// Genre allow-list file, one label per line (built-in list if omitted)
    #[arg(short, long, global = true, env = "HARVEST_GENRES")]
    genres: Option<PathBuf>,

    /// Number of concurrent fetches
    #[arg(short, long, global = true, env = "HARVEST_CONCURRENCY", default_value = "1")]
    concurrency: usize,

    /// Maximum number of requests per second
    #[arg(short, long, global = true, env = "HARVEST_REQUESTS_PER_SECOND", default_value = "1")]
    requests_per_second: u32,

    /// Consecutive backoff rounds without progress before giving up
    #[arg(long, global = true, env = "HARVEST_MAX_RETRIES", default_value = "5")]
    max_retries: u32,

    /// First backoff delay in seconds after a rate limit
    #[arg(long, global = true, env = "HARVEST_BACKOFF_SECS", default_value = "60")]
    backoff_secs: u64,

    /// Ceiling for the backoff delay in seconds
    #[arg(long, global = true, env = "HARVEST_MAX_BACKOFF_SECS", default_value = "900")]
    max_backoff_secs: u64,

    /// Per-request timeout in seconds
    #[arg(long, global = true, env = "HARVEST_TIMEOUT_SECS", default_value = "30")]
    timeout_secs: u64,

    /// User agent sent with every request
    #[arg(long, global = true, env = "HARVEST_USER_AGENT")]
    user_agent: Option<String>,

    /// Directory for a daily log file with the per-id trail
    #[arg(long, global = true, env = "HARVEST_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

impl HarvestArgs {
    fn config(&self) -> HarvestConfig {
        let mut builder = HarvestConfig::builder()
            .output_dir(self.output_dir.clone())
            .start_id(self.start_id)
            .max_id(self.max_id)
            .base_url(self.base_url.clone())
            .genres_path(self.genres.clone())
            .concurrency(self.concurrency)
            .requests_per_second(self.requests_per_second)
            .max_retries(self.max_retries)
            .backoff_secs(self.backoff_secs)
            .max_backoff_secs(self.max_backoff_secs)
            .timeout_secs(self.timeout_secs);
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        builder.build()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    let _otel = telemetry::init_tracing_subscriber(cli.harvest.log_dir.as_deref())?;

    let config = cli.harvest.config();
    config.validate()?;

    let started = Instant::now();

    // Execute the appropriate command
    match cli.command {
        None => {
            let summary = crawl_command(&config).await?;
            print_crawl_summary(&summary);
            aggregate_command(&config).await?;
        }
        Some(Commands::Crawl) => {
            let summary = crawl_command(&config).await?;
            print_crawl_summary(&summary);
        }
        Some(Commands::Aggregate) => {
            aggregate_command(&config).await?;
        }
    }

    println!(
        "Done. Metadata files are in {} (run time {:.2?})",
        config.output_dir.display(),
        started.elapsed()
    );

    Ok(())
}

#[instrument(skip(config))]
async fn crawl_command(config: &HarvestConfig) -> anyhow::Result<CrawlSummary> {
    let vocabulary = match &config.genres_path {
        Some(path) => GenreVocabulary::load(path).await?,
        None => GenreVocabulary::default(),
    };
    info!("Using {} genre labels", vocabulary.len());

    let store = FileRecordStore::at(&config.output_dir);
    store
        .ensure_directories()
        .await
        .with_context(|| format!("Failed to create {}", config.output_dir.display()))?;

    let fetcher = HttpFetcher::new(config)?;

    println!(
        "Crawling ids {}..{} into {}",
        config.start_id,
        config.max_id,
        config.output_dir.display()
    );

    // Create a channel for progress updates
    let (progress_sender, mut progress_receiver) = mpsc::channel(100);

    let progress_bar = ProgressBar::new(config.id_count());
    progress_bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({eta}) {msg}")?
            .progress_chars("##-"),
    );

    // Spawn a task to process progress updates
    let progress_handle = tokio::spawn({
        let progress_bar = progress_bar.clone();
        async move {
            while let Some(update) = progress_receiver.recv().await {
                match update {
                    CrawlProgress::Resumed { pending, total } => {
                        progress_bar.set_position(total - pending);
                        progress_bar.set_message(format!("{} ids pending", pending));
                    }
                    CrawlProgress::Processed {
                        book_id,
                        position,
                        persisted,
                        ..
                    } => {
                        progress_bar.set_position(position);
                        if persisted {
                            progress_bar.set_message(format!("stored {}", book_id));
                        } else {
                            progress_bar.set_message(format!("skipped {}", book_id));
                        }
                    }
                    CrawlProgress::BackingOff { round, delay } => {
                        progress_bar.set_message(format!(
                            "rate limited, waiting {}s (retry {})",
                            delay.as_secs(),
                            round
                        ));
                    }
                }
            }
            progress_bar.finish_with_message("crawl finished");
        }
    });

    let scheduler = CrawlScheduler::new(fetcher, store, vocabulary, config)
        .with_progress(progress_sender);
    let result = scheduler.run().await;

    // Dropping the scheduler closes the channel and ends the progress task
    drop(scheduler);
    let _ = progress_handle.await;

    Ok(result?)
}

#[instrument(skip(config))]
async fn aggregate_command(config: &HarvestConfig) -> anyhow::Result<()> {
    let store = FileRecordStore::at(&config.output_dir);

    let dataset = Aggregator::run(&store).await?;
    let written = Aggregator::export(&dataset, &FileDatasetSink::new(store)).await?;

    println!("Consolidated {} records", dataset.len());
    for path in written {
        println!("  {}", path.display());
    }

    Ok(())
}

fn print_crawl_summary(summary: &CrawlSummary) {
    println!();
    println!(
        "Crawl started {}",
        summary.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("  Stored:         {}", summary.persisted);
    println!("  Skipped:        {}", summary.skipped);
    println!("  Already stored: {}", summary.already_stored);
    println!("  Backoff rounds: {}", summary.retry_rounds);
    println!("  Elapsed:        {:.2?}", summary.elapsed);
}
