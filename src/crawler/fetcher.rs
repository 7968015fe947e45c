//! Page retrieval for catalog ids
//!
//! The scheduler only sees the `Fetcher` trait; `HttpFetcher` is the reqwest
//! implementation used by the CLI.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client as ReqwestClient, StatusCode};
use tracing::{debug, debug_span, instrument, Instrument};
use url::Url;

use super::config::HarvestConfig;
use super::error::FetchError;
use super::BookId;

/// Raw body of one catalog page
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Id the page was fetched for
    pub book_id: BookId,

    /// Locator the page was fetched from
    pub url: String,

    /// HTML body
    pub html: String,
}

/// Retrieves the catalog page for an id
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the page for `book_id`
    async fn fetch(&self, book_id: BookId) -> Result<FetchedPage, FetchError>;
}

#[async_trait]
impl<T: Fetcher + ?Sized> Fetcher for &T {
    async fn fetch(&self, book_id: BookId) -> Result<FetchedPage, FetchError> {
        (**self).fetch(book_id).await
    }
}

#[async_trait]
impl<T: Fetcher + ?Sized> Fetcher for Arc<T> {
    async fn fetch(&self, book_id: BookId) -> Result<FetchedPage, FetchError> {
        (**self).fetch(book_id).await
    }
}

/// HTTP fetcher with a request rate cap
#[derive(Clone)]
pub struct HttpFetcher {
    client: ReqwestClient,
    base_url: Url,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl HttpFetcher {
    /// Create a fetcher from the harvest configuration
    pub fn new(config: &HarvestConfig) -> Result<Self, FetchError> {
        let client = ReqwestClient::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .build()?;

        // Url::join replaces the last segment unless the base ends with '/'
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }

        let rate = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            client,
            base_url: Url::parse(&base)?,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(rate))),
        })
    }

    /// Locator for an id
    pub fn url_for(&self, book_id: BookId) -> Result<Url, FetchError> {
        Ok(self.base_url.join(&book_id.to_string())?)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self), fields(book_id = %book_id))]
    async fn fetch(&self, book_id: BookId) -> Result<FetchedPage, FetchError> {
        let url = self.url_for(book_id)?;

        self.limiter
            .until_ready()
            .instrument(debug_span!("limiter"))
            .await;

        debug!("Sending GET request to {}", url);
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();

        if status.is_success() {
            let html = response.text().await?;
            return Ok(FetchedPage {
                book_id,
                url: url.to_string(),
                html,
            });
        }

        debug!("Catalog answered {} for {}", status, url);
        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                Err(FetchError::RateLimited { retry_after })
            }
            StatusCode::NOT_FOUND => Err(FetchError::NotFound {
                url: url.to_string(),
            }),
            _ => Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            }),
        }
    }
}
