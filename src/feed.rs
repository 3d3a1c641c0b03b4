//! Paginated feed retrieval.
//!
//! Pages are fetched strictly in order because the decision to stop depends on
//! the previous page. The stop rule lives in [`PageTermination`] so another
//! upstream can swap it without touching the pipeline.

use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const USER_AGENT: &str = "Mozilla/5.0 (compatible; boardwatch/0.1)";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub const JOBS_PER_PAGE: usize = 10;
pub const MAX_PAGES: u32 = 20;
pub const FETCH_RETRIES: u32 = 2;
pub const FETCH_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed feed: {0}")]
    Parse(#[from] rss::Error),
}

/// One entry exactly as the upstream feed described it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawListing {
    pub guid: Option<String>,
    pub title: String,
    pub link: String,
    pub published: Option<String>,
    pub company: Option<String>,
    pub description_html: String,
}

impl RawListing {
    pub fn from_item(item: &rss::Item) -> Self {
        let company = item
            .extensions()
            .get("job_listing")
            .and_then(|ext| ext.get("company"))
            .and_then(|values| values.first())
            .and_then(|value| value.value())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let description_html = item
            .content()
            .filter(|c| !c.trim().is_empty())
            .or_else(|| item.description())
            .unwrap_or_default()
            .to_string();

        Self {
            guid: item.guid().map(|g| g.value().to_string()),
            title: item.title().unwrap_or_default().trim().to_string(),
            link: item.link().unwrap_or_default().trim().to_string(),
            published: item.pub_date().map(str::to_string),
            company,
            description_html,
        }
    }
}

pub trait FeedSource {
    /// Fetches one page (1-based). A single attempt; retries belong to the caller.
    fn fetch_page(&self, page: u32) -> Result<Vec<RawListing>, FetchError>;
}

pub fn parse_page(body: &[u8]) -> Result<Vec<RawListing>, FetchError> {
    let channel = rss::Channel::read_from(body)?;
    Ok(channel.items().iter().map(RawListing::from_item).collect())
}

pub fn page_url(base: &str, page: u32) -> String {
    if page <= 1 {
        return base.to_string();
    }
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{}{}paged={}", base, sep, page)
}

pub struct HttpFeedSource {
    url: String,
    client: reqwest::blocking::Client,
}

impl HttpFeedSource {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }
}

impl FeedSource for HttpFeedSource {
    fn fetch_page(&self, page: u32) -> Result<Vec<RawListing>, FetchError> {
        let response = self
            .client
            .get(page_url(&self.url, page))
            .send()?
            .error_for_status()?;
        let body = response.bytes()?;
        parse_page(&body)
    }
}

/// Decides whether a page with `entries` items is the last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTermination {
    /// Stop on an empty page or one shorter than a full page.
    ShortPage { page_size: usize },
    /// Stop only on an empty page.
    #[cfg_attr(not(test), allow(dead_code))]
    EmptyPage,
}

impl PageTermination {
    pub fn is_last_page(&self, entries: usize) -> bool {
        match self {
            PageTermination::ShortPage { page_size } => entries == 0 || entries < *page_size,
            PageTermination::EmptyPage => entries == 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: FETCH_RETRIES,
            delay: FETCH_RETRY_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchPlan {
    pub termination: PageTermination,
    pub retry: RetryPolicy,
    pub max_pages: u32,
}

impl Default for FetchPlan {
    fn default() -> Self {
        Self {
            termination: PageTermination::ShortPage {
                page_size: JOBS_PER_PAGE,
            },
            retry: RetryPolicy::default(),
            max_pages: MAX_PAGES,
        }
    }
}

#[derive(Debug, Default)]
pub struct BoardFetch {
    pub listings: Vec<RawListing>,
    pub pages_fetched: u32,
    /// Page that failed after all retries, if pagination ended that way.
    pub failed_page: Option<u32>,
}

impl BoardFetch {
    /// True when not even the first page could be retrieved.
    pub fn is_unavailable(&self) -> bool {
        self.pages_fetched == 0 && self.failed_page.is_some()
    }
}

/// Tries a page `1 + retries` times with a fixed delay between attempts.
pub fn fetch_with_retry(
    source: &dyn FeedSource,
    page: u32,
    retry: &RetryPolicy,
) -> Option<Vec<RawListing>> {
    let attempts = retry.retries + 1;
    for attempt in 1..=attempts {
        match source.fetch_page(page) {
            Ok(listings) => return Some(listings),
            Err(e) => {
                warn!(
                    "Attempt {}/{} fetching feed page {} failed: {}",
                    attempt, attempts, page, e
                );
                if attempt < attempts && !retry.delay.is_zero() {
                    thread::sleep(retry.delay);
                }
            }
        }
    }
    None
}

/// Walks the feed until the termination rule, a failed page, or the page cap.
pub fn collect_board(source: &dyn FeedSource, plan: &FetchPlan) -> BoardFetch {
    let mut board = BoardFetch::default();

    for page in 1..=plan.max_pages {
        let Some(page_listings) = fetch_with_retry(source, page, &plan.retry) else {
            board.failed_page = Some(page);
            break;
        };
        let count = page_listings.len();
        board.pages_fetched = page;
        board.listings.extend(page_listings);

        if count > 0 {
            info!(
                "Page {}: found {} jobs (total: {})",
                page,
                count,
                board.listings.len()
            );
        }
        if plan.termination.is_last_page(count) {
            break;
        }
        if page == plan.max_pages {
            warn!("Stopped at the {}-page ceiling; feed may be looping", plan.max_pages);
        }
    }

    board
}
