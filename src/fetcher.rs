use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use feed_rs::{model::Entry, parser};
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::config::Config;
use crate::db::{Database, Feed, RetentionReport};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid feed URL: {0}")]
    InvalidUrl(String),
    #[error("Request failed: {0}")]
    Network(reqwest::Error),
    #[error("Request timed out")]
    Timeout,
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Network(err)
        }
    }
}

/// One normalized upstream entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedItem {
    pub guid: String,
    pub title: String,
    pub link: String,
    pub description: String,
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub items: Vec<ParsedItem>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub refreshed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Completed(RefreshSummary),
    AlreadyRunning,
}

/// Accepts absolute http(s) URLs with a host.
pub fn validate_url(raw: &str) -> Result<Url, FetchError> {
    let url = Url::parse(raw.trim()).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(FetchError::InvalidUrl(format!(
                "unsupported scheme: {}",
                scheme
            )))
        }
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(FetchError::InvalidUrl("URL has no host".to_string()));
    }

    Ok(url)
}

/// Parse an RSS or Atom document.
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, FetchError> {
    let parsed = parser::parse(bytes).map_err(|e| FetchError::Parse(e.to_string()))?;

    let items = parsed.entries.into_iter().filter_map(entry_to_item).collect();

    Ok(ParsedFeed {
        title: parsed
            .title
            .map(|t| t.content.trim().to_string())
            .filter(|t| !t.is_empty()),
        items,
    })
}

fn entry_to_item(entry: Entry) -> Option<ParsedItem> {
    let title = entry
        .title
        .map(|t| t.content.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "Untitled".to_string());

    let link = entry
        .links
        .first()
        .map(|l| l.href.trim().to_string())
        .unwrap_or_default();

    if link.is_empty() {
        warn!("Skipping entry with no link: {}", title);
        return None;
    }

    let description = entry
        .summary
        .map(|s| s.content)
        .or_else(|| entry.content.and_then(|c| c.body))
        .unwrap_or_default();

    let author = entry
        .authors
        .into_iter()
        .map(|p| p.name.trim().to_string())
        .find(|name| !name.is_empty());

    Some(ParsedItem {
        guid: entry.id,
        title,
        link,
        description,
        author,
        published: entry.published.or(entry.updated),
    })
}

pub struct Fetcher {
    client: Client,
    db: Arc<Database>,
    refreshing: AtomicBool,
    retention_window: chrono::Duration,
}

/// Clears the refreshing flag when a refresh-all ends, including when its
/// future is dropped mid-run.
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Fetcher {
    pub fn new(db: Arc<Database>, config: &Config) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout))
            .user_agent("RssCache/1.0 (RSS Proxy)")
            .build()?;

        Ok(Self {
            client,
            db,
            refreshing: AtomicBool::new(false),
            retention_window: config.retention_window(),
        })
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    pub async fn refresh_all_feeds(&self) -> anyhow::Result<RefreshOutcome> {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("Refresh already in progress, skipping");
            return Ok(RefreshOutcome::AlreadyRunning);
        }
        let _guard = RefreshGuard(&self.refreshing);

        self.do_refresh_all().await.map(RefreshOutcome::Completed)
    }

    async fn do_refresh_all(&self) -> anyhow::Result<RefreshSummary> {
        let feeds = self.db.get_all_feeds().await?;
        info!("Refreshing {} feeds", feeds.len());

        let mut summary = RefreshSummary::default();
        for feed in feeds {
            match self.refresh_feed(&feed).await {
                Ok(_) => summary.refreshed += 1,
                Err(_) => summary.failed += 1,
            }
        }

        info!(
            "Feed refresh complete: {} refreshed, {} failed",
            summary.refreshed, summary.failed
        );
        Ok(summary)
    }

    /// Fetch one feed and apply retention, recording the outcome on the feed.
    ///
    /// A failed fetch leaves stored items untouched apart from the usual
    /// age and cap pruning, and is returned as an error.
    pub async fn refresh_feed(&self, feed: &Feed) -> anyhow::Result<RetentionReport> {
        info!("Fetching feed: {} ({})", feed.name, feed.url);

        match self.fetch_feed(&feed.url).await {
            Ok(parsed) => {
                let report = self
                    .db
                    .apply_retention(feed.id, self.retention_window, parsed.items, Utc::now())
                    .await?;
                info!(
                    "Feed '{}': {} new, {} pruned",
                    feed.name, report.inserted, report.deleted
                );
                if let Err(e) = self.db.update_feed_fetched(feed.id, None).await {
                    warn!("Failed to record refresh for feed '{}': {}", feed.name, e);
                }
                Ok(report)
            }
            Err(fetch_err) => {
                error!("Failed to refresh feed '{}': {}", feed.name, fetch_err);
                let message = fetch_err.to_string();
                if let Err(e) = self.db.update_feed_fetched(feed.id, Some(&message)).await {
                    warn!("Failed to record error for feed '{}': {}", feed.name, e);
                }
                if let Err(e) = self.prune_feed(feed).await {
                    error!("Failed to prune feed '{}': {}", feed.name, e);
                }
                Err(fetch_err.into())
            }
        }
    }

    /// Apply age and cap pruning without fetching anything.
    pub async fn prune_feed(&self, feed: &Feed) -> anyhow::Result<RetentionReport> {
        self.db
            .apply_retention(feed.id, self.retention_window, Vec::new(), Utc::now())
            .await
    }

    pub async fn fetch_feed(&self, url: &str) -> Result<ParsedFeed, FetchError> {
        let url = validate_url(url)?;

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let bytes = response.bytes().await?;
        parse_feed(&bytes)
    }
}

pub async fn start_background_refresh(fetcher: Arc<Fetcher>, interval_minutes: u64) {
    let interval = Duration::from_secs(interval_minutes.saturating_mul(60));

    info!("Starting initial feed fetch");
    if let Err(e) = fetcher.refresh_all_feeds().await {
        error!("Initial feed fetch failed: {}", e);
    }

    loop {
        tokio::time::sleep(interval).await;
        info!("Starting scheduled feed refresh");
        if let Err(e) = fetcher.refresh_all_feeds().await {
            error!("Scheduled feed refresh failed: {}", e);
        }
    }
}
