use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use anyhow::Context;
use serde::Serialize;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    FromRow, SqliteConnection, SqlitePool,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::FeedConfig;
use crate::fetcher::{validate_url, ParsedItem};
use crate::retention::{RetentionPolicy, StoredEntry};

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Feed {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub max_items: i64,
    pub last_fetched: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
}

/// A feed together with the number of visible items it holds.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct FeedSummary {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub feed: Feed,
    pub item_count: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Item {
    pub id: i64,
    pub feed_id: i64,
    pub guid: String,
    pub title: String,
    pub link: String,
    pub description: String,
    pub author: Option<String>,
    pub published: Option<String>,
    pub ingested_at: String,
    pub hidden: bool,
}

impl Item {
    /// Publish time, falling back to ingestion time.
    pub fn effective_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.published.as_deref().unwrap_or(&self.ingested_at);
        parse_timestamp(raw).ok()
    }
}

/// An item joined with the feed it came from, for merged exports.
#[derive(Debug, Clone, FromRow)]
pub struct SourcedItem {
    #[sqlx(flatten)]
    pub item: Item,
    pub feed_name: String,
    pub feed_url: String,
}

#[derive(Debug, Clone)]
pub struct NewFeed {
    pub name: String,
    pub url: String,
    pub max_items: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub inserted: usize,
    pub deleted: usize,
}

/// Fixed-precision RFC 3339 so that text order matches time order.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

/// True when the error comes from a UNIQUE constraint, such as a second
/// feed with the same URL.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .map_or(false, |e| e.is_unique_violation())
}

pub struct Database {
    pool: SqlitePool,
    feed_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // An in-memory database lives only as long as its connection
        let pool_options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options.connect_with(options).await?;

        Ok(Self {
            pool,
            feed_locks: Mutex::new(HashMap::new()),
        })
    }

    pub async fn initialize(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                url TEXT NOT NULL UNIQUE,
                max_items INTEGER NOT NULL DEFAULT 30 CHECK (max_items > 0),
                last_fetched TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                guid TEXT NOT NULL,
                title TEXT NOT NULL,
                link TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                author TEXT,
                published TEXT,
                ingested_at TEXT NOT NULL,
                hidden INTEGER NOT NULL DEFAULT 0,
                UNIQUE(feed_id, link)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_items_feed_effective
            ON items(feed_id, COALESCE(published, ingested_at) DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Serializes writes to one feed's item set.
    pub async fn lock_feed(&self, feed_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.feed_locks.lock().await;
            locks.entry(feed_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Upsert feeds listed in the config file, keyed by URL.
    pub async fn sync_feeds(
        &self,
        configs: &[FeedConfig],
        default_max_items: i64,
    ) -> anyhow::Result<()> {
        let now = format_timestamp(Utc::now());
        for config in configs {
            // Stored in the same normalized form the API registers
            let url = validate_url(&config.url)
                .with_context(|| format!("Invalid URL for feed '{}'", config.name))?
                .to_string();
            sqlx::query(
                r#"
                INSERT INTO feeds (name, url, max_items, created_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(url) DO UPDATE SET
                    name = excluded.name,
                    max_items = excluded.max_items
                "#,
            )
            .bind(&config.name)
            .bind(&url)
            .bind(config.max_items.unwrap_or(default_max_items))
            .bind(&now)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn create_feed(&self, new_feed: &NewFeed) -> anyhow::Result<Feed> {
        let id = sqlx::query(
            "INSERT INTO feeds (name, url, max_items, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&new_feed.name)
        .bind(&new_feed.url)
        .bind(new_feed.max_items)
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_feed(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Feed {} vanished after insert", id))
    }

    pub async fn get_all_feeds(&self) -> anyhow::Result<Vec<Feed>> {
        let feeds = sqlx::query_as::<_, Feed>("SELECT * FROM feeds ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(feeds)
    }

    pub async fn get_feed_summaries(&self) -> anyhow::Result<Vec<FeedSummary>> {
        let feeds = sqlx::query_as::<_, FeedSummary>(
            r#"
            SELECT feeds.*, COUNT(items.id) AS item_count
            FROM feeds
            LEFT JOIN items ON items.feed_id = feeds.id AND items.hidden = 0
            GROUP BY feeds.id
            ORDER BY feeds.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    pub async fn get_feed(&self, feed_id: i64) -> anyhow::Result<Option<Feed>> {
        let feed = sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE id = ?")
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    pub async fn get_feed_by_url(&self, url: &str) -> anyhow::Result<Option<Feed>> {
        let feed = sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    /// Returns `None` when no feed has this id.
    pub async fn update_feed(
        &self,
        feed_id: i64,
        name: Option<&str>,
        max_items: Option<i64>,
    ) -> anyhow::Result<Option<Feed>> {
        let _guard = self.lock_feed(feed_id).await;
        let result = sqlx::query(
            r#"
            UPDATE feeds
            SET name = COALESCE(?, name), max_items = COALESCE(?, max_items)
            WHERE id = ?
            "#,
        )
        .bind(name)
        .bind(max_items)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_feed(feed_id).await
    }

    /// Deletes the feed and, through the foreign key, all of its items.
    pub async fn delete_feed(&self, feed_id: i64) -> anyhow::Result<bool> {
        let _guard = self.lock_feed(feed_id).await;
        let result = sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            self.feed_locks.lock().await.remove(&feed_id);
        }
        Ok(deleted)
    }

    pub async fn get_items_for_feed(
        &self,
        feed_id: i64,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<Item>> {
        let items = sqlx::query_as::<_, Item>(
            r#"
            SELECT * FROM items
            WHERE feed_id = ? AND hidden = 0
            ORDER BY COALESCE(published, ingested_at) DESC, id ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(feed_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    pub async fn get_item_count_for_feed(&self, feed_id: i64) -> anyhow::Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM items WHERE feed_id = ? AND hidden = 0")
                .bind(feed_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0)
    }

    /// Counts every stored row, hidden ones included.
    pub async fn get_stored_count_for_feed(&self, feed_id: i64) -> anyhow::Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    /// Newest visible items across all feeds.
    pub async fn get_recent_items(&self, limit: i64) -> anyhow::Result<Vec<SourcedItem>> {
        let items = sqlx::query_as::<_, SourcedItem>(
            r#"
            SELECT items.*, feeds.name AS feed_name, feeds.url AS feed_url
            FROM items
            JOIN feeds ON feeds.id = items.feed_id
            WHERE items.hidden = 0
            ORDER BY COALESCE(items.published, items.ingested_at) DESC, items.id ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    pub async fn get_item(&self, item_id: i64) -> anyhow::Result<Option<Item>> {
        let item = sqlx::query_as::<_, Item>("SELECT * FROM items WHERE id = ?")
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(item)
    }

    /// Hidden items keep their link reserved, so a refresh will not bring
    /// them back, but they are never listed or exported.
    pub async fn hide_item(&self, item_id: i64) -> anyhow::Result<bool> {
        let Some(item) = self.get_item(item_id).await? else {
            return Ok(false);
        };
        let _guard = self.lock_feed(item.feed_id).await;
        let result = sqlx::query("UPDATE items SET hidden = 1 WHERE id = ?")
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_item(&self, item_id: i64) -> anyhow::Result<bool> {
        let Some(item) = self.get_item(item_id).await? else {
            return Ok(false);
        };
        let _guard = self.lock_feed(item.feed_id).await;
        let result = sqlx::query("DELETE FROM items WHERE id = ?")
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Creates a feed together with its first items in one transaction, so
    /// a failure leaves no feed row behind.
    pub async fn register_feed(
        &self,
        new_feed: &NewFeed,
        max_age: chrono::Duration,
        parsed: Vec<ParsedItem>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<(Feed, RetentionReport)> {
        let mut tx = self.pool.begin().await?;
        let created_at = format_timestamp(now);

        let id = sqlx::query(
            r#"
            INSERT INTO feeds (name, url, max_items, last_fetched, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new_feed.name)
        .bind(&new_feed.url)
        .bind(new_feed.max_items)
        .bind(&created_at)
        .bind(&created_at)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let report = retain(&mut *tx, id, max_age, parsed, now).await?;
        let feed = sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok((feed, report))
    }

    /// Runs the retention policy for one feed against freshly parsed items
    /// and applies the outcome atomically.
    pub async fn apply_retention(
        &self,
        feed_id: i64,
        max_age: chrono::Duration,
        parsed: Vec<ParsedItem>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<RetentionReport> {
        let _guard = self.lock_feed(feed_id).await;
        let mut tx = self.pool.begin().await?;
        let report = retain(&mut *tx, feed_id, max_age, parsed, now).await?;
        tx.commit().await?;
        Ok(report)
    }

    pub async fn update_feed_fetched(
        &self,
        feed_id: i64,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        let now = format_timestamp(Utc::now());
        sqlx::query("UPDATE feeds SET last_fetched = ?, last_error = ? WHERE id = ?")
            .bind(&now)
            .bind(error)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

async fn retain(
    conn: &mut SqliteConnection,
    feed_id: i64,
    max_age: chrono::Duration,
    parsed: Vec<ParsedItem>,
    now: DateTime<Utc>,
) -> anyhow::Result<RetentionReport> {
    // A write as the first statement takes SQLite's write lock before any
    // read, so the transaction never has to upgrade a read lock.
    let cap: Option<(i64,)> = sqlx::query_as(
        "UPDATE feeds SET max_items = max_items WHERE id = ? RETURNING max_items",
    )
    .bind(feed_id)
    .fetch_optional(&mut *conn)
    .await?;
    let Some((max_items,)) = cap else {
        return Ok(RetentionReport::default());
    };
    let policy = RetentionPolicy::new(max_items, max_age);

    let rows: Vec<(i64, String, Option<String>, String)> =
        sqlx::query_as("SELECT id, link, published, ingested_at FROM items WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_all(&mut *conn)
            .await?;

    let stored = rows
        .into_iter()
        .map(|(id, link, published, ingested_at)| {
            let effective_at = parse_timestamp(published.as_deref().unwrap_or(&ingested_at))?;
            Ok(StoredEntry {
                id,
                link,
                effective_at,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let plan = policy.plan(&stored, parsed, now);

    for id in &plan.delete {
        sqlx::query("DELETE FROM items WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }

    let ingested_at = format_timestamp(now);
    for fresh in &plan.insert {
        let item = &fresh.item;
        sqlx::query(
            r#"
            INSERT INTO items
                (feed_id, guid, title, link, description, author, published, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(feed_id, link) DO NOTHING
            "#,
        )
        .bind(feed_id)
        .bind(&item.guid)
        .bind(&item.title)
        .bind(&item.link)
        .bind(&item.description)
        .bind(item.author.as_deref())
        .bind(item.published.map(format_timestamp))
        .bind(&ingested_at)
        .execute(&mut *conn)
        .await?;
    }

    Ok(RetentionReport {
        inserted: plan.insert.len(),
        deleted: plan.delete.len(),
    })
}
