//! Integration tests for the rss-cache service
//!
//! These tests drive the full path from upstream fetch through retention to
//! the RSS export, against on-disk databases and mocked upstream feeds.

use std::io::Write;
use tempfile::NamedTempFile;

mod common {
    use std::sync::Arc;

    use chrono::{DateTime, Utc};
    use rss_cache::config::Config;
    use rss_cache::db::Database;
    use rss_cache::fetcher::Fetcher;
    use rss_cache::routes::AppState;
    use tempfile::TempDir;

    /// Create a temporary directory for test databases
    pub fn create_temp_dir() -> TempDir {
        tempfile::tempdir().expect("Failed to create temp directory")
    }

    /// Create a test database path
    pub fn create_db_path(temp_dir: &TempDir) -> String {
        let db_path = temp_dir.path().join("test.db");
        format!("sqlite:{}?mode=rwc", db_path.display())
    }

    pub async fn create_db(temp_dir: &TempDir) -> Arc<Database> {
        let db = Database::new(&create_db_path(temp_dir)).await.unwrap();
        db.initialize().await.unwrap();
        Arc::new(db)
    }

    pub fn test_config() -> Config {
        Config {
            fetch_timeout: 5,
            public_url: "http://cache.test".to_string(),
            ..Config::default()
        }
    }

    pub fn create_state(db: Arc<Database>, config: Config) -> Arc<AppState> {
        let fetcher = Arc::new(Fetcher::new(db.clone(), &config).unwrap());
        Arc::new(AppState {
            db,
            fetcher,
            config: Arc::new(config),
        })
    }

    /// An RSS document with one item per (slug, publish time).
    pub fn rss(title: &str, items: &[(&str, DateTime<Utc>)]) -> String {
        let items: String = items
            .iter()
            .map(|(slug, published)| {
                format!(
                    r#"
                    <item>
                        <title>{slug}</title>
                        <link>https://upstream.example.com/{slug}</link>
                        <guid>{slug}</guid>
                        <description>About {slug}</description>
                        <pubDate>{}</pubDate>
                    </item>"#,
                    published.to_rfc2822()
                )
            })
            .collect();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
            <rss version="2.0">
                <channel>
                    <title>{title}</title>
                    <link>https://upstream.example.com</link>
                    <description>Upstream</description>
                    {items}
                </channel>
            </rss>"#
        )
    }
}

#[cfg(test)]
mod config_integration_tests {
    use super::*;
    use rss_cache::config::Config;

    #[test]
    fn test_load_actual_feeds_config() {
        // Test loading the actual feeds.toml from the project
        let config = Config::load("feeds.toml");
        assert!(config.is_ok(), "Failed to load feeds.toml: {:?}", config.err());

        let config = config.unwrap();
        assert!(!config.feeds.is_empty(), "feeds.toml should have at least one feed");
        assert!(config.refresh_interval > 0, "refresh_interval should be positive");
        assert!(config.feeds.iter().all(|f| f.max_items.map_or(true, |n| n > 0)));
    }

    #[test]
    fn test_config_from_file() {
        let toml_content = r#"
            refresh_interval = 15
            export_limit = 50

            [[feeds]]
            name = "Hacker News"
            url = "https://news.ycombinator.com/rss"
            max_items = 10

            [[feeds]]
            name = "Tech Blog"
            url = "https://blog.example.com/feed.xml"
        "#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.refresh_interval, 15);
        assert_eq!(config.export_limit, 50);
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.feeds[0].max_items, Some(10));
        assert_eq!(config.feeds[1].max_items, None);
    }
}

#[cfg(test)]
mod retention_integration_tests {
    use super::common::*;
    use chrono::{Duration, Utc};
    use rss_cache::db::NewFeed;
    use rss_cache::fetcher::{Fetcher, ParsedItem};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_feed(server: &MockServer, body: String) {
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_cap_keeps_newest_items() {
        let temp_dir = create_temp_dir();
        let db = create_db(&temp_dir).await;
        let server = MockServer::start().await;

        let now = Utc::now();
        let items: Vec<_> = ["t1", "t2", "t3", "t4", "t5"]
            .iter()
            .enumerate()
            .map(|(i, slug)| (*slug, now - Duration::hours(5 - i as i64)))
            .collect();
        mount_feed(&server, rss("Five", &items)).await;

        let feed = db
            .create_feed(&NewFeed {
                name: "Capped".to_string(),
                url: format!("{}/feed.xml", server.uri()),
                max_items: 3,
            })
            .await
            .unwrap();
        let fetcher = Fetcher::new(db.clone(), &test_config()).unwrap();

        fetcher.refresh_feed(&feed).await.unwrap();

        let stored = db.get_items_for_feed(feed.id, 10, 0).await.unwrap();
        let titles: Vec<_> = stored.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["t5", "t4", "t3"]);
    }

    #[tokio::test]
    async fn test_expired_item_removed_on_next_refresh() {
        let temp_dir = create_temp_dir();
        let db = create_db(&temp_dir).await;
        let server = MockServer::start().await;

        let now = Utc::now();
        mount_feed(&server, rss("Fresh", &[("fresh", now - Duration::hours(1))])).await;

        let feed = db
            .create_feed(&NewFeed {
                name: "Aging".to_string(),
                url: format!("{}/feed.xml", server.uri()),
                max_items: 30,
            })
            .await
            .unwrap();

        // Stored two days ago, when an item published eight days ago was still in the window
        let old = ParsedItem {
            guid: "old".to_string(),
            title: "old".to_string(),
            link: "https://upstream.example.com/old".to_string(),
            description: String::new(),
            author: None,
            published: Some(now - Duration::days(8)),
        };
        db.apply_retention(feed.id, Duration::days(7), vec![old], now - Duration::days(2))
            .await
            .unwrap();
        assert_eq!(db.get_stored_count_for_feed(feed.id).await.unwrap(), 1);

        let fetcher = Fetcher::new(db.clone(), &test_config()).unwrap();
        fetcher.refresh_feed(&feed).await.unwrap();

        let stored = db.get_items_for_feed(feed.id, 10, 0).await.unwrap();
        let titles: Vec<_> = stored.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_unchanged_upstream_is_idempotent() {
        let temp_dir = create_temp_dir();
        let db = create_db(&temp_dir).await;
        let server = MockServer::start().await;

        let now = Utc::now();
        let items: Vec<_> = (0..6)
            .map(|i| (["a", "b", "c", "d", "e", "f"][i], now - Duration::minutes(i as i64 * 10)))
            .collect();
        mount_feed(&server, rss("Stable", &items)).await;

        let feed = db
            .create_feed(&NewFeed {
                name: "Stable".to_string(),
                url: format!("{}/feed.xml", server.uri()),
                max_items: 4,
            })
            .await
            .unwrap();
        let fetcher = Fetcher::new(db.clone(), &test_config()).unwrap();

        fetcher.refresh_feed(&feed).await.unwrap();
        let first = db.get_items_for_feed(feed.id, 10, 0).await.unwrap();

        let report = fetcher.refresh_feed(&feed).await.unwrap();
        let second = db.get_items_for_feed(feed.id, 10, 0).await.unwrap();

        assert_eq!(report.inserted, 0);
        assert_eq!(report.deleted, 0);
        let ids = |items: &[rss_cache::db::Item]| items.iter().map(|i| i.id).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(first.len(), 4);
    }

    #[tokio::test]
    async fn test_refresh_all_bounds_every_feed() {
        let temp_dir = create_temp_dir();
        let db = create_db(&temp_dir).await;
        let server = MockServer::start().await;

        let now = Utc::now();
        let items: Vec<_> = ["p", "q", "r", "s"]
            .iter()
            .enumerate()
            .map(|(i, slug)| (*slug, now - Duration::hours(i as i64)))
            .collect();
        mount_feed(&server, rss("Shared", &items)).await;

        for (name, cap) in [("Two", 2), ("Three", 3)] {
            db.create_feed(&NewFeed {
                name: name.to_string(),
                url: format!("{}/feed.xml?{}", server.uri(), name),
                max_items: cap,
            })
            .await
            .unwrap();
        }
        db.create_feed(&NewFeed {
            name: "Broken".to_string(),
            url: format!("{}/missing.xml", server.uri()),
            max_items: 5,
        })
        .await
        .unwrap();

        let fetcher = Fetcher::new(db.clone(), &test_config()).unwrap();
        let outcome = fetcher.refresh_all_feeds().await.unwrap();
        assert_eq!(
            outcome,
            rss_cache::fetcher::RefreshOutcome::Completed(rss_cache::fetcher::RefreshSummary {
                refreshed: 2,
                failed: 1,
            })
        );

        for feed in db.get_all_feeds().await.unwrap() {
            let count = db.get_stored_count_for_feed(feed.id).await.unwrap();
            assert!(count <= feed.max_items, "{} holds {} items", feed.name, count);
            if feed.name == "Broken" {
                assert!(feed.last_error.is_some());
            } else {
                assert_eq!(count, feed.max_items);
                assert!(feed.last_error.is_none());
            }
        }
    }
}

#[cfg(test)]
mod database_integration_tests {
    use super::common::*;
    use chrono::Utc;
    use rss_cache::config::FeedConfig;
    use rss_cache::db::Database;
    use rss_cache::fetcher::ParsedItem;

    #[tokio::test]
    async fn test_database_persistence() {
        let temp_dir = create_temp_dir();
        let db_url = create_db_path(&temp_dir);

        // Create database and add data
        {
            let db = Database::new(&db_url).await.unwrap();
            db.initialize().await.unwrap();

            let configs = vec![FeedConfig {
                name: "Persistent Feed".to_string(),
                url: "https://persistent.com/rss".to_string(),
                max_items: Some(5),
            }];
            db.sync_feeds(&configs, 30).await.unwrap();

            let feeds = db.get_all_feeds().await.unwrap();
            let item = ParsedItem {
                guid: "persistent-guid".to_string(),
                title: "Persistent Article".to_string(),
                link: "https://persistent.com/article".to_string(),
                description: String::new(),
                author: None,
                published: None,
            };
            db.apply_retention(feeds[0].id, chrono::Duration::days(7), vec![item], Utc::now())
                .await
                .unwrap();
        }

        // Reopen database and verify data persists
        {
            let db = Database::new(&db_url).await.unwrap();

            let feeds = db.get_all_feeds().await.unwrap();
            assert_eq!(feeds.len(), 1);
            assert_eq!(feeds[0].name, "Persistent Feed");
            assert_eq!(feeds[0].max_items, 5);

            let items = db.get_items_for_feed(feeds[0].id, 10, 0).await.unwrap();
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].title, "Persistent Article");
            assert!(items[0].published.is_none());
        }
    }

    #[tokio::test]
    async fn test_config_resync_updates_existing_feed() {
        let temp_dir = create_temp_dir();
        let db = create_db(&temp_dir).await;

        let initial = vec![FeedConfig {
            name: "Original Name".to_string(),
            url: "https://feed.example.com/rss".to_string(),
            max_items: None,
        }];
        db.sync_feeds(&initial, 30).await.unwrap();

        let updated = vec![FeedConfig {
            name: "Updated Name".to_string(),
            url: "https://feed.example.com/rss".to_string(),
            max_items: Some(12),
        }];
        db.sync_feeds(&updated, 30).await.unwrap();

        let feeds = db.get_all_feeds().await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].name, "Updated Name");
        assert_eq!(feeds[0].max_items, 12);
    }
}

#[cfg(test)]
mod end_to_end_tests {
    use super::common::*;
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use chrono::{Duration, Utc};
    use rss_cache::routes::router;
    use serde_json::{json, Value};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_register_then_export() {
        let temp_dir = create_temp_dir();
        let db = create_db(&temp_dir).await;
        let upstream = MockServer::start().await;

        let now = Utc::now();
        for (feed_path, slugs) in [("/alpha.xml", ["a1", "a2"]), ("/beta.xml", ["b1", "b2"])] {
            let items: Vec<_> = slugs
                .iter()
                .enumerate()
                .map(|(i, slug)| (*slug, now - Duration::minutes(i as i64 + 1)))
                .collect();
            Mock::given(method("GET"))
                .and(path(feed_path))
                .respond_with(ResponseTemplate::new(200).set_body_string(rss("Upstream", &items)))
                .mount(&upstream)
                .await;
        }

        let server = TestServer::new(router(create_state(db, test_config()))).unwrap();

        for (name, feed_path) in [("Alpha", "/alpha.xml"), ("Beta", "/beta.xml")] {
            let response = server
                .post("/api/feeds")
                .json(&json!({ "url": format!("{}{}", upstream.uri(), feed_path), "name": name }))
                .await;
            response.assert_status(StatusCode::CREATED);
        }

        let feeds: Value = server.get("/api/feeds").await.json();
        let feeds = feeds["feeds"].as_array().unwrap();
        assert_eq!(feeds.len(), 2);
        assert!(feeds.iter().all(|f| f["item_count"] == 2));

        let response = server.get("/rss/all").await;
        response.assert_status_ok();
        let xml = response.text();

        let parsed = feed_rs::parser::parse(xml.as_bytes()).unwrap();
        assert_eq!(parsed.entries.len(), 4);
        let alpha_url = format!("{}/alpha.xml", upstream.uri());
        let beta_url = format!("{}/beta.xml", upstream.uri());
        assert_eq!(
            xml.matches(&format!(r#"<source url="{}">Alpha</source>"#, alpha_url)).count(),
            2
        );
        assert_eq!(
            xml.matches(&format!(r#"<source url="{}">Beta</source>"#, beta_url)).count(),
            2
        );
        assert!(xml.contains("<link>http://cache.test/rss/all</link>"));
    }

    #[tokio::test]
    async fn test_export_limit_applies_to_merged_document() {
        let temp_dir = create_temp_dir();
        let db = create_db(&temp_dir).await;
        let upstream = MockServer::start().await;

        let now = Utc::now();
        let slugs: Vec<String> = (0..8).map(|i| format!("item{}", i)).collect();
        let items: Vec<_> = slugs
            .iter()
            .enumerate()
            .map(|(i, slug)| (slug.as_str(), now - Duration::minutes(i as i64)))
            .collect();
        Mock::given(method("GET"))
            .and(path("/many.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss("Many", &items)))
            .mount(&upstream)
            .await;

        let config = rss_cache::config::Config {
            export_limit: 3,
            ..test_config()
        };
        let server = TestServer::new(router(create_state(db, config))).unwrap();

        server
            .post("/api/feeds")
            .json(&json!({ "url": format!("{}/many.xml", upstream.uri()) }))
            .await
            .assert_status(StatusCode::CREATED);

        let xml = server.get("/rss/all").await.text();
        assert_eq!(xml.matches("<item>").count(), 3);
        assert!(xml.contains("https://upstream.example.com/item0"));
        assert!(!xml.contains("https://upstream.example.com/item3"));
    }

    #[tokio::test]
    async fn test_refresh_status_and_trigger() {
        let temp_dir = create_temp_dir();
        let db = create_db(&temp_dir).await;
        let server = TestServer::new(router(create_state(db, test_config()))).unwrap();

        let status: Value = server.get("/api/refresh/status").await.json();
        assert_eq!(status["refreshing"], false);

        let body: Value = server.post("/api/feeds/refresh").await.json();
        assert_eq!(body["status"], "refreshed");
    }
}
