use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Refresh interval in minutes
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    /// Items older than this many days are pruned on refresh
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// Cap applied to feeds registered without one
    #[serde(default = "default_max_items")]
    pub default_max_items: i64,
    /// Maximum number of items in the merged export
    #[serde(default = "default_export_limit")]
    pub export_limit: i64,
    /// Per-fetch HTTP timeout in seconds
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: u64,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Base URL used for channel links in exported documents
    #[serde(default = "default_public_url")]
    pub public_url: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

/// One year of minutes.
const MAX_REFRESH_INTERVAL: u64 = 525_600;
/// About a century.
const MAX_RETENTION_DAYS: i64 = 36_500;

fn default_refresh_interval() -> u64 {
    5
}

fn default_retention_days() -> i64 {
    7
}

fn default_max_items() -> i64 {
    30
}

fn default_export_limit() -> i64 {
    100
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_bind_address() -> String {
    "0.0.0.0:5050".to_string()
}

fn default_public_url() -> String {
    "http://localhost:5050".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub max_items: Option<i64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            retention_days: default_retention_days(),
            default_max_items: default_max_items(),
            export_limit: default_export_limit(),
            fetch_timeout: default_fetch_timeout(),
            bind_address: default_bind_address(),
            public_url: default_public_url(),
            language: default_language(),
            feeds: Vec::new(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(1..=MAX_REFRESH_INTERVAL).contains(&self.refresh_interval) {
            anyhow::bail!(
                "refresh_interval must be between 1 and {} minutes",
                MAX_REFRESH_INTERVAL
            );
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&self.retention_days) {
            anyhow::bail!(
                "retention_days must be between 1 and {}",
                MAX_RETENTION_DAYS
            );
        }
        if self.fetch_timeout == 0 {
            anyhow::bail!("fetch_timeout must be positive");
        }
        if self.default_max_items <= 0 {
            anyhow::bail!("default_max_items must be positive");
        }
        if let Some(feed) = self
            .feeds
            .iter()
            .find(|f| matches!(f.max_items, Some(n) if n <= 0))
        {
            anyhow::bail!("max_items for feed '{}' must be positive", feed.name);
        }
        Ok(())
    }

    pub fn retention_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }
}
