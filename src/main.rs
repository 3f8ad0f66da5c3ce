use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rss_cache::config::Config;
use rss_cache::db::Database;
use rss_cache::fetcher::{start_background_refresh, Fetcher};
use rss_cache::routes::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rss_cache=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path =
        std::env::var("RSS_CACHE_CONFIG").unwrap_or_else(|_| "feeds.toml".to_string());
    let config = Config::load_or_default(&config_path)?;
    info!(
        "Loaded {} feeds from configuration ({})",
        config.feeds.len(),
        config_path
    );

    // Initialize database
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite:rss_cache.db?mode=rwc".to_string());
    let db = Database::new(&database_url).await?;
    db.initialize().await?;
    db.sync_feeds(&config.feeds, config.default_max_items).await?;
    info!("Database initialized");

    let db = Arc::new(db);
    let fetcher = Arc::new(Fetcher::new(db.clone(), &config)?);

    // Start background refresh task
    let bg_fetcher = fetcher.clone();
    let refresh_interval = config.refresh_interval;
    tokio::spawn(async move {
        start_background_refresh(bg_fetcher, refresh_interval).await;
    });

    let bind_address = config.bind_address.clone();
    let state = Arc::new(AppState {
        db,
        fetcher,
        config: Arc::new(config),
    });
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("Server starting on http://{}", bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}
