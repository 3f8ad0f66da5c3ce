use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::api;
use crate::config::Config;
use crate::db::{Database, FeedSummary};
use crate::error::AppError;
use crate::export::{self, ExportSettings, RSS_CONTENT_TYPE};
use crate::fetcher::Fetcher;

pub struct AppState {
    pub db: Arc<Database>,
    pub fetcher: Arc<Fetcher>,
    pub config: Arc<Config>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/feeds", get(api::list_feeds).post(api::create_feed))
        .route("/api/feeds/refresh", post(api::refresh))
        .route(
            "/api/feeds/:id",
            get(api::get_feed)
                .put(api::update_feed)
                .delete(api::delete_feed),
        )
        .route("/api/feeds/:id/items", get(api::feed_items))
        .route("/api/items/:id", delete(api::hide_item))
        .route("/api/items/:id/permanent", delete(api::delete_item))
        .route("/api/refresh/status", get(api::refresh_status))
        .route("/rss/all", get(rss_all))
        .route("/rss/feed/:id", get(rss_feed))
        .nest_service("/static", ServeDir::new("static"))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Template)]
#[template(path = "index.html")]
pub struct IndexTemplate {
    pub feeds: Vec<FeedSummary>,
    pub public_url: String,
    pub refresh_interval: u64,
    pub retention_days: i64,
}

// Wrapper for HTML responses
struct HtmlTemplate<T>(T);

impl<T: Template> IntoResponse for HtmlTemplate<T> {
    fn into_response(self) -> Response {
        match self.0.render() {
            Ok(html) => Html(html).into_response(),
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to render template: {}", err),
            )
                .into_response(),
        }
    }
}

struct RssDocument(String);

impl IntoResponse for RssDocument {
    fn into_response(self) -> Response {
        ([(header::CONTENT_TYPE, RSS_CONTENT_TYPE)], self.0).into_response()
    }
}

pub async fn index(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    let feeds = state.db.get_feed_summaries().await?;
    let settings = ExportSettings::from(state.config.as_ref());

    Ok(HtmlTemplate(IndexTemplate {
        feeds,
        public_url: settings.public_url,
        refresh_interval: state.config.refresh_interval,
        retention_days: state.config.retention_days,
    }))
}

pub async fn health() -> impl IntoResponse {
    Html("OK")
}

pub async fn rss_all(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    let items = state.db.get_recent_items(state.config.export_limit).await?;
    let settings = ExportSettings::from(state.config.as_ref());
    let xml = export::merged_document(&items, &settings, Utc::now())?;
    Ok(RssDocument(xml))
}

pub async fn rss_feed(
    State(state): State<Arc<AppState>>,
    Path(feed_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let feed = state
        .db
        .get_feed(feed_id)
        .await?
        .ok_or_else(|| AppError::not_found("Feed not found"))?;

    let items = state
        .db
        .get_items_for_feed(feed.id, feed.max_items, 0)
        .await?;
    let settings = ExportSettings::from(state.config.as_ref());
    let xml = export::feed_document(&feed, &items, &settings, Utc::now())?;
    Ok(RssDocument(xml))
}
