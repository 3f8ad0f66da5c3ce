//! JSON management API for feeds and items.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::db::{is_unique_violation, Feed, FeedSummary, Item, NewFeed};
use crate::error::AppError;
use crate::fetcher::{validate_url, RefreshOutcome};
use crate::routes::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateFeed {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub max_items: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateFeed {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub max_items: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ItemsQuery {
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct FeedList {
    pub feeds: Vec<FeedSummary>,
}

#[derive(Debug, Serialize)]
pub struct ItemList {
    pub items: Vec<Item>,
}

fn check_cap(max_items: Option<i64>) -> Result<(), AppError> {
    match max_items {
        Some(n) if n <= 0 => Err(AppError::validation("max_items must be positive")),
        _ => Ok(()),
    }
}

/// Trims a supplied name, rejecting one that is blank.
fn clean_name(name: Option<&str>) -> Result<Option<String>, AppError> {
    match name.map(str::trim) {
        Some("") => Err(AppError::validation("name must not be empty")),
        other => Ok(other.map(str::to_string)),
    }
}

async fn require_feed(state: &AppState, feed_id: i64) -> Result<Feed, AppError> {
    state
        .db
        .get_feed(feed_id)
        .await?
        .ok_or_else(|| AppError::not_found("Feed not found"))
}

pub async fn list_feeds(State(state): State<Arc<AppState>>) -> Result<Json<FeedList>, AppError> {
    let feeds = state.db.get_feed_summaries().await?;
    Ok(Json(FeedList { feeds }))
}

/// Registers a feed after fetching it once, storing its first items.
pub async fn create_feed(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateFeed>,
) -> Result<(StatusCode, Json<Feed>), AppError> {
    check_cap(body.max_items)?;
    let name = clean_name(body.name.as_deref())?;
    let url = validate_url(&body.url)
        .map_err(|e| AppError::validation(e.to_string()))?
        .to_string();

    if state.db.get_feed_by_url(&url).await?.is_some() {
        return Err(AppError::conflict("Feed already exists"));
    }

    let parsed = state
        .fetcher
        .fetch_feed(&url)
        .await
        .map_err(|e| AppError::validation(format!("Failed to load feed: {}", e)))?;

    let new_feed = NewFeed {
        name: name
            .or_else(|| parsed.title.clone())
            .unwrap_or_else(|| "Untitled".to_string()),
        url,
        max_items: body.max_items.unwrap_or(state.config.default_max_items),
    };
    let (feed, report) = state
        .db
        .register_feed(
            &new_feed,
            state.config.retention_window(),
            parsed.items,
            Utc::now(),
        )
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::conflict("Feed already exists")
            } else {
                AppError::from(e)
            }
        })?;
    info!(
        "Registered feed '{}' ({}) with {} items",
        feed.name, feed.url, report.inserted
    );

    Ok((StatusCode::CREATED, Json(feed)))
}

pub async fn get_feed(
    State(state): State<Arc<AppState>>,
    Path(feed_id): Path<i64>,
) -> Result<Json<Feed>, AppError> {
    Ok(Json(require_feed(&state, feed_id).await?))
}

pub async fn update_feed(
    State(state): State<Arc<AppState>>,
    Path(feed_id): Path<i64>,
    Json(body): Json<UpdateFeed>,
) -> Result<Json<Value>, AppError> {
    check_cap(body.max_items)?;
    let name = clean_name(body.name.as_deref())?;

    let before = require_feed(&state, feed_id).await?;
    let updated = state
        .db
        .update_feed(feed_id, name.as_deref(), body.max_items)
        .await?
        .ok_or_else(|| AppError::not_found("Feed not found"))?;

    if updated.max_items != before.max_items {
        info!(
            "Cap of feed '{}' changed from {} to {}",
            updated.name, before.max_items, updated.max_items
        );
        if state.fetcher.refresh_feed(&updated).await.is_err() {
            warn!("Refresh after cap change failed for '{}'", updated.name);
        }
    }

    let feed = require_feed(&state, feed_id).await?;
    Ok(Json(json!({ "status": "updated", "feed": feed })))
}

pub async fn delete_feed(
    State(state): State<Arc<AppState>>,
    Path(feed_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    if !state.db.delete_feed(feed_id).await? {
        return Err(AppError::not_found("Feed not found"));
    }
    info!("Deleted feed {}", feed_id);
    Ok(Json(json!({ "status": "deleted" })))
}

pub async fn feed_items(
    State(state): State<Arc<AppState>>,
    Path(feed_id): Path<i64>,
    Query(query): Query<ItemsQuery>,
) -> Result<Json<ItemList>, AppError> {
    let feed = require_feed(&state, feed_id).await?;
    let limit = query.limit.unwrap_or(feed.max_items);
    if limit < 0 || query.offset < 0 {
        return Err(AppError::validation("limit and offset must not be negative"));
    }

    let items = state
        .db
        .get_items_for_feed(feed_id, limit, query.offset)
        .await?;
    Ok(Json(ItemList { items }))
}

pub async fn hide_item(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    if !state.db.hide_item(item_id).await? {
        return Err(AppError::not_found("Item not found"));
    }
    Ok(Json(json!({ "status": "hidden" })))
}

pub async fn delete_item(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    if !state.db.delete_item(item_id).await? {
        return Err(AppError::not_found("Item not found"));
    }
    Ok(Json(json!({ "status": "deleted" })))
}

/// Runs refresh-all on its own task so a disconnecting client cannot cancel it.
pub async fn refresh(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let fetcher = state.fetcher.clone();
    let outcome = tokio::spawn(async move { fetcher.refresh_all_feeds().await })
        .await
        .map_err(anyhow::Error::from)??;

    let body = match outcome {
        RefreshOutcome::Completed(summary) => json!({
            "status": "refreshed",
            "refreshed": summary.refreshed,
            "failed": summary.failed,
        }),
        RefreshOutcome::AlreadyRunning => json!({ "status": "already_running" }),
    };
    Ok(Json(body))
}

pub async fn refresh_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let refreshing = state.fetcher.is_refreshing();
    Json(json!({ "refreshing": refreshing }))
}
