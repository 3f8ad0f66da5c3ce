//! RSS Cache - a bounded local proxy for RSS/Atom feeds
//!
//! Feeds are polled on a schedule, each one is capped to a fixed number of
//! recent items, old items are pruned, and the result is served back as
//! RSS 2.0 per feed or merged across all feeds.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod fetcher;
pub mod retention;
pub mod routes;
