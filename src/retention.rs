//! Age- and count-based retention for a feed's item set.
//!
//! The policy is a pure function from (stored items, parsed items, cap, now)
//! to a [`RetentionPlan`]. The database applies the plan in one transaction
//! while holding the feed's write lock.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};

use crate::fetcher::ParsedItem;

/// The part of a stored item the policy needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub id: i64,
    pub link: String,
    /// Publish time, or ingestion time when the item had none
    pub effective_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub max_items: usize,
    pub max_age: Duration,
}

/// A parsed item accepted for insertion.
#[derive(Debug, Clone)]
pub struct FreshItem {
    pub item: ParsedItem,
    pub effective_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct RetentionPlan {
    /// New rows, in the order they must be inserted
    pub insert: Vec<FreshItem>,
    /// Ids of stored rows to delete
    pub delete: Vec<i64>,
}

impl RetentionPlan {
    pub fn is_empty(&self) -> bool {
        self.insert.is_empty() && self.delete.is_empty()
    }
}

// Ties on effective time go to whatever was ingested first: stored rows by
// id, then fresh rows in upstream order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Slot {
    Stored(i64),
    Fresh(usize),
}

impl RetentionPolicy {
    pub fn new(max_items: i64, max_age: Duration) -> Self {
        Self {
            max_items: usize::try_from(max_items).unwrap_or(0),
            max_age,
        }
    }

    pub fn plan(
        &self,
        stored: &[StoredEntry],
        parsed: Vec<ParsedItem>,
        now: DateTime<Utc>,
    ) -> RetentionPlan {
        let cutoff = now
            .checked_sub_signed(self.max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut seen = HashSet::new();
        let mut candidates: Vec<FreshItem> = parsed
            .into_iter()
            .filter(|item| !item.link.is_empty() && seen.insert(item.link.clone()))
            .map(|item| FreshItem {
                effective_at: item.published.unwrap_or(now),
                item,
            })
            .collect();

        // Only the newest `max_items` upstream entries are candidates
        candidates.sort_by(|a, b| b.effective_at.cmp(&a.effective_at));
        candidates.truncate(self.max_items);

        let known: HashSet<&str> = stored.iter().map(|s| s.link.as_str()).collect();
        let fresh: Vec<FreshItem> = candidates
            .into_iter()
            .filter(|c| !known.contains(c.item.link.as_str()) && c.effective_at >= cutoff)
            .collect();

        let mut plan = RetentionPlan::default();
        let mut ranked: Vec<(DateTime<Utc>, Slot)> = Vec::with_capacity(stored.len() + fresh.len());

        for entry in stored {
            if entry.effective_at < cutoff {
                plan.delete.push(entry.id);
            } else {
                ranked.push((entry.effective_at, Slot::Stored(entry.id)));
            }
        }
        for (idx, item) in fresh.iter().enumerate() {
            ranked.push((item.effective_at, Slot::Fresh(idx)));
        }

        ranked.sort_by(|a, b| match b.0.cmp(&a.0) {
            Ordering::Equal => a.1.cmp(&b.1),
            other => other,
        });

        let mut keep_fresh = vec![false; fresh.len()];
        for (position, (_, slot)) in ranked.into_iter().enumerate() {
            let kept = position < self.max_items;
            match slot {
                Slot::Stored(id) if !kept => plan.delete.push(id),
                Slot::Fresh(idx) => keep_fresh[idx] = kept,
                Slot::Stored(_) => {}
            }
        }

        plan.insert = fresh
            .into_iter()
            .zip(keep_fresh)
            .filter_map(|(item, keep)| keep.then_some(item))
            .collect();

        plan
    }
}
