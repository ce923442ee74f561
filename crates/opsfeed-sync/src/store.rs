//! Bounded, newest-first notification feed and its persisted layout.

use std::collections::HashSet;

use opsfeed_core::{Category, Notification};
use opsfeed_storage::{load_json, save_json, KeyValueStore, StorageError};
use serde::{Deserialize, Serialize};

pub const DEFAULT_STORE_CAP: usize = 100;
pub const NOTIFICATIONS_KEY: &str = "notifications";

/// On-disk shape of the `notifications` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedFeed {
    #[serde(default)]
    pub items: Vec<Notification>,
    #[serde(default)]
    pub last_updated: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PersistedFeedRef<'a> {
    items: &'a [Notification],
    last_updated: i64,
}

#[derive(Debug, Clone)]
pub struct NotificationStore {
    cap: usize,
    items: Vec<Notification>,
}

impl NotificationStore {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            items: Vec::new(),
        }
    }

    /// Restore persisted items. Duplicate dedup keys collapse onto their first
    /// (newest) occurrence and anything past the cap is dropped. Returns the
    /// store and how many records were discarded.
    pub fn restore(cap: usize, items: Vec<Notification>) -> (Self, usize) {
        let mut store = Self::new(cap);
        let restored = items.len();
        let mut seen = HashSet::new();
        store.items = items
            .into_iter()
            .filter(|n| seen.insert(n.dedup_key()))
            .collect();
        store.items.truncate(store.cap);
        let discarded = restored - store.items.len();
        (store, discarded)
    }

    pub fn items(&self) -> &[Notification] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Put a batch at the head, keeping the batch's own order.
    pub fn prepend(&mut self, batch: Vec<Notification>) {
        if batch.is_empty() {
            return;
        }
        let mut merged = batch;
        merged.append(&mut self.items);
        self.items = merged;
    }

    /// Drop the oldest records beyond the cap and hand them back.
    pub fn trim(&mut self) -> Vec<Notification> {
        if self.items.len() <= self.cap {
            return Vec::new();
        }
        self.items.split_off(self.cap)
    }

    /// Returns the record's category when found.
    pub fn mark_read(&mut self, id: &str) -> Option<Category> {
        let item = self.items.iter_mut().find(|n| n.id == id)?;
        item.read = true;
        Some(item.source_type)
    }

    /// Returns how many records flipped from unread to read.
    pub fn mark_all_read(&mut self) -> usize {
        let mut flipped = 0;
        for item in self.items.iter_mut().filter(|n| !n.read) {
            item.read = true;
            flipped += 1;
        }
        flipped
    }

    /// Consumer view: newest `timestamp` first regardless of insertion order.
    pub fn sorted_newest_first(&self) -> Vec<Notification> {
        let mut items = self.items.clone();
        items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        items
    }
}

pub async fn load_feed(kv: &dyn KeyValueStore) -> Result<Option<PersistedFeed>, StorageError> {
    load_json(kv, NOTIFICATIONS_KEY).await
}

pub async fn save_feed(
    kv: &dyn KeyValueStore,
    store: &NotificationStore,
    last_updated: i64,
) -> Result<(), StorageError> {
    save_json(
        kv,
        NOTIFICATIONS_KEY,
        &PersistedFeedRef {
            items: store.items(),
            last_updated,
        },
    )
    .await
}
