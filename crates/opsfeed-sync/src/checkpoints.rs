//! Per-category "last seen" checkpoints.
//!
//! A looser freshness signal than the read flags: it answers "how much is new
//! since the operator last opened this category's list view".

use std::collections::HashMap;

use opsfeed_core::Category;
use opsfeed_storage::{load_json, save_json, KeyValueStore, StorageError};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStyle {
    /// Epoch millis of the last visit; fresh = entities created after it.
    Time,
    /// Pending total at the last visit; fresh = growth since then.
    Count,
}

pub fn checkpoint_style(category: Category) -> CheckpointStyle {
    match category {
        Category::Review | Category::Lead => CheckpointStyle::Time,
        Category::Order | Category::Question => CheckpointStyle::Count,
    }
}

pub fn checkpoint_key(category: Category) -> String {
    match checkpoint_style(category) {
        CheckpointStyle::Time => format!("lastSeen:{category}Time"),
        CheckpointStyle::Count => format!("lastSeen:{category}Count"),
    }
}

/// What the latest successful poll saw for one category.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPulse {
    pub total: usize,
    pub created: Vec<i64>,
}

impl BatchPulse {
    pub fn absorb(&mut self, timestamps: impl IntoIterator<Item = i64>) {
        for ts in timestamps {
            self.total += 1;
            self.created.push(ts);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoints {
    values: HashMap<Category, i64>,
}

impl Checkpoints {
    pub fn get(&self, category: Category) -> Option<i64> {
        self.values.get(&category).copied()
    }

    pub fn fresh(&self, category: Category, pulse: &BatchPulse) -> usize {
        let seen = self.get(category).unwrap_or(0);
        match checkpoint_style(category) {
            CheckpointStyle::Time => pulse.created.iter().filter(|ts| **ts > seen).count(),
            CheckpointStyle::Count => pulse.total.saturating_sub(seen.max(0) as usize),
        }
    }

    /// Record a visit. Returns the stored checkpoint value, if any.
    ///
    /// Without a pulse a count checkpoint has nothing to compare against, so
    /// the existing value is kept.
    pub fn mark_seen(
        &mut self,
        category: Category,
        pulse: Option<&BatchPulse>,
        now_ms: i64,
    ) -> Option<i64> {
        let value = match checkpoint_style(category) {
            // never move backwards; entity clocks may run ahead of ours
            CheckpointStyle::Time => pulse
                .and_then(|p| p.created.iter().copied().max())
                .unwrap_or(now_ms)
                .max(now_ms)
                .max(self.get(category).unwrap_or(0)),
            CheckpointStyle::Count => match pulse {
                Some(pulse) => pulse.total as i64,
                None => return self.get(category),
            },
        };
        self.values.insert(category, value);
        Some(value)
    }

    /// Missing or unreadable keys leave that category without a checkpoint.
    pub async fn load(kv: &dyn KeyValueStore) -> Self {
        let mut checkpoints = Self::default();
        for category in Category::ALL {
            let key = checkpoint_key(category);
            match load_json::<i64>(kv, &key).await {
                Ok(Some(value)) => {
                    checkpoints.values.insert(category, value);
                }
                Ok(None) => {}
                Err(err) => warn!(%key, error = %err, "discarding unreadable checkpoint"),
            }
        }
        checkpoints
    }

    pub async fn save(&self, kv: &dyn KeyValueStore, category: Category) -> Result<(), StorageError> {
        match self.get(category) {
            Some(value) => save_json(kv, &checkpoint_key(category), &value).await,
            None => kv.remove(&checkpoint_key(category)).await,
        }
    }
}
