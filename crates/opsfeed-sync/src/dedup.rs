//! Session-lifetime memory of every `(category, source_id)` already turned
//! into a notification.

use std::collections::{HashSet, VecDeque};

use opsfeed_core::{dedup_key, Category, Notification};

/// How the cache bounds its memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupPolicy {
    /// Keys outlive their store records for the whole session.
    #[default]
    Unbounded,
    /// Keep at most `n` keys, evicting the oldest insertion first. An entity
    /// whose key was evicted re-notifies if a later poll still returns it.
    Capped(usize),
}

#[derive(Debug, Default)]
pub struct DedupCache {
    policy: DedupPolicy,
    keys: HashSet<String>,
    insertion_order: VecDeque<String>,
}

impl DedupCache {
    pub fn new(policy: DedupPolicy) -> Self {
        Self {
            policy,
            keys: HashSet::new(),
            insertion_order: VecDeque::new(),
        }
    }

    /// Rebuild from persisted records, oldest first so eviction order under a
    /// cap matches creation order.
    pub fn rebuild<'a>(policy: DedupPolicy, items: impl DoubleEndedIterator<Item = &'a Notification>) -> Self {
        let mut cache = Self::new(policy);
        for item in items.rev() {
            cache.add(item.source_type, &item.source_id);
        }
        cache
    }

    pub fn has(&self, category: Category, source_id: &str) -> bool {
        self.keys.contains(&dedup_key(category, source_id))
    }

    /// Returns `false` when the key was already present.
    pub fn add(&mut self, category: Category, source_id: &str) -> bool {
        let key = dedup_key(category, source_id);
        if !self.keys.insert(key.clone()) {
            return false;
        }
        if let DedupPolicy::Capped(cap) = self.policy {
            self.insertion_order.push_back(key);
            while self.keys.len() > cap.max(1) {
                match self.insertion_order.pop_front() {
                    Some(oldest) => {
                        self.keys.remove(&oldest);
                    }
                    None => break,
                }
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(category: Category, source_id: &str) -> Notification {
        Notification {
            id: format!("{category}-{source_id}-0"),
            source_type: category,
            source_id: source_id.to_string(),
            title: String::new(),
            message: String::new(),
            timestamp: 0,
            read: true,
        }
    }

    #[test]
    fn add_is_idempotent_and_scoped_by_category() {
        let mut cache = DedupCache::new(DedupPolicy::Unbounded);
        assert!(cache.add(Category::Review, "1"));
        assert!(!cache.add(Category::Review, "1"));
        assert!(cache.has(Category::Review, "1"));
        assert!(!cache.has(Category::Order, "1"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn rebuild_includes_read_records() {
        let items = vec![note(Category::Order, "o2"), note(Category::Order, "o1")];
        let cache = DedupCache::rebuild(DedupPolicy::Unbounded, items.iter());
        assert!(cache.has(Category::Order, "o1"));
        assert!(cache.has(Category::Order, "o2"));
    }

    #[test]
    fn capped_policy_evicts_oldest_first() {
        let mut cache = DedupCache::new(DedupPolicy::Capped(2));
        cache.add(Category::Lead, "a");
        cache.add(Category::Lead, "b");
        cache.add(Category::Lead, "c");
        assert_eq!(cache.len(), 2);
        assert!(!cache.has(Category::Lead, "a"));
        assert!(cache.has(Category::Lead, "c"));
    }

    #[test]
    fn capped_rebuild_keeps_newest_store_records() {
        // store order is newest first
        let items = vec![
            note(Category::Review, "new"),
            note(Category::Review, "mid"),
            note(Category::Review, "old"),
        ];
        let cache = DedupCache::rebuild(DedupPolicy::Capped(2), items.iter());
        assert!(cache.has(Category::Review, "new"));
        assert!(cache.has(Category::Review, "mid"));
        assert!(!cache.has(Category::Review, "old"));
    }
}
