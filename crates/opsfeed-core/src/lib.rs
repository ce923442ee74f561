//! Core domain model for the opsfeed notification engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod entities;

pub use entities::{
    Answer, BulkRfqRecord, LeadEvent, OrderRecord, QuestionRecord, ReviewRecord, RfqItem,
    SingleLeadRecord, ACTIONABLE_ORDER_STATUSES,
};

pub const CRATE_NAME: &str = "opsfeed-core";

/// Logical notification channel backed by one or more backend collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Order,
    Review,
    Question,
    Lead,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Order,
        Category::Review,
        Category::Question,
        Category::Lead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Order => "order",
            Category::Review => "review",
            Category::Question => "question",
            Category::Lead => "lead",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown notification category `{0}`")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "order" | "orders" => Ok(Category::Order),
            "review" | "reviews" => Ok(Category::Review),
            "question" | "questions" => Ok(Category::Question),
            "lead" | "leads" => Ok(Category::Lead),
            other => Err(UnknownCategory(other.to_string())),
        }
    }
}

/// Uniqueness boundary for notification creation: `"{category}-{source_id}"`.
pub fn dedup_key(category: Category, source_id: &str) -> String {
    format!("{}-{}", category.as_str(), source_id)
}

/// One surfaced event in the operator feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub source_type: Category,
    pub source_id: String,
    pub title: String,
    pub message: String,
    /// Epoch millis.
    pub timestamp: i64,
    #[serde(default)]
    pub read: bool,
}

impl Notification {
    pub fn dedup_key(&self) -> String {
        dedup_key(self.source_type, &self.source_id)
    }
}

/// Normalised handoff from a source adapter into the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationDraft {
    pub category: Category,
    pub source_id: String,
    pub title: String,
    pub message: String,
    pub timestamp: i64,
}

impl NotificationDraft {
    pub fn dedup_key(&self) -> String {
        dedup_key(self.category, &self.source_id)
    }

    /// Materialise the draft as an unread notification.
    ///
    /// The id folds in the timestamp so a category/source pair that is ever
    /// re-surfaced after a cache reset never collides with an older record.
    pub fn into_notification(self) -> Notification {
        Notification {
            id: format!("{}-{}-{}", self.category, self.source_id, self.timestamp),
            source_type: self.category,
            source_id: self.source_id,
            title: self.title,
            message: self.message,
            timestamp: self.timestamp,
            read: false,
        }
    }
}

/// Unread notifications per category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub order: usize,
    pub question: usize,
    pub review: usize,
    pub lead: usize,
}

impl Counts {
    pub fn get(&self, category: Category) -> usize {
        match category {
            Category::Order => self.order,
            Category::Review => self.review,
            Category::Question => self.question,
            Category::Lead => self.lead,
        }
    }

    fn slot_mut(&mut self, category: Category) -> &mut usize {
        match category {
            Category::Order => &mut self.order,
            Category::Review => &mut self.review,
            Category::Question => &mut self.question,
            Category::Lead => &mut self.lead,
        }
    }

    pub fn total(&self) -> usize {
        self.order + self.question + self.review + self.lead
    }
}

/// Full scan of the store. Counts are never maintained incrementally.
pub fn recompute_counts(items: &[Notification]) -> Counts {
    let mut counts = Counts::default();
    for item in items.iter().filter(|n| !n.read) {
        *counts.slot_mut(item.source_type) += 1;
    }
    counts
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Parses an RFC 3339 `createdAt` into epoch millis.
pub fn parse_created_at(raw: Option<&str>) -> Option<i64> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(category: Category, source_id: &str, read: bool) -> Notification {
        Notification {
            id: format!("{category}-{source_id}-1"),
            source_type: category,
            source_id: source_id.to_string(),
            title: "t".into(),
            message: "m".into(),
            timestamp: 1,
            read,
        }
    }

    #[test]
    fn counts_only_unread_per_category() {
        let items = vec![
            note(Category::Review, "r1", false),
            note(Category::Review, "r2", true),
            note(Category::Order, "o1", false),
            note(Category::Lead, "l1", false),
            note(Category::Lead, "l2", false),
        ];
        let counts = recompute_counts(&items);
        assert_eq!(counts.review, 1);
        assert_eq!(counts.order, 1);
        assert_eq!(counts.question, 0);
        assert_eq!(counts.lead, 2);
        assert_eq!(counts.total(), 4);
    }

    #[test]
    fn notification_serializes_camel_case_with_lowercase_category() {
        let json = serde_json::to_value(note(Category::Question, "q9", false)).unwrap();
        assert_eq!(json["sourceType"], "question");
        assert_eq!(json["sourceId"], "q9");
        assert_eq!(json["read"], false);
    }

    #[test]
    fn draft_id_includes_category_source_and_instant() {
        let draft = NotificationDraft {
            category: Category::Order,
            source_id: "o1".into(),
            title: "New order".into(),
            message: "m".into(),
            timestamp: 1_700_000_000_000,
        };
        assert_eq!(draft.dedup_key(), "order-o1");
        let n = draft.into_notification();
        assert_eq!(n.id, "order-o1-1700000000000");
        assert!(!n.read);
    }

    #[test]
    fn category_parses_singular_and_plural() {
        assert_eq!("reviews".parse::<Category>().unwrap(), Category::Review);
        assert_eq!("Lead".parse::<Category>().unwrap(), Category::Lead);
        assert!("coupon".parse::<Category>().is_err());
    }

    #[test]
    fn created_at_parsing_tolerates_garbage() {
        assert_eq!(
            parse_created_at(Some("2026-02-24T12:00:00Z")),
            Some(1_771_934_400_000)
        );
        assert_eq!(parse_created_at(Some("yesterday")), None);
        assert_eq!(parse_created_at(None), None);
    }
}
