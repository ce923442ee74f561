//! Source entity shapes as returned by the back-office REST collections,
//! plus their normalisation into [`NotificationDraft`]s.

use serde::{Deserialize, Deserializer, Serialize};

use crate::{parse_created_at, Category, NotificationDraft};

/// Order statuses an operator still has to act on.
pub const ACTIONABLE_ORDER_STATUSES: [&str; 3] = ["pending", "confirmed", "processing"];

/// Prefix that keeps bulk RFQ ids apart from single-lead ids inside the
/// shared `lead` category.
const BULK_RFQ_ID_PREFIX: &str = "rfq-";

/// Backends disagree on whether ids are numbers or strings.
fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Int(i64),
        Float(f64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Int(i) => i.to_string(),
        RawId::Float(f) => f.to_string(),
    })
}

fn default_true() -> bool {
    true
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    #[serde(alias = "_id", deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub total_amount: Option<f64>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl OrderRecord {
    pub fn is_actionable(&self) -> bool {
        self.status
            .as_deref()
            .map(|s| {
                ACTIONABLE_ORDER_STATUSES
                    .iter()
                    .any(|candidate| s.eq_ignore_ascii_case(candidate))
            })
            .unwrap_or(false)
    }

    pub fn to_draft(&self, fallback_ts: i64) -> NotificationDraft {
        let customer = non_blank(self.customer_name.as_deref()).unwrap_or("A customer");
        let message = match self.total_amount {
            Some(total) => format!("{customer} placed an order for {total:.2}"),
            None => format!("{customer} placed an order"),
        };
        NotificationDraft {
            category: Category::Order,
            source_id: self.id.clone(),
            title: "New order".to_string(),
            message,
            timestamp: parse_created_at(self.created_at.as_deref()).unwrap_or(fallback_ts),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRecord {
    #[serde(alias = "_id", deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl ReviewRecord {
    pub fn to_draft(&self, fallback_ts: i64) -> NotificationDraft {
        let message = non_blank(self.title.as_deref())
            .or_else(|| non_blank(self.comment.as_deref()))
            .unwrap_or("A customer left a review")
            .to_string();
        NotificationDraft {
            category: Category::Review,
            source_id: self.id.clone(),
            title: "New review".to_string(),
            message,
            timestamp: parse_created_at(self.created_at.as_deref()).unwrap_or(fallback_ts),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionRecord {
    #[serde(alias = "_id", deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub question_text: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub answers: Vec<Answer>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl QuestionRecord {
    /// Active, and no active operator-authored answer yet.
    pub fn needs_attention(&self) -> bool {
        self.is_active && !self.answers.iter().any(|a| a.is_admin && a.is_active)
    }

    pub fn to_draft(&self, fallback_ts: i64) -> NotificationDraft {
        let message = non_blank(self.question_text.as_deref())
            .unwrap_or("Customer asked a question")
            .to_string();
        NotificationDraft {
            category: Category::Question,
            source_id: self.id.clone(),
            title: "New question".to_string(),
            message,
            timestamp: parse_created_at(self.created_at.as_deref()).unwrap_or(fallback_ts),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleLeadRecord {
    #[serde(alias = "_id", deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub buyer_name: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RfqItem {
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub quantity: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRfqRecord {
    #[serde(alias = "_id", deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub buyer_name: Option<String>,
    #[serde(default)]
    pub items: Vec<RfqItem>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Both lead flavours funnel into [`Category::Lead`].
#[derive(Debug, Clone, PartialEq)]
pub enum LeadEvent {
    Single(SingleLeadRecord),
    BulkRfq(BulkRfqRecord),
}

impl LeadEvent {
    /// Identifier in the shared lead namespace. Bulk RFQs carry a prefix so a
    /// single lead and an RFQ that happen to share a backend id stay distinct.
    pub fn source_id(&self) -> String {
        match self {
            LeadEvent::Single(lead) => lead.id.clone(),
            LeadEvent::BulkRfq(rfq) => format!("{BULK_RFQ_ID_PREFIX}{}", rfq.id),
        }
    }

    pub fn normalize(&self, fallback_ts: i64) -> NotificationDraft {
        let (title, message, created_at) = match self {
            LeadEvent::Single(lead) => {
                let buyer = non_blank(lead.buyer_name.as_deref()).unwrap_or("A buyer");
                let product = non_blank(lead.product_name.as_deref()).unwrap_or("a product");
                (
                    "New lead",
                    format!("{buyer} is interested in {product}"),
                    lead.created_at.as_deref(),
                )
            }
            LeadEvent::BulkRfq(rfq) => {
                let buyer = non_blank(rfq.buyer_name.as_deref()).unwrap_or("A buyer");
                let n = rfq.items.len();
                let noun = if n == 1 { "item" } else { "items" };
                (
                    "New bulk RFQ",
                    format!("{buyer} requested a quote for {n} {noun}"),
                    rfq.created_at.as_deref(),
                )
            }
        };
        NotificationDraft {
            category: Category::Lead,
            source_id: self.source_id(),
            title: title.to_string(),
            message,
            timestamp: parse_created_at(created_at).unwrap_or(fallback_ts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_and_mongo_style_ids_decode_to_strings() {
        let order: OrderRecord =
            serde_json::from_str(r#"{"id": 42, "status": "pending"}"#).unwrap();
        assert_eq!(order.id, "42");
        let review: ReviewRecord =
            serde_json::from_str(r#"{"_id": "abc", "comment": "great"}"#).unwrap();
        assert_eq!(review.id, "abc");
    }

    #[test]
    fn question_needs_attention_only_without_active_admin_answer() {
        let mut q: QuestionRecord = serde_json::from_str(
            r#"{"id": "q1", "questionText": "Does it ship?", "answers": [{"isAdmin": false}]}"#,
        )
        .unwrap();
        assert!(q.needs_attention());

        q.answers.push(Answer { is_admin: true, is_active: false });
        assert!(q.needs_attention());

        q.answers.push(Answer { is_admin: true, is_active: true });
        assert!(!q.needs_attention());

        q.answers.clear();
        q.is_active = false;
        assert!(!q.needs_attention());
    }

    #[test]
    fn empty_question_text_falls_back() {
        let q = QuestionRecord {
            id: "q2".into(),
            question_text: Some("   ".into()),
            is_active: true,
            answers: vec![],
            created_at: None,
        };
        let draft = q.to_draft(7);
        assert_eq!(draft.message, "Customer asked a question");
        assert_eq!(draft.timestamp, 7);
    }

    #[test]
    fn order_status_filter_is_case_insensitive() {
        let mut order = OrderRecord {
            id: "o1".into(),
            status: Some("Processing".into()),
            customer_name: None,
            total_amount: Some(12.5),
            created_at: Some("2026-02-24T12:00:00Z".into()),
        };
        assert!(order.is_actionable());
        let draft = order.to_draft(0);
        assert_eq!(draft.message, "A customer placed an order for 12.50");
        assert_eq!(draft.timestamp, 1_771_934_400_000);

        order.status = Some("delivered".into());
        assert!(!order.is_actionable());
        order.status = None;
        assert!(!order.is_actionable());
    }

    #[test]
    fn lead_flavours_share_category_but_not_identity() {
        let single = LeadEvent::Single(SingleLeadRecord {
            id: "7".into(),
            buyer_name: Some("Acme".into()),
            product_name: Some("Drill".into()),
            created_at: None,
        });
        let bulk = LeadEvent::BulkRfq(BulkRfqRecord {
            id: "7".into(),
            buyer_name: None,
            items: vec![
                RfqItem { product_name: Some("Saw".into()), quantity: Some(3.0) },
                RfqItem { product_name: None, quantity: None },
            ],
            created_at: None,
        });

        let a = single.normalize(1);
        let b = bulk.normalize(1);
        assert_eq!(a.category, Category::Lead);
        assert_eq!(b.category, Category::Lead);
        assert_ne!(a.dedup_key(), b.dedup_key());
        assert_eq!(a.message, "Acme is interested in Drill");
        assert_eq!(b.message, "A buyer requested a quote for 2 items");
    }
}
