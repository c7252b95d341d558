// 💬 Review entity

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub const ALL: [Sentiment; 3] = [Sentiment::Positive, Sentiment::Neutral, Sentiment::Negative];

    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Neutral => "neutral",
            Sentiment::Negative => "negative",
        }
    }

    pub fn parse(raw: &str) -> Option<Sentiment> {
        let raw = raw.trim();
        Sentiment::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(raw))
    }
}

/// A row of the append-only review fact table (fct_reviews)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub review_id: String,
    pub listing_id: i64,
    pub review_date: NaiveDateTime,
    pub reviewer_name: Option<String>,
    pub review_text: String,
    /// Canonical sentiment label; unknown labels are kept as delivered for the accepted-values rule
    pub review_sentiment: Option<String>,
}

/// Stand-in for NULL inside the surrogate key so that NULL and "" hash differently
const NULL_SENTINEL: &str = "_surrogate_key_null_";

/// Deterministic surrogate key over an ordered tuple of business columns.
///
/// Same inputs in the same order always yield the same 64-char hex id.
pub fn surrogate_key(fields: &[Option<&str>]) -> String {
    let joined = fields
        .iter()
        .map(|f| f.unwrap_or(NULL_SENTINEL))
        .collect::<Vec<_>>()
        .join("-");

    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    format!("{:x}", hasher.finalize())
}
