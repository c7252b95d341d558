// Pipeline error taxonomy
//
// Contract violations and field parse errors abort a model before commit.
// Row-level quality failures are NOT errors: they land in the failure sink.

use thiserror::Error;

use crate::contract::ContractViolation;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Declared output schema does not match the model's contract.
    #[error("contract violation on {model}: {}", format_violations(.violations))]
    ContractViolation {
        model: String,
        violations: Vec<ContractViolation>,
    },

    /// A price string could not be turned into a non-negative decimal.
    #[error("cannot parse price {raw:?} for listing {listing_id}: {reason}")]
    PriceParse {
        listing_id: i64,
        raw: String,
        reason: String,
    },

    /// Any other field that failed cleansing (room type, superhost flag, timestamps).
    #[error("invalid {field} value {value:?} in {relation}")]
    InvalidValue {
        relation: String,
        field: String,
        value: String,
    },

    #[error("relation {0} does not exist; run its upstream step first")]
    MissingRelation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn invalid(relation: &str, field: &str, value: impl Into<String>) -> Self {
        PipelineError::InvalidValue {
            relation: relation.to_string(),
            field: field.to_string(),
            value: value.into(),
        }
    }
}

fn format_violations(violations: &[ContractViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
