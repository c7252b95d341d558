// 👤 Host entity

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Display name used when the source has no host name
pub const ANONYMOUS_HOST: &str = "Anonymous";

/// A cleansed host row (dim_hosts_cleansed)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub host_id: i64,
    /// Never empty: falls back to ANONYMOUS_HOST
    pub host_name: String,
    pub is_superhost: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Parse the raw `t`/`f` superhost flag.
pub fn parse_superhost(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "t" | "true" => Some(true),
        "f" | "false" => Some(false),
        _ => None,
    }
}
