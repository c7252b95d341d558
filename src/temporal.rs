// ⏰ Temporal helpers
//
// Warehouse timestamps are stored as TEXT in `YYYY-MM-DD HH:MM:SS` form so
// that lexical order equals chronological order (MAX() works as a watermark).
// Dates are stored as `YYYY-MM-DD`.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Parse a timestamp as it appears in raw extracts.
///
/// Accepts `YYYY-MM-DD HH:MM:SS`, the ISO `T` separator, fractional seconds,
/// and bare dates (midnight).
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
    ];
    for format in FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ts);
        }
    }

    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
        .ok()
        .or_else(|| parse_timestamp(raw).map(|ts| ts.date()))
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn format_date(date: &NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

// ============================================================================
// VALIDITY RANGE
// ============================================================================

/// Half-open validity range `[valid_from, valid_to)` of one version.
///
/// `valid_to == None` means the version is still current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validity {
    pub valid_from: NaiveDateTime,
    pub valid_to: Option<NaiveDateTime>,
}

impl Validity {
    pub fn open(valid_from: NaiveDateTime) -> Self {
        Validity {
            valid_from,
            valid_to: None,
        }
    }

    pub fn is_current(&self) -> bool {
        self.valid_to.is_none()
    }

    pub fn was_valid_at(&self, time: NaiveDateTime) -> bool {
        self.valid_from <= time && self.valid_to.map_or(true, |until| until > time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).unwrap()
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = ts("2009-06-05 21:34:42");
        assert_eq!(parse_timestamp("2009-06-05 21:34:42"), Some(expected));
        assert_eq!(parse_timestamp("2009-06-05T21:34:42"), Some(expected));
        assert_eq!(parse_timestamp(" 2009-06-05 21:34:42.000 "), Some(expected));
        assert_eq!(
            parse_timestamp("2009-06-05"),
            Some(ts("2009-06-05 00:00:00"))
        );
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("06/05/2009"), None);
    }

    #[test]
    fn test_format_sorts_chronologically() {
        let a = format_timestamp(&ts("2009-06-05 21:34:42"));
        let b = format_timestamp(&ts("2010-01-01 00:00:00"));
        assert!(a < b);
    }

    #[test]
    fn test_validity_range() {
        let mut v = Validity::open(ts("2024-01-01 00:00:00"));
        assert!(v.is_current());
        assert!(v.was_valid_at(ts("2030-01-01 00:00:00")));
        assert!(!v.was_valid_at(ts("2023-12-31 23:59:59")));

        v.valid_to = Some(ts("2024-02-01 00:00:00"));
        assert!(!v.is_current());
        assert!(v.was_valid_at(ts("2024-01-31 23:59:59")));
        assert!(!v.was_valid_at(ts("2024-02-01 00:00:00")));
    }
}
