// 📈 Incremental Fact Loader - fct_reviews
//
// Append-only. The first run loads every retained review; later runs load
// only reviews dated strictly after MAX(review_date) already in the table.
// review_id is a surrogate key over (listing_id, review_date, reviewer_name,
// review_text) and carries a unique index, so overlapping loads never
// duplicate a logical review.

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::contract::{DataType, Materialization, Relation, RelationKind};
use crate::db::table_exists;
use crate::entities::{surrogate_key, Review, Sentiment};
use crate::error::Result;
use crate::sources::{read_src_reviews, SrcReview, SRC_REVIEWS};
use crate::temporal::{format_timestamp, parse_timestamp};

pub const FCT_REVIEWS: &str = "fct_reviews";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadMode {
    /// Target absent or empty
    Initial,
    /// Watermark filter applied
    Incremental,
    /// Target dropped and rebuilt on request
    FullRefresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadReport {
    pub mode: LoadMode,
    pub watermark: Option<NaiveDateTime>,
    pub source_rows: usize,
    pub inserted: usize,
    /// Already present (same review_id)
    pub duplicates: usize,
    /// review_text null or blank
    pub skipped_empty_text: usize,
    /// review_date null or unparsable
    pub skipped_bad_watermark: usize,
    /// At or before the watermark
    pub skipped_not_new: usize,
}

pub fn fct_reviews_relation() -> Relation {
    Relation::new(
        FCT_REVIEWS,
        RelationKind::Model,
        Materialization::Incremental,
        "Append-only review facts, loaded by review_date watermark",
    )
    .column("review_id", DataType::Text, "Surrogate key")
    .column("listing_id", DataType::Integer, "References dim_listings_cleansed")
    .column("review_date", DataType::Timestamp, "Watermark column")
    .column("reviewer_name", DataType::Text, "Reviewer")
    .column("review_text", DataType::Text, "Non-empty review text")
    .column("review_sentiment", DataType::Text, "positive, neutral or negative")
    .depends_on(SRC_REVIEWS)
}

/// Keep only rows that are retained and new relative to `watermark`.
pub fn select_increment(rows: &[SrcReview], watermark: Option<NaiveDateTime>) -> (Vec<Review>, LoadReport) {
    let mut report = LoadReport {
        mode: if watermark.is_some() {
            LoadMode::Incremental
        } else {
            LoadMode::Initial
        },
        watermark,
        source_rows: rows.len(),
        inserted: 0,
        duplicates: 0,
        skipped_empty_text: 0,
        skipped_bad_watermark: 0,
        skipped_not_new: 0,
    };
    let mut selected = Vec::new();

    for row in rows {
        let text = match row.review_text.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => {
                report.skipped_empty_text += 1;
                continue;
            }
        };

        let Some(review_date) = row.review_date.as_deref().and_then(parse_timestamp) else {
            report.skipped_bad_watermark += 1;
            continue;
        };

        if let Some(mark) = watermark {
            if review_date <= mark {
                report.skipped_not_new += 1;
                continue;
            }
        }

        let listing_id = row.listing_id.to_string();
        let date_str = format_timestamp(&review_date);
        let review_id = surrogate_key(&[
            Some(listing_id.as_str()),
            Some(date_str.as_str()),
            row.reviewer_name.as_deref(),
            Some(text.as_str()),
        ]);

        selected.push(Review {
            review_id,
            listing_id: row.listing_id,
            review_date,
            reviewer_name: row.reviewer_name.clone(),
            review_text: text,
            // Known labels are canonicalised, anything else is kept for the accepted-values rule
            review_sentiment: row.review_sentiment.as_deref().map(|s| match Sentiment::parse(s) {
                Some(sentiment) => sentiment.as_str().to_string(),
                None => s.trim().to_string(),
            }),
        });
    }

    (selected, report)
}

/// Highest review_date already loaded, or None when the table is absent or empty.
pub fn current_watermark(conn: &Connection) -> Result<Option<NaiveDateTime>> {
    if !table_exists(conn, FCT_REVIEWS)? {
        return Ok(None);
    }
    let max: Option<String> = conn
        .query_row("SELECT MAX(review_date) FROM fct_reviews", [], |row| row.get(0))
        .optional()?
        .flatten();
    Ok(max.as_deref().and_then(parse_timestamp))
}

fn create_target(conn: &Connection) -> Result<()> {
    let relation = fct_reviews_relation();
    conn.execute(
        &relation
            .create_table_sql()
            .replacen("CREATE TABLE", "CREATE TABLE IF NOT EXISTS", 1),
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_fct_reviews_review_id ON fct_reviews(review_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fct_reviews_review_date ON fct_reviews(review_date)",
        [],
    )?;
    Ok(())
}

/// Run the incremental load. The whole batch commits or nothing does.
pub fn load_fct_reviews(conn: &mut Connection, full_refresh: bool) -> Result<LoadReport> {
    let source = read_src_reviews(conn)?;

    let tx = conn.transaction()?;
    if full_refresh {
        tx.execute("DROP TABLE IF EXISTS fct_reviews", [])?;
    }
    create_target(&tx)?;

    let watermark = current_watermark(&tx)?;
    debug!(watermark = ?watermark, "incremental window");
    let (reviews, mut report) = select_increment(&source, watermark);
    if full_refresh {
        report.mode = LoadMode::FullRefresh;
    }

    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO fct_reviews
                (review_id, listing_id, review_date, reviewer_name, review_text, review_sentiment)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for review in &reviews {
            let changed = stmt.execute(params![
                review.review_id,
                review.listing_id,
                format_timestamp(&review.review_date),
                review.reviewer_name,
                review.review_text,
                review.review_sentiment,
            ])?;
            if changed == 1 {
                report.inserted += 1;
            } else {
                report.duplicates += 1;
            }
        }
    }
    tx.commit()?;

    info!(
        model = FCT_REVIEWS,
        mode = ?report.mode,
        inserted = report.inserted,
        duplicates = report.duplicates,
        skipped_empty_text = report.skipped_empty_text,
        skipped_bad_watermark = report.skipped_bad_watermark,
        "incremental load finished"
    );
    Ok(report)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{row_count, setup_warehouse};
    use crate::sources::{create_source_views, write_raw_hosts, write_raw_listings, write_raw_reviews, RawReview};

    fn raw_review(listing_id: i64, date: Option<&str>, name: &str, text: Option<&str>) -> RawReview {
        RawReview {
            listing_id,
            date: date.map(str::to_string),
            reviewer_name: Some(name.to_string()),
            comments: text.map(str::to_string),
            sentiment: Some("positive".to_string()),
        }
    }

    fn warehouse(reviews: &[RawReview]) -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        setup_warehouse(&conn).unwrap();
        write_raw_listings(&mut conn, &[]).unwrap();
        write_raw_hosts(&mut conn, &[]).unwrap();
        write_raw_reviews(&mut conn, reviews).unwrap();
        create_source_views(&conn).unwrap();
        conn
    }

    #[test]
    fn test_initial_load_retains_non_empty_text() {
        let mut conn = warehouse(&[
            raw_review(1, Some("2024-01-01 00:00:00"), "Ann", Some("Lovely")),
            raw_review(1, Some("2024-01-02 00:00:00"), "Ben", Some("   ")),
            raw_review(2, Some("2024-01-03 00:00:00"), "Cat", None),
        ]);

        let report = load_fct_reviews(&mut conn, false).unwrap();
        assert_eq!(report.mode, LoadMode::Initial);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped_empty_text, 2);
        assert_eq!(row_count(&conn, FCT_REVIEWS).unwrap(), 1);
    }

    #[test]
    fn test_sentiment_labels_are_canonicalised() {
        let row = |label: &str| SrcReview {
            listing_id: 1,
            review_date: Some("2024-01-01".to_string()),
            reviewer_name: Some(label.to_string()),
            review_text: Some("Fine".to_string()),
            review_sentiment: Some(label.to_string()),
        };
        let (selected, _) = select_increment(&[row(" Positive "), row("NEGATIVE"), row("Meh ")], None);
        let labels: Vec<Option<&str>> = selected.iter().map(|r| r.review_sentiment.as_deref()).collect();
        assert_eq!(labels, vec![Some("positive"), Some("negative"), Some("Meh")]);
    }

    #[test]
    fn test_second_run_without_new_data_is_noop() {
        let reviews = vec![
            raw_review(1, Some("2024-01-01 00:00:00"), "Ann", Some("Lovely")),
            raw_review(2, Some("2024-01-05 12:00:00"), "Ben", Some("Noisy")),
        ];
        let mut conn = warehouse(&reviews);

        load_fct_reviews(&mut conn, false).unwrap();
        let second = load_fct_reviews(&mut conn, false).unwrap();

        assert_eq!(second.mode, LoadMode::Incremental);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped_not_new, 2);
        assert_eq!(row_count(&conn, FCT_REVIEWS).unwrap(), 2);
    }

    #[test]
    fn test_only_rows_after_watermark_are_loaded() {
        let mut conn = warehouse(&[raw_review(1, Some("2024-01-05 00:00:00"), "Ann", Some("Good"))]);
        load_fct_reviews(&mut conn, false).unwrap();

        write_raw_reviews(
            &mut conn,
            &[
                raw_review(1, Some("2024-01-05 00:00:00"), "Ann", Some("Good")),
                // Late arrival dated before the watermark is not picked up
                raw_review(1, Some("2024-01-04 00:00:00"), "Old", Some("Late")),
                raw_review(1, Some("2024-01-06 00:00:00"), "New", Some("Fresh")),
            ],
        )
        .unwrap();

        let report = load_fct_reviews(&mut conn, false).unwrap();
        assert_eq!(report.watermark, parse_timestamp("2024-01-05 00:00:00"));
        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped_not_new, 2);
        assert_eq!(current_watermark(&conn).unwrap(), parse_timestamp("2024-01-06 00:00:00"));
    }

    #[test]
    fn test_bad_watermark_rows_are_excluded_not_fatal() {
        let mut conn = warehouse(&[
            raw_review(1, None, "Ann", Some("No date")),
            raw_review(1, Some("yesterday"), "Ben", Some("Bad date")),
            raw_review(1, Some("2024-01-01"), "Cat", Some("Fine")),
        ]);

        let report = load_fct_reviews(&mut conn, false).unwrap();
        assert_eq!(report.skipped_bad_watermark, 2);
        assert_eq!(report.inserted, 1);
    }

    #[test]
    fn test_full_refresh_reloads_everything_once() {
        let reviews = vec![
            raw_review(1, Some("2024-01-01 00:00:00"), "Ann", Some("Lovely")),
            raw_review(2, Some("2024-01-02 00:00:00"), "Ben", Some("Nice")),
        ];
        let mut conn = warehouse(&reviews);
        load_fct_reviews(&mut conn, false).unwrap();

        let report = load_fct_reviews(&mut conn, true).unwrap();
        assert_eq!(report.mode, LoadMode::FullRefresh);
        assert_eq!(report.inserted, 2);
        assert_eq!(row_count(&conn, FCT_REVIEWS).unwrap(), 2);
    }

    #[test]
    fn test_identical_source_rows_collapse_to_one_review() {
        let mut conn = warehouse(&[
            raw_review(1, Some("2024-01-01 00:00:00"), "Ann", Some("Lovely")),
            raw_review(1, Some("2024-01-01 00:00:00"), "Ann", Some("Lovely")),
        ]);

        let report = load_fct_reviews(&mut conn, false).unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.duplicates, 1);
    }

    #[test]
    fn test_review_id_stable_across_date_formats() {
        let a = vec![SrcReview {
            listing_id: 7,
            review_date: Some("2024-01-26".to_string()),
            reviewer_name: Some("Ann".to_string()),
            review_text: Some("Nice".to_string()),
            review_sentiment: None,
        }];
        let mut b = a.clone();
        b[0].review_date = Some("2024-01-26 00:00:00".to_string());

        let (ra, _) = select_increment(&a, None);
        let (rb, _) = select_increment(&b, None);
        assert_eq!(ra[0].review_id, rb[0].review_id);
    }
}
