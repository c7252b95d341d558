// 🌕 Mart Composer - mart_fullmoon_reviews
//
// A review is flagged "full moon" when it was written the day after a full
// moon. The flag depends only on review_date and the calendar.

use chrono::{Days, NaiveDate, NaiveDateTime};
use rusqlite::types::Value;
use rusqlite::Connection;
use std::collections::HashSet;
use tracing::info;

use crate::contract::{DataType, Materialization, Relation, RelationKind, SchemaContract};
use crate::db::{json_to_sql_value, query_json_rows, replace_table, require_relation};
use crate::error::Result;
use crate::incremental::{fct_reviews_relation, FCT_REVIEWS};
use crate::seeds::{read_full_moon_dates, SEED_FULL_MOON_DATES};
use crate::temporal::parse_timestamp;

pub const MART_FULLMOON_REVIEWS: &str = "mart_fullmoon_reviews";

pub const FULL_MOON: &str = "full moon";
pub const NOT_FULL_MOON: &str = "not full moon";

/// "full moon" iff the review's calendar day is a full moon date + 1 day.
pub fn full_moon_flag(review_date: NaiveDateTime, calendar: &HashSet<NaiveDate>) -> &'static str {
    let day_before = review_date.date().checked_sub_days(Days::new(1));
    match day_before {
        Some(day) if calendar.contains(&day) => FULL_MOON,
        _ => NOT_FULL_MOON,
    }
}

pub fn mart_fullmoon_relation() -> Relation {
    let mut relation = Relation::new(
        MART_FULLMOON_REVIEWS,
        RelationKind::Model,
        Materialization::Table,
        "Reviews flagged by whether they were written the day after a full moon",
    )
    .depends_on(FCT_REVIEWS)
    .depends_on(SEED_FULL_MOON_DATES);
    relation.columns = fct_reviews_relation().columns;
    relation.column("is_full_moon", DataType::Text, "full moon / not full moon")
}

pub fn build_mart_fullmoon_reviews(conn: &mut Connection, contract: Option<&SchemaContract>) -> Result<usize> {
    let relation = mart_fullmoon_relation();
    if let Some(contract) = contract {
        contract.enforce(&relation)?;
    }
    require_relation(conn, FCT_REVIEWS)?;
    let calendar: HashSet<NaiveDate> = read_full_moon_dates(conn)?.into_iter().collect();

    let fact_columns = fct_reviews_relation().column_names().join(", ");
    let facts = query_json_rows(
        conn,
        &format!("SELECT {} FROM fct_reviews ORDER BY review_date, review_id", fact_columns),
        [],
    )?;

    let mut rows = Vec::with_capacity(facts.len());
    let mut flagged = 0usize;
    for fact in &facts {
        let review_date = fact["review_date"].as_str().and_then(parse_timestamp);
        // Loader guarantees a parsable review_date; anything else is simply not flagged
        let flag = review_date.map_or(NOT_FULL_MOON, |d| full_moon_flag(d, &calendar));
        if flag == FULL_MOON {
            flagged += 1;
        }

        let mut row: Vec<Value> = relation.columns[..relation.columns.len() - 1]
            .iter()
            .map(|c| json_to_sql_value(&fact[c.name.as_str()]))
            .collect();
        row.push(Value::Text(flag.to_string()));
        rows.push(row);
    }

    let written = replace_table(conn, &relation, &rows)?;
    info!(model = MART_FULLMOON_REVIEWS, rows = written, full_moon = flagged, "model built");
    Ok(written)
}
