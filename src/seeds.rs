// 🌕 Seeds - static reference data shipped with the project

use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::Connection;
use serde::Deserialize;
use std::path::Path;
use tracing::info;

use crate::contract::{DataType, Materialization, Relation, RelationKind};
use crate::db::{replace_table, require_relation};
use crate::error::{PipelineError, Result};
use crate::temporal::{format_date, parse_date};

pub const SEED_FULL_MOON_DATES: &str = "seed_full_moon_dates";

#[derive(Debug, Deserialize)]
struct FullMoonRow {
    full_moon_date: String,
}

pub fn full_moon_relation() -> Relation {
    Relation::new(
        SEED_FULL_MOON_DATES,
        RelationKind::Seed,
        Materialization::Table,
        "Calendar of full-moon dates",
    )
    .column("full_moon_date", DataType::Date, "Date of a full moon")
}

/// Load the full-moon calendar CSV, replacing the previous seed contents.
pub fn load_full_moon_dates(conn: &mut Connection, path: &Path) -> Result<usize> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut dates = Vec::new();
    for result in rdr.deserialize() {
        let row: FullMoonRow = result?;
        let date = parse_date(&row.full_moon_date).ok_or_else(|| {
            PipelineError::invalid(SEED_FULL_MOON_DATES, "full_moon_date", row.full_moon_date.clone())
        })?;
        dates.push(date);
    }
    let loaded = write_full_moon_dates(conn, &dates)?;
    info!(relation = SEED_FULL_MOON_DATES, rows = loaded, "seed loaded");
    Ok(loaded)
}

pub fn write_full_moon_dates(conn: &mut Connection, dates: &[NaiveDate]) -> Result<usize> {
    let rows: Vec<Vec<Value>> = dates
        .iter()
        .map(|d| vec![Value::Text(format_date(d))])
        .collect();
    replace_table(conn, &full_moon_relation(), &rows)
}

pub fn read_full_moon_dates(conn: &Connection) -> Result<Vec<NaiveDate>> {
    require_relation(conn, SEED_FULL_MOON_DATES)?;
    let mut stmt = conn.prepare("SELECT full_moon_date FROM seed_full_moon_dates ORDER BY full_moon_date")?;
    let raw: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    raw.iter()
        .map(|s| {
            parse_date(s)
                .ok_or_else(|| PipelineError::invalid(SEED_FULL_MOON_DATES, "full_moon_date", s.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_and_read_seed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed_full_moon_dates.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "full_moon_date").unwrap();
        writeln!(file, "2024-01-25").unwrap();
        writeln!(file, "2023-12-27").unwrap();
        drop(file);

        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(load_full_moon_dates(&mut conn, &path).unwrap(), 2);

        let dates = read_full_moon_dates(&conn).unwrap();
        assert_eq!(
            dates,
            vec![
                NaiveDate::from_ymd_opt(2023, 12, 27).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 25).unwrap(),
            ]
        );
    }

    #[test]
    fn test_bad_seed_date_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.csv");
        std::fs::write(&path, "full_moon_date\nnot-a-date\n").unwrap();

        let mut conn = Connection::open_in_memory().unwrap();
        assert!(matches!(
            load_full_moon_dates(&mut conn, &path),
            Err(PipelineError::InvalidValue { .. })
        ));
    }
}
