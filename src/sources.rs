// 📥 Source adapter
//
// Raw CSV extracts are loaded as-is into raw_* tables. The src_* views only
// rename columns; every business rule lives downstream.

use rusqlite::types::Value;
use rusqlite::Connection;
use serde::Deserialize;
use std::path::Path;
use tracing::info;

use crate::contract::{DataType, Materialization, Relation, RelationKind};
use crate::db::{replace_table, require_relation};
use crate::error::{PipelineError, Result};

pub const RAW_LISTINGS: &str = "raw_listings";
pub const RAW_HOSTS: &str = "raw_hosts";
pub const RAW_REVIEWS: &str = "raw_reviews";

pub const SRC_LISTINGS: &str = "src_listings";
pub const SRC_HOSTS: &str = "src_hosts";
pub const SRC_REVIEWS: &str = "src_reviews";

// ============================================================================
// RAW EXTRACT ROWS (CSV headers as delivered by the feed)
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct RawListing {
    pub id: i64,
    pub listing_url: Option<String>,
    pub name: Option<String>,
    pub room_type: Option<String>,
    pub minimum_nights: Option<i64>,
    pub host_id: Option<i64>,
    pub price: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawHost {
    pub id: i64,
    pub name: Option<String>,
    pub is_superhost: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawReview {
    pub listing_id: i64,
    pub date: Option<String>,
    pub reviewer_name: Option<String>,
    pub comments: Option<String>,
    pub sentiment: Option<String>,
}

fn text(v: &Option<String>) -> Value {
    match v {
        Some(s) => Value::Text(s.clone()),
        None => Value::Null,
    }
}

fn int(v: Option<i64>) -> Value {
    v.map(Value::Integer).unwrap_or(Value::Null)
}

impl RawListing {
    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.id),
            text(&self.listing_url),
            text(&self.name),
            text(&self.room_type),
            int(self.minimum_nights),
            int(self.host_id),
            text(&self.price),
            text(&self.created_at),
            text(&self.updated_at),
        ]
    }
}

impl RawHost {
    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.id),
            text(&self.name),
            text(&self.is_superhost),
            text(&self.created_at),
            text(&self.updated_at),
        ]
    }
}

impl RawReview {
    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.listing_id),
            text(&self.date),
            text(&self.reviewer_name),
            text(&self.comments),
            text(&self.sentiment),
        ]
    }
}

// ============================================================================
// RELATIONS
// ============================================================================

pub fn raw_listings_relation() -> Relation {
    Relation::new(RAW_LISTINGS, RelationKind::Source, Materialization::Table, "Raw listings extract")
        .column("id", DataType::Integer, "Listing id")
        .column("listing_url", DataType::Text, "Public URL")
        .column("name", DataType::Text, "Listing title")
        .column("room_type", DataType::Text, "Room type label")
        .column("minimum_nights", DataType::Integer, "Minimum stay, may be 0")
        .column("host_id", DataType::Integer, "Owning host")
        .column("price", DataType::Text, "Currency-formatted price, e.g. $1,250.00")
        .column("created_at", DataType::Text, "Creation timestamp")
        .column("updated_at", DataType::Text, "Last update timestamp")
}

pub fn raw_hosts_relation() -> Relation {
    Relation::new(RAW_HOSTS, RelationKind::Source, Materialization::Table, "Raw hosts extract")
        .column("id", DataType::Integer, "Host id")
        .column("name", DataType::Text, "Host display name, may be null")
        .column("is_superhost", DataType::Text, "t or f")
        .column("created_at", DataType::Text, "Creation timestamp")
        .column("updated_at", DataType::Text, "Last update timestamp")
}

pub fn raw_reviews_relation() -> Relation {
    Relation::new(RAW_REVIEWS, RelationKind::Source, Materialization::Table, "Raw reviews extract")
        .column("listing_id", DataType::Integer, "Reviewed listing")
        .column("date", DataType::Text, "Review date")
        .column("reviewer_name", DataType::Text, "Reviewer")
        .column("comments", DataType::Text, "Free-text review")
        .column("sentiment", DataType::Text, "positive, neutral or negative")
}

pub fn src_listings_relation() -> Relation {
    Relation::new(SRC_LISTINGS, RelationKind::Model, Materialization::View, "Listings with renamed columns")
        .column("listing_id", DataType::Integer, "Listing id")
        .column("listing_name", DataType::Text, "Listing title")
        .column("listing_url", DataType::Text, "Public URL")
        .column("room_type", DataType::Text, "Room type label")
        .column("minimum_nights", DataType::Integer, "Minimum stay as delivered")
        .column("host_id", DataType::Integer, "Owning host")
        .column("price_str", DataType::Text, "Price as delivered")
        .column("created_at", DataType::Text, "Creation timestamp")
        .column("updated_at", DataType::Text, "Last update timestamp")
        .depends_on(RAW_LISTINGS)
}

pub fn src_hosts_relation() -> Relation {
    Relation::new(SRC_HOSTS, RelationKind::Model, Materialization::View, "Hosts with renamed columns")
        .column("host_id", DataType::Integer, "Host id")
        .column("host_name", DataType::Text, "Host display name")
        .column("is_superhost", DataType::Text, "t or f")
        .column("created_at", DataType::Text, "Creation timestamp")
        .column("updated_at", DataType::Text, "Last update timestamp")
        .depends_on(RAW_HOSTS)
}

pub fn src_reviews_relation() -> Relation {
    Relation::new(SRC_REVIEWS, RelationKind::Model, Materialization::View, "Reviews with renamed columns")
        .column("listing_id", DataType::Integer, "Reviewed listing")
        .column("review_date", DataType::Text, "Review date")
        .column("reviewer_name", DataType::Text, "Reviewer")
        .column("review_text", DataType::Text, "Free-text review")
        .column("review_sentiment", DataType::Text, "Sentiment label")
        .depends_on(RAW_REVIEWS)
}

// ============================================================================
// LOADING
// ============================================================================

fn read_csv<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Err(PipelineError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("source file not found: {}", path.display()),
        )));
    }
    let mut rdr = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for result in rdr.deserialize() {
        rows.push(result?);
    }
    Ok(rows)
}

pub fn load_raw_listings(conn: &mut Connection, path: &Path) -> Result<usize> {
    let rows: Vec<RawListing> = read_csv(path)?;
    let values: Vec<Vec<Value>> = rows.iter().map(|r| r.to_values()).collect();
    let loaded = replace_table(conn, &raw_listings_relation(), &values)?;
    info!(relation = RAW_LISTINGS, rows = loaded, "raw extract loaded");
    Ok(loaded)
}

pub fn load_raw_hosts(conn: &mut Connection, path: &Path) -> Result<usize> {
    let rows: Vec<RawHost> = read_csv(path)?;
    let values: Vec<Vec<Value>> = rows.iter().map(|r| r.to_values()).collect();
    let loaded = replace_table(conn, &raw_hosts_relation(), &values)?;
    info!(relation = RAW_HOSTS, rows = loaded, "raw extract loaded");
    Ok(loaded)
}

pub fn load_raw_reviews(conn: &mut Connection, path: &Path) -> Result<usize> {
    let rows: Vec<RawReview> = read_csv(path)?;
    let values: Vec<Vec<Value>> = rows.iter().map(|r| r.to_values()).collect();
    let loaded = replace_table(conn, &raw_reviews_relation(), &values)?;
    info!(relation = RAW_REVIEWS, rows = loaded, "raw extract loaded");
    Ok(loaded)
}

/// Write raw rows directly (used when extracts come from memory rather than files).
pub fn write_raw_listings(conn: &mut Connection, rows: &[RawListing]) -> Result<usize> {
    let values: Vec<Vec<Value>> = rows.iter().map(|r| r.to_values()).collect();
    replace_table(conn, &raw_listings_relation(), &values)
}

pub fn write_raw_hosts(conn: &mut Connection, rows: &[RawHost]) -> Result<usize> {
    let values: Vec<Vec<Value>> = rows.iter().map(|r| r.to_values()).collect();
    replace_table(conn, &raw_hosts_relation(), &values)
}

pub fn write_raw_reviews(conn: &mut Connection, rows: &[RawReview]) -> Result<usize> {
    let values: Vec<Vec<Value>> = rows.iter().map(|r| r.to_values()).collect();
    replace_table(conn, &raw_reviews_relation(), &values)
}

// ============================================================================
// SOURCE VIEWS
// ============================================================================

/// (Re)create the renaming views over the raw tables.
pub fn create_source_views(conn: &Connection) -> Result<()> {
    require_relation(conn, RAW_LISTINGS)?;
    require_relation(conn, RAW_HOSTS)?;
    require_relation(conn, RAW_REVIEWS)?;

    conn.execute_batch(
        "DROP VIEW IF EXISTS src_listings;
         CREATE VIEW src_listings AS
         SELECT id AS listing_id,
                name AS listing_name,
                listing_url,
                room_type,
                minimum_nights,
                host_id,
                price AS price_str,
                created_at,
                updated_at
         FROM raw_listings;

         DROP VIEW IF EXISTS src_hosts;
         CREATE VIEW src_hosts AS
         SELECT id AS host_id,
                name AS host_name,
                is_superhost,
                created_at,
                updated_at
         FROM raw_hosts;

         DROP VIEW IF EXISTS src_reviews;
         CREATE VIEW src_reviews AS
         SELECT listing_id,
                date AS review_date,
                reviewer_name,
                comments AS review_text,
                sentiment AS review_sentiment
         FROM raw_reviews;",
    )?;
    Ok(())
}

// ============================================================================
// TYPED READERS
// ============================================================================

#[derive(Debug, Clone)]
pub struct SrcListing {
    pub listing_id: i64,
    pub listing_name: Option<String>,
    pub room_type: Option<String>,
    pub minimum_nights: Option<i64>,
    pub host_id: Option<i64>,
    pub price_str: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SrcHost {
    pub host_id: i64,
    pub host_name: Option<String>,
    pub is_superhost: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SrcReview {
    pub listing_id: i64,
    pub review_date: Option<String>,
    pub reviewer_name: Option<String>,
    pub review_text: Option<String>,
    pub review_sentiment: Option<String>,
}

pub fn read_src_listings(conn: &Connection) -> Result<Vec<SrcListing>> {
    require_relation(conn, SRC_LISTINGS)?;
    let mut stmt = conn.prepare(
        "SELECT listing_id, listing_name, room_type, minimum_nights, host_id,
                price_str, created_at, updated_at
         FROM src_listings
         ORDER BY listing_id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(SrcListing {
                listing_id: row.get(0)?,
                listing_name: row.get(1)?,
                room_type: row.get(2)?,
                minimum_nights: row.get(3)?,
                host_id: row.get(4)?,
                price_str: row.get(5)?,
                created_at: row.get(6)?,
                updated_at: row.get(7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn read_src_hosts(conn: &Connection) -> Result<Vec<SrcHost>> {
    require_relation(conn, SRC_HOSTS)?;
    let mut stmt = conn.prepare(
        "SELECT host_id, host_name, is_superhost, created_at, updated_at
         FROM src_hosts
         ORDER BY host_id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(SrcHost {
                host_id: row.get(0)?,
                host_name: row.get(1)?,
                is_superhost: row.get(2)?,
                created_at: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn read_src_reviews(conn: &Connection) -> Result<Vec<SrcReview>> {
    require_relation(conn, SRC_REVIEWS)?;
    let mut stmt = conn.prepare(
        "SELECT listing_id, review_date, reviewer_name, review_text, review_sentiment
         FROM src_reviews",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(SrcReview {
                listing_id: row.get(0)?,
                review_date: row.get(1)?,
                reviewer_name: row.get(2)?,
                review_text: row.get(3)?,
                review_sentiment: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_warehouse;
    use std::io::Write;

    #[test]
    fn test_load_csv_and_read_through_views() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "id,name,is_superhost,created_at,updated_at").unwrap();
        writeln!(file, "1,Alice,t,2020-01-01 10:00:00,2020-01-02 10:00:00").unwrap();
        writeln!(file, "2,,f,2020-01-01 10:00:00,2020-01-02 10:00:00").unwrap();
        drop(file);

        let mut conn = Connection::open_in_memory().unwrap();
        setup_warehouse(&conn).unwrap();
        assert_eq!(load_raw_hosts(&mut conn, &path).unwrap(), 2);
        write_raw_listings(&mut conn, &[]).unwrap();
        write_raw_reviews(&mut conn, &[]).unwrap();
        create_source_views(&conn).unwrap();

        let hosts = read_src_hosts(&conn).unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].host_name.as_deref(), Some("Alice"));
        // Empty CSV field arrives as None
        assert_eq!(hosts[1].host_name, None);
        assert_eq!(hosts[1].is_superhost.as_deref(), Some("f"));
    }

    #[test]
    fn test_views_require_raw_tables() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(matches!(
            create_source_views(&conn),
            Err(PipelineError::MissingRelation(_))
        ));
    }

    #[test]
    fn test_missing_csv_is_io_error() {
        let mut conn = Connection::open_in_memory().unwrap();
        let err = load_raw_listings(&mut conn, Path::new("/no/such/listings.csv")).unwrap_err();
        assert!(matches!(err, PipelineError::Io(_)));
    }
}
