// 🧹 Dimension Cleanser
//
// Column rules:
// - minimum_nights <= 0 becomes 1
// - price "$1,250.00" becomes 1250.00; unparseable or negative aborts the model
// - empty host name becomes "Anonymous"
//
// Every model is cleansed fully in memory before the table is replaced, so a
// single bad row means nothing of that model is committed.

use rusqlite::types::Value;
use rusqlite::Connection;
use rust_decimal::Decimal;
use std::str::FromStr;
use tracing::{debug, info};

use crate::contract::{DataType, Materialization, Relation, RelationKind, SchemaContract};
use crate::db::{replace_table, replace_table_from_select, require_relation};
use crate::entities::{parse_superhost, Host, Listing, RoomType, ANONYMOUS_HOST};
use crate::error::{PipelineError, Result};
use crate::sources::{read_src_hosts, read_src_listings, SrcHost, SrcListing, SRC_HOSTS, SRC_LISTINGS};
use crate::temporal::{format_timestamp, parse_timestamp};

pub const DIM_LISTINGS_CLEANSED: &str = "dim_listings_cleansed";
pub const DIM_HOSTS_CLEANSED: &str = "dim_hosts_cleansed";
pub const DIM_LISTINGS_W_HOSTS: &str = "dim_listings_w_hosts";

// ============================================================================
// COLUMN RULES
// ============================================================================

/// Non-positive minimum stays are data-entry errors and become 1.
pub fn cleanse_minimum_nights(raw: i64) -> i64 {
    if raw <= 0 {
        1
    } else {
        raw
    }
}

/// Parse a currency-formatted price into a two-decimal value.
///
/// Accepts an optional leading `$` and `,` thousands separators.
/// Returns the failure reason on error.
pub fn parse_price(raw: &str) -> std::result::Result<Decimal, String> {
    let trimmed = raw.trim();
    let unsigned = trimmed.strip_prefix('$').unwrap_or(trimmed);
    let digits: String = unsigned.chars().filter(|c| *c != ',').collect();

    if digits.is_empty() {
        return Err("empty price".to_string());
    }
    // Separators must sit between digits: "$,5" or "5,,0" are not prices
    if unsigned.starts_with(',') || unsigned.ends_with(',') || unsigned.contains(",,") {
        return Err("misplaced thousands separator".to_string());
    }

    let value = Decimal::from_str(&digits).map_err(|e| e.to_string())?;
    if value.is_sign_negative() && !value.is_zero() {
        return Err("negative price".to_string());
    }
    Ok(value.round_dp(2))
}

pub fn cleanse_host_name(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => ANONYMOUS_HOST.to_string(),
    }
}

fn required_timestamp(relation: &str, field: &str, raw: &Option<String>) -> Result<chrono::NaiveDateTime> {
    raw.as_deref()
        .and_then(parse_timestamp)
        .ok_or_else(|| PipelineError::invalid(relation, field, raw.clone().unwrap_or_default()))
}

pub fn cleanse_listing(src: &SrcListing) -> Result<Listing> {
    let raw_room_type = src.room_type.clone().unwrap_or_default();
    let room_type = RoomType::parse(&raw_room_type)
        .ok_or_else(|| PipelineError::invalid(DIM_LISTINGS_CLEANSED, "room_type", raw_room_type.clone()))?;

    let raw_price = src.price_str.clone().unwrap_or_default();
    let price = parse_price(&raw_price).map_err(|reason| PipelineError::PriceParse {
        listing_id: src.listing_id,
        raw: raw_price.clone(),
        reason,
    })?;

    let host_id = src
        .host_id
        .ok_or_else(|| PipelineError::invalid(DIM_LISTINGS_CLEANSED, "host_id", "NULL"))?;

    Ok(Listing {
        listing_id: src.listing_id,
        listing_name: src.listing_name.clone().unwrap_or_default(),
        room_type,
        // A missing value is treated like 0
        minimum_nights: cleanse_minimum_nights(src.minimum_nights.unwrap_or(0)),
        host_id,
        price,
        created_at: required_timestamp(DIM_LISTINGS_CLEANSED, "created_at", &src.created_at)?,
        updated_at: required_timestamp(DIM_LISTINGS_CLEANSED, "updated_at", &src.updated_at)?,
    })
}

pub fn cleanse_host(src: &SrcHost) -> Result<Host> {
    let raw_flag = src.is_superhost.clone().unwrap_or_default();
    let is_superhost = parse_superhost(&raw_flag)
        .ok_or_else(|| PipelineError::invalid(DIM_HOSTS_CLEANSED, "is_superhost", raw_flag.clone()))?;

    Ok(Host {
        host_id: src.host_id,
        host_name: cleanse_host_name(src.host_name.as_deref()),
        is_superhost,
        created_at: required_timestamp(DIM_HOSTS_CLEANSED, "created_at", &src.created_at)?,
        updated_at: required_timestamp(DIM_HOSTS_CLEANSED, "updated_at", &src.updated_at)?,
    })
}

// ============================================================================
// RELATIONS
// ============================================================================

pub fn dim_listings_relation() -> Relation {
    Relation::new(
        DIM_LISTINGS_CLEANSED,
        RelationKind::Model,
        Materialization::Table,
        "Cleansed listings: minimum_nights >= 1, numeric price",
    )
    .column("listing_id", DataType::Integer, "Primary key")
    .column("listing_name", DataType::Text, "Listing title")
    .column("room_type", DataType::Text, "One of the four room type labels")
    .column("minimum_nights", DataType::Integer, "Minimum stay, always >= 1")
    .column("host_id", DataType::Integer, "References dim_hosts_cleansed")
    .column("price", DataType::Numeric, "Nightly price")
    .column("created_at", DataType::Timestamp, "Creation timestamp")
    .column("updated_at", DataType::Timestamp, "Last update timestamp")
    .depends_on(SRC_LISTINGS)
}

pub fn dim_hosts_relation() -> Relation {
    Relation::new(
        DIM_HOSTS_CLEANSED,
        RelationKind::Model,
        Materialization::Table,
        "Cleansed hosts, one row per host_id",
    )
    .column("host_id", DataType::Integer, "Primary key")
    .column("host_name", DataType::Text, "Display name, Anonymous when missing")
    .column("is_superhost", DataType::Boolean, "Superhost flag")
    .column("created_at", DataType::Timestamp, "Creation timestamp")
    .column("updated_at", DataType::Timestamp, "Last update timestamp")
    .depends_on(SRC_HOSTS)
}

pub fn dim_listings_w_hosts_relation() -> Relation {
    Relation::new(
        DIM_LISTINGS_W_HOSTS,
        RelationKind::Model,
        Materialization::Table,
        "Listings joined with their host",
    )
    .column("listing_id", DataType::Integer, "Primary key")
    .column("listing_name", DataType::Text, "Listing title")
    .column("room_type", DataType::Text, "Room type label")
    .column("minimum_nights", DataType::Integer, "Minimum stay")
    .column("price", DataType::Numeric, "Nightly price")
    .column("host_id", DataType::Integer, "Owning host")
    .column("host_name", DataType::Text, "Host display name")
    .column("host_is_superhost", DataType::Boolean, "Superhost flag")
    .column("created_at", DataType::Timestamp, "Listing creation timestamp")
    .column("updated_at", DataType::Timestamp, "Latest of listing and host update")
    .depends_on(DIM_LISTINGS_CLEANSED)
    .depends_on(DIM_HOSTS_CLEANSED)
}

fn listing_values(l: &Listing) -> Vec<Value> {
    vec![
        Value::Integer(l.listing_id),
        Value::Text(l.listing_name.clone()),
        Value::Text(l.room_type.as_str().to_string()),
        Value::Integer(l.minimum_nights),
        Value::Integer(l.host_id),
        // NUMERIC affinity stores the decimal text as a number
        Value::Text(l.price.to_string()),
        Value::Text(format_timestamp(&l.created_at)),
        Value::Text(format_timestamp(&l.updated_at)),
    ]
}

fn host_values(h: &Host) -> Vec<Value> {
    vec![
        Value::Integer(h.host_id),
        Value::Text(h.host_name.clone()),
        Value::Integer(i64::from(h.is_superhost)),
        Value::Text(format_timestamp(&h.created_at)),
        Value::Text(format_timestamp(&h.updated_at)),
    ]
}

// ============================================================================
// MODEL BUILDERS
// ============================================================================

fn enforce_contract(contract: Option<&SchemaContract>, relation: &Relation) -> Result<()> {
    if let Some(contract) = contract {
        contract.enforce(relation)?;
        debug!(model = %relation.name, "contract satisfied");
    }
    Ok(())
}

pub fn build_dim_listings(conn: &mut Connection, contract: Option<&SchemaContract>) -> Result<usize> {
    let relation = dim_listings_relation();
    enforce_contract(contract, &relation)?;

    let rows = read_src_listings(conn)?
        .iter()
        .map(|src| cleanse_listing(src).map(|l| listing_values(&l)))
        .collect::<Result<Vec<_>>>()?;

    let written = replace_table(conn, &relation, &rows)?;
    info!(model = DIM_LISTINGS_CLEANSED, rows = written, "model built");
    Ok(written)
}

pub fn build_dim_hosts(conn: &mut Connection, contract: Option<&SchemaContract>) -> Result<usize> {
    let relation = dim_hosts_relation();
    enforce_contract(contract, &relation)?;

    let rows = read_src_hosts(conn)?
        .iter()
        .map(|src| cleanse_host(src).map(|h| host_values(&h)))
        .collect::<Result<Vec<_>>>()?;

    let written = replace_table(conn, &relation, &rows)?;
    info!(model = DIM_HOSTS_CLEANSED, rows = written, "model built");
    Ok(written)
}

pub fn build_dim_listings_w_hosts(conn: &mut Connection, contract: Option<&SchemaContract>) -> Result<usize> {
    let relation = dim_listings_w_hosts_relation();
    enforce_contract(contract, &relation)?;
    require_relation(conn, DIM_LISTINGS_CLEANSED)?;
    require_relation(conn, DIM_HOSTS_CLEANSED)?;

    let written = replace_table_from_select(
        conn,
        &relation,
        "SELECT l.listing_id,
                l.listing_name,
                l.room_type,
                l.minimum_nights,
                l.price,
                l.host_id,
                h.host_name,
                h.is_superhost,
                l.created_at,
                COALESCE(MAX(l.updated_at, h.updated_at), l.updated_at)
         FROM dim_listings_cleansed l
         LEFT JOIN dim_hosts_cleansed h ON l.host_id = h.host_id",
    )?;
    info!(model = DIM_LISTINGS_W_HOSTS, rows = written, "model built");
    Ok(written)
}

// ============================================================================
// TESTS
// ============================================================================
