// 🕰️ Slowly-Changing Snapshotter
//
// Historizes a raw table per natural key. Per key:
//
//   ACTIVE (valid_to NULL) ──newer version──▶ CLOSED (valid_to set)
//          └──────────key disappears───────▶ INVALIDATED (valid_to set, invalidated = 1)
//
// History is append-only: an ACTIVE row gets its valid_to exactly once and is
// never touched again after that. Point-in-time reconstruction is a range
// lookup on [valid_from, valid_to).

use chrono::NaiveDateTime;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{info, warn};

use crate::contract::{Column, DataType, Materialization, Relation, RelationKind};
use crate::db::{json_to_sql_value, query_json_rows, require_relation, table_exists};
use crate::entities::surrogate_key;
use crate::error::{PipelineError, Result};
use crate::sources::{raw_hosts_relation, raw_listings_relation};
use crate::temporal::{format_timestamp, parse_timestamp, Validity};

pub const SCD_RAW_LISTINGS: &str = "scd_raw_listings";
pub const SCD_RAW_HOSTS: &str = "scd_raw_hosts";

const SCD_COLUMNS: [&str; 5] = ["scd_id", "scd_updated_at", "valid_from", "valid_to", "invalidated"];

// ============================================================================
// CONFIGURATION
// ============================================================================

/// How a changed row is detected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum SnapshotStrategy {
    /// The updated_at column strictly increased
    Timestamp,
    /// Any of the listed columns changed value
    Check { columns: Vec<String> },
}

/// What to snapshot: source relation, natural key and change column.
#[derive(Debug, Clone)]
pub struct SnapshotSpec {
    pub name: String,
    pub source: Relation,
    pub unique_key: String,
    pub updated_at: String,
    pub strategy: SnapshotStrategy,
}

impl SnapshotSpec {
    pub fn listings(strategy: SnapshotStrategy) -> Self {
        SnapshotSpec {
            name: SCD_RAW_LISTINGS.to_string(),
            source: raw_listings_relation(),
            unique_key: "id".to_string(),
            updated_at: "updated_at".to_string(),
            strategy,
        }
    }

    pub fn hosts(strategy: SnapshotStrategy) -> Self {
        SnapshotSpec {
            name: SCD_RAW_HOSTS.to_string(),
            source: raw_hosts_relation(),
            unique_key: "id".to_string(),
            updated_at: "updated_at".to_string(),
            strategy,
        }
    }

    /// History relation: source columns followed by the SCD bookkeeping columns.
    pub fn relation(&self) -> Relation {
        let mut relation = Relation::new(
            &self.name,
            RelationKind::Snapshot,
            Materialization::Snapshot,
            &format!("Change history of {}", self.source.name),
        )
        .depends_on(&self.source.name);
        relation.columns = self.source.columns.clone();
        relation.columns.extend([
            Column::new("scd_id", DataType::Text, "Version id: hash of key and valid_from"),
            Column::new("scd_updated_at", DataType::Timestamp, "Change column value of this version"),
            Column::new("valid_from", DataType::Timestamp, "Start of validity"),
            Column::new("valid_to", DataType::Timestamp, "End of validity, NULL while active"),
            Column::new("invalidated", DataType::Boolean, "Key vanished from the source"),
        ]);
        relation
    }

    fn validate(&self) -> Result<()> {
        let names = self.source.column_names();
        for col in [&self.unique_key, &self.updated_at] {
            if !names.contains(&col.as_str()) {
                return Err(PipelineError::Config(format!(
                    "snapshot {}: column {} not in {}",
                    self.name, col, self.source.name
                )));
            }
        }
        if let SnapshotStrategy::Check { columns } = &self.strategy {
            if columns.is_empty() {
                return Err(PipelineError::Config(format!(
                    "snapshot {}: check strategy needs at least one column",
                    self.name
                )));
            }
            if let Some(missing) = columns.iter().find(|c| !names.contains(&c.as_str())) {
                return Err(PipelineError::Config(format!(
                    "snapshot {}: check column {} not in {}",
                    self.name, missing, self.source.name
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// One source row as seen by the snapshotter
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub key: String,
    pub updated_at: Option<NaiveDateTime>,
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// One historized version of a key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub scd_id: String,
    pub key: String,
    pub scd_updated_at: Option<NaiveDateTime>,
    pub validity: Validity,
    pub invalidated: bool,
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl SnapshotRecord {
    pub fn is_active(&self) -> bool {
        self.validity.is_current()
    }
}

fn key_string(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn timestamp_field(object: &serde_json::Map<String, serde_json::Value>, column: &str) -> Option<NaiveDateTime> {
    object.get(column).and_then(|v| v.as_str()).and_then(parse_timestamp)
}

fn record_from_json(spec: &SnapshotSpec, row: serde_json::Value) -> Option<SnapshotRecord> {
    let serde_json::Value::Object(mut object) = row else {
        return None;
    };
    let scd_id = object.remove("scd_id").and_then(|v| v.as_str().map(str::to_string))?;
    let scd_updated_at = timestamp_field(&object, "scd_updated_at");
    let valid_from = timestamp_field(&object, "valid_from")?;
    let valid_to = timestamp_field(&object, "valid_to");
    let invalidated = object.get("invalidated").and_then(|v| v.as_i64()).unwrap_or(0) != 0;
    for col in &SCD_COLUMNS[1..] {
        object.remove(*col);
    }
    let key = key_string(object.get(&spec.unique_key))?;

    Some(SnapshotRecord {
        scd_id,
        key,
        scd_updated_at,
        validity: Validity {
            valid_from,
            valid_to,
        },
        invalidated,
        attributes: object,
    })
}

// ============================================================================
// PLANNING (pure state machine)
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CloseVersion {
    pub scd_id: String,
    pub key: String,
    pub valid_to: NaiveDateTime,
    pub invalidate: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotPlan {
    pub closes: Vec<CloseVersion>,
    pub inserts: Vec<SnapshotRecord>,
    /// Timestamp strategy rows without a usable change column, or whose
    /// change cannot open a version after the active one yet
    pub skipped: usize,
}

fn new_version(row: &SourceRow, scd_updated_at: Option<NaiveDateTime>, valid_from: NaiveDateTime) -> SnapshotRecord {
    let from = format_timestamp(&valid_from);
    SnapshotRecord {
        scd_id: surrogate_key(&[Some(row.key.as_str()), Some(from.as_str())]),
        key: row.key.clone(),
        scd_updated_at,
        validity: Validity::open(valid_from),
        invalidated: false,
        attributes: row.attributes.clone(),
    }
}

fn check_columns_changed(columns: &[String], active: &SnapshotRecord, row: &SourceRow) -> bool {
    columns
        .iter()
        .any(|c| active.attributes.get(c) != row.attributes.get(c))
}

/// Decide which versions to close and which to insert.
///
/// `active` holds the current ACTIVE version per key, `known_keys` every key
/// that has any history at all. Source rows must have unique keys.
pub fn plan_snapshot(
    strategy: &SnapshotStrategy,
    active: &HashMap<String, SnapshotRecord>,
    known_keys: &HashSet<String>,
    source: &[SourceRow],
    run_at: NaiveDateTime,
) -> SnapshotPlan {
    let mut plan = SnapshotPlan::default();
    let mut seen = HashSet::new();

    for row in source {
        seen.insert(row.key.clone());

        match strategy {
            SnapshotStrategy::Timestamp => {
                let Some(updated_at) = row.updated_at else {
                    plan.skipped += 1;
                    continue;
                };
                match active.get(&row.key) {
                    None => {
                        // A returning key must not overlap its invalidated past
                        let valid_from = if known_keys.contains(&row.key) {
                            updated_at.max(run_at)
                        } else {
                            updated_at
                        };
                        plan.inserts.push(new_version(row, Some(updated_at), valid_from));
                    }
                    Some(current) => {
                        let newer = current.scd_updated_at.map_or(true, |prev| updated_at > prev);
                        if !newer {
                            continue;
                        }
                        // Never start before the version being closed
                        let start = if updated_at > current.validity.valid_from {
                            updated_at
                        } else {
                            run_at
                        };
                        if start <= current.validity.valid_from {
                            plan.skipped += 1;
                            continue;
                        }
                        plan.closes.push(CloseVersion {
                            scd_id: current.scd_id.clone(),
                            key: row.key.clone(),
                            valid_to: start,
                            invalidate: false,
                        });
                        plan.inserts.push(new_version(row, Some(updated_at), start));
                    }
                }
            }
            SnapshotStrategy::Check { columns } => match active.get(&row.key) {
                None => plan.inserts.push(new_version(row, Some(run_at), run_at)),
                Some(current) if check_columns_changed(columns, current, row) => {
                    plan.closes.push(CloseVersion {
                        scd_id: current.scd_id.clone(),
                        key: row.key.clone(),
                        valid_to: run_at,
                        invalidate: false,
                    });
                    plan.inserts.push(new_version(row, Some(run_at), run_at));
                }
                Some(_) => {}
            },
        }
    }

    // Hard deletes: ACTIVE keys missing from the extract
    let mut vanished: Vec<&SnapshotRecord> = active.values().filter(|r| !seen.contains(&r.key)).collect();
    vanished.sort_by(|a, b| a.key.cmp(&b.key));
    for record in vanished {
        plan.closes.push(CloseVersion {
            scd_id: record.scd_id.clone(),
            key: record.key.clone(),
            valid_to: run_at,
            invalidate: true,
        });
    }

    plan
}

// ============================================================================
// EXECUTION
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotReport {
    pub snapshot: String,
    pub new_keys: usize,
    pub new_versions: usize,
    pub invalidated: usize,
    pub skipped: usize,
}

fn read_source_rows(conn: &Connection, spec: &SnapshotSpec) -> Result<Vec<SourceRow>> {
    require_relation(conn, &spec.source.name)?;
    let sql = format!("SELECT {} FROM {}", spec.source.column_names().join(", "), spec.source.name);

    // One row per key; on duplicates the latest updated_at wins
    let mut by_key: BTreeMap<String, SourceRow> = BTreeMap::new();
    for row in query_json_rows(conn, &sql, [])? {
        let serde_json::Value::Object(object) = row else {
            continue;
        };
        let Some(key) = key_string(object.get(&spec.unique_key)) else {
            warn!(snapshot = %spec.name, "source row without key skipped");
            continue;
        };
        let candidate = SourceRow {
            key: key.clone(),
            updated_at: timestamp_field(&object, &spec.updated_at),
            attributes: object,
        };
        match by_key.get(&key) {
            Some(existing) if existing.updated_at >= candidate.updated_at => {}
            _ => {
                by_key.insert(key, candidate);
            }
        }
    }
    Ok(by_key.into_values().collect())
}

fn read_history(conn: &Connection, spec: &SnapshotSpec, filter: &str) -> Result<Vec<SnapshotRecord>> {
    let relation = spec.relation();
    let sql = format!(
        "SELECT {} FROM {} {} ORDER BY valid_from",
        relation.column_names().join(", "),
        spec.name,
        filter
    );
    Ok(query_json_rows(conn, &sql, [])?
        .into_iter()
        .filter_map(|row| record_from_json(spec, row))
        .collect())
}

fn ensure_history_table(conn: &Connection, spec: &SnapshotSpec) -> Result<()> {
    if table_exists(conn, &spec.name)? {
        return Ok(());
    }
    conn.execute(&spec.relation().create_table_sql(), [])?;
    conn.execute(
        &format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_{0}_scd_id ON {0}(scd_id)",
            spec.name
        ),
        [],
    )?;
    Ok(())
}

/// Snapshot the source once at `run_at`. All changes commit together.
pub fn run_snapshot(conn: &mut Connection, spec: &SnapshotSpec, run_at: NaiveDateTime) -> Result<SnapshotReport> {
    spec.validate()?;
    let source = read_source_rows(conn, spec)?;

    let tx = conn.transaction()?;
    ensure_history_table(&tx, spec)?;

    let history = read_history(&tx, spec, "")?;
    let known_keys: HashSet<String> = history.iter().map(|r| r.key.clone()).collect();
    let active: HashMap<String, SnapshotRecord> = history
        .into_iter()
        .filter(|r| r.is_active())
        .map(|r| (r.key.clone(), r))
        .collect();

    let plan = plan_snapshot(&spec.strategy, &active, &known_keys, &source, run_at);

    for close in &plan.closes {
        tx.execute(
            &format!(
                "UPDATE {} SET valid_to = ?1, invalidated = ?2 WHERE scd_id = ?3 AND valid_to IS NULL",
                spec.name
            ),
            params![format_timestamp(&close.valid_to), i64::from(close.invalidate), close.scd_id],
        )?;
    }

    let relation = spec.relation();
    {
        let mut stmt = tx.prepare(&relation.insert_sql())?;
        for record in &plan.inserts {
            let values: Vec<Value> = relation
                .columns
                .iter()
                .map(|col| match col.name.as_str() {
                    "scd_id" => Value::Text(record.scd_id.clone()),
                    "scd_updated_at" => record
                        .scd_updated_at
                        .map(|t| Value::Text(format_timestamp(&t)))
                        .unwrap_or(Value::Null),
                    "valid_from" => Value::Text(format_timestamp(&record.validity.valid_from)),
                    "valid_to" => Value::Null,
                    "invalidated" => Value::Integer(0),
                    other => record.attributes.get(other).map(json_to_sql_value).unwrap_or(Value::Null),
                })
                .collect();
            stmt.execute(params_from_iter(values.iter()))?;
        }
    }
    tx.commit()?;

    let new_keys = plan.inserts.iter().filter(|r| !active.contains_key(&r.key)).count();
    let report = SnapshotReport {
        snapshot: spec.name.clone(),
        new_keys,
        new_versions: plan.inserts.len() - new_keys,
        invalidated: plan.closes.iter().filter(|c| c.invalidate).count(),
        skipped: plan.skipped,
    };
    info!(
        snapshot = %report.snapshot,
        new_keys = report.new_keys,
        new_versions = report.new_versions,
        invalidated = report.invalidated,
        "snapshot taken"
    );
    Ok(report)
}

/// Every version of one key, oldest first.
pub fn key_history(conn: &Connection, spec: &SnapshotSpec, key: &str) -> Result<Vec<SnapshotRecord>> {
    require_relation(conn, &spec.name)?;
    Ok(read_history(conn, spec, "")?
        .into_iter()
        .filter(|r| r.key == key)
        .collect())
}

/// The version of `key` that was valid at `time`, if any.
pub fn as_of(conn: &Connection, spec: &SnapshotSpec, key: &str, time: NaiveDateTime) -> Result<Option<SnapshotRecord>> {
    Ok(key_history(conn, spec, key)?
        .into_iter()
        .find(|r| r.validity.was_valid_at(time)))
}

// ============================================================================
// TESTS
// ============================================================================
