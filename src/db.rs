use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::contract::Relation;
use crate::error::{PipelineError, Result};

/// Open (or create) the warehouse file and make sure bookkeeping tables exist.
pub fn open_warehouse(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    setup_warehouse(&conn)?;
    Ok(conn)
}

pub fn setup_warehouse(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Failure sink: rows that failed a data-quality rule
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS dq_failures (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            test_name TEXT NOT NULL,
            relation TEXT NOT NULL,
            severity TEXT NOT NULL,
            row_json TEXT NOT NULL,
            detected_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Run events (audit trail of every model, seed, snapshot and test)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS run_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            run_id TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_dq_failures_test ON dq_failures(test_name)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_run_events_entity ON run_events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// RELATION HELPERS
// ============================================================================

pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn row_count(conn: &Connection, name: &str) -> Result<i64> {
    if !table_exists(conn, name)? {
        return Err(PipelineError::MissingRelation(name.to_string()));
    }
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", name), [], |row| {
        row.get(0)
    })?;
    Ok(count)
}

pub fn require_relation(conn: &Connection, name: &str) -> Result<()> {
    if table_exists(conn, name)? {
        Ok(())
    } else {
        Err(PipelineError::MissingRelation(name.to_string()))
    }
}

/// Rebuild a table from rows inside one transaction.
///
/// If any insert fails the transaction rolls back and the previous contents
/// of the table survive.
pub fn replace_table(conn: &mut Connection, relation: &Relation, rows: &[Vec<Value>]) -> Result<usize> {
    let tx = conn.transaction()?;
    tx.execute(&format!("DROP TABLE IF EXISTS {}", relation.name), [])?;
    tx.execute(&relation.create_table_sql(), [])?;

    {
        let mut stmt = tx.prepare(&relation.insert_sql())?;
        for row in rows {
            stmt.execute(params_from_iter(row.iter()))?;
        }
    }

    tx.commit()?;
    debug!(relation = %relation.name, rows = rows.len(), "table replaced");
    Ok(rows.len())
}

/// Rebuild a table from a SELECT whose output columns follow `relation.columns` in order.
pub fn replace_table_from_select(conn: &mut Connection, relation: &Relation, select_sql: &str) -> Result<usize> {
    let tx = conn.transaction()?;
    tx.execute(&format!("DROP TABLE IF EXISTS {}", relation.name), [])?;
    tx.execute(&relation.create_table_sql(), [])?;
    let inserted = tx.execute(
        &format!(
            "INSERT INTO {} ({}) {}",
            relation.name,
            relation.column_names().join(", "),
            select_sql
        ),
        [],
    )?;
    tx.commit()?;
    debug!(relation = %relation.name, rows = inserted, "table replaced from select");
    Ok(inserted)
}

/// Run a query and return every row as a JSON object keyed by column name.
pub fn query_json_rows<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

    let rows = stmt
        .query_map(params, |row| {
            let mut object = serde_json::Map::new();
            for (i, name) in names.iter().enumerate() {
                let value: Value = row.get(i)?;
                object.insert(name.clone(), sql_value_to_json(value));
            }
            Ok(serde_json::Value::Object(object))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

pub fn sql_value_to_json(value: Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => serde_json::json!(i),
        Value::Real(f) => serde_json::json!(f),
        Value::Text(s) => serde_json::json!(s),
        Value::Blob(b) => serde_json::json!(format!("<{} bytes>", b.len())),
    }
}

pub fn json_to_sql_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Real(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

// ============================================================================
// RUN EVENTS
// ============================================================================

/// One entry in the run audit trail
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub run_id: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        run_id: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            run_id: run_id.to_string(),
        }
    }
}

pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO run_events (
            event_id, timestamp, event_type, entity_type, entity_id, data, run_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.run_id,
        ],
    )?;

    Ok(())
}

/// Which run events to list. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub run_id: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    /// Keep only the most recent `limit` events
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn for_run(run_id: &str) -> Self {
        EventFilter {
            run_id: Some(run_id.to_string()),
            ..Default::default()
        }
    }

    pub fn for_entity(entity_type: &str, entity_id: &str) -> Self {
        EventFilter {
            entity_type: Some(entity_type.to_string()),
            entity_id: Some(entity_id.to_string()),
            ..Default::default()
        }
    }
}

fn conversion_error(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn event_from_row(row: &rusqlite::Row) -> rusqlite::Result<Event> {
    let timestamp: String = row.get("timestamp")?;
    let data: String = row.get("data")?;

    Ok(Event {
        event_id: row.get("event_id")?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| conversion_error(1, e))?
            .with_timezone(&Utc),
        event_type: row.get("event_type")?,
        entity_type: row.get("entity_type")?,
        entity_id: row.get("entity_id")?,
        data: serde_json::from_str(&data).map_err(|e| conversion_error(5, e))?,
        run_id: row.get("run_id")?,
    })
}

/// Run events matching `filter`, oldest first.
pub fn list_events(conn: &Connection, filter: &EventFilter) -> Result<Vec<Event>> {
    let mut clauses = Vec::new();
    let mut values: Vec<Value> = Vec::new();
    for (column, wanted) in [
        ("run_id", &filter.run_id),
        ("entity_type", &filter.entity_type),
        ("entity_id", &filter.entity_id),
    ] {
        if let Some(wanted) = wanted {
            values.push(Value::Text(wanted.clone()));
            clauses.push(format!("{} = ?{}", column, values.len()));
        }
    }

    let mut sql = String::from(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, run_id FROM run_events",
    );
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY id DESC");
    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    let mut stmt = conn.prepare(&sql)?;
    let mut events = stmt
        .query_map(params_from_iter(values.iter()), event_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    events.reverse();
    Ok(events)
}

/// Id of the newest run that logged anything.
pub fn latest_run_id(conn: &Connection) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT run_id FROM run_events ORDER BY id DESC LIMIT 1", [], |row| row.get(0))
        .optional()?)
}
