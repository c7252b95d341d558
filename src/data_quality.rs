// ✅ Data Quality Engine - rule queries over the warehouse
//
// Every rule is a SELECT that returns the rows violating it. Zero rows means
// pass. Failing rows are copied as JSON into dq_failures so they can be
// inspected after the run.

use chrono::{NaiveDateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cleanse::{DIM_HOSTS_CLEANSED, DIM_LISTINGS_CLEANSED, DIM_LISTINGS_W_HOSTS};
use crate::config::{FreshnessConfig, QualityConfig};
use crate::db::query_json_rows;
use crate::entities::{RoomType, Sentiment};
use crate::error::{PipelineError, Result};
use crate::incremental::FCT_REVIEWS;
use crate::sources::{RAW_REVIEWS, SRC_LISTINGS};
use crate::temporal::{format_timestamp, parse_timestamp};

// ============================================================================
// RULES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error, // Fails the run
    Warn,  // Reported only
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warn => "warn",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Unique,
    NotNull,
    Relationships,
    AcceptedValues,
    PositiveValue,
    NoNulls,
    RowCountEqual,
    MaxValue,
    Singular,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityRule {
    pub name: String,
    pub relation: String,
    pub kind: RuleKind,
    pub severity: Severity,
    /// Returns the failing rows
    pub sql: String,
}

fn sql_literal(value: &str) -> String {
    if value.parse::<i64>().is_ok() {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "''"))
    }
}

impl QualityRule {
    fn new(name: String, relation: &str, kind: RuleKind, sql: String) -> Self {
        QualityRule {
            name,
            relation: relation.to_string(),
            kind,
            severity: Severity::Error,
            sql,
        }
    }

    /// Builder: downgrade to a warning
    pub fn warn(mut self) -> Self {
        self.severity = Severity::Warn;
        self
    }

    pub fn unique(relation: &str, column: &str) -> Self {
        Self::new(
            format!("unique_{}_{}", relation, column),
            relation,
            RuleKind::Unique,
            format!(
                "SELECT {col}, COUNT(*) AS n_records FROM {rel} WHERE {col} IS NOT NULL GROUP BY {col} HAVING COUNT(*) > 1",
                rel = relation,
                col = column
            ),
        )
    }

    pub fn not_null(relation: &str, column: &str) -> Self {
        Self::new(
            format!("not_null_{}_{}", relation, column),
            relation,
            RuleKind::NotNull,
            format!("SELECT * FROM {} WHERE {} IS NULL", relation, column),
        )
    }

    /// Every non-null `column` must exist as `to.field`.
    pub fn relationships(relation: &str, column: &str, to: &str, field: &str) -> Self {
        Self::new(
            format!("relationships_{}_{}", relation, column),
            relation,
            RuleKind::Relationships,
            format!(
                "SELECT child.* FROM {rel} child LEFT JOIN {to} parent ON child.{col} = parent.{field} \
                 WHERE child.{col} IS NOT NULL AND parent.{field} IS NULL",
                rel = relation,
                col = column,
                to = to,
                field = field
            ),
        )
    }

    pub fn accepted_values(relation: &str, column: &str, values: &[&str]) -> Self {
        let list = values.iter().map(|v| sql_literal(v)).collect::<Vec<_>>().join(", ");
        Self::new(
            format!("accepted_values_{}_{}", relation, column),
            relation,
            RuleKind::AcceptedValues,
            format!(
                "SELECT * FROM {} WHERE {} IS NOT NULL AND {} NOT IN ({})",
                relation, column, column, list
            ),
        )
    }

    pub fn positive_value(relation: &str, column: &str) -> Self {
        Self::new(
            format!("positive_value_{}_{}", relation, column),
            relation,
            RuleKind::PositiveValue,
            format!("SELECT * FROM {} WHERE {} < 1", relation, column),
        )
    }

    pub fn no_nulls(relation: &str, columns: &[&str]) -> Self {
        let predicate = columns
            .iter()
            .map(|c| format!("{} IS NULL", c))
            .collect::<Vec<_>>()
            .join(" OR ");
        Self::new(
            format!("no_nulls_in_{}", relation),
            relation,
            RuleKind::NoNulls,
            format!("SELECT * FROM {} WHERE {}", relation, predicate),
        )
    }

    pub fn row_count_equal(relation: &str, compare_to: &str) -> Self {
        Self::new(
            format!("row_count_{}_matches_{}", relation, compare_to),
            relation,
            RuleKind::RowCountEqual,
            format!(
                "SELECT a.n AS relation_rows, b.n AS compare_rows \
                 FROM (SELECT COUNT(*) AS n FROM {}) a, (SELECT COUNT(*) AS n FROM {}) b \
                 WHERE a.n != b.n",
                relation, compare_to
            ),
        )
    }

    pub fn max_value(relation: &str, column: &str, max: f64) -> Self {
        Self::new(
            format!("{}_max_{}", column, relation),
            relation,
            RuleKind::MaxValue,
            format!("SELECT * FROM {} WHERE {} > {}", relation, column, max),
        )
    }

    pub fn singular(name: &str, relation: &str, sql: &str) -> Self {
        Self::new(name.to_string(), relation, RuleKind::Singular, sql.to_string())
    }
}

/// The project's declared rule set
pub fn default_rules(config: &QualityConfig) -> Vec<QualityRule> {
    let room_types: Vec<&str> = RoomType::ALL.iter().map(|r| r.as_str()).collect();
    let sentiments: Vec<&str> = Sentiment::ALL.iter().map(|s| s.as_str()).collect();

    vec![
        QualityRule::unique(DIM_LISTINGS_CLEANSED, "listing_id"),
        QualityRule::not_null(DIM_LISTINGS_CLEANSED, "listing_id"),
        QualityRule::not_null(DIM_LISTINGS_CLEANSED, "host_id"),
        QualityRule::relationships(DIM_LISTINGS_CLEANSED, "host_id", DIM_HOSTS_CLEANSED, "host_id"),
        QualityRule::accepted_values(DIM_LISTINGS_CLEANSED, "room_type", &room_types),
        QualityRule::positive_value(DIM_LISTINGS_CLEANSED, "minimum_nights"),
        QualityRule::unique(DIM_HOSTS_CLEANSED, "host_id"),
        QualityRule::not_null(DIM_HOSTS_CLEANSED, "host_name"),
        QualityRule::accepted_values(DIM_HOSTS_CLEANSED, "is_superhost", &["0", "1"]),
        QualityRule::relationships(FCT_REVIEWS, "listing_id", DIM_LISTINGS_CLEANSED, "listing_id"),
        QualityRule::accepted_values(FCT_REVIEWS, "review_sentiment", &sentiments),
        QualityRule::singular(
            "consistent_created_at",
            FCT_REVIEWS,
            "SELECT r.* FROM fct_reviews r \
             JOIN dim_listings_cleansed l ON r.listing_id = l.listing_id \
             WHERE r.review_date < l.created_at",
        ),
        QualityRule::no_nulls(
            DIM_LISTINGS_W_HOSTS,
            &[
                "listing_id",
                "listing_name",
                "room_type",
                "minimum_nights",
                "price",
                "host_id",
                "host_name",
                "host_is_superhost",
                "created_at",
                "updated_at",
            ],
        )
        .warn(),
        QualityRule::row_count_equal(DIM_LISTINGS_W_HOSTS, SRC_LISTINGS),
        QualityRule::max_value(DIM_LISTINGS_W_HOSTS, "price", config.max_price).warn(),
    ]
}

// ============================================================================
// RESULTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
    /// The rule query itself could not run
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub relation: String,
    pub severity: Severity,
    pub status: TestStatus,
    pub failures: usize,
    pub message: Option<String>,
}

impl TestResult {
    /// Failing error-severity rules and broken queries block the run.
    pub fn is_blocking(&self) -> bool {
        match self.status {
            TestStatus::Pass => false,
            TestStatus::Fail => self.severity == Severity::Error,
            TestStatus::Error => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub run_id: String,
    pub results: Vec<TestResult>,
}

impl QualityReport {
    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|r| r.status == TestStatus::Pass).count()
    }

    pub fn warned_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == TestStatus::Fail && r.severity == Severity::Warn)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_blocking()).count()
    }

    /// The run fails iff an error-severity rule fails
    pub fn is_success(&self) -> bool {
        self.failed_count() == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "PASS={} WARN={} ERROR={} TOTAL={}",
            self.passed_count(),
            self.warned_count(),
            self.failed_count(),
            self.results.len()
        )
    }
}

// ============================================================================
// DATA QUALITY ENGINE
// ============================================================================

pub struct DataQualityEngine {
    rules: Vec<QualityRule>,

    /// Copy failing rows into dq_failures
    store_failures: bool,
}

impl DataQualityEngine {
    pub fn new(config: &QualityConfig) -> Self {
        DataQualityEngine {
            rules: default_rules(config),
            store_failures: config.store_failures,
        }
    }

    pub fn with_rules(rules: Vec<QualityRule>, store_failures: bool) -> Self {
        DataQualityEngine { rules, store_failures }
    }

    pub fn rules(&self) -> &[QualityRule] {
        &self.rules
    }

    /// Run every rule. Only sink writes can fail this call; rule errors land in the report.
    pub fn run(&self, conn: &mut Connection, run_id: &str) -> Result<QualityReport> {
        let detected_at = format_timestamp(&Utc::now().naive_utc());
        let mut results = Vec::with_capacity(self.rules.len());
        let mut failing_rows: Vec<(&QualityRule, Vec<serde_json::Value>)> = Vec::new();

        for rule in &self.rules {
            match query_json_rows(conn, &rule.sql, []) {
                Ok(rows) if rows.is_empty() => {
                    debug!(test = %rule.name, "pass");
                    results.push(TestResult {
                        name: rule.name.clone(),
                        relation: rule.relation.clone(),
                        severity: rule.severity,
                        status: TestStatus::Pass,
                        failures: 0,
                        message: None,
                    });
                }
                Ok(rows) => {
                    warn!(test = %rule.name, severity = rule.severity.as_str(), failures = rows.len(), "test failed");
                    results.push(TestResult {
                        name: rule.name.clone(),
                        relation: rule.relation.clone(),
                        severity: rule.severity,
                        status: TestStatus::Fail,
                        failures: rows.len(),
                        message: Some(format!("{} failing rows", rows.len())),
                    });
                    failing_rows.push((rule, rows));
                }
                Err(e) => {
                    warn!(test = %rule.name, error = %e, "test could not run");
                    results.push(TestResult {
                        name: rule.name.clone(),
                        relation: rule.relation.clone(),
                        severity: rule.severity,
                        status: TestStatus::Error,
                        failures: 0,
                        message: Some(e.to_string()),
                    });
                }
            }
        }

        if self.store_failures && !failing_rows.is_empty() {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO dq_failures (run_id, test_name, relation, severity, row_json, detected_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for (rule, rows) in &failing_rows {
                    for row in rows {
                        stmt.execute(params![
                            run_id,
                            rule.name,
                            rule.relation,
                            rule.severity.as_str(),
                            serde_json::to_string(row)?,
                            detected_at,
                        ])?;
                    }
                }
            }
            tx.commit()?;
        }

        let report = QualityReport {
            run_id: run_id.to_string(),
            results,
        };
        info!(run_id, summary = %report.summary(), "tests finished");
        Ok(report)
    }
}

/// Failing rows stored for a test, oldest first
pub fn stored_failures(conn: &Connection, test_name: &str) -> Result<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare("SELECT row_json FROM dq_failures WHERE test_name = ?1 ORDER BY id")?;
    let raw: Vec<String> = stmt
        .query_map([test_name], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    raw.iter()
        .map(|s| serde_json::from_str::<serde_json::Value>(s).map_err(PipelineError::from))
        .collect()
}

// ============================================================================
// SOURCE FRESHNESS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FreshnessStatus {
    Pass,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreshnessReport {
    pub source: String,
    pub max_loaded_at: Option<NaiveDateTime>,
    pub age_hours: Option<i64>,
    pub status: FreshnessStatus,
}

/// Compare the newest review date with `now`.
///
/// An empty or unreadable source counts as stale.
pub fn check_freshness(conn: &Connection, config: &FreshnessConfig, now: NaiveDateTime) -> Result<FreshnessReport> {
    // Raw text does not sort by time; unparsable dates are left out of the max
    let mut stmt = conn.prepare(&format!("SELECT date FROM {} WHERE date IS NOT NULL", RAW_REVIEWS))?;
    let mut max_loaded_at: Option<NaiveDateTime> = None;
    for date in stmt.query_map([], |row| row.get::<_, String>(0))? {
        if let Some(ts) = parse_timestamp(&date?) {
            max_loaded_at = max_loaded_at.max(Some(ts));
        }
    }
    let age_hours = max_loaded_at.map(|t| (now - t).num_hours());

    let status = match age_hours {
        None => FreshnessStatus::Error,
        Some(age) if age >= config.error_after_hours => FreshnessStatus::Error,
        Some(age) if age >= config.warn_after_hours => FreshnessStatus::Warn,
        Some(_) => FreshnessStatus::Pass,
    };

    let report = FreshnessReport {
        source: RAW_REVIEWS.to_string(),
        max_loaded_at,
        age_hours,
        status,
    };
    info!(source = RAW_REVIEWS, status = ?report.status, age_hours = ?report.age_hours, "freshness checked");
    Ok(report)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_warehouse;
    use crate::sources::{write_raw_reviews, RawReview};

    fn warehouse() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_warehouse(&conn).unwrap();
        conn.execute_batch(
            "CREATE TABLE parents (id INTEGER);
             CREATE TABLE children (id INTEGER, parent_id INTEGER, kind TEXT, qty INTEGER);
             INSERT INTO parents VALUES (1), (2);
             INSERT INTO children VALUES (10, 1, 'a', 1), (11, 2, 'b', 3), (12, 9, 'z', 0), (12, NULL, 'a', 2);",
        )
        .unwrap();
        conn
    }

    fn result<'a>(report: &'a QualityReport, name: &str) -> &'a TestResult {
        report.results.iter().find(|r| r.name == name).unwrap()
    }

    #[test]
    fn test_generic_rules_detect_failing_rows() {
        let mut conn = warehouse();
        let engine = DataQualityEngine::with_rules(
            vec![
                QualityRule::unique("children", "id"),
                QualityRule::not_null("children", "parent_id"),
                QualityRule::relationships("children", "parent_id", "parents", "id"),
                QualityRule::accepted_values("children", "kind", &["a", "b"]),
                QualityRule::positive_value("children", "qty"),
                QualityRule::unique("parents", "id"),
            ],
            true,
        );

        let report = engine.run(&mut conn, "run-1").unwrap();

        assert_eq!(result(&report, "unique_children_id").failures, 1);
        assert_eq!(result(&report, "not_null_children_parent_id").failures, 1);
        // NULL parent is not an orphan
        assert_eq!(result(&report, "relationships_children_parent_id").failures, 1);
        assert_eq!(result(&report, "accepted_values_children_kind").failures, 1);
        assert_eq!(result(&report, "positive_value_children_qty").failures, 1);
        assert_eq!(result(&report, "unique_parents_id").status, TestStatus::Pass);
        assert!(!report.is_success());
        assert_eq!(report.passed_count(), 1);
    }

    #[test]
    fn test_failing_rows_land_in_sink() {
        let mut conn = warehouse();
        let engine = DataQualityEngine::with_rules(
            vec![QualityRule::accepted_values("children", "kind", &["a", "b"])],
            true,
        );
        engine.run(&mut conn, "run-1").unwrap();

        let stored = stored_failures(&conn, "accepted_values_children_kind").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0]["kind"], "z");
        assert_eq!(stored[0]["id"], 12);

        let run_id: String = conn
            .query_row("SELECT run_id FROM dq_failures", [], |row| row.get(0))
            .unwrap();
        assert_eq!(run_id, "run-1");
    }

    #[test]
    fn test_store_failures_can_be_disabled() {
        let mut conn = warehouse();
        let engine = DataQualityEngine::with_rules(vec![QualityRule::positive_value("children", "qty")], false);
        let report = engine.run(&mut conn, "run-1").unwrap();
        assert_eq!(report.failed_count(), 1);
        assert!(stored_failures(&conn, "positive_value_children_qty").unwrap().is_empty());
    }

    #[test]
    fn test_warn_rules_do_not_fail_run() {
        let mut conn = warehouse();
        let engine = DataQualityEngine::with_rules(vec![QualityRule::max_value("children", "qty", 2.0).warn()], true);

        let report = engine.run(&mut conn, "run-1").unwrap();
        assert_eq!(report.warned_count(), 1);
        assert!(report.is_success());
        assert_eq!(report.summary(), "PASS=0 WARN=1 ERROR=0 TOTAL=1");
    }

    #[test]
    fn test_broken_rule_is_reported_as_error() {
        let mut conn = warehouse();
        let engine = DataQualityEngine::with_rules(
            vec![QualityRule::not_null("does_not_exist", "id").warn()],
            true,
        );

        let report = engine.run(&mut conn, "run-1").unwrap();
        assert_eq!(report.results[0].status, TestStatus::Error);
        assert!(!report.is_success());
    }

    #[test]
    fn test_row_count_and_no_nulls() {
        let mut conn = warehouse();
        let engine = DataQualityEngine::with_rules(
            vec![
                QualityRule::row_count_equal("children", "parents"),
                QualityRule::no_nulls("children", &["id", "parent_id"]),
            ],
            true,
        );
        let report = engine.run(&mut conn, "run-1").unwrap();

        let count = result(&report, "row_count_children_matches_parents");
        assert_eq!(count.failures, 1);
        let stored = stored_failures(&conn, "row_count_children_matches_parents").unwrap();
        assert_eq!(stored[0]["relation_rows"], 4);
        assert_eq!(stored[0]["compare_rows"], 2);

        assert_eq!(result(&report, "no_nulls_in_children").failures, 1);
    }

    #[test]
    fn test_default_rule_names() {
        let rules = default_rules(&QualityConfig::default());
        let names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        assert!(names.contains(&"relationships_fct_reviews_listing_id"));
        assert!(names.contains(&"row_count_dim_listings_w_hosts_matches_src_listings"));
        assert!(names.contains(&"price_max_dim_listings_w_hosts"));
        assert!(names.contains(&"no_nulls_in_dim_listings_w_hosts"));
        assert_eq!(rules.iter().filter(|r| r.severity == Severity::Warn).count(), 2);
    }

    #[test]
    fn test_freshness_thresholds() {
        let mut conn = Connection::open_in_memory().unwrap();
        let config = FreshnessConfig {
            warn_after_hours: 1,
            error_after_hours: 24,
        };
        let now = parse_timestamp("2024-01-02 12:00:00").unwrap();
        let review = |date: &str| RawReview {
            listing_id: 1,
            date: Some(date.to_string()),
            reviewer_name: None,
            comments: Some("ok".to_string()),
            sentiment: None,
        };

        write_raw_reviews(&mut conn, &[review("2024-01-02 11:30:00")]).unwrap();
        assert_eq!(check_freshness(&conn, &config, now).unwrap().status, FreshnessStatus::Pass);

        write_raw_reviews(&mut conn, &[review("2024-01-02 06:00:00")]).unwrap();
        assert_eq!(check_freshness(&conn, &config, now).unwrap().status, FreshnessStatus::Warn);

        write_raw_reviews(&mut conn, &[review("2023-12-01 00:00:00")]).unwrap();
        let stale = check_freshness(&conn, &config, now).unwrap();
        assert_eq!(stale.status, FreshnessStatus::Error);
        assert!(stale.age_hours.unwrap() > 24);

        write_raw_reviews(&mut conn, &[]).unwrap();
        assert_eq!(check_freshness(&conn, &config, now).unwrap().status, FreshnessStatus::Error);
    }

    #[test]
    fn test_freshness_ignores_unparsable_dates() {
        let mut conn = Connection::open_in_memory().unwrap();
        let config = FreshnessConfig {
            warn_after_hours: 1,
            error_after_hours: 24,
        };
        let now = parse_timestamp("2024-01-02 12:00:00").unwrap();
        let review = |date: &str| RawReview {
            listing_id: 1,
            date: Some(date.to_string()),
            reviewer_name: None,
            comments: Some("ok".to_string()),
            sentiment: None,
        };

        // "yesterday" sorts after every ISO date as text
        write_raw_reviews(&mut conn, &[review("2024-01-02 11:30:00"), review("yesterday"), review("2023-06-01")]).unwrap();
        let report = check_freshness(&conn, &config, now).unwrap();
        assert_eq!(report.status, FreshnessStatus::Pass);
        assert_eq!(report.max_loaded_at, parse_timestamp("2024-01-02 11:30:00"));
        assert_eq!(report.age_hours, Some(0));

        write_raw_reviews(&mut conn, &[review("yesterday")]).unwrap();
        let report = check_freshness(&conn, &config, now).unwrap();
        assert_eq!(report.status, FreshnessStatus::Error);
        assert_eq!(report.max_loaded_at, None);
    }
}
