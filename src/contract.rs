// 📐 Shape Layer - Relation schemas and contracts
// Every materialized relation declares its columns up front. A contract is the
// promise made to downstream consumers; it is checked against the declared
// columns before the warehouse is touched.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{PipelineError, Result};

// ============================================================================
// DATA TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Integer,
    Text,
    Numeric,
    Boolean,
    Timestamp,
    Date,
}

impl DataType {
    /// Declared SQL type used in CREATE TABLE
    pub fn sql(&self) -> &'static str {
        match self {
            DataType::Integer => "INTEGER",
            DataType::Text => "TEXT",
            DataType::Numeric => "NUMERIC(10,2)",
            DataType::Boolean => "BOOLEAN",
            DataType::Timestamp => "TIMESTAMP",
            DataType::Date => "DATE",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::Integer => "integer",
            DataType::Text => "text",
            DataType::Numeric => "numeric",
            DataType::Boolean => "boolean",
            DataType::Timestamp => "timestamp",
            DataType::Date => "date",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// RELATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub description: String,
}

impl Column {
    pub fn new(name: &str, data_type: DataType, description: &str) -> Self {
        Column {
            name: name.to_string(),
            data_type,
            description: description.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    Source,
    Seed,
    Model,
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Materialization {
    Table,
    View,
    Incremental,
    Snapshot,
}

/// A warehouse relation: name, declared columns and lineage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub name: String,
    pub kind: RelationKind,
    pub materialization: Materialization,
    pub description: String,
    pub columns: Vec<Column>,
    pub depends_on: Vec<String>,
}

impl Relation {
    pub fn new(
        name: &str,
        kind: RelationKind,
        materialization: Materialization,
        description: &str,
    ) -> Self {
        Relation {
            name: name.to_string(),
            kind,
            materialization,
            description: description.to_string(),
            columns: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    /// Builder: add a column
    pub fn column(mut self, name: &str, data_type: DataType, description: &str) -> Self {
        self.columns.push(Column::new(name, data_type, description));
        self
    }

    /// Builder: add an upstream relation
    pub fn depends_on(mut self, upstream: &str) -> Self {
        self.depends_on.push(upstream.to_string());
        self
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn create_table_sql(&self) -> String {
        let cols = self
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.data_type.sql()))
            .collect::<Vec<_>>()
            .join(", ");
        format!("CREATE TABLE {} ({})", self.name, cols)
    }

    pub fn insert_sql(&self) -> String {
        let placeholders = (1..=self.columns.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.name,
            self.column_names().join(", "),
            placeholders
        )
    }
}

// ============================================================================
// CONTRACTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractColumn {
    pub name: String,
    pub data_type: DataType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaContract {
    pub model: String,
    pub columns: Vec<ContractColumn>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractViolation {
    MissingColumn { column: String },
    UnexpectedColumn { column: String },
    TypeMismatch {
        column: String,
        expected: DataType,
        actual: DataType,
    },
}

impl fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractViolation::MissingColumn { column } => {
                write!(f, "column {} is declared in the contract but not produced", column)
            }
            ContractViolation::UnexpectedColumn { column } => {
                write!(f, "column {} is produced but not declared in the contract", column)
            }
            ContractViolation::TypeMismatch {
                column,
                expected,
                actual,
            } => write!(f, "column {} expected {} but is {}", column, expected, actual),
        }
    }
}

impl SchemaContract {
    pub fn new(model: &str) -> Self {
        SchemaContract {
            model: model.to_string(),
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, name: &str, data_type: DataType) -> Self {
        self.columns.push(ContractColumn {
            name: name.to_string(),
            data_type,
        });
        self
    }

    /// Compare the contract with a relation's declared columns.
    ///
    /// Column names are matched case-insensitively; order does not matter.
    pub fn violations(&self, relation: &Relation) -> Vec<ContractViolation> {
        let mut violations = Vec::new();

        for expected in &self.columns {
            match relation
                .columns
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(&expected.name))
            {
                None => violations.push(ContractViolation::MissingColumn {
                    column: expected.name.clone(),
                }),
                Some(actual) if actual.data_type != expected.data_type => {
                    violations.push(ContractViolation::TypeMismatch {
                        column: expected.name.clone(),
                        expected: expected.data_type,
                        actual: actual.data_type,
                    })
                }
                Some(_) => {}
            }
        }

        for actual in &relation.columns {
            if !self
                .columns
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(&actual.name))
            {
                violations.push(ContractViolation::UnexpectedColumn {
                    column: actual.name.clone(),
                });
            }
        }

        violations
    }

    /// Fail fast if the relation does not honour this contract.
    pub fn enforce(&self, relation: &Relation) -> Result<()> {
        let violations = self.violations(relation);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::ContractViolation {
                model: relation.name.clone(),
                violations,
            })
        }
    }
}

/// Contract shipped with the project for the host dimension.
pub fn dim_hosts_contract() -> SchemaContract {
    SchemaContract::new("dim_hosts_cleansed")
        .column("host_id", DataType::Integer)
        .column("host_name", DataType::Text)
        .column("is_superhost", DataType::Boolean)
        .column("created_at", DataType::Timestamp)
        .column("updated_at", DataType::Timestamp)
}

// ============================================================================
// TESTS
// ============================================================================
