// 📚 Catalog - machine-readable project documentation
//
// `docs` writes target/catalog.json: every relation with its columns,
// lineage and current row count.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::cleanse::{dim_hosts_relation, dim_listings_relation, dim_listings_w_hosts_relation};
use crate::config::PipelineConfig;
use crate::contract::{Column, Materialization, Relation, RelationKind};
use crate::db::{row_count, table_exists};
use crate::error::Result;
use crate::incremental::fct_reviews_relation;
use crate::mart::mart_fullmoon_relation;
use crate::seeds::full_moon_relation;
use crate::snapshot::{SnapshotSpec, SCD_RAW_HOSTS, SCD_RAW_LISTINGS};
use crate::sources::{
    raw_hosts_relation, raw_listings_relation, raw_reviews_relation, src_hosts_relation, src_listings_relation,
    src_reviews_relation,
};

pub const CATALOG_FILE: &str = "catalog.json";

/// Every relation the project declares, upstream first.
pub fn project_relations(config: &PipelineConfig) -> Vec<Relation> {
    vec![
        raw_listings_relation(),
        raw_hosts_relation(),
        raw_reviews_relation(),
        full_moon_relation(),
        src_listings_relation(),
        src_hosts_relation(),
        src_reviews_relation(),
        dim_listings_relation(),
        dim_hosts_relation(),
        dim_listings_w_hosts_relation(),
        fct_reviews_relation(),
        mart_fullmoon_relation(),
        SnapshotSpec::listings(config.snapshot_strategy(SCD_RAW_LISTINGS)).relation(),
        SnapshotSpec::hosts(config.snapshot_strategy(SCD_RAW_HOSTS)).relation(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogNode {
    pub name: String,
    pub kind: RelationKind,
    pub materialization: Materialization,
    pub description: String,
    pub columns: Vec<Column>,
    pub depends_on: Vec<String>,
    /// None when the relation has not been built yet
    pub row_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub generated_at: DateTime<Utc>,
    pub version: String,
    pub nodes: Vec<CatalogNode>,
}

impl Catalog {
    pub fn node(&self, name: &str) -> Option<&CatalogNode> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

pub fn build_catalog(conn: &Connection, relations: Vec<Relation>) -> Result<Catalog> {
    let mut nodes = Vec::with_capacity(relations.len());
    for relation in relations {
        let count = if table_exists(conn, &relation.name)? {
            Some(row_count(conn, &relation.name)?)
        } else {
            None
        };
        nodes.push(CatalogNode {
            name: relation.name,
            kind: relation.kind,
            materialization: relation.materialization,
            description: relation.description,
            columns: relation.columns,
            depends_on: relation.depends_on,
            row_count: count,
        });
    }
    Ok(Catalog {
        generated_at: Utc::now(),
        version: crate::VERSION.to_string(),
        nodes,
    })
}

/// Write catalog.json into `target_dir`, creating it if needed.
pub fn write_catalog(catalog: &Catalog, target_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(target_dir)?;
    let path = target_dir.join(CATALOG_FILE);
    let json = serde_json::to_string_pretty(catalog)?;
    std::fs::write(&path, json)?;
    info!(path = %path.display(), nodes = catalog.nodes.len(), "catalog written");
    Ok(path)
}
