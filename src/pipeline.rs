// 🔁 Pipeline - orchestration of load / seed / snapshot / run / test / docs / history
//
// Model order is fixed: source views → dims → fact → mart.
// Each step reads only what earlier steps committed, and every step leaves
// one run_events row behind (success or failure).

use chrono::{NaiveDateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{error, info, info_span};

use crate::cleanse::{
    build_dim_hosts, build_dim_listings, build_dim_listings_w_hosts, DIM_HOSTS_CLEANSED, DIM_LISTINGS_CLEANSED,
    DIM_LISTINGS_W_HOSTS,
};
use crate::config::PipelineConfig;
use crate::data_quality::{check_freshness, DataQualityEngine, FreshnessReport, QualityReport};
use crate::db::{insert_event, latest_run_id, list_events, open_warehouse, setup_warehouse, Event, EventFilter};
use crate::docs::{build_catalog, project_relations, write_catalog};
use crate::error::Result;
use crate::incremental::{load_fct_reviews, LoadReport, FCT_REVIEWS};
use crate::mart::{build_mart_fullmoon_reviews, MART_FULLMOON_REVIEWS};
use crate::seeds::{load_full_moon_dates, SEED_FULL_MOON_DATES};
use crate::snapshot::{run_snapshot, SnapshotReport, SnapshotSpec, SCD_RAW_HOSTS, SCD_RAW_LISTINGS};
use crate::sources::{
    create_source_views, load_raw_hosts, load_raw_listings, load_raw_reviews, RAW_HOSTS, RAW_LISTINGS, RAW_REVIEWS,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResult {
    pub name: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub models: Vec<ModelResult>,
    pub fct_reviews: LoadReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSummary {
    pub seeded: usize,
    pub snapshots: Vec<SnapshotReport>,
    pub run: RunSummary,
    pub tests: QualityReport,
}

impl BuildSummary {
    pub fn is_success(&self) -> bool {
        self.tests.is_success()
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    conn: Connection,
    run_id: String,
}

impl Pipeline {
    /// Open the configured warehouse file.
    pub fn open(config: PipelineConfig) -> Result<Self> {
        let conn = open_warehouse(&config.database)?;
        Ok(Self::new(config, conn))
    }

    /// Use an existing connection (in-memory warehouses in tests).
    pub fn with_connection(config: PipelineConfig, conn: Connection) -> Result<Self> {
        setup_warehouse(&conn)?;
        Ok(Self::new(config, conn))
    }

    fn new(config: PipelineConfig, conn: Connection) -> Self {
        let run_id = uuid::Uuid::new_v4().to_string();
        info!(run_id = %run_id, database = %config.database.display(), "pipeline opened");
        Pipeline { config, conn, run_id }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn record(&self, event_type: &str, entity_type: &str, entity_id: &str, data: serde_json::Value) -> Result<()> {
        insert_event(
            &self.conn,
            &Event::new(event_type, entity_type, entity_id, data, &self.run_id),
        )
    }

    /// Run one step and log its outcome to run_events.
    fn step<T, F>(&mut self, entity_type: &str, name: &str, f: F) -> Result<T>
    where
        T: Serialize,
        F: FnOnce(&mut Connection, &PipelineConfig) -> Result<T>,
    {
        let span = info_span!("step", kind = entity_type, name);
        let _enter = span.enter();

        match f(&mut self.conn, &self.config) {
            Ok(output) => {
                self.record("completed", entity_type, name, serde_json::to_value(&output)?)?;
                Ok(output)
            }
            Err(e) => {
                error!(error = %e, "step failed");
                self.record("failed", entity_type, name, serde_json::json!({ "error": e.to_string() }))?;
                Err(e)
            }
        }
    }

    fn model<F>(&mut self, models: &mut Vec<ModelResult>, name: &str, build: F) -> Result<()>
    where
        F: FnOnce(&mut Connection, &PipelineConfig) -> Result<usize>,
    {
        let rows = self.step("model", name, build)?;
        models.push(ModelResult {
            name: name.to_string(),
            rows,
        });
        Ok(())
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    /// Replace the raw tables from the configured CSV extracts.
    pub fn load(&mut self) -> Result<Vec<ModelResult>> {
        let mut loaded = Vec::new();
        let rows = self.step("source", RAW_LISTINGS, |conn, config| {
            load_raw_listings(conn, &config.sources.listings)
        })?;
        loaded.push(ModelResult {
            name: RAW_LISTINGS.to_string(),
            rows,
        });
        let rows = self.step("source", RAW_HOSTS, |conn, config| load_raw_hosts(conn, &config.sources.hosts))?;
        loaded.push(ModelResult {
            name: RAW_HOSTS.to_string(),
            rows,
        });
        let rows = self.step("source", RAW_REVIEWS, |conn, config| {
            load_raw_reviews(conn, &config.sources.reviews)
        })?;
        loaded.push(ModelResult {
            name: RAW_REVIEWS.to_string(),
            rows,
        });
        Ok(loaded)
    }

    pub fn seed(&mut self) -> Result<usize> {
        self.step("seed", SEED_FULL_MOON_DATES, |conn, config| {
            load_full_moon_dates(conn, &config.seeds.full_moon_dates)
        })
    }

    pub fn snapshot(&mut self) -> Result<Vec<SnapshotReport>> {
        self.snapshot_at(Utc::now().naive_utc())
    }

    /// Snapshot both raw tables as of `run_at`.
    pub fn snapshot_at(&mut self, run_at: NaiveDateTime) -> Result<Vec<SnapshotReport>> {
        let listings = self.step("snapshot", SCD_RAW_LISTINGS, |conn, config| {
            run_snapshot(conn, &SnapshotSpec::listings(config.snapshot_strategy(SCD_RAW_LISTINGS)), run_at)
        })?;
        let hosts = self.step("snapshot", SCD_RAW_HOSTS, |conn, config| {
            run_snapshot(conn, &SnapshotSpec::hosts(config.snapshot_strategy(SCD_RAW_HOSTS)), run_at)
        })?;
        Ok(vec![listings, hosts])
    }

    /// Build every model in dependency order. Stops at the first failing model.
    pub fn run(&mut self, full_refresh: bool) -> Result<RunSummary> {
        self.step("model", "source_views", |conn, _| create_source_views(conn))?;

        let mut models = Vec::new();
        self.model(&mut models, DIM_LISTINGS_CLEANSED, |conn, config| {
            build_dim_listings(conn, config.contract_for(DIM_LISTINGS_CLEANSED).as_ref())
        })?;
        self.model(&mut models, DIM_HOSTS_CLEANSED, |conn, config| {
            build_dim_hosts(conn, config.contract_for(DIM_HOSTS_CLEANSED).as_ref())
        })?;
        self.model(&mut models, DIM_LISTINGS_W_HOSTS, |conn, config| {
            build_dim_listings_w_hosts(conn, config.contract_for(DIM_LISTINGS_W_HOSTS).as_ref())
        })?;

        let fct_reviews = self.step("model", FCT_REVIEWS, |conn, _| load_fct_reviews(conn, full_refresh))?;
        models.push(ModelResult {
            name: FCT_REVIEWS.to_string(),
            rows: fct_reviews.inserted,
        });

        self.model(&mut models, MART_FULLMOON_REVIEWS, |conn, config| {
            build_mart_fullmoon_reviews(conn, config.contract_for(MART_FULLMOON_REVIEWS).as_ref())
        })?;

        Ok(RunSummary { models, fct_reviews })
    }

    /// Run every data-quality rule. Failing rules are in the report, not an Err.
    pub fn test(&mut self) -> Result<QualityReport> {
        let run_id = self.run_id.clone();
        let report = self.step("test", "data_quality", |conn, config| {
            DataQualityEngine::new(&config.quality).run(conn, &run_id)
        })?;
        info!(summary = %report.summary(), "data quality");
        Ok(report)
    }

    pub fn freshness(&mut self) -> Result<FreshnessReport> {
        let now = Utc::now().naive_utc();
        self.step("source", "freshness", |conn, config| check_freshness(conn, &config.freshness, now))
    }

    pub fn docs(&mut self) -> Result<PathBuf> {
        self.step("docs", "catalog", |conn, config| {
            let catalog = build_catalog(conn, project_relations(config))?;
            write_catalog(&catalog, &config.target_dir)
        })
    }

    /// seed, snapshot, run and test in one go.
    pub fn build(&mut self, full_refresh: bool) -> Result<BuildSummary> {
        let seeded = self.seed()?;
        let snapshots = self.snapshot()?;
        let run = self.run(full_refresh)?;
        let tests = self.test()?;
        Ok(BuildSummary {
            seeded,
            snapshots,
            run,
            tests,
        })
    }

    /// Logged step outcomes matching `filter`. Reading history logs nothing.
    pub fn history(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        list_events(&self.conn, filter)
    }

    /// Events of the most recent earlier invocation, empty on a fresh warehouse.
    pub fn last_run(&self) -> Result<Vec<Event>> {
        match latest_run_id(&self.conn)? {
            Some(run_id) => list_events(&self.conn, &EventFilter::for_run(&run_id)),
            None => Ok(Vec::new()),
        }
    }
}
