// Airbnb Analytics Pipeline - Core Library
// Exposes all modules for use in the CLI and tests

pub mod config;
pub mod contract;
pub mod db;
pub mod entities;
pub mod error;
pub mod temporal;

pub mod sources;        // Source adapter: raw tables + renaming views
pub mod seeds;          // Full-moon calendar
pub mod cleanse;        // Dimension cleanser
pub mod incremental;    // Incremental fact loader
pub mod mart;           // Full-moon mart
pub mod snapshot;       // SCD snapshotter
pub mod data_quality;   // Rule queries + failure sink
pub mod docs;           // catalog.json
pub mod pipeline;       // Orchestration

// Re-export commonly used types
pub use config::{PipelineConfig, DEFAULT_CONFIG_FILE};
pub use contract::{DataType, Relation, SchemaContract};
pub use data_quality::{DataQualityEngine, FreshnessReport, FreshnessStatus, QualityReport, Severity, TestStatus};
pub use db::{open_warehouse, setup_warehouse, Event};
pub use entities::{Host, Listing, Review, RoomType, Sentiment};
pub use error::{PipelineError, Result};
pub use incremental::{LoadMode, LoadReport};
pub use pipeline::{BuildSummary, Pipeline, RunSummary};
pub use snapshot::{SnapshotRecord, SnapshotReport, SnapshotStrategy};
pub use temporal::Validity;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
