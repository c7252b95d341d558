// Project configuration (pipeline.toml)
//
// Every field has a default, so an absent file yields the default project layout:
//
// ```toml
// database = "warehouse.db"
// target_dir = "target"
//
// [sources]
// listings = "data/listings.csv"
//
// [snapshots.scd_raw_hosts]
// strategy = "timestamp"
//
// [[contracts]]
// model = "dim_hosts_cleansed"
// columns = [{ name = "host_id", data_type = "integer" }]
// ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::contract::{dim_hosts_contract, SchemaContract};
use crate::error::{PipelineError, Result};
use crate::snapshot::SnapshotStrategy;

pub const DEFAULT_CONFIG_FILE: &str = "pipeline.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// SQLite warehouse file
    pub database: PathBuf,

    /// Where `docs` writes catalog.json
    pub target_dir: PathBuf,

    pub sources: SourcePaths,
    pub seeds: SeedPaths,
    pub freshness: FreshnessConfig,
    pub quality: QualityConfig,

    /// Snapshot strategy per snapshot relation name
    pub snapshots: BTreeMap<String, SnapshotStrategy>,

    /// Contracts by model; replaces the built-in contract of the same model
    pub contracts: Vec<SchemaContract>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcePaths {
    pub listings: PathBuf,
    pub hosts: PathBuf,
    pub reviews: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedPaths {
    pub full_moon_dates: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessConfig {
    pub warn_after_hours: i64,
    pub error_after_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Upper bound for the price_max rule on dim_listings_w_hosts
    pub max_price: f64,

    /// Persist failing rows to dq_failures
    pub store_failures: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            database: PathBuf::from("warehouse.db"),
            target_dir: PathBuf::from("target"),
            sources: SourcePaths::default(),
            seeds: SeedPaths::default(),
            freshness: FreshnessConfig::default(),
            quality: QualityConfig::default(),
            snapshots: BTreeMap::new(),
            contracts: Vec::new(),
        }
    }
}

impl Default for SourcePaths {
    fn default() -> Self {
        SourcePaths {
            listings: PathBuf::from("data/listings.csv"),
            hosts: PathBuf::from("data/hosts.csv"),
            reviews: PathBuf::from("data/reviews.csv"),
        }
    }
}

impl Default for SeedPaths {
    fn default() -> Self {
        SeedPaths {
            full_moon_dates: PathBuf::from("seeds/seed_full_moon_dates.csv"),
        }
    }
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        FreshnessConfig {
            warn_after_hours: 1,
            error_after_hours: 24,
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        QualityConfig {
            max_price: 5000.0,
            store_failures: true,
        }
    }
}

impl PipelineConfig {
    /// Load from a TOML file. A missing file is not an error: defaults apply.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&contents)?;

        // Relative paths are resolved against the config file's directory
        match path.parent() {
            Some(base) if !base.as_os_str().is_empty() => Ok(config.rebase(base)),
            _ => Ok(config),
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: PipelineConfig =
            toml::from_str(contents).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.freshness.warn_after_hours > self.freshness.error_after_hours {
            return Err(PipelineError::Config(format!(
                "freshness.warn_after_hours ({}) exceeds error_after_hours ({})",
                self.freshness.warn_after_hours, self.freshness.error_after_hours
            )));
        }
        if self.quality.max_price <= 0.0 {
            return Err(PipelineError::Config(
                "quality.max_price must be positive".to_string(),
            ));
        }
        for contract in &self.contracts {
            if contract.columns.is_empty() {
                return Err(PipelineError::Config(format!(
                    "contract for {} declares no columns",
                    contract.model
                )));
            }
        }
        Ok(())
    }

    fn rebase(mut self, base: &Path) -> Self {
        let join = |p: &PathBuf| {
            if p.is_absolute() {
                p.clone()
            } else {
                base.join(p)
            }
        };
        self.database = join(&self.database);
        self.target_dir = join(&self.target_dir);
        self.sources.listings = join(&self.sources.listings);
        self.sources.hosts = join(&self.sources.hosts);
        self.sources.reviews = join(&self.sources.reviews);
        self.seeds.full_moon_dates = join(&self.seeds.full_moon_dates);
        self
    }

    /// Contract for a model: configured one first, then the built-in one.
    pub fn contract_for(&self, model: &str) -> Option<SchemaContract> {
        if let Some(contract) = self.contracts.iter().find(|c| c.model == model) {
            return Some(contract.clone());
        }
        let builtin = dim_hosts_contract();
        if builtin.model == model {
            Some(builtin)
        } else {
            None
        }
    }

    pub fn snapshot_strategy(&self, snapshot: &str) -> SnapshotStrategy {
        self.snapshots
            .get(snapshot)
            .cloned()
            .unwrap_or(SnapshotStrategy::Timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::DataType;

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config = PipelineConfig::from_toml("").unwrap();
        assert_eq!(config.database, PathBuf::from("warehouse.db"));
        assert_eq!(config.freshness.error_after_hours, 24);
        assert!(config.quality.store_failures);
        assert_eq!(
            config.snapshot_strategy("scd_raw_hosts"),
            SnapshotStrategy::Timestamp
        );
    }

    #[test]
    fn test_builtin_host_contract() {
        let config = PipelineConfig::default();
        let contract = config.contract_for("dim_hosts_cleansed").unwrap();
        assert_eq!(contract.columns.len(), 5);
        assert!(config.contract_for("fct_reviews").is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            database = "dw.db"

            [sources]
            reviews = "raw/reviews.csv"

            [quality]
            max_price = 900.0

            [snapshots.scd_raw_listings]
            strategy = "check"
            columns = ["price", "minimum_nights"]

            [[contracts]]
            model = "dim_hosts_cleansed"
            columns = [
                { name = "host_id", data_type = "integer" },
                { name = "host_name", data_type = "text" },
            ]
        "#;
        let config = PipelineConfig::from_toml(toml).unwrap();

        assert_eq!(config.database, PathBuf::from("dw.db"));
        assert_eq!(config.sources.reviews, PathBuf::from("raw/reviews.csv"));
        assert_eq!(config.sources.hosts, PathBuf::from("data/hosts.csv"));
        assert_eq!(config.quality.max_price, 900.0);
        assert_eq!(
            config.snapshot_strategy("scd_raw_listings"),
            SnapshotStrategy::Check {
                columns: vec!["price".to_string(), "minimum_nights".to_string()]
            }
        );

        let contract = config.contract_for("dim_hosts_cleansed").unwrap();
        assert_eq!(contract.columns.len(), 2);
        assert_eq!(contract.columns[1].data_type, DataType::Text);
    }

    #[test]
    fn test_invalid_freshness_rejected() {
        let toml = "[freshness]\nwarn_after_hours = 48\nerror_after_hours = 24\n";
        assert!(matches!(
            PipelineConfig::from_toml(toml),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = PipelineConfig::load(Path::new("/nonexistent/pipeline.toml")).unwrap();
        assert_eq!(config.target_dir, PathBuf::from("target"));
    }
}
