use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use airbnb_pipeline::data_quality::{FreshnessStatus, TestStatus};
use airbnb_pipeline::db::EventFilter;
use airbnb_pipeline::{Pipeline, PipelineConfig, QualityReport, DEFAULT_CONFIG_FILE};

#[derive(Parser)]
#[command(name = "airbnb-pipeline", version, about = "Airbnb analytics pipeline over a SQLite warehouse")]
struct Cli {
    /// Project configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Override the warehouse file from the config
    #[arg(short, long)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load raw CSV extracts into raw_listings, raw_hosts, raw_reviews
    Load,
    /// Load the full-moon calendar seed
    Seed,
    /// Historize raw listings and hosts
    Snapshot,
    /// Build all models
    Run {
        /// Rebuild fct_reviews from scratch
        #[arg(long)]
        full_refresh: bool,
    },
    /// Run data-quality rules
    Test,
    /// Check raw_reviews freshness
    Freshness,
    /// Write catalog.json into the target directory
    Docs,
    /// seed + snapshot + run + test
    Build {
        #[arg(long)]
        full_refresh: bool,
    },
    /// Show logged step outcomes (default: the previous invocation)
    History {
        /// Only this run id
        #[arg(long)]
        run: Option<String>,
        /// Only this model, source or snapshot name
        #[arg(long)]
        name: Option<String>,
        /// Newest N events
        #[arg(long)]
        limit: Option<usize>,
    },
}

fn init_tracing() {
    // AIRBNB_LOG_FORMAT=json switches to machine-parseable output
    let log_format = std::env::var("AIRBNB_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "airbnb_pipeline=info".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    match execute(cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            tracing::error!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Returns Ok(false) when the command ran but its checks failed.
fn execute(cli: Cli) -> Result<bool> {
    let mut config = PipelineConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(database) = cli.database {
        config.database = database;
    }

    let mut pipeline = Pipeline::open(config).context("opening warehouse")?;

    match cli.command {
        Command::Load => {
            for loaded in pipeline.load()? {
                println!("✓ {}: {} rows", loaded.name, loaded.rows);
            }
        }
        Command::Seed => {
            let rows = pipeline.seed()?;
            println!("✓ seed_full_moon_dates: {} rows", rows);
        }
        Command::Snapshot => {
            for report in pipeline.snapshot()? {
                println!(
                    "✓ {}: {} new keys, {} new versions, {} invalidated",
                    report.snapshot, report.new_keys, report.new_versions, report.invalidated
                );
            }
        }
        Command::Run { full_refresh } => {
            let summary = pipeline.run(full_refresh)?;
            for model in &summary.models {
                println!("✓ {}: {} rows", model.name, model.rows);
            }
        }
        Command::Test => {
            let report = pipeline.test()?;
            print_tests(&report);
            return Ok(report.is_success());
        }
        Command::Freshness => {
            let report = pipeline.freshness()?;
            println!(
                "{} {}: newest row {:?}, age {:?}h",
                match report.status {
                    FreshnessStatus::Pass => "✓",
                    FreshnessStatus::Warn => "⚠️",
                    FreshnessStatus::Error => "❌",
                },
                report.source,
                report.max_loaded_at,
                report.age_hours
            );
            return Ok(report.status != FreshnessStatus::Error);
        }
        Command::Docs => {
            let path = pipeline.docs()?;
            println!("✓ catalog written to {}", path.display());
        }
        Command::Build { full_refresh } => {
            let summary = pipeline.build(full_refresh)?;
            for model in &summary.run.models {
                println!("✓ {}: {} rows", model.name, model.rows);
            }
            print_tests(&summary.tests);
            return Ok(summary.is_success());
        }
        Command::History { run, name, limit } => {
            let events = if run.is_none() && name.is_none() && limit.is_none() {
                pipeline.last_run()?
            } else {
                pipeline.history(&EventFilter {
                    run_id: run,
                    entity_type: None,
                    entity_id: name,
                    limit,
                })?
            };
            if events.is_empty() {
                println!("No run events recorded");
            }
            for event in &events {
                let mark = if event.event_type == "failed" { "❌" } else { "✓" };
                println!(
                    "{} {} {} {} [{}] {}",
                    mark,
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.entity_type,
                    event.entity_id,
                    event.run_id,
                    event.data
                );
            }
        }
    }

    Ok(true)
}

fn print_tests(report: &QualityReport) {
    for result in &report.results {
        let mark = match result.status {
            TestStatus::Pass => "✓",
            TestStatus::Fail if !result.is_blocking() => "⚠️",
            _ => "❌",
        };
        match &result.message {
            Some(message) => println!("{} {} ({})", mark, result.name, message),
            None => println!("{} {}", mark, result.name),
        }
    }
    println!("\n{}", report.summary());
}
