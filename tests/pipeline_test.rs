// End-to-end runs against a warehouse file built from CSV extracts

use airbnb_pipeline::data_quality::{stored_failures, FreshnessStatus, TestStatus};
use airbnb_pipeline::db::{query_json_rows, row_count, EventFilter};
use airbnb_pipeline::{Pipeline, PipelineConfig, PipelineError};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const LISTINGS: &str = "\
id,listing_url,name,room_type,minimum_nights,host_id,price,created_at,updated_at
1,https://www.airbnb.com/rooms/1,Loft in Mitte,Entire home/apt,0,10,\"$1,250.00\",2016-01-01 10:00:00,2022-01-01 10:00:00
2,https://www.airbnb.com/rooms/2,Quiet room,Private room,3,20,$45.00,2017-05-05 12:00:00,2022-02-01 08:00:00
";

const HOSTS: &str = "\
id,name,is_superhost,created_at,updated_at
10,Ann,t,2015-01-01 00:00:00,2022-03-01 00:00:00
20,,f,2015-06-01 00:00:00,2021-01-01 00:00:00
";

const REVIEWS: &str = "\
listing_id,date,reviewer_name,comments,sentiment
1,2024-01-25,Ben,Nice place,positive
1,2024-01-26,Cat,Lovely host,positive
2,2024-01-27,Dan,,neutral
2,2024-01-28,Eve,Too loud,negative
";

const FULL_MOONS: &str = "\
full_moon_date
2023-12-27
2024-01-25
";

fn project(config_toml: &str, reviews: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join("data")).unwrap();
    fs::create_dir_all(root.join("seeds")).unwrap();
    fs::write(root.join("data/listings.csv"), LISTINGS).unwrap();
    fs::write(root.join("data/hosts.csv"), HOSTS).unwrap();
    fs::write(root.join("data/reviews.csv"), reviews).unwrap();
    fs::write(root.join("seeds/seed_full_moon_dates.csv"), FULL_MOONS).unwrap();

    let config_path = root.join("pipeline.toml");
    fs::write(&config_path, config_toml).unwrap();
    (dir, config_path)
}

fn open(config_path: &Path) -> Pipeline {
    Pipeline::open(PipelineConfig::load(config_path).unwrap()).unwrap()
}

#[test]
fn test_build_end_to_end() {
    let (_dir, config_path) = project("database = \"warehouse.db\"\n", REVIEWS);
    let mut pipeline = open(&config_path);

    pipeline.load().unwrap();
    let summary = pipeline.build(false).unwrap();
    assert!(summary.is_success(), "{}", summary.tests.summary());

    let conn = pipeline.connection();
    assert_eq!(row_count(conn, "dim_listings_cleansed").unwrap(), 2);
    assert_eq!(row_count(conn, "dim_hosts_cleansed").unwrap(), 2);
    // Empty review text is dropped
    assert_eq!(row_count(conn, "fct_reviews").unwrap(), 3);
    assert_eq!(row_count(conn, "scd_raw_listings").unwrap(), 2);

    let listing = query_json_rows(
        conn,
        "SELECT minimum_nights, price FROM dim_listings_cleansed WHERE listing_id = 1",
        [],
    )
    .unwrap();
    assert_eq!(listing[0]["minimum_nights"], 1);
    assert_eq!(listing[0]["price"].as_f64(), Some(1250.0));

    let anonymous = query_json_rows(conn, "SELECT host_name FROM dim_hosts_cleansed WHERE host_id = 20", []).unwrap();
    assert_eq!(anonymous[0]["host_name"], "Anonymous");

    let moons = query_json_rows(
        conn,
        "SELECT reviewer_name, is_full_moon FROM mart_fullmoon_reviews ORDER BY review_date",
        [],
    )
    .unwrap();
    assert_eq!(moons[0]["is_full_moon"], "not full moon");
    assert_eq!(moons[1]["reviewer_name"], "Cat");
    assert_eq!(moons[1]["is_full_moon"], "full moon");

    let failures: i64 = conn
        .query_row("SELECT COUNT(*) FROM dq_failures", [], |row| row.get(0))
        .unwrap();
    assert_eq!(failures, 0);
}

#[test]
fn test_rerun_without_new_data_changes_nothing() {
    let (_dir, config_path) = project("", REVIEWS);
    let mut pipeline = open(&config_path);
    pipeline.load().unwrap();
    pipeline.seed().unwrap();
    pipeline.run(false).unwrap();

    let again = pipeline.run(false).unwrap();
    assert_eq!(again.fct_reviews.inserted, 0);
    assert_eq!(row_count(pipeline.connection(), "fct_reviews").unwrap(), 3);
    assert_eq!(row_count(pipeline.connection(), "mart_fullmoon_reviews").unwrap(), 3);

    let refreshed = pipeline.run(true).unwrap();
    assert_eq!(refreshed.fct_reviews.inserted, 3);
}

#[test]
fn test_orphan_review_lands_in_failure_sink() {
    let reviews = format!("{}99,2024-02-01,Zed,Where is this,positive\n", REVIEWS);
    let (_dir, config_path) = project("", &reviews);
    let mut pipeline = open(&config_path);
    pipeline.load().unwrap();

    let summary = pipeline.build(false).unwrap();
    assert!(!summary.is_success());

    let orphan = summary
        .tests
        .results
        .iter()
        .find(|r| r.name == "relationships_fct_reviews_listing_id")
        .unwrap();
    assert_eq!(orphan.status, TestStatus::Fail);
    assert_eq!(orphan.failures, 1);

    let stored = stored_failures(pipeline.connection(), "relationships_fct_reviews_listing_id").unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0]["listing_id"], 99);
    assert_eq!(stored[0]["reviewer_name"], "Zed");
}

#[test]
fn test_early_review_and_duplicate_host_fail_default_rules() {
    // Listing 1 was created in 2016
    let reviews = format!("{}1,2010-05-01,Old,Before the listing existed,positive\n", REVIEWS);
    let (dir, config_path) = project("", &reviews);
    let hosts = format!("{}10,Ann B,f,2015-01-01 00:00:00,2022-04-01 00:00:00\n", HOSTS);
    fs::write(dir.path().join("data/hosts.csv"), hosts).unwrap();

    let mut pipeline = open(&config_path);
    pipeline.load().unwrap();
    let summary = pipeline.build(false).unwrap();
    assert!(!summary.is_success());

    let status_of = |name: &str| {
        summary
            .tests
            .results
            .iter()
            .find(|r| r.name == name)
            .map(|r| (r.status, r.failures))
            .unwrap()
    };
    assert_eq!(status_of("consistent_created_at"), (TestStatus::Fail, 1));
    assert_eq!(status_of("unique_dim_hosts_cleansed_host_id"), (TestStatus::Fail, 1));

    let early = stored_failures(pipeline.connection(), "consistent_created_at").unwrap();
    assert_eq!(early.len(), 1);
    assert_eq!(early[0]["reviewer_name"], "Old");
    assert_eq!(early[0]["listing_id"], 1);

    let duplicates = stored_failures(pipeline.connection(), "unique_dim_hosts_cleansed_host_id").unwrap();
    assert_eq!(duplicates.len(), 1);
    assert_eq!(duplicates[0]["host_id"], 10);
    assert_eq!(duplicates[0]["n_records"], 2);
}

#[test]
fn test_configured_contract_mismatch_keeps_previous_table() {
    let (dir, config_path) = project("", REVIEWS);
    {
        let mut pipeline = open(&config_path);
        pipeline.load().unwrap();
        pipeline.seed().unwrap();
        pipeline.run(false).unwrap();
    }

    // Same warehouse, stricter contract: updated_at is no longer promised
    let strict = "\
[[contracts]]
model = \"dim_hosts_cleansed\"
columns = [
    { name = \"host_id\", data_type = \"integer\" },
    { name = \"host_name\", data_type = \"text\" },
    { name = \"is_superhost\", data_type = \"boolean\" },
    { name = \"created_at\", data_type = \"timestamp\" },
]
";
    fs::write(dir.path().join("pipeline.toml"), strict).unwrap();
    let mut pipeline = open(&config_path);

    let err = pipeline.run(false).unwrap_err();
    assert!(matches!(err, PipelineError::ContractViolation { .. }));
    assert_eq!(row_count(pipeline.connection(), "dim_hosts_cleansed").unwrap(), 2);
}

#[test]
fn test_docs_and_freshness() {
    let (dir, config_path) = project("", REVIEWS);
    let mut pipeline = open(&config_path);
    pipeline.load().unwrap();

    let catalog_path = pipeline.docs().unwrap();
    assert_eq!(catalog_path, dir.path().join("target").join("catalog.json"));
    let catalog: serde_json::Value = serde_json::from_str(&fs::read_to_string(catalog_path).unwrap()).unwrap();
    let raw_reviews = catalog["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .find(|n| n["name"] == "raw_reviews")
        .unwrap();
    assert_eq!(raw_reviews["row_count"], 4);

    // 2024 reviews are long past the 24h error threshold
    let freshness = pipeline.freshness().unwrap();
    assert_eq!(freshness.status, FreshnessStatus::Error);
}

#[test]
fn test_history_of_previous_invocation() {
    let (_dir, config_path) = project("", REVIEWS);
    let first_run = {
        let mut pipeline = open(&config_path);
        pipeline.load().unwrap();
        pipeline.seed().unwrap();
        pipeline.run(false).unwrap();
        pipeline.run_id().to_string()
    };

    let pipeline = open(&config_path);
    assert_ne!(pipeline.run_id(), first_run);
    let events = pipeline.last_run().unwrap();
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.run_id == first_run && e.event_type == "completed"));
    assert_eq!(events.last().unwrap().entity_id, "mart_fullmoon_reviews");

    let fact = pipeline
        .history(&EventFilter::for_entity("model", "fct_reviews"))
        .unwrap();
    assert_eq!(fact.len(), 1);
    assert_eq!(fact[0].data["inserted"], 3);
    assert!(pipeline.history(&EventFilter::for_run(pipeline.run_id())).unwrap().is_empty());
}

#[test]
fn test_missing_extract_is_an_error() {
    let (dir, config_path) = project("", REVIEWS);
    fs::remove_file(dir.path().join("data/hosts.csv")).unwrap();
    let mut pipeline = open(&config_path);
    assert!(matches!(pipeline.load(), Err(PipelineError::Io(_))));
}
