//! The `adaptest init` command.

use std::path::Path;

use anyhow::Result;

pub fn execute() -> Result<()> {
    if Path::new("adaptest.toml").exists() {
        println!("adaptest.toml already exists, skipping.");
    } else {
        std::fs::write("adaptest.toml", SAMPLE_CONFIG)?;
        println!("Created adaptest.toml");
    }

    std::fs::create_dir_all("catalogs")?;
    let catalog_path = Path::new("catalogs/sample.toml");
    if catalog_path.exists() {
        println!("catalogs/sample.toml already exists, skipping.");
    } else {
        std::fs::write(catalog_path, SAMPLE_CATALOG)?;
        println!("Created catalogs/sample.toml");
    }

    println!("\nNext steps:");
    println!("  1. Run: adaptest validate --catalog catalogs/sample.toml");
    println!("  2. Run: adaptest simulate --examinees 200 --seed 42");
    println!("  3. Run: adaptest calibrate");

    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# adaptest configuration

catalog_path = "catalogs/sample.toml"
response_log_path = "responses.jsonl"
output_dir = "./adaptest-results"
catalog_refresh_secs = 300
catalog_max_staleness_secs = 3600
session_retention_secs = 3600

[exam]
min_items = 10
max_items = 30
se_target = 0.30
idle_timeout_secs = 1800

[exam.estimator]
method = "mle"
max_iterations = 25

[exam.selection]
method = "max_info"
top_k = 5
content_balancing = true
balance_tolerance = 0.05

[exam.scoring]
center = 500.0
slope = 100.0
pass_threshold = 600.0

[exposure]
max_rate = 0.20
warmup_sessions = 50

[calibration]
min_sample_size = 30
update_threshold = 0.3
"#;

const SAMPLE_CATALOG: &str = include_str!("../../../../catalogs/sample.toml");
