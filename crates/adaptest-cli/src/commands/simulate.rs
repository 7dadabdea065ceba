//! The `adaptest simulate` command.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use comfy_table::{Cell, Table};

use adaptest_core::simulate::{
    run_simulation, ExamineeOutcome, SimulationConfig, SimulationObserver, SimulationReport,
};
use adaptest_core::{AdaptiveEngine, ItemCatalogRepository};
use adaptest_store::config::load_config_from;
use adaptest_store::{JsonlResponseLog, TomlCatalog};

const DEFAULT_SEED: u64 = 42;

pub struct SimulateArgs {
    pub catalog: Option<PathBuf>,
    pub examinees: usize,
    pub seed: Option<u64>,
    pub parallelism: usize,
    pub ability_mean: f64,
    pub ability_sd: f64,
    pub output: Option<PathBuf>,
    pub report: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

/// Console progress reporter.
struct ConsoleObserver;

impl SimulationObserver for ConsoleObserver {
    fn on_examinee_complete(&self, outcome: &ExamineeOutcome) {
        tracing::debug!(
            examinee = outcome.index,
            items = outcome.items_administered,
            "examinee finished: {}",
            outcome.termination
        );
    }

    fn on_examinee_error(&self, index: usize, error: &str) {
        eprintln!("  ERROR: examinee {index}: {error}");
    }

    fn on_simulation_complete(
        &self,
        total: usize,
        completed: usize,
        failed: usize,
        elapsed: Duration,
    ) {
        eprintln!(
            "\nComplete: {completed}/{total} sessions finished, {failed} failed ({:.1}s)",
            elapsed.as_secs_f64()
        );
    }
}

pub async fn execute(args: SimulateArgs) -> Result<()> {
    anyhow::ensure!(args.examinees >= 1, "examinees must be at least 1");
    anyhow::ensure!(args.parallelism >= 1, "parallelism must be at least 1");
    anyhow::ensure!(
        args.ability_sd.is_finite() && args.ability_sd > 0.0,
        "ability-sd must be positive"
    );

    let config = load_config_from(args.config.as_deref())?;
    let catalog_path = args.catalog.unwrap_or_else(|| config.catalog_path.clone());
    let output = args
        .output
        .unwrap_or_else(|| config.response_log_path.clone());
    let seed = args.seed.or(config.seed).unwrap_or(DEFAULT_SEED);

    let catalog = TomlCatalog::new(&catalog_path);
    let snapshot = catalog
        .load_snapshot()
        .await
        .with_context(|| format!("failed to load catalog {}", catalog_path.display()))?;
    eprintln!(
        "adaptest v{} — Simulating {} examinees on catalog {} v{} ({} items)",
        env!("CARGO_PKG_VERSION"),
        args.examinees,
        snapshot.id,
        snapshot.version,
        snapshot.selectable_count()
    );

    let log = JsonlResponseLog::create(&output).await?;

    let mut engine_config = config.engine_config();
    engine_config.seed = Some(seed);
    let engine = AdaptiveEngine::new(Arc::new(catalog), Arc::new(log), engine_config);

    let sim_config = SimulationConfig {
        examinees: args.examinees,
        parallelism: args.parallelism,
        seed,
        ability_mean: args.ability_mean,
        ability_sd: args.ability_sd,
        ..Default::default()
    };
    let report = run_simulation(&engine, &sim_config, &ConsoleObserver).await?;

    print_summary(&report);
    eprintln!("Responses saved to: {}", output.display());

    if let Some(path) = &args.report {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report: {}", path.display()))?;
        eprintln!("Simulation report: {}", path.display());
    }

    Ok(())
}

fn print_summary(report: &SimulationReport) {
    let s = &report.summary;
    let mut table = Table::new();
    table.set_header(vec!["Metric", "Value"]);

    let correlation = s
        .correlation
        .map(|r| format!("{r:.3}"))
        .unwrap_or_else(|| "n/a".to_string());
    let rows = [
        ("Examinees", s.examinees.to_string()),
        ("Completed", s.completed.to_string()),
        ("Exhausted", s.exhausted.to_string()),
        ("Failed", s.failed.to_string()),
        ("Bias", format!("{:+.3}", s.bias)),
        ("RMSE", format!("{:.3}", s.rmse)),
        ("Correlation", correlation),
        ("Mean items", format!("{:.1}", s.mean_items)),
        ("Mean SE", format!("{:.3}", s.mean_standard_error)),
        ("Pass rate", format!("{:.1}%", s.pass_rate * 100.0)),
        ("Max exposure", format!("{:.3}", s.max_exposure_rate)),
    ];
    for (name, value) in rows {
        table.add_row(vec![Cell::new(name), Cell::new(value)]);
    }

    println!("{table}");
}
