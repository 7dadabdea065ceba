//! The `adaptest calibrate` command.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use adaptest_core::{AdaptiveEngine, BatchWindow};
use adaptest_store::config::load_config_from;
use adaptest_store::{JsonlResponseLog, TomlCatalog};

pub async fn execute(
    catalog: Option<PathBuf>,
    responses: Option<PathBuf>,
    format: String,
    output: Option<PathBuf>,
    top: usize,
    fail_on_gate: bool,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let config = load_config_from(config_path.as_deref())?;
    let catalog_path = catalog.unwrap_or_else(|| config.catalog_path.clone());
    let responses_path = responses.unwrap_or_else(|| config.response_log_path.clone());
    anyhow::ensure!(
        responses_path.exists(),
        "response log not found: {}",
        responses_path.display()
    );

    let engine = AdaptiveEngine::new(
        Arc::new(TomlCatalog::new(&catalog_path)),
        Arc::new(JsonlResponseLog::open(&responses_path)),
        config.engine_config(),
    );
    let report = engine.run_calibration(&BatchWindow::all()).await?;

    match format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        "text" => print!("{}", report.render_text(top)),
        other => anyhow::bail!("unknown format '{other}' (expected text or json)"),
    }

    if let Some(path) = &output {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        report.save_json(path)?;
        eprintln!("Calibration report saved to: {}", path.display());
    }

    if fail_on_gate && !report.all_gates_passed() {
        let failed: Vec<&str> = report
            .gates
            .iter()
            .filter(|g| !g.passed)
            .map(|g| g.name.as_str())
            .collect();
        anyhow::bail!("quality gates failed: {}", failed.join(", "));
    }

    Ok(())
}
