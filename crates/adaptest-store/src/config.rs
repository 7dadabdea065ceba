//! Layered configuration loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use adaptest_core::calibration::CalibrationConfig;
use adaptest_core::exposure::ExposureConfig;
use adaptest_core::{EngineConfig, ExamConfig};

use crate::error::StoreError;

/// Top-level adaptest configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptestConfig {
    /// Default exam settings for new sessions.
    #[serde(default)]
    pub exam: ExamConfig,
    #[serde(default)]
    pub exposure: ExposureConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    /// Item catalog TOML file.
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,
    /// JSON Lines response log.
    #[serde(default = "default_response_log_path")]
    pub response_log_path: PathBuf,
    /// Output directory for reports.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Seed for session random streams. Unset means entropy.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_refresh_secs")]
    pub catalog_refresh_secs: u64,
    #[serde(default = "default_max_staleness_secs")]
    pub catalog_max_staleness_secs: u64,
    /// How long terminated sessions stay queryable in memory.
    #[serde(default = "default_session_retention_secs")]
    pub session_retention_secs: u64,
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("catalog.toml")
}
fn default_response_log_path() -> PathBuf {
    PathBuf::from("responses.jsonl")
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("./adaptest-results")
}
fn default_refresh_secs() -> u64 {
    300
}
fn default_max_staleness_secs() -> u64 {
    3600
}
fn default_session_retention_secs() -> u64 {
    3600
}

impl Default for AdaptestConfig {
    fn default() -> Self {
        Self {
            exam: ExamConfig::default(),
            exposure: ExposureConfig::default(),
            calibration: CalibrationConfig::default(),
            catalog_path: default_catalog_path(),
            response_log_path: default_response_log_path(),
            output_dir: default_output_dir(),
            seed: None,
            catalog_refresh_secs: default_refresh_secs(),
            catalog_max_staleness_secs: default_max_staleness_secs(),
            session_retention_secs: default_session_retention_secs(),
        }
    }
}

impl AdaptestConfig {
    /// Check every section, reporting the first inconsistency.
    pub fn validate(&self) -> Result<(), StoreError> {
        self.exam.validate().map_err(StoreError::InvalidConfig)?;
        self.exposure.validate().map_err(StoreError::InvalidConfig)?;
        if self.catalog_max_staleness_secs < self.catalog_refresh_secs {
            return Err(StoreError::InvalidConfig(format!(
                "catalog_max_staleness_secs ({}) is below catalog_refresh_secs ({})",
                self.catalog_max_staleness_secs, self.catalog_refresh_secs
            )));
        }
        Ok(())
    }

    /// Engine settings derived from this configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            exam: self.exam.clone(),
            exposure: self.exposure.clone(),
            calibration: self.calibration.clone(),
            catalog_refresh_interval: Duration::from_secs(self.catalog_refresh_secs),
            catalog_max_staleness: Duration::from_secs(self.catalog_max_staleness_secs),
            session_retention: Duration::from_secs(self.session_retention_secs),
            seed: self.seed,
        }
    }
}

/// Resolve environment variable references like `${VAR_NAME}` in a string.
/// Expand `${VAR}` references. Substituted values are not expanded again.
fn resolve_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut from = 0;
    while let Some(offset) = result[from..].find("${") {
        let start = from + offset;
        let Some(len) = result[start..].find('}') else {
            break;
        };
        let name = &result[start + 2..start + len];
        let value = std::env::var(name).unwrap_or_default();
        result.replace_range(start..start + len + 1, &value);
        from = start + value.len();
    }
    result
}

fn resolve_path(path: &Path) -> PathBuf {
    PathBuf::from(resolve_env_vars(&path.to_string_lossy()))
}

/// Load configuration from well-known paths.
///
/// Search order:
/// 1. `adaptest.toml` in the current directory
/// 2. `~/.config/adaptest/config.toml`
///
/// Environment overrides: `ADAPTEST_SEED`, `ADAPTEST_CATALOG`,
/// `ADAPTEST_RESPONSE_LOG`.
pub fn load_config() -> Result<AdaptestConfig> {
    load_config_from(None)
}

/// Load config from an explicit path, or search the default locations.
pub fn load_config_from(path: Option<&Path>) -> Result<AdaptestConfig> {
    let config_path = match path {
        Some(p) if p.exists() => Some(p.to_path_buf()),
        Some(p) => anyhow::bail!("config file not found: {}", p.display()),
        None => {
            let local = PathBuf::from("adaptest.toml");
            if local.exists() {
                Some(local)
            } else {
                dirs_path()
                    .map(|home| home.join("config.toml"))
                    .filter(|global| global.exists())
            }
        }
    };

    let mut config = match &config_path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config: {}", path.display()))?;
            let config = toml::from_str::<AdaptestConfig>(&content)
                .with_context(|| format!("failed to parse config: {}", path.display()))?;
            tracing::debug!("loaded config from {}", path.display());
            config
        }
        None => AdaptestConfig::default(),
    };

    apply_env_overrides(&mut config, |var| std::env::var(var).ok())?;

    config.catalog_path = resolve_path(&config.catalog_path);
    config.response_log_path = resolve_path(&config.response_log_path);
    config.output_dir = resolve_path(&config.output_dir);

    config.validate()?;
    Ok(config)
}

/// Apply `ADAPTEST_*` overrides read through `lookup`.
fn apply_env_overrides(
    config: &mut AdaptestConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), StoreError> {
    if let Some(value) = lookup("ADAPTEST_SEED") {
        let seed = value.trim().parse::<u64>().map_err(|_| StoreError::InvalidEnv {
            var: "ADAPTEST_SEED",
            value: value.clone(),
        })?;
        config.seed = Some(seed);
    }
    if let Some(path) = lookup("ADAPTEST_CATALOG") {
        config.catalog_path = PathBuf::from(path);
    }
    if let Some(path) = lookup("ADAPTEST_RESPONSE_LOG") {
        config.response_log_path = PathBuf::from(path);
    }
    Ok(())
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".config").join("adaptest"))
}
