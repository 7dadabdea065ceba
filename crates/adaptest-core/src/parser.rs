//! TOML item catalog parser.
//!
//! Loads catalogs from TOML files and validates them.
//!
//! ```toml
//! [catalog]
//! id = "residency-2026"
//! version = "2026.1"
//!
//! [[items]]
//! id = "cm-001"
//! content_area = "clinica_medica"
//! difficulty = -0.4
//! discrimination = 1.3
//! guessing = 0.2
//! ```

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::model::{CatalogSnapshot, ContentArea, Item};

/// Intermediate TOML structure for parsing catalog files.
#[derive(Debug, Deserialize)]
struct TomlCatalogFile {
    catalog: TomlCatalogHeader,
    #[serde(default)]
    items: Vec<TomlItem>,
}

#[derive(Debug, Deserialize)]
struct TomlCatalogHeader {
    id: String,
    #[serde(default = "default_version")]
    version: String,
}

fn default_version() -> String {
    "1".to_string()
}

#[derive(Debug, Deserialize)]
struct TomlItem {
    id: String,
    content_area: String,
    difficulty: f64,
    discrimination: f64,
    #[serde(default = "default_guessing")]
    guessing: f64,
    #[serde(default = "default_true")]
    active: bool,
    #[serde(default)]
    exposure_count: u64,
    #[serde(default)]
    infit: Option<f64>,
    #[serde(default)]
    outfit: Option<f64>,
}

fn default_guessing() -> f64 {
    0.2
}

fn default_true() -> bool {
    true
}

/// A parsed catalog file, before deduplication and parameter checks.
#[derive(Debug, Clone)]
pub struct CatalogFile {
    pub id: String,
    pub version: String,
    pub items: Vec<Item>,
}

impl CatalogFile {
    /// Build a snapshot, dropping items whose parameters are invalid.
    pub fn into_snapshot(self) -> CatalogSnapshot {
        CatalogSnapshot::new(self.id, self.version, self.items)
    }
}

/// Parse a single TOML catalog file.
pub fn parse_catalog(path: &Path) -> Result<CatalogFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read catalog file: {}", path.display()))?;

    parse_catalog_str(&content, path)
}

/// Parse a TOML string into a catalog (useful for testing).
pub fn parse_catalog_str(content: &str, source_path: &Path) -> Result<CatalogFile> {
    let parsed: TomlCatalogFile = toml::from_str(content)
        .with_context(|| format!("failed to parse TOML: {}", source_path.display()))?;

    let items = parsed
        .items
        .into_iter()
        .map(|i| {
            let content_area: ContentArea = i
                .content_area
                .parse()
                .map_err(|e: String| anyhow::anyhow!("item '{}': {}", i.id, e))?;
            Ok(Item {
                id: i.id,
                content_area,
                difficulty: i.difficulty,
                discrimination: i.discrimination,
                guessing: i.guessing,
                active: i.active,
                exposure_count: i.exposure_count,
                infit: i.infit,
                outfit: i.outfit,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CatalogFile {
        id: parsed.catalog.id,
        version: parsed.catalog.version,
        items,
    })
}

/// A warning from catalog validation.
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    /// The item ID (if applicable).
    pub item_id: Option<String>,
    /// Warning message.
    pub message: String,
}

/// Validate a catalog for common issues.
pub fn validate_catalog(catalog: &CatalogFile) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();

    let mut seen_ids = HashSet::new();
    for item in &catalog.items {
        if !seen_ids.insert(&item.id) {
            warnings.push(ValidationWarning {
                item_id: Some(item.id.clone()),
                message: format!("duplicate item ID: {}", item.id),
            });
        }
    }

    for item in &catalog.items {
        if let Err(e) = item.params().check() {
            warnings.push(ValidationWarning {
                item_id: Some(item.id.clone()),
                message: e,
            });
        }
        if item.is_misfit() {
            warnings.push(ValidationWarning {
                item_id: Some(item.id.clone()),
                message: "fit statistics outside [0.7, 1.3]; item will not be selected".into(),
            });
        }
        if !item.active {
            warnings.push(ValidationWarning {
                item_id: Some(item.id.clone()),
                message: "item is inactive".into(),
            });
        }
    }

    // Content areas nothing can be drawn from
    for area in ContentArea::ALL {
        let usable = catalog
            .items
            .iter()
            .any(|i| i.content_area == area && i.is_selectable());
        if !usable {
            warnings.push(ValidationWarning {
                item_id: None,
                message: format!("no selectable items in content area {area}"),
            });
        }
    }

    warnings
}
