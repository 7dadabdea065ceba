//! The `adaptest validate` command.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use adaptest_core::parser::{self, CatalogFile};

pub fn execute(catalog_path: PathBuf) -> Result<()> {
    let catalogs = if catalog_path.is_dir() {
        load_directory(&catalog_path)?
    } else {
        vec![parser::parse_catalog(&catalog_path)?]
    };

    let mut total_warnings = 0;

    for catalog in &catalogs {
        let selectable = catalog.items.iter().filter(|i| i.is_selectable()).count();
        println!(
            "Catalog: {} v{} ({} items, {} selectable)",
            catalog.id,
            catalog.version,
            catalog.items.len(),
            selectable
        );

        let warnings = parser::validate_catalog(catalog);
        for w in &warnings {
            let prefix = w
                .item_id
                .as_ref()
                .map(|id| format!("  [{id}]"))
                .unwrap_or_else(|| "  ".to_string());
            println!("{prefix} WARNING: {}", w.message);
        }
        total_warnings += warnings.len();
    }

    if total_warnings == 0 {
        println!("All catalogs valid.");
    } else {
        println!("\n{total_warnings} warning(s) found.");
    }

    Ok(())
}

/// Parse every `.toml` file in a directory, in name order.
fn load_directory(dir: &Path) -> Result<Vec<CatalogFile>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory: {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();

    if paths.is_empty() {
        anyhow::bail!("no catalog files found in {}", dir.display());
    }
    paths.iter().map(|p| parser::parse_catalog(p)).collect()
}
