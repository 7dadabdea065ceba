//! File-backed repositories: a TOML item catalog and a JSON Lines response
//! log.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use adaptest_core::model::{CatalogSnapshot, Response};
use adaptest_core::parser::{parse_catalog_str, validate_catalog};
use adaptest_core::{BatchWindow, ItemCatalogRepository, ResponseLogRepository};

use crate::error::StoreError;

/// Item catalog read from a TOML file on every load.
pub struct TomlCatalog {
    path: PathBuf,
    name: String,
}

impl TomlCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self { path, name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ItemCatalogRepository for TomlCatalog {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load_snapshot(&self) -> anyhow::Result<CatalogSnapshot> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        let file = parse_catalog_str(&content, &self.path)?;

        let warnings = validate_catalog(&file);
        for warning in &warnings {
            match &warning.item_id {
                Some(id) => tracing::warn!(item = %id, "{}", warning.message),
                None => tracing::warn!("{}", warning.message),
            }
        }
        Ok(file.into_snapshot())
    }
}

/// Append-only response log stored as JSON Lines.
///
/// Appends from concurrent sessions are serialized through an internal lock
/// so lines never interleave.
pub struct JsonlResponseLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlResponseLog {
    /// Open a log, appending to any existing content.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Create an empty log, truncating any existing file.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
        tokio::fs::File::create(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        Ok(Self::open(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every response in the file, in append order.
    pub async fn read_all(&self) -> Result<Vec<Response>, StoreError> {
        self.read_matching(&BatchWindow::all()).await
    }

    async fn read_matching(&self, window: &BatchWindow) -> Result<Vec<Response>, StoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        let mut responses = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let response: Response =
                serde_json::from_str(line).map_err(|source| StoreError::CorruptLine {
                    path: self.path.clone(),
                    line: idx + 1,
                    source,
                })?;
            if window.contains(response.recorded_at) {
                responses.push(response);
            }
        }
        Ok(responses)
    }
}

#[async_trait]
impl ResponseLogRepository for JsonlResponseLog {
    async fn append(&self, response: &Response) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(response).context("failed to encode response")?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.flush().await.map_err(|e| StoreError::io(&self.path, e))?;
        Ok(())
    }

    async fn snapshot(&self, window: &BatchWindow) -> anyhow::Result<Vec<Response>> {
        Ok(self.read_matching(window).await?)
    }
}
