//! Repository traits the engine is wired with.
//!
//! Implementations live in `adaptest-store` (files) and [`crate::memory`]
//! (in-process doubles for tests and simulations).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{CatalogSnapshot, Response};

// ---------------------------------------------------------------------------
// Item catalog
// ---------------------------------------------------------------------------

/// Read-only source of calibrated items.
#[async_trait]
pub trait ItemCatalogRepository: Send + Sync {
    /// Human-readable source name (e.g. a file path).
    fn name(&self) -> &str;

    /// Load the current catalog snapshot.
    async fn load_snapshot(&self) -> anyhow::Result<CatalogSnapshot>;
}

// ---------------------------------------------------------------------------
// Response log
// ---------------------------------------------------------------------------

/// Append-only store of examinee responses.
#[async_trait]
pub trait ResponseLogRepository: Send + Sync {
    /// Durably record one response.
    async fn append(&self, response: &Response) -> anyhow::Result<()>;

    /// Responses recorded within `window`, in append order.
    async fn snapshot(&self, window: &BatchWindow) -> anyhow::Result<Vec<Response>>;
}

/// Time range of responses a calibration batch reads. Both ends optional;
/// `since` is inclusive, `until` exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchWindow {
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

impl BatchWindow {
    /// Every response ever logged.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.since.map_or(true, |s| at >= s) && self.until.map_or(true, |u| at < u)
    }
}
