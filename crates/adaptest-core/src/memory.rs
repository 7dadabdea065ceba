//! In-memory repositories for tests and simulations.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;

use crate::model::{CatalogSnapshot, Item, Response};
use crate::traits::{BatchWindow, ItemCatalogRepository, ResponseLogRepository};

/// A catalog held in memory.
///
/// Can be switched into a failing mode to exercise outage handling.
pub struct InMemoryCatalog {
    snapshot: RwLock<CatalogSnapshot>,
    failing: AtomicBool,
    load_count: AtomicU32,
}

impl InMemoryCatalog {
    pub fn new(snapshot: CatalogSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
            failing: AtomicBool::new(false),
            load_count: AtomicU32::new(0),
        }
    }

    pub fn from_items(items: Vec<Item>) -> Self {
        Self::new(CatalogSnapshot::new("memory", "1", items))
    }

    /// Replace the catalog content.
    pub fn replace(&self, snapshot: CatalogSnapshot) {
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }

    /// Make subsequent loads fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Number of `load_snapshot` calls made.
    pub fn load_count(&self) -> u32 {
        self.load_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ItemCatalogRepository for InMemoryCatalog {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load_snapshot(&self) -> anyhow::Result<CatalogSnapshot> {
        self.load_count.fetch_add(1, Ordering::Relaxed);
        if self.failing.load(Ordering::Relaxed) {
            anyhow::bail!("in-memory catalog is set to fail");
        }
        let snapshot = self
            .snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        Ok(snapshot.with_loaded_at(chrono::Utc::now()))
    }
}

/// An append-only response log held in memory.
#[derive(Default)]
pub struct InMemoryResponseLog {
    responses: Mutex<Vec<Response>>,
    failing: AtomicBool,
}

impl InMemoryResponseLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent appends fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.responses.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All responses, in append order.
    pub fn all(&self) -> Vec<Response> {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ResponseLogRepository for InMemoryResponseLog {
    async fn append(&self, response: &Response) -> anyhow::Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            anyhow::bail!("in-memory response log is set to fail");
        }
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(response.clone());
        Ok(())
    }

    async fn snapshot(&self, window: &BatchWindow) -> anyhow::Result<Vec<Response>> {
        Ok(self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| window.contains(r.recorded_at))
            .cloned()
            .collect())
    }
}
