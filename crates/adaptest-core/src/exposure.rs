//! Sympson-Hetter exposure control.
//!
//! Every item carries an admission probability `p_i`. When the selector
//! settles on an item for a session, an admission experiment is run once for
//! that (session, item) pair: with probability `p_i` the item may be served,
//! otherwise it is withheld for the rest of the session and the selector
//! moves on. `p_i` is retuned continuously from observed counts so that the
//! long-run fraction of sessions that see the item stays at or below its
//! target rate:
//!
//! ```text
//! P(served) = P(selected) * p_i   =>   p_i = min(1, r_max * sessions / requests_i)
//! ```
//!
//! Counters are shared across all sessions of an engine and updated with
//! atomics, so concurrent sessions never lose an increment.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};

use crate::model::ItemId;

/// Exposure-control tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureConfig {
    /// Default target exposure rate `r_max`.
    #[serde(default = "default_max_rate")]
    pub max_rate: f64,
    /// Sessions observed before admission experiments begin.
    #[serde(default = "default_warmup_sessions")]
    pub warmup_sessions: u64,
    /// Per-item target rates overriding `max_rate`.
    #[serde(default)]
    pub overrides: HashMap<ItemId, f64>,
}

fn default_max_rate() -> f64 {
    0.20
}

fn default_warmup_sessions() -> u64 {
    50
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            max_rate: default_max_rate(),
            warmup_sessions: default_warmup_sessions(),
            overrides: HashMap::new(),
        }
    }
}

impl ExposureConfig {
    pub fn target_rate(&self, item_id: &str) -> f64 {
        self.overrides
            .get(item_id)
            .copied()
            .unwrap_or(self.max_rate)
    }

    pub fn validate(&self) -> Result<(), String> {
        let check = |name: &str, rate: f64| {
            if rate.is_finite() && rate > 0.0 && rate <= 1.0 {
                Ok(())
            } else {
                Err(format!("exposure rate for {name} must be in (0, 1], got {rate}"))
            }
        };
        check("all items", self.max_rate)?;
        for (id, rate) in &self.overrides {
            check(id, *rate)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ItemCounters {
    served: AtomicU64,
    requests: AtomicU64,
}

/// Per-session exposure state: cached admission decisions and the session's
/// random stream.
#[derive(Debug)]
pub struct SessionContext {
    decisions: HashMap<ItemId, bool>,
    rng: Pcg64,
}

impl SessionContext {
    pub fn new(seed: u64) -> Self {
        Self {
            decisions: HashMap::new(),
            rng: Pcg64::seed_from_u64(seed),
        }
    }

    /// Items whose admission experiment failed in this session.
    pub fn withheld(&self) -> impl Iterator<Item = &str> {
        self.decisions
            .iter()
            .filter(|(_, admitted)| !**admitted)
            .map(|(id, _)| id.as_str())
    }

    pub fn is_withheld(&self, item_id: &str) -> bool {
        self.decisions.get(item_id) == Some(&false)
    }

    pub fn rng_mut(&mut self) -> &mut Pcg64 {
        &mut self.rng
    }
}

/// Point-in-time exposure figures for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemExposure {
    pub item_id: ItemId,
    pub served: u64,
    pub requests: u64,
    /// `served / sessions`.
    pub exposure_rate: f64,
    /// Current admission probability `p_i`.
    pub admission_probability: f64,
}

/// Persistable counter state: the session denominator plus per-item figures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExposureState {
    pub sessions: u64,
    pub items: Vec<ItemExposure>,
}

/// Shared Sympson-Hetter controller.
#[derive(Debug, Default)]
pub struct ExposureController {
    config: ExposureConfig,
    sessions: AtomicU64,
    counters: RwLock<HashMap<ItemId, Arc<ItemCounters>>>,
}

impl ExposureController {
    pub fn new(config: ExposureConfig) -> Self {
        Self {
            config,
            sessions: AtomicU64::new(0),
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Resume from counters persisted by an earlier run. Rates and admission
    /// probabilities are recomputed from the raw counts.
    pub fn from_state(config: ExposureConfig, state: ExposureState) -> Self {
        let counters = state
            .items
            .into_iter()
            .map(|item| {
                let counters = ItemCounters {
                    served: AtomicU64::new(item.served),
                    requests: AtomicU64::new(item.requests),
                };
                (item.item_id, Arc::new(counters))
            })
            .collect();
        Self {
            config,
            sessions: AtomicU64::new(state.sessions),
            counters: RwLock::new(counters),
        }
    }

    /// Counter state for the surrounding system to persist.
    pub fn state(&self) -> ExposureState {
        ExposureState {
            sessions: self.sessions(),
            items: self.snapshot(),
        }
    }

    pub fn config(&self) -> &ExposureConfig {
        &self.config
    }

    /// Count a new session toward the exposure denominator.
    pub fn record_session_started(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    /// Run (or recall) the admission experiment for `item_id` in a session.
    pub fn may_serve(&self, item_id: &str, ctx: &mut SessionContext) -> bool {
        if let Some(&admitted) = ctx.decisions.get(item_id) {
            return admitted;
        }

        let counters = self.counters_for(item_id);
        let requests = counters.requests.fetch_add(1, Ordering::Relaxed) + 1;
        let p = self.admission_probability_for(item_id, self.sessions(), requests);
        let admitted = p >= 1.0 || ctx.rng.random::<f64>() < p;

        if !admitted {
            tracing::trace!(item = item_id, p, "item withheld by exposure control");
        }
        ctx.decisions.insert(item_id.to_string(), admitted);
        admitted
    }

    /// Record that an item was administered.
    pub fn record_served(&self, item_id: &str) {
        self.counters_for(item_id)
            .served
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn served_count(&self, item_id: &str) -> u64 {
        self.existing(item_id)
            .map(|c| c.served.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Fraction of started sessions that were served this item.
    pub fn exposure_rate(&self, item_id: &str) -> f64 {
        let sessions = self.sessions();
        if sessions == 0 {
            return 0.0;
        }
        self.served_count(item_id) as f64 / sessions as f64
    }

    /// Current admission probability `p_i`.
    pub fn admission_probability(&self, item_id: &str) -> f64 {
        let requests = self
            .existing(item_id)
            .map(|c| c.requests.load(Ordering::Relaxed))
            .unwrap_or(0);
        self.admission_probability_for(item_id, self.sessions(), requests)
    }

    /// Exposure figures for every item seen so far, ordered by id.
    pub fn snapshot(&self) -> Vec<ItemExposure> {
        let sessions = self.sessions();
        let counters = self.counters.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<ItemExposure> = counters
            .iter()
            .map(|(id, c)| {
                let served = c.served.load(Ordering::Relaxed);
                let requests = c.requests.load(Ordering::Relaxed);
                ItemExposure {
                    item_id: id.clone(),
                    served,
                    requests,
                    exposure_rate: if sessions == 0 {
                        0.0
                    } else {
                        served as f64 / sessions as f64
                    },
                    admission_probability: self.admission_probability_for(id, sessions, requests),
                }
            })
            .collect();
        out.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        out
    }

    fn admission_probability_for(&self, item_id: &str, sessions: u64, requests: u64) -> f64 {
        if sessions < self.config.warmup_sessions || requests == 0 {
            return 1.0;
        }
        let target = self.config.target_rate(item_id);
        (target * sessions as f64 / requests as f64).min(1.0)
    }

    fn existing(&self, item_id: &str) -> Option<Arc<ItemCounters>> {
        self.counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(item_id)
            .cloned()
    }

    fn counters_for(&self, item_id: &str) -> Arc<ItemCounters> {
        if let Some(existing) = self.existing(item_id) {
            return existing;
        }
        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        counters
            .entry(item_id.to_string())
            .or_default()
            .clone()
    }
}
