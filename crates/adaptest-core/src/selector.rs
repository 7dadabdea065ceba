//! Next-item selection.
//!
//! Items are ranked by Fisher information at the current ability estimate and
//! one of the top `K` is drawn uniformly (randomesque selection). The drawn
//! item must pass its Sympson-Hetter admission experiment; if it is withheld
//! the draw repeats over the remaining candidates. Content balancing is soft:
//! areas already over their target share are set aside and only reconsidered
//! when nothing else can be served.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::exposure::{ExposureController, SessionContext};
use crate::irt;
use crate::model::{CatalogSnapshot, ContentArea, Item, ItemId};

/// Ranking rule for eligible items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    /// Maximum Fisher information with randomesque top-K.
    MaxInfo,
    /// Uniform over all eligible items (baseline for comparisons).
    Random,
}

/// Selection tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionConfig {
    #[serde(default = "default_method")]
    pub method: SelectionMethod,
    /// Size of the randomesque candidate pool.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_true")]
    pub content_balancing: bool,
    /// Target share of administered items per area.
    #[serde(default = "default_area_targets")]
    pub area_targets: HashMap<ContentArea, f64>,
    /// How far above target an area may drift before it is set aside.
    #[serde(default = "default_balance_tolerance")]
    pub balance_tolerance: f64,
}

fn default_method() -> SelectionMethod {
    SelectionMethod::MaxInfo
}

fn default_top_k() -> usize {
    5
}

fn default_true() -> bool {
    true
}

fn default_area_targets() -> HashMap<ContentArea, f64> {
    ContentArea::ALL.iter().map(|a| (*a, 0.2)).collect()
}

fn default_balance_tolerance() -> f64 {
    0.05
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            top_k: default_top_k(),
            content_balancing: true,
            area_targets: default_area_targets(),
            balance_tolerance: default_balance_tolerance(),
        }
    }
}

impl SelectionConfig {
    pub fn target_for(&self, area: ContentArea) -> f64 {
        self.area_targets.get(&area).copied().unwrap_or(0.0)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.top_k == 0 {
            return Err("selection.top_k must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.balance_tolerance) {
            return Err(format!(
                "selection.balance_tolerance must be in [0, 1], got {}",
                self.balance_tolerance
            ));
        }
        if let Some((area, t)) = self
            .area_targets
            .iter()
            .find(|(_, t)| !t.is_finite() || **t < 0.0)
        {
            return Err(format!("area target for {area} must be >= 0, got {t}"));
        }
        if self.content_balancing {
            let sum: f64 = self.area_targets.values().sum();
            if (sum - 1.0).abs() > 0.01 {
                return Err(format!("area targets must sum to 1.0, got {sum:.3}"));
            }
        }
        Ok(())
    }
}

/// What the selector needs to know about the session.
#[derive(Debug, Clone, Copy)]
pub struct SessionView<'a> {
    pub theta: f64,
    /// Items already administered, in order.
    pub administered: &'a [ItemId],
}

/// Stateless item selector.
#[derive(Debug, Clone, Default)]
pub struct ItemSelector {
    config: SelectionConfig,
}

struct Candidate<'c> {
    item: &'c Item,
    information: f64,
    exposure: u64,
}

impl ItemSelector {
    pub fn new(config: SelectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    /// Choose the next item, or `None` when nothing can be served.
    pub fn select_next<'c>(
        &self,
        view: SessionView<'_>,
        catalog: &'c CatalogSnapshot,
        exposure: &ExposureController,
        ctx: &mut SessionContext,
    ) -> Option<&'c Item> {
        let administered: HashSet<&str> = view.administered.iter().map(String::as_str).collect();
        let over_target = self.over_target_areas(view.administered, catalog);

        let (mut preferred, mut deferred): (Vec<_>, Vec<_>) = catalog
            .items()
            .iter()
            .filter(|item| item.is_selectable())
            .filter(|item| !administered.contains(item.id.as_str()))
            .filter(|item| !ctx.is_withheld(&item.id))
            .map(|item| Candidate {
                item,
                information: irt::information(view.theta, &item.params()),
                exposure: item.exposure_count + exposure.served_count(&item.id),
            })
            .filter(|c| c.information.is_finite())
            .partition(|c| !over_target.contains(&c.item.content_area));

        if let Some(item) = self.draw(&mut preferred, exposure, ctx) {
            return Some(item);
        }
        if !deferred.is_empty() {
            tracing::debug!(
                remaining = deferred.len(),
                "content balance relaxed; only over-target areas remain"
            );
        }
        self.draw(&mut deferred, exposure, ctx)
    }

    fn draw<'c>(
        &self,
        pool: &mut Vec<Candidate<'c>>,
        exposure: &ExposureController,
        ctx: &mut SessionContext,
    ) -> Option<&'c Item> {
        if self.config.method == SelectionMethod::MaxInfo {
            pool.sort_by(rank);
        }

        while !pool.is_empty() {
            let window = match self.config.method {
                SelectionMethod::MaxInfo => self.config.top_k.max(1).min(pool.len()),
                SelectionMethod::Random => pool.len(),
            };
            let idx = ctx.rng_mut().random_range(0..window);
            let candidate = pool.remove(idx);
            if exposure.may_serve(&candidate.item.id, ctx) {
                tracing::debug!(
                    item = %candidate.item.id,
                    information = candidate.information,
                    "selected item"
                );
                return Some(candidate.item);
            }
        }
        None
    }

    /// Areas whose administered share exceeds target plus tolerance.
    fn over_target_areas(
        &self,
        administered: &[ItemId],
        catalog: &CatalogSnapshot,
    ) -> HashSet<ContentArea> {
        if !self.config.content_balancing || administered.is_empty() {
            return HashSet::new();
        }
        let total = administered.len() as f64;
        area_counts(administered, catalog)
            .into_iter()
            .filter(|(area, count)| {
                *count as f64 / total > self.config.target_for(*area) + self.config.balance_tolerance
            })
            .map(|(area, _)| area)
            .collect()
    }
}

/// Information descending, then exposure ascending, then id.
fn rank(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    b.information
        .total_cmp(&a.information)
        .then(a.exposure.cmp(&b.exposure))
        .then_with(|| a.item.id.cmp(&b.item.id))
}

/// Count administered items per content area.
pub fn area_counts(administered: &[ItemId], catalog: &CatalogSnapshot) -> HashMap<ContentArea, usize> {
    let mut counts = HashMap::new();
    for id in administered {
        if let Some(item) = catalog.get(id) {
            *counts.entry(item.content_area).or_insert(0) += 1;
        }
    }
    counts
}

/// Administered share per content area, every area present.
pub fn area_coverage(administered: &[ItemId], catalog: &CatalogSnapshot) -> HashMap<ContentArea, f64> {
    let counts = area_counts(administered, catalog);
    let total = administered.len();
    ContentArea::ALL
        .iter()
        .map(|area| {
            let share = if total == 0 {
                0.0
            } else {
                counts.get(area).copied().unwrap_or(0) as f64 / total as f64
            };
            (*area, share)
        })
        .collect()
}

/// Whether every area's share is within `tolerance` of its target.
pub fn is_balanced(
    administered: &[ItemId],
    catalog: &CatalogSnapshot,
    config: &SelectionConfig,
    tolerance: f64,
) -> bool {
    area_coverage(administered, catalog)
        .iter()
        .all(|(area, share)| (share - config.target_for(*area)).abs() <= tolerance)
}
