//! Core data model types for adaptest.
//!
//! These are the types shared by every component: calibrated items and their
//! 3PL parameters, the fixed exam content areas, immutable response records,
//! and the versioned catalog snapshot the engine selects from.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller-provided item identifier.
pub type ItemId = String;

/// Engine-assigned session identifier.
pub type SessionId = Uuid;

/// Lower bound of the acceptable infit/outfit mean-square range.
pub const FIT_LOWER: f64 = 0.7;
/// Upper bound of the acceptable infit/outfit mean-square range.
pub const FIT_UPPER: f64 = 1.3;

/// Upper bound (exclusive) for the guessing parameter.
pub const MAX_GUESSING: f64 = 0.5;

/// The five fixed exam domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentArea {
    ClinicaMedica,
    Cirurgia,
    GinecologiaObstetricia,
    Pediatria,
    SaudeColetiva,
}

impl ContentArea {
    /// All areas in canonical order.
    pub const ALL: [ContentArea; 5] = [
        ContentArea::ClinicaMedica,
        ContentArea::Cirurgia,
        ContentArea::GinecologiaObstetricia,
        ContentArea::Pediatria,
        ContentArea::SaudeColetiva,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentArea::ClinicaMedica => "clinica_medica",
            ContentArea::Cirurgia => "cirurgia",
            ContentArea::GinecologiaObstetricia => "ginecologia_obstetricia",
            ContentArea::Pediatria => "pediatria",
            ContentArea::SaudeColetiva => "saude_coletiva",
        }
    }
}

impl fmt::Display for ContentArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentArea {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "clinica_medica" | "internal_medicine" => Ok(ContentArea::ClinicaMedica),
            "cirurgia" | "surgery" => Ok(ContentArea::Cirurgia),
            "ginecologia_obstetricia" | "go" | "obgyn" | "ob_gyn" => {
                Ok(ContentArea::GinecologiaObstetricia)
            }
            "pediatria" | "pediatrics" => Ok(ContentArea::Pediatria),
            "saude_coletiva" | "public_health" => Ok(ContentArea::SaudeColetiva),
            other => Err(format!("unknown content area: {other}")),
        }
    }
}

/// The 3PL parameter triple of one item.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ItemParameters {
    /// Discrimination `a` (> 0).
    pub discrimination: f64,
    /// Difficulty `b`.
    pub difficulty: f64,
    /// Pseudo-guessing lower asymptote `c` in `[0, 0.5)`.
    pub guessing: f64,
}

impl ItemParameters {
    pub fn new(discrimination: f64, difficulty: f64, guessing: f64) -> Self {
        Self {
            discrimination,
            difficulty,
            guessing,
        }
    }

    /// Check the parameter invariants, describing the first violation.
    pub fn check(&self) -> Result<(), String> {
        if !self.discrimination.is_finite() || self.discrimination <= 0.0 {
            return Err(format!(
                "discrimination must be finite and > 0, got {}",
                self.discrimination
            ));
        }
        if !self.difficulty.is_finite() {
            return Err(format!("difficulty must be finite, got {}", self.difficulty));
        }
        if !self.guessing.is_finite() || !(0.0..MAX_GUESSING).contains(&self.guessing) {
            return Err(format!(
                "guessing must be in [0, {MAX_GUESSING}), got {}",
                self.guessing
            ));
        }
        Ok(())
    }
}

/// A calibrated item in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Unique item identifier.
    pub id: ItemId,
    /// Exam domain the item belongs to.
    pub content_area: ContentArea,
    /// Difficulty `b`, typically in `[-3, 3]`.
    pub difficulty: f64,
    /// Discrimination `a`, typically in `[0.3, 2.5]`.
    pub discrimination: f64,
    /// Guessing `c`, about 0.2–0.25 for 4–5 option items.
    #[serde(default = "default_guessing")]
    pub guessing: f64,
    /// Inactive items are never selected.
    #[serde(default = "default_true")]
    pub active: bool,
    /// Exposure count as of the snapshot.
    #[serde(default)]
    pub exposure_count: u64,
    /// Information-weighted mean-square fit from the last calibration.
    #[serde(default)]
    pub infit: Option<f64>,
    /// Unweighted mean-square fit from the last calibration.
    #[serde(default)]
    pub outfit: Option<f64>,
}

fn default_guessing() -> f64 {
    0.2
}

fn default_true() -> bool {
    true
}

impl Item {
    pub fn params(&self) -> ItemParameters {
        ItemParameters::new(self.discrimination, self.difficulty, self.guessing)
    }

    /// True when either fit statistic lies outside `[0.7, 1.3]`.
    pub fn is_misfit(&self) -> bool {
        self.infit.is_some_and(|v| !fit_in_bounds(v))
            || self.outfit.is_some_and(|v| !fit_in_bounds(v))
    }

    /// Active and not pending misfit review.
    pub fn is_selectable(&self) -> bool {
        self.active && !self.is_misfit()
    }
}

/// Whether a mean-square fit statistic is within the acceptable range.
pub fn fit_in_bounds(value: f64) -> bool {
    (FIT_LOWER..=FIT_UPPER).contains(&value)
}

/// One examinee response. Immutable once written to the response log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub session_id: SessionId,
    pub item_id: ItemId,
    pub is_correct: bool,
    pub response_time_ms: u64,
    /// Ability estimate in effect when the item was answered.
    pub theta_at_response: f64,
    pub recorded_at: DateTime<Utc>,
}

/// A versioned, read-mostly view of the item catalog.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    /// Catalog identifier.
    pub id: String,
    /// Version tag of the catalog content.
    pub version: String,
    /// When this snapshot was materialized.
    pub loaded_at: DateTime<Utc>,
    items: Vec<Item>,
    index: HashMap<ItemId, usize>,
}

impl CatalogSnapshot {
    /// Build a snapshot. Items with invalid parameters and later duplicates
    /// of an id are dropped.
    pub fn new(id: impl Into<String>, version: impl Into<String>, items: Vec<Item>) -> Self {
        let mut index = HashMap::with_capacity(items.len());
        let mut unique = Vec::with_capacity(items.len());
        for item in items {
            if let Err(e) = item.params().check() {
                tracing::warn!("dropping item '{}': {}", item.id, e);
                continue;
            }
            if index.contains_key(&item.id) {
                tracing::warn!("dropping duplicate catalog item '{}'", item.id);
                continue;
            }
            index.insert(item.id.clone(), unique.len());
            unique.push(item);
        }
        Self {
            id: id.into(),
            version: version.into(),
            loaded_at: Utc::now(),
            items: unique,
            index,
        }
    }

    pub fn with_loaded_at(mut self, loaded_at: DateTime<Utc>) -> Self {
        self.loaded_at = loaded_at;
        self
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn get(&self, id: &str) -> Option<&Item> {
        self.index.get(id).map(|&idx| &self.items[idx])
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of items eligible for selection at all.
    pub fn selectable_count(&self) -> usize {
        self.items.iter().filter(|i| i.is_selectable()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str) -> Item {
        Item {
            id: id.into(),
            content_area: ContentArea::Pediatria,
            difficulty: 0.0,
            discrimination: 1.0,
            guessing: 0.2,
            active: true,
            exposure_count: 0,
            infit: None,
            outfit: None,
        }
    }

    #[test]
    fn content_area_display_and_parse() {
        assert_eq!(ContentArea::SaudeColetiva.to_string(), "saude_coletiva");
        assert_eq!("cirurgia".parse::<ContentArea>().unwrap(), ContentArea::Cirurgia);
        assert_eq!(
            "GO".parse::<ContentArea>().unwrap(),
            ContentArea::GinecologiaObstetricia
        );
        assert_eq!(
            "clinica-medica".parse::<ContentArea>().unwrap(),
            ContentArea::ClinicaMedica
        );
        assert!("cardiology".parse::<ContentArea>().is_err());
    }

    #[test]
    fn parameter_invariants() {
        assert!(ItemParameters::new(1.2, 0.0, 0.2).check().is_ok());
        assert!(ItemParameters::new(0.0, 0.0, 0.2).check().is_err());
        assert!(ItemParameters::new(1.0, 0.0, 0.5).check().is_err());
        assert!(ItemParameters::new(1.0, f64::NAN, 0.2).check().is_err());
        assert!(ItemParameters::new(1.0, 0.0, -0.1).check().is_err());
    }

    #[test]
    fn misfit_items_are_not_selectable() {
        let mut it = item("q1");
        assert!(it.is_selectable());
        it.infit = Some(1.1);
        it.outfit = Some(1.31);
        assert!(it.is_misfit());
        assert!(!it.is_selectable());

        let mut inactive = item("q2");
        inactive.active = false;
        assert!(!inactive.is_misfit());
        assert!(!inactive.is_selectable());
    }

    #[test]
    fn fit_bounds_are_inclusive() {
        assert!(fit_in_bounds(0.7));
        assert!(fit_in_bounds(1.3));
        assert!(!fit_in_bounds(0.69));
    }

    #[test]
    fn snapshot_indexes_and_dedupes() {
        let snapshot = CatalogSnapshot::new("bank", "v1", vec![item("a"), item("b"), item("a")]);
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.get("b").is_some());
        assert!(snapshot.get("zzz").is_none());
        assert_eq!(snapshot.selectable_count(), 2);
    }

    #[test]
    fn snapshot_drops_invalid_parameters() {
        let mut nan_b = item("nan_b");
        nan_b.difficulty = f64::NAN;
        let mut neg_a = item("neg_a");
        neg_a.discrimination = -1.5;
        let mut high_c = item("high_c");
        high_c.guessing = 0.5;
        let snapshot = CatalogSnapshot::new("bank", "v1", vec![nan_b, item("ok"), neg_a, high_c]);
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get("ok").is_some());
        assert!(snapshot.get("nan_b").is_none());
        assert!(snapshot.get("neg_a").is_none());
    }

    #[test]
    fn item_serde_defaults() {
        let json = r#"{"id":"q9","content_area":"pediatria","difficulty":0.5,"discrimination":1.1}"#;
        let it: Item = serde_json::from_str(json).unwrap();
        assert!(it.active);
        assert_eq!(it.guessing, 0.2);
        assert_eq!(it.exposure_count, 0);
        assert!(it.infit.is_none());
    }
}
