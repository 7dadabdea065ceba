//! Scaled-score conversion and pass/fail decisions.
//!
//! `scaled = round(clamp(center + slope * theta, min, max))`. Scoring never
//! re-estimates ability; it only transforms a terminal estimate.

use serde::{Deserialize, Serialize};

use crate::irt;

/// Scale constants. Defaults put theta 0 at 500 on a 0-1000 scale with a
/// pass bar of 600.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_center")]
    pub center: f64,
    #[serde(default = "default_slope")]
    pub slope: f64,
    #[serde(default = "default_min")]
    pub min_score: f64,
    #[serde(default = "default_max")]
    pub max_score: f64,
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: f64,
}

fn default_center() -> f64 {
    500.0
}
fn default_slope() -> f64 {
    100.0
}
fn default_min() -> f64 {
    0.0
}
fn default_max() -> f64 {
    1000.0
}
fn default_pass_threshold() -> f64 {
    600.0
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            center: default_center(),
            slope: default_slope(),
            min_score: default_min(),
            max_score: default_max(),
            pass_threshold: default_pass_threshold(),
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.slope.is_finite() && self.slope > 0.0) {
            return Err(format!("scoring.slope must be > 0, got {}", self.slope));
        }
        if self.min_score >= self.max_score {
            return Err(format!(
                "scoring.min_score ({}) must be below max_score ({})",
                self.min_score, self.max_score
            ));
        }
        if !(self.min_score..=self.max_score).contains(&self.pass_threshold) {
            return Err(format!(
                "scoring.pass_threshold {} outside [{}, {}]",
                self.pass_threshold, self.min_score, self.max_score
            ));
        }
        Ok(())
    }
}

/// A reportable result for a completed session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub scaled_score: u32,
    pub passed: bool,
    pub theta: f64,
    pub standard_error: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    config: ScoringConfig,
}

impl ScoringEngine {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn scaled(&self, theta: f64) -> u32 {
        let raw = self.config.center + self.config.slope * theta;
        let clamped = if raw.is_nan() {
            self.config.center
        } else {
            raw.clamp(self.config.min_score, self.config.max_score)
        };
        clamped.round().max(0.0) as u32
    }

    pub fn score(&self, theta: f64, standard_error: f64) -> ScoreResult {
        let scaled_score = self.scaled(theta);
        ScoreResult {
            scaled_score,
            passed: scaled_score as f64 >= self.config.pass_threshold,
            theta,
            standard_error,
        }
    }

    /// Inverse transform: the theta that maps onto `score` before rounding.
    pub fn theta_for_score(&self, score: f64) -> f64 {
        (score - self.config.center) / self.config.slope
    }

    /// Probability that true ability is at or above the pass bar, treating the
    /// estimate as normal with the given standard error.
    pub fn pass_probability(&self, theta: f64, standard_error: f64) -> f64 {
        let cut = self.theta_for_score(self.config.pass_threshold);
        if !(standard_error > 0.0) {
            return if theta >= cut { 1.0 } else { 0.0 };
        }
        irt::normal_cdf((theta - cut) / standard_error)
    }
}

/// Measurement precision as a percentage: 100 at zero standard error,
/// three points lower per 0.01 of error, never below 0.
pub fn precision_percent(standard_error: f64) -> f64 {
    if !standard_error.is_finite() {
        return 0.0;
    }
    (100.0 - standard_error * 300.0).clamp(0.0, 100.0)
}
