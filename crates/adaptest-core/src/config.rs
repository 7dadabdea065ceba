//! Exam-level configuration: stop rules plus the estimator, selector, and
//! scoring settings a session runs under.

use serde::{Deserialize, Serialize};

use crate::estimator::EstimatorConfig;
use crate::scoring::ScoringConfig;
use crate::selector::SelectionConfig;

/// Settings shared by every session of one exam.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamConfig {
    /// Items required before the SE stop rule may fire.
    #[serde(default = "default_min_items")]
    pub min_items: usize,
    /// Hard cap on test length.
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    /// Stop once the standard error is at or below this.
    #[serde(default = "default_se_target")]
    pub se_target: f64,
    /// Sessions idle longer than this are abandoned.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default)]
    pub estimator: EstimatorConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
}

fn default_min_items() -> usize {
    10
}

fn default_max_items() -> usize {
    30
}

fn default_se_target() -> f64 {
    0.30
}

fn default_idle_timeout_secs() -> u64 {
    30 * 60
}

impl Default for ExamConfig {
    fn default() -> Self {
        Self {
            min_items: default_min_items(),
            max_items: default_max_items(),
            se_target: default_se_target(),
            idle_timeout_secs: default_idle_timeout_secs(),
            estimator: EstimatorConfig::default(),
            selection: SelectionConfig::default(),
            scoring: ScoringConfig::default(),
        }
    }
}

impl ExamConfig {
    pub fn idle_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_timeout_secs.min(i64::MAX as u64) as i64)
    }

    /// Reject settings no session could run under.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_items == 0 {
            return Err("max_items must be at least 1".into());
        }
        if self.min_items > self.max_items {
            return Err(format!(
                "min_items ({}) exceeds max_items ({})",
                self.min_items, self.max_items
            ));
        }
        if !(self.se_target.is_finite() && self.se_target > 0.0) {
            return Err(format!("se_target must be > 0, got {}", self.se_target));
        }
        let est = &self.estimator;
        if est.max_iterations == 0 {
            return Err("estimator.max_iterations must be at least 1".into());
        }
        if est.quadrature_points < 2 || est.quadrature_min >= est.quadrature_max {
            return Err("estimator quadrature grid needs >= 2 points on a non-empty range".into());
        }
        self.selection.validate()?;
        self.scoring.validate()?;
        Ok(())
    }
}
