//! Calibration and session report types with JSON persistence and text
//! rendering.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{ContentArea, ItemId, SessionId};
use crate::scoring::ScoreResult;
use crate::session::{SessionStatus, TerminationReason};
use crate::statistics::ErrorStatistics;

/// Outcome of calibration for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Enough data and fit within bounds.
    Validated,
    /// Enough data and fit out of bounds; proposed for exclusion.
    Misfit,
    /// Fewer responses than the sample threshold.
    NeedsMoreData,
}

/// Per-item comparison of catalog and empirical parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemCalibration {
    pub item_id: ItemId,
    pub content_area: ContentArea,
    pub responses: usize,
    pub proportion_correct: Option<f64>,
    pub catalog_difficulty: f64,
    pub empirical_difficulty: Option<f64>,
    pub difficulty_error: Option<f64>,
    pub catalog_discrimination: f64,
    pub empirical_discrimination: Option<f64>,
    pub discrimination_error: Option<f64>,
    pub point_biserial: Option<f64>,
    /// Residual-based mean squares computed from this batch.
    pub empirical_infit: Option<f64>,
    pub empirical_outfit: Option<f64>,
    pub status: ItemStatus,
    /// Human-readable reasons behind a misfit status.
    #[serde(default)]
    pub fit_flags: Vec<String>,
}

/// A pass/fail threshold on an aggregate statistic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGate {
    pub name: String,
    /// e.g. `"< 0.30"`.
    pub requirement: String,
    pub value: Option<f64>,
    pub passed: bool,
}

/// Proposed catalog changes for a separate review step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeProposal {
    pub exclusions: Vec<ItemId>,
    pub parameter_updates: Vec<ParameterUpdate>,
}

impl ChangeProposal {
    pub fn is_empty(&self) -> bool {
        self.exclusions.is_empty() && self.parameter_updates.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterUpdate {
    pub item_id: ItemId,
    pub current_difficulty: f64,
    pub proposed_difficulty: f64,
    pub current_discrimination: f64,
    pub proposed_discrimination: f64,
}

/// Result of one calibration batch. Never applied to live items directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub catalog_items: usize,
    pub responses_analyzed: usize,
    /// Responses whose item was not in the catalog.
    #[serde(default)]
    pub responses_skipped: usize,
    pub items: Vec<ItemCalibration>,
    pub difficulty: ErrorStatistics,
    pub discrimination: ErrorStatistics,
    /// Items with enough data over all catalog items.
    pub coverage_rate: f64,
    pub gates: Vec<QualityGate>,
    pub proposal: ChangeProposal,
}

impl CalibrationReport {
    /// Save the report as JSON to a file.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize report")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        Ok(())
    }

    /// Load a report from a JSON file.
    pub fn load_json(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read report from {}", path.display()))?;
        serde_json::from_str(&content).context("failed to parse report JSON")
    }

    pub fn all_gates_passed(&self) -> bool {
        self.gates.iter().all(|g| g.passed)
    }

    pub fn count(&self, status: ItemStatus) -> usize {
        self.items.iter().filter(|i| i.status == status).count()
    }

    /// Plain-text summary with the largest difficulty errors and
    /// recommendations.
    pub fn render_text(&self, top_n: usize) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Calibration report {}", self.id);
        let _ = writeln!(out, "Generated: {}", self.created_at.to_rfc3339());
        let _ = writeln!(
            out,
            "Responses analyzed: {} ({} skipped)",
            self.responses_analyzed, self.responses_skipped
        );
        let _ = writeln!(
            out,
            "Items: {} validated, {} misfit, {} need more data (of {})",
            self.count(ItemStatus::Validated),
            self.count(ItemStatus::Misfit),
            self.count(ItemStatus::NeedsMoreData),
            self.catalog_items
        );
        let _ = writeln!(out, "Coverage: {:.1}%", self.coverage_rate * 100.0);
        out.push('\n');

        for (label, stats) in [
            ("Difficulty", &self.difficulty),
            ("Discrimination", &self.discrimination),
        ] {
            let _ = writeln!(
                out,
                "{label:<15} n={:<4} MAE={:.3} RMSE={:.3} r={} rho={}",
                stats.n,
                stats.mae,
                stats.rmse,
                fmt_opt(stats.pearson),
                fmt_opt(stats.spearman)
            );
        }
        out.push('\n');

        out.push_str("Quality gates:\n");
        for gate in &self.gates {
            let _ = writeln!(
                out,
                "  [{}] {} {} (observed {})",
                if gate.passed { "PASS" } else { "FAIL" },
                gate.name,
                gate.requirement,
                fmt_opt(gate.value)
            );
        }

        let mut worst: Vec<&ItemCalibration> = self
            .items
            .iter()
            .filter(|i| i.difficulty_error.is_some())
            .collect();
        worst.sort_by(|a, b| {
            let ea = a.difficulty_error.unwrap_or(0.0).abs();
            let eb = b.difficulty_error.unwrap_or(0.0).abs();
            eb.total_cmp(&ea).then_with(|| a.item_id.cmp(&b.item_id))
        });
        if !worst.is_empty() && top_n > 0 {
            let _ = writeln!(out, "\nLargest difficulty errors:");
            for item in worst.iter().take(top_n) {
                let _ = writeln!(
                    out,
                    "  {:<16} catalog b={:+.2} empirical b={} error={}",
                    item.item_id,
                    item.catalog_difficulty,
                    fmt_opt(item.empirical_difficulty),
                    fmt_opt(item.difficulty_error)
                );
            }
        }

        out.push_str("\nRecommendations:\n");
        let recommendations = self.recommendations();
        if recommendations.is_empty() {
            out.push_str("  none\n");
        }
        for line in recommendations {
            let _ = writeln!(out, "  - {line}");
        }
        out
    }

    fn recommendations(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if !self.proposal.exclusions.is_empty() {
            lines.push(format!(
                "Review {} misfitting item(s) for exclusion: {}",
                self.proposal.exclusions.len(),
                self.proposal.exclusions.join(", ")
            ));
        }
        if !self.proposal.parameter_updates.is_empty() {
            lines.push(format!(
                "Recalibrate {} item(s) whose parameters drifted",
                self.proposal.parameter_updates.len()
            ));
        }
        let waiting = self.count(ItemStatus::NeedsMoreData);
        if waiting > 0 {
            lines.push(format!(
                "Collect more responses for {waiting} item(s) below the sample threshold"
            ));
        }
        for gate in self.gates.iter().filter(|g| !g.passed) {
            lines.push(format!("Quality gate failed: {} {}", gate.name, gate.requirement));
        }
        lines
    }
}

/// How an examinee did within one content area.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AreaPerformance {
    pub correct: usize,
    pub total: usize,
    /// Percent of this area's items answered correctly.
    pub percentage: f64,
    /// Mean catalog difficulty of the items served from this area.
    pub average_difficulty: f64,
    /// This area's share of all administered items.
    pub share: f64,
}

/// Examinee-facing summary of one session, available in any state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub examinee_id: String,
    pub status: SessionStatus,
    pub termination: Option<TerminationReason>,
    pub items_administered: usize,
    pub correct_count: usize,
    pub theta: f64,
    pub standard_error: f64,
    pub precision_percent: f64,
    /// Chance that true ability clears the pass bar given the current estimate.
    pub pass_probability: f64,
    /// Present only once the session completed under a stop rule.
    pub score: Option<ScoreResult>,
    /// Every content area, including ones never served.
    pub areas: BTreeMap<ContentArea, AreaPerformance>,
}

impl SessionReport {
    pub fn percent_correct(&self) -> f64 {
        if self.items_administered == 0 {
            0.0
        } else {
            self.correct_count as f64 / self.items_administered as f64 * 100.0
        }
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Session report {}", self.session_id);
        let _ = writeln!(out, "Examinee: {}", self.examinee_id);
        let _ = writeln!(
            out,
            "Correct: {} / {} ({:.0}%)",
            self.correct_count,
            self.items_administered,
            self.percent_correct()
        );
        let _ = writeln!(
            out,
            "Theta: {:.3}  SE: {:.3}  Precision: {:.1}%",
            self.theta, self.standard_error, self.precision_percent
        );
        match &self.score {
            Some(score) => {
                let verdict = if score.passed { "pass" } else { "fail" };
                let _ = writeln!(out, "Score: {} ({verdict})", score.scaled_score);
            }
            None => {
                let _ = writeln!(out, "Score: n/a");
            }
        }
        let reason = self
            .termination
            .map(|r| r.to_string())
            .unwrap_or_else(|| "in progress".into());
        let _ = writeln!(out, "Stopped: {reason}");

        out.push_str("
Areas:
");
        for (area, perf) in &self.areas {
            let _ = writeln!(
                out,
                "  {:<24} {:>2}/{:<2} {:>5.1}% correct  share {:>5.1}%  mean b={:+.2}",
                area.as_str(),
                perf.correct,
                perf.total,
                perf.percentage,
                perf.share * 100.0,
                perf.average_difficulty
            );
        }
        out
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.3}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_report() -> CalibrationReport {
        let item = |id: &str, status, err: Option<f64>| ItemCalibration {
            item_id: id.into(),
            content_area: ContentArea::Cirurgia,
            responses: 40,
            proportion_correct: Some(0.6),
            catalog_difficulty: 0.0,
            empirical_difficulty: err,
            difficulty_error: err,
            catalog_discrimination: 1.0,
            empirical_discrimination: Some(1.0),
            discrimination_error: Some(0.0),
            point_biserial: Some(0.3),
            empirical_infit: Some(1.0),
            empirical_outfit: Some(1.0),
            status,
            fit_flags: Vec::new(),
        };
        CalibrationReport {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            catalog_items: 3,
            responses_analyzed: 80,
            responses_skipped: 0,
            items: vec![
                item("small", ItemStatus::Validated, Some(0.1)),
                item("large", ItemStatus::Misfit, Some(-0.9)),
                item("new", ItemStatus::NeedsMoreData, None),
            ],
            difficulty: ErrorStatistics::from_pairs(&[0.0, 0.0], &[0.1, -0.9]),
            discrimination: ErrorStatistics::from_pairs(&[1.0, 1.0], &[1.0, 1.0]),
            coverage_rate: 2.0 / 3.0,
            gates: vec![QualityGate {
                name: "difficulty_mae".into(),
                requirement: "< 0.30".into(),
                value: Some(0.5),
                passed: false,
            }],
            proposal: ChangeProposal {
                exclusions: vec!["large".into()],
                parameter_updates: Vec::new(),
            },
        }
    }

    #[test]
    fn json_roundtrip() {
        let report = make_report();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("report.json");
        report.save_json(&path).unwrap();
        let loaded = CalibrationReport::load_json(&path).unwrap();
        assert_eq!(loaded.id, report.id);
        assert_eq!(loaded.items.len(), 3);
        assert_eq!(loaded.items[1].status, ItemStatus::Misfit);
        assert_eq!(loaded.proposal, report.proposal);
        assert!((loaded.coverage_rate - report.coverage_rate).abs() < 1e-12);
    }

    #[test]
    fn text_lists_worst_items_first() {
        let text = make_report().render_text(5);
        let large = text.find("large").unwrap();
        let small = text.rfind("small").unwrap();
        assert!(large < small);
        assert!(text.contains("[FAIL] difficulty_mae"));
        assert!(text.contains("1 misfit"));
        assert!(text.contains("Collect more responses for 1 item(s)"));
    }

    #[test]
    fn gate_summary() {
        let mut report = make_report();
        assert!(!report.all_gates_passed());
        report.gates[0].passed = true;
        assert!(report.all_gates_passed());
    }

    #[test]
    fn session_report_text_and_json() {
        let mut areas: BTreeMap<ContentArea, AreaPerformance> = ContentArea::ALL
            .iter()
            .map(|a| (*a, AreaPerformance::default()))
            .collect();
        areas.insert(
            ContentArea::Pediatria,
            AreaPerformance {
                correct: 3,
                total: 4,
                percentage: 75.0,
                average_difficulty: 0.25,
                share: 1.0,
            },
        );
        let report = SessionReport {
            session_id: Uuid::new_v4(),
            examinee_id: "ana".into(),
            status: SessionStatus::Active,
            termination: None,
            items_administered: 4,
            correct_count: 3,
            theta: 0.4,
            standard_error: 0.5,
            precision_percent: 0.0,
            pass_probability: 0.12,
            score: None,
            areas,
        };
        assert_eq!(report.percent_correct(), 75.0);

        let text = report.render_text();
        assert!(text.contains("Correct: 3 / 4 (75%)"));
        assert!(text.contains("Score: n/a"));
        assert!(text.contains("Stopped: in progress"));
        assert!(text.contains("pediatria"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["areas"]["pediatria"]["correct"], 3);
        let back: SessionReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }
}
