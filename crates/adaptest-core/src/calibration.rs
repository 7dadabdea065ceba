//! Offline calibration monitoring.
//!
//! Compares each item's catalog parameters against what a batch of logged
//! responses says about it. Difficulty is recovered from the
//! guessing-corrected proportion correct; discrimination from the
//! point-biserial correlation between the item score and the examinee's
//! session total. Fit is checked both against the catalog's stored infit and
//! outfit and against residual mean squares computed from the batch.
//!
//! The monitor only reads. Its [`ChangeProposal`] is for a separate review
//! step.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::irt;
use crate::model::{fit_in_bounds, Item, ItemId, Response, SessionId, FIT_LOWER, FIT_UPPER};
use crate::report::{
    CalibrationReport, ChangeProposal, ItemCalibration, ItemStatus, ParameterUpdate, QualityGate,
};
use crate::statistics::{self, ErrorStatistics};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Responses an item needs before it is evaluated.
    #[serde(default = "default_min_sample_size")]
    pub min_sample_size: usize,
    /// Multiplier turning `|r_pb|` into a discrimination estimate.
    #[serde(default = "default_discrimination_scale")]
    pub discrimination_scale: f64,
    /// Below this `|r_pb|` the discrimination estimate defaults to 1.0.
    #[serde(default = "default_min_point_biserial")]
    pub min_point_biserial: f64,
    #[serde(default = "default_max_difficulty_mae")]
    pub max_difficulty_mae: f64,
    #[serde(default = "default_min_difficulty_correlation")]
    pub min_difficulty_correlation: f64,
    #[serde(default = "default_min_discrimination_correlation")]
    pub min_discrimination_correlation: f64,
    /// Absolute parameter error above which an update is proposed.
    #[serde(default = "default_update_threshold")]
    pub update_threshold: f64,
}

fn default_min_sample_size() -> usize {
    30
}
fn default_discrimination_scale() -> f64 {
    3.0
}
fn default_min_point_biserial() -> f64 {
    0.05
}
fn default_max_difficulty_mae() -> f64 {
    0.3
}
fn default_min_difficulty_correlation() -> f64 {
    0.7
}
fn default_min_discrimination_correlation() -> f64 {
    0.6
}
fn default_update_threshold() -> f64 {
    0.3
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_sample_size: default_min_sample_size(),
            discrimination_scale: default_discrimination_scale(),
            min_point_biserial: default_min_point_biserial(),
            max_difficulty_mae: default_max_difficulty_mae(),
            min_difficulty_correlation: default_min_difficulty_correlation(),
            min_discrimination_correlation: default_min_discrimination_correlation(),
            update_threshold: default_update_threshold(),
        }
    }
}

const MIN_DISCRIMINATION: f64 = 0.3;
const MAX_DISCRIMINATION: f64 = 2.5;

#[derive(Debug, Clone, Default)]
pub struct CalibrationMonitor {
    config: CalibrationConfig,
}

impl CalibrationMonitor {
    pub fn new(config: CalibrationConfig) -> Self {
        Self { config }
    }

    /// Validate catalog parameters against a batch of responses.
    pub fn validate(&self, items: &[Item], responses: &[Response]) -> CalibrationReport {
        let known: HashMap<&str, &Item> = items.iter().map(|i| (i.id.as_str(), i)).collect();

        let mut session_totals: HashMap<SessionId, f64> = HashMap::new();
        let mut by_item: HashMap<&str, Vec<&Response>> = HashMap::new();
        let mut skipped = 0usize;
        for response in responses {
            if !known.contains_key(response.item_id.as_str()) {
                skipped += 1;
                continue;
            }
            let total = session_totals.entry(response.session_id).or_insert(0.0);
            if response.is_correct {
                *total += 1.0;
            }
            by_item
                .entry(response.item_id.as_str())
                .or_default()
                .push(response);
        }
        if skipped > 0 {
            tracing::warn!(skipped, "responses reference items missing from the catalog");
        }

        let results: Vec<ItemCalibration> = items
            .iter()
            .map(|item| {
                let rows = by_item.get(item.id.as_str()).map(Vec::as_slice).unwrap_or(&[]);
                self.calibrate_item(item, rows, &session_totals)
            })
            .collect();

        let sufficient: Vec<&ItemCalibration> = results
            .iter()
            .filter(|r| r.status != ItemStatus::NeedsMoreData)
            .collect();
        let difficulty = ErrorStatistics::from_pairs(
            &sufficient.iter().map(|r| r.catalog_difficulty).collect::<Vec<_>>(),
            &sufficient
                .iter()
                .filter_map(|r| r.empirical_difficulty)
                .collect::<Vec<_>>(),
        );
        let discrimination = ErrorStatistics::from_pairs(
            &sufficient
                .iter()
                .map(|r| r.catalog_discrimination)
                .collect::<Vec<_>>(),
            &sufficient
                .iter()
                .filter_map(|r| r.empirical_discrimination)
                .collect::<Vec<_>>(),
        );

        let coverage_rate = if items.is_empty() {
            0.0
        } else {
            sufficient.len() as f64 / items.len() as f64
        };
        let gates = self.quality_gates(&difficulty, &discrimination);
        let proposal = self.proposal(&results);

        let report = CalibrationReport {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            catalog_items: items.len(),
            responses_analyzed: responses.len() - skipped,
            responses_skipped: skipped,
            items: results,
            difficulty,
            discrimination,
            coverage_rate,
            gates,
            proposal,
        };

        tracing::info!(
            items = report.catalog_items,
            responses = report.responses_analyzed,
            coverage = report.coverage_rate,
            misfit = report.count(ItemStatus::Misfit),
            gates_passed = report.all_gates_passed(),
            "calibration batch complete"
        );
        report
    }

    fn calibrate_item(
        &self,
        item: &Item,
        rows: &[&Response],
        session_totals: &HashMap<SessionId, f64>,
    ) -> ItemCalibration {
        let n = rows.len();
        let mut result = ItemCalibration {
            item_id: item.id.clone(),
            content_area: item.content_area,
            responses: n,
            proportion_correct: None,
            catalog_difficulty: item.difficulty,
            empirical_difficulty: None,
            difficulty_error: None,
            catalog_discrimination: item.discrimination,
            empirical_discrimination: None,
            discrimination_error: None,
            point_biserial: None,
            empirical_infit: None,
            empirical_outfit: None,
            status: ItemStatus::NeedsMoreData,
            fit_flags: Vec::new(),
        };
        if n < self.config.min_sample_size || n == 0 {
            return result;
        }

        let correct = rows.iter().filter(|r| r.is_correct).count();
        let p = correct as f64 / n as f64;
        let thetas: Vec<f64> = rows.iter().map(|r| r.theta_at_response).collect();

        let b_emp = empirical_difficulty(p, statistics::mean(&thetas), item);
        let scores: Vec<bool> = rows.iter().map(|r| r.is_correct).collect();
        let totals: Vec<f64> = rows
            .iter()
            .map(|r| session_totals.get(&r.session_id).copied().unwrap_or(0.0))
            .collect();
        let r_pb = statistics::point_biserial(&scores, &totals);
        let a_emp = match r_pb {
            Some(r) if r.abs() >= self.config.min_point_biserial => {
                (r.abs() * self.config.discrimination_scale).clamp(MIN_DISCRIMINATION, MAX_DISCRIMINATION)
            }
            _ => 1.0,
        };
        let (infit, outfit) = residual_fit(item, rows);

        result.proportion_correct = Some(p);
        result.empirical_difficulty = Some(b_emp);
        result.difficulty_error = Some(b_emp - item.difficulty);
        result.point_biserial = r_pb;
        result.empirical_discrimination = Some(a_emp);
        result.discrimination_error = Some(a_emp - item.discrimination);
        result.empirical_infit = infit;
        result.empirical_outfit = outfit;

        let flags = fit_flags(item, infit, outfit);
        result.status = if flags.is_empty() {
            ItemStatus::Validated
        } else {
            tracing::warn!(item = %item.id, "misfit: {}", flags.join("; "));
            ItemStatus::Misfit
        };
        result.fit_flags = flags;
        result
    }

    fn quality_gates(
        &self,
        difficulty: &ErrorStatistics,
        discrimination: &ErrorStatistics,
    ) -> Vec<QualityGate> {
        let mae = (difficulty.n > 0).then_some(difficulty.mae);
        vec![
            QualityGate {
                name: "difficulty_mae".into(),
                requirement: format!("< {:.2}", self.config.max_difficulty_mae),
                value: mae,
                passed: mae.is_some_and(|v| v < self.config.max_difficulty_mae),
            },
            QualityGate {
                name: "difficulty_correlation".into(),
                requirement: format!("> {:.2}", self.config.min_difficulty_correlation),
                value: difficulty.pearson,
                passed: difficulty
                    .pearson
                    .is_some_and(|r| r > self.config.min_difficulty_correlation),
            },
            QualityGate {
                name: "discrimination_correlation".into(),
                requirement: format!("> {:.2}", self.config.min_discrimination_correlation),
                value: discrimination.pearson,
                passed: discrimination
                    .pearson
                    .is_some_and(|r| r > self.config.min_discrimination_correlation),
            },
        ]
    }

    fn proposal(&self, results: &[ItemCalibration]) -> ChangeProposal {
        let mut proposal = ChangeProposal::default();
        for r in results {
            match r.status {
                ItemStatus::Misfit => proposal.exclusions.push(r.item_id.clone()),
                ItemStatus::Validated => {
                    let drifted = [r.difficulty_error, r.discrimination_error]
                        .iter()
                        .flatten()
                        .any(|e| e.abs() > self.config.update_threshold);
                    if drifted {
                        proposal.parameter_updates.push(ParameterUpdate {
                            item_id: r.item_id.clone(),
                            current_difficulty: r.catalog_difficulty,
                            proposed_difficulty: r.empirical_difficulty.unwrap_or(r.catalog_difficulty),
                            current_discrimination: r.catalog_discrimination,
                            proposed_discrimination: r
                                .empirical_discrimination
                                .unwrap_or(r.catalog_discrimination),
                        });
                    }
                }
                ItemStatus::NeedsMoreData => {}
            }
        }
        proposal
    }
}

/// Difficulty implied by proportion correct `p` among examinees whose mean
/// ability was `mean_theta`, inverting the 3PL at the catalog `a` and `c`.
pub fn empirical_difficulty(p: f64, mean_theta: f64, item: &Item) -> f64 {
    let c = item.guessing;
    let corrected = ((p - c) / (1.0 - c)).clamp(0.01, 0.99);
    mean_theta - irt::logit(corrected) / item.discrimination
}

/// Information-weighted (infit) and unweighted (outfit) mean-square residuals
/// at the logged ability estimates.
pub fn residual_fit(item: &Item, rows: &[&Response]) -> (Option<f64>, Option<f64>) {
    let params = item.params();
    let mut squared = 0.0;
    let mut variance = 0.0;
    let mut standardized = 0.0;
    let mut n = 0usize;
    for row in rows {
        let p = irt::probability(row.theta_at_response, &params)
            .clamp(irt::PROB_EPSILON, 1.0 - irt::PROB_EPSILON);
        let x = if row.is_correct { 1.0 } else { 0.0 };
        let w = p * (1.0 - p);
        squared += (x - p).powi(2);
        variance += w;
        standardized += (x - p).powi(2) / w;
        n += 1;
    }
    if n == 0 {
        return (None, None);
    }
    let infit = (variance > 0.0).then(|| squared / variance);
    (infit, Some(standardized / n as f64))
}

fn fit_flags(item: &Item, infit: Option<f64>, outfit: Option<f64>) -> Vec<String> {
    let mut flags = Vec::new();
    let mut check = |label: &str, value: Option<f64>| {
        if let Some(v) = value.filter(|v| !fit_in_bounds(*v)) {
            flags.push(format!("{label} {v:.2} outside [{FIT_LOWER}, {FIT_UPPER}]"));
        }
    };
    check("catalog infit", item.infit);
    check("catalog outfit", item.outfit);
    check("empirical infit", infit);
    check("empirical outfit", outfit);
    flags
}

/// Items grouped by id for quick lookup in reports.
pub fn index_results(report: &CalibrationReport) -> HashMap<&ItemId, &ItemCalibration> {
    report.items.iter().map(|r| (&r.item_id, r)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContentArea;
    use chrono::Utc;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    fn item(id: &str, a: f64, b: f64) -> Item {
        Item {
            id: id.into(),
            content_area: ContentArea::ClinicaMedica,
            difficulty: b,
            discrimination: a,
            guessing: 0.2,
            active: true,
            exposure_count: 0,
            infit: None,
            outfit: None,
        }
    }

    /// Simulate `examinees` answering every item under the 3PL at their true
    /// ability, logging that ability as `theta_at_response`.
    fn simulate(items: &[Item], examinees: usize, seed: u64) -> Vec<Response> {
        let mut rng = Pcg64::seed_from_u64(seed);
        let mut out = Vec::new();
        for _ in 0..examinees {
            let session = Uuid::new_v4();
            let theta: f64 = rng.random_range(-2.0..2.0);
            for it in items {
                let p = irt::probability(theta, &it.params());
                out.push(Response {
                    session_id: session,
                    item_id: it.id.clone(),
                    is_correct: rng.random::<f64>() < p,
                    response_time_ms: 30_000,
                    theta_at_response: theta,
                    recorded_at: Utc::now(),
                });
            }
        }
        out
    }

    #[test]
    fn items_below_threshold_need_more_data() {
        let items = vec![item("q1", 1.0, 0.0)];
        let responses = simulate(&items, 10, 1);
        let report = CalibrationMonitor::default().validate(&items, &responses);
        assert_eq!(report.items[0].status, ItemStatus::NeedsMoreData);
        assert_eq!(report.coverage_rate, 0.0);
        assert!(report.proposal.exclusions.is_empty());
        assert!(!report.all_gates_passed());
    }

    #[test]
    fn well_calibrated_bank_recovers_difficulty_ordering() {
        let items: Vec<Item> = (0..10)
            .map(|i| item(&format!("q{i}"), 1.2, -1.5 + 0.3 * i as f64))
            .collect();
        let responses = simulate(&items, 400, 7);
        let report = CalibrationMonitor::default().validate(&items, &responses);

        assert_eq!(report.coverage_rate, 1.0);
        assert_eq!(report.responses_analyzed, 4000);
        let r = report.difficulty.pearson.unwrap();
        assert!(r > 0.9, "difficulty correlation {r}");
        assert!(report.gates[1].passed);
    }

    #[test]
    fn misfit_catalog_values_are_flagged_for_exclusion() {
        let mut bad = item("bad", 1.0, 0.0);
        bad.outfit = Some(1.6);
        let items = vec![bad, item("good", 1.0, 0.0)];
        let responses = simulate(&items, 60, 3);
        let report = CalibrationMonitor::default().validate(&items, &responses);

        let by_id = index_results(&report);
        assert_eq!(by_id[&"bad".to_string()].status, ItemStatus::Misfit);
        assert!(report.proposal.exclusions.contains(&"bad".to_string()));
        assert!(by_id[&"bad".to_string()]
            .fit_flags
            .iter()
            .any(|f| f.contains("catalog outfit")));
    }

    #[test]
    fn misfit_catalog_values_without_data_need_more_data() {
        let mut bad = item("bad", 1.0, 0.0);
        bad.infit = Some(2.0);
        let report = CalibrationMonitor::default().validate(&[bad], &[]);
        assert_eq!(report.items[0].status, ItemStatus::NeedsMoreData);
    }

    /// `n` responses to `item_id`, the first `correct` of them right, each
    /// from its own session at ability `theta`.
    fn fixed_responses(item_id: &str, n: usize, correct: usize, theta: f64) -> Vec<Response> {
        (0..n)
            .map(|i| Response {
                session_id: Uuid::new_v4(),
                item_id: item_id.into(),
                is_correct: i < correct,
                response_time_ms: 20_000,
                theta_at_response: theta,
                recorded_at: Utc::now(),
            })
            .collect()
    }

    #[test]
    fn batch_statistics_match_hand_computed_values() {
        let items: Vec<Item> = [("easy", -1.0), ("mid", 0.2), ("hard", 1.5), ("sparse", 0.0)]
            .into_iter()
            .map(|(id, b)| Item {
                guessing: 0.0,
                ..item(id, 1.0, b)
            })
            .collect();
        // With a = 1 and c = 0, empirical b = mean theta - logit(p).
        let mut responses = fixed_responses("easy", 4, 3, 0.0); // b = -ln 3
        responses.extend(fixed_responses("mid", 4, 2, 0.0)); // b = 0
        responses.extend(fixed_responses("hard", 4, 1, 0.5)); // b = 0.5 + ln 3
        responses.extend(fixed_responses("sparse", 2, 1, 0.0));
        responses.extend(fixed_responses("ghost", 3, 3, 0.0));

        let monitor = CalibrationMonitor::new(CalibrationConfig {
            min_sample_size: 4,
            ..Default::default()
        });
        let report = monitor.validate(&items, &responses);

        let ln3 = 3f64.ln();
        let by_id = index_results(&report);
        let b = |id: &str| by_id[&id.to_string()].empirical_difficulty.unwrap();
        assert!((b("easy") + ln3).abs() < 1e-9);
        assert!(b("mid").abs() < 1e-9);
        assert!((b("hard") - (0.5 + ln3)).abs() < 1e-9);
        assert_eq!(by_id[&"sparse".to_string()].status, ItemStatus::NeedsMoreData);

        // Errors against the catalog: -(ln 3 - 1), -0.2, +(ln 3 - 1).
        let d = ln3 - 1.0;
        let expected_mae = (2.0 * d + 0.2) / 3.0;
        let expected_rmse = ((2.0 * d * d + 0.04) / 3.0).sqrt();
        assert_eq!(report.difficulty.n, 3);
        assert!((report.difficulty.mae - expected_mae).abs() < 1e-9);
        assert!((report.difficulty.rmse - expected_rmse).abs() < 1e-9);
        let r = report.difficulty.pearson.unwrap();
        assert!((r - 0.996_513_317_530_056_6).abs() < 1e-9, "pearson {r}");
        assert!((report.coverage_rate - 0.75).abs() < 1e-9);
        assert_eq!(report.responses_skipped, 3);
        assert_eq!(report.responses_analyzed, 14);
    }

    #[test]
    fn unknown_items_are_skipped() {
        let items = vec![item("q1", 1.0, 0.0)];
        let mut responses = simulate(&items, 5, 2);
        responses[0].item_id = "ghost".into();
        let report = CalibrationMonitor::default().validate(&items, &responses);
        assert_eq!(report.responses_skipped, 1);
        assert_eq!(report.responses_analyzed, 4);
    }

    #[test]
    fn empirical_difficulty_inverts_the_model() {
        let it = item("q", 1.5, 0.4);
        // Proportion correct at theta = b is c + (1 - c) / 2.
        let p = irt::probability(0.4, &it.params());
        assert!((empirical_difficulty(p, 0.4, &it) - 0.4).abs() < 1e-9);
        // Saturated proportions are clamped, not infinite.
        assert!(empirical_difficulty(1.0, 0.0, &it).is_finite());
        assert!(empirical_difficulty(0.0, 0.0, &it).is_finite());
    }

    #[test]
    fn residual_fit_near_one_for_model_data() {
        let it = item("q", 1.0, 0.0);
        let responses = simulate(std::slice::from_ref(&it), 2000, 11);
        let rows: Vec<&Response> = responses.iter().collect();
        let (infit, outfit) = residual_fit(&it, &rows);
        assert!((infit.unwrap() - 1.0).abs() < 0.1, "infit {infit:?}");
        assert!((outfit.unwrap() - 1.0).abs() < 0.15, "outfit {outfit:?}");
    }

    #[test]
    fn badly_drifted_item_is_excluded_not_updated() {
        // The catalog claims the item is very hard; data says otherwise.
        let items = vec![item("drift", 1.2, 2.5)];
        let truth = vec![item("drift", 1.2, -0.5)];
        let responses = simulate(&truth, 200, 5);
        let report = CalibrationMonitor::default().validate(&items, &responses);

        let result = &report.items[0];
        assert!(result.difficulty_error.unwrap() < -1.0);
        assert_eq!(result.status, ItemStatus::Misfit);
        assert_eq!(report.proposal.exclusions, vec!["drift".to_string()]);
        assert!(report.proposal.parameter_updates.is_empty());
    }

    #[test]
    fn validated_items_past_threshold_get_updates() {
        let row = |id: &str, b_err: f64| ItemCalibration {
            item_id: id.into(),
            content_area: ContentArea::Pediatria,
            responses: 50,
            proportion_correct: Some(0.5),
            catalog_difficulty: 0.0,
            empirical_difficulty: Some(b_err),
            difficulty_error: Some(b_err),
            catalog_discrimination: 1.0,
            empirical_discrimination: Some(1.1),
            discrimination_error: Some(0.1),
            point_biserial: Some(0.35),
            empirical_infit: Some(1.0),
            empirical_outfit: Some(1.0),
            status: ItemStatus::Validated,
            fit_flags: Vec::new(),
        };
        let proposal =
            CalibrationMonitor::default().proposal(&[row("steady", 0.1), row("moved", -0.45)]);
        assert!(proposal.exclusions.is_empty());
        assert_eq!(proposal.parameter_updates.len(), 1);
        let update = &proposal.parameter_updates[0];
        assert_eq!(update.item_id, "moved");
        assert_eq!(update.proposed_difficulty, -0.45);
        assert_eq!(update.proposed_discrimination, 1.1);
    }
}
