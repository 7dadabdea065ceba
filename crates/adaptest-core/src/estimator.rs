//! Ability estimation from a scored response sequence.
//!
//! Maximum likelihood via Newton-Raphson (Fisher scoring) is the primary
//! method. MLE has no finite solution for all-correct or all-incorrect
//! patterns and can wander off on short, noisy sequences; when that happens
//! the estimator falls back to Expected A Posteriori (EAP) with a
//! standard-normal prior over a fixed quadrature grid, which is always finite
//! and bounded by the grid.
//!
//! The estimator is a pure function of the response history.

use serde::{Deserialize, Serialize};

use crate::error::EstimationDivergence;
use crate::irt;
use crate::model::ItemParameters;

/// How the engine estimates ability after each response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimationMethod {
    /// MLE with EAP fallback on divergence.
    Mle,
    /// EAP for every update.
    Eap,
}

/// Which computation produced an [`Estimate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateSource {
    /// No responses yet; the prior is reported.
    Prior,
    /// Converged maximum likelihood.
    Mle,
    /// MLE diverged and EAP was used instead.
    EapFallback,
    /// EAP was requested directly.
    Eap,
}

/// Estimator tuning. All fields have serde defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    #[serde(default = "default_method")]
    pub method: EstimationMethod,
    /// Newton-Raphson iteration cap.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Stop when `|Δθ|` falls below this.
    #[serde(default = "default_tolerance")]
    pub convergence_tolerance: f64,
    /// `|θ|` beyond this counts as divergence.
    #[serde(default = "default_divergence_bound")]
    pub divergence_bound: f64,
    /// Number of EAP quadrature nodes.
    #[serde(default = "default_quadrature_points")]
    pub quadrature_points: usize,
    #[serde(default = "default_quadrature_min")]
    pub quadrature_min: f64,
    #[serde(default = "default_quadrature_max")]
    pub quadrature_max: f64,
    /// Standard error reported before any response.
    #[serde(default = "default_prior_se")]
    pub prior_standard_error: f64,
}

fn default_method() -> EstimationMethod {
    EstimationMethod::Mle
}
fn default_max_iterations() -> u32 {
    25
}
fn default_tolerance() -> f64 {
    1e-4
}
fn default_divergence_bound() -> f64 {
    6.0
}
fn default_quadrature_points() -> usize {
    41
}
fn default_quadrature_min() -> f64 {
    -4.0
}
fn default_quadrature_max() -> f64 {
    4.0
}
fn default_prior_se() -> f64 {
    1.0
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            max_iterations: default_max_iterations(),
            convergence_tolerance: default_tolerance(),
            divergence_bound: default_divergence_bound(),
            quadrature_points: default_quadrature_points(),
            quadrature_min: default_quadrature_min(),
            quadrature_max: default_quadrature_max(),
            prior_standard_error: default_prior_se(),
        }
    }
}

/// An ability estimate and its standard error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Estimate {
    pub theta: f64,
    pub standard_error: f64,
    pub source: EstimateSource,
    /// Newton-Raphson iterations spent (0 for EAP-only paths).
    pub iterations: u32,
}

/// Stateless ability estimator.
#[derive(Debug, Clone, Default)]
pub struct AbilityEstimator {
    config: EstimatorConfig,
}

impl AbilityEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Estimate ability from an ordered list of `(item parameters, correct)`.
    pub fn estimate(&self, responses: &[(ItemParameters, bool)]) -> Estimate {
        if responses.is_empty() {
            return Estimate {
                theta: 0.0,
                standard_error: self.config.prior_standard_error,
                source: EstimateSource::Prior,
                iterations: 0,
            };
        }

        match self.config.method {
            EstimationMethod::Eap => self.expected_a_posteriori(responses, EstimateSource::Eap),
            EstimationMethod::Mle => match self.maximum_likelihood(responses) {
                Ok(estimate) => estimate,
                Err(divergence) => {
                    tracing::debug!(
                        responses = responses.len(),
                        "MLE diverged ({divergence}); falling back to EAP"
                    );
                    self.expected_a_posteriori(responses, EstimateSource::EapFallback)
                }
            },
        }
    }

    /// Newton-Raphson on the 3PL log-likelihood, starting at θ = 0.
    pub fn maximum_likelihood(
        &self,
        responses: &[(ItemParameters, bool)],
    ) -> Result<Estimate, EstimationDivergence> {
        if responses.iter().all(|(_, correct)| *correct) {
            return Err(EstimationDivergence::ExtremePattern("all correct"));
        }
        if responses.iter().all(|(_, correct)| !*correct) {
            return Err(EstimationDivergence::ExtremePattern("all incorrect"));
        }

        let mut theta = 0.0f64;
        for iteration in 1..=self.config.max_iterations {
            let (gradient, info) = score_and_information(theta, responses);
            if !(info > 0.0) || !gradient.is_finite() {
                return Err(EstimationDivergence::Degenerate);
            }

            let delta = gradient / info;
            theta += delta;
            if !theta.is_finite() {
                return Err(EstimationDivergence::Degenerate);
            }
            if theta.abs() > self.config.divergence_bound {
                return Err(EstimationDivergence::OutOfBounds(theta));
            }

            if delta.abs() < self.config.convergence_tolerance {
                let info = irt::test_information(theta, responses.iter().map(|(p, _)| p));
                if !(info > 0.0) {
                    return Err(EstimationDivergence::Degenerate);
                }
                return Ok(Estimate {
                    theta,
                    standard_error: 1.0 / info.sqrt(),
                    source: EstimateSource::Mle,
                    iterations: iteration,
                });
            }
        }

        Err(EstimationDivergence::IterationCap(self.config.max_iterations))
    }

    /// Posterior mean and standard deviation under a N(0, 1) prior.
    pub fn expected_a_posteriori(
        &self,
        responses: &[(ItemParameters, bool)],
        source: EstimateSource,
    ) -> Estimate {
        let nodes = quadrature_nodes(
            self.config.quadrature_points,
            self.config.quadrature_min,
            self.config.quadrature_max,
        );

        let log_posterior: Vec<f64> = nodes
            .iter()
            .map(|&theta| irt::log_likelihood(theta, responses) - 0.5 * theta * theta)
            .collect();

        let max = log_posterior
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let weights: Vec<f64> = log_posterior.iter().map(|lp| (lp - max).exp()).collect();
        let total: f64 = weights.iter().sum();

        if !(total > 0.0) || !total.is_finite() {
            return Estimate {
                theta: 0.0,
                standard_error: self.config.prior_standard_error,
                source,
                iterations: 0,
            };
        }

        let mean = nodes
            .iter()
            .zip(&weights)
            .map(|(theta, w)| theta * w)
            .sum::<f64>()
            / total;
        let variance = nodes
            .iter()
            .zip(&weights)
            .map(|(theta, w)| (theta - mean).powi(2) * w)
            .sum::<f64>()
            / total;

        Estimate {
            theta: mean,
            standard_error: variance.max(0.0).sqrt(),
            source,
            iterations: 0,
        }
    }
}

/// First derivative of the log-likelihood and test information at `theta`.
fn score_and_information(theta: f64, responses: &[(ItemParameters, bool)]) -> (f64, f64) {
    let mut gradient = 0.0;
    let mut info = 0.0;
    for (params, correct) in responses {
        let p = irt::probability(theta, params).clamp(irt::PROB_EPSILON, 1.0 - irt::PROB_EPSILON);
        let c = params.guessing;
        let u = if *correct { 1.0 } else { 0.0 };
        gradient += params.discrimination * (u - p) * (p - c) / ((1.0 - c) * p);
        info += irt::information(theta, params);
    }
    (gradient, info)
}

/// Evenly spaced quadrature nodes on `[min, max]`.
pub fn quadrature_nodes(points: usize, min: f64, max: f64) -> Vec<f64> {
    match points {
        0 => Vec::new(),
        1 => vec![(min + max) / 2.0],
        n => {
            let step = (max - min) / (n - 1) as f64;
            (0..n).map(|i| min + step * i as f64).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(a: f64, b: f64, c: f64) -> ItemParameters {
        ItemParameters::new(a, b, c)
    }

    fn mixed_pattern() -> Vec<(ItemParameters, bool)> {
        vec![
            (item(1.2, -1.0, 0.2), true),
            (item(1.0, -0.5, 0.2), true),
            (item(1.5, 0.0, 0.2), true),
            (item(1.1, 0.5, 0.2), false),
            (item(0.9, 1.0, 0.2), true),
            (item(1.3, 1.5, 0.2), false),
            (item(1.0, 2.0, 0.2), false),
        ]
    }

    #[test]
    fn empty_history_reports_prior() {
        let est = AbilityEstimator::default().estimate(&[]);
        assert_eq!(est.theta, 0.0);
        assert_eq!(est.standard_error, 1.0);
        assert_eq!(est.source, EstimateSource::Prior);
    }

    #[test]
    fn mixed_pattern_converges_with_mle() {
        let est = AbilityEstimator::default().estimate(&mixed_pattern());
        assert_eq!(est.source, EstimateSource::Mle);
        assert!(est.iterations <= 25);
        assert!(est.theta > -1.0 && est.theta < 2.0, "theta {}", est.theta);
        assert!(est.standard_error.is_finite() && est.standard_error > 0.0);
    }

    #[test]
    fn mle_is_a_stationary_point() {
        let responses = mixed_pattern();
        let est = AbilityEstimator::default()
            .maximum_likelihood(&responses)
            .unwrap();
        let (gradient, _) = score_and_information(est.theta, &responses);
        assert!(gradient.abs() < 1e-3, "gradient {gradient}");
    }

    #[test]
    fn mle_standard_error_matches_information() {
        let responses = mixed_pattern();
        let est = AbilityEstimator::default().estimate(&responses);
        let info = irt::test_information(est.theta, responses.iter().map(|(p, _)| p));
        assert!((est.standard_error - 1.0 / info.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn all_correct_falls_back_to_bounded_eap() {
        let responses: Vec<_> = (0..15)
            .map(|i| (item(1.4, -1.5 + 0.25 * i as f64, 0.2), true))
            .collect();
        let est = AbilityEstimator::default().estimate(&responses);
        assert_eq!(est.source, EstimateSource::EapFallback);
        assert!(est.theta > 0.5, "theta should move upward, got {}", est.theta);
        assert!(est.theta <= 4.0);
        assert!(est.standard_error.is_finite() && est.standard_error >= 0.0);
    }

    #[test]
    fn all_incorrect_falls_back_to_bounded_eap() {
        let responses: Vec<_> = (0..8).map(|_| (item(1.0, 0.0, 0.2), false)).collect();
        let est = AbilityEstimator::default().estimate(&responses);
        assert_eq!(est.source, EstimateSource::EapFallback);
        assert!(est.theta < 0.0 && est.theta >= -4.0);
    }

    #[test]
    fn single_response_is_extreme_pattern() {
        let err = AbilityEstimator::default()
            .maximum_likelihood(&[(item(1.0, 0.0, 0.2), true)])
            .unwrap_err();
        assert_eq!(err, EstimationDivergence::ExtremePattern("all correct"));
    }

    #[test]
    fn iteration_cap_is_divergence() {
        let estimator = AbilityEstimator::new(EstimatorConfig {
            max_iterations: 1,
            convergence_tolerance: 1e-12,
            ..Default::default()
        });
        let result = estimator.maximum_likelihood(&mixed_pattern());
        assert_eq!(result.unwrap_err(), EstimationDivergence::IterationCap(1));
        let est = estimator.estimate(&mixed_pattern());
        assert_eq!(est.source, EstimateSource::EapFallback);
    }

    #[test]
    fn eap_method_is_used_directly() {
        let estimator = AbilityEstimator::new(EstimatorConfig {
            method: EstimationMethod::Eap,
            ..Default::default()
        });
        let est = estimator.estimate(&mixed_pattern());
        assert_eq!(est.source, EstimateSource::Eap);
        assert!(est.standard_error < 1.0);
    }

    #[test]
    fn standard_error_always_finite_and_non_negative() {
        let estimator = AbilityEstimator::default();
        let bank = [
            item(0.3, -3.0, 0.0),
            item(2.5, 3.0, 0.25),
            item(1.0, 0.0, 0.2),
            item(1.8, -1.2, 0.1),
            item(0.6, 2.2, 0.3),
        ];
        // Every response pattern over the five items.
        for mask in 0u32..32 {
            let responses: Vec<_> = bank
                .iter()
                .enumerate()
                .map(|(i, p)| (*p, mask & (1 << i) != 0))
                .collect();
            let est = estimator.estimate(&responses);
            assert!(est.standard_error.is_finite(), "mask {mask}");
            assert!(est.standard_error >= 0.0, "mask {mask}");
            assert!(est.theta.is_finite(), "mask {mask}");
        }
    }

    #[test]
    fn quadrature_grid_shape() {
        let nodes = quadrature_nodes(41, -4.0, 4.0);
        assert_eq!(nodes.len(), 41);
        assert!((nodes[0] + 4.0).abs() < 1e-12);
        assert!((nodes[40] - 4.0).abs() < 1e-12);
        assert!((nodes[20]).abs() < 1e-12);
    }
}
