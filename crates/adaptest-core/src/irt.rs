//! Three-parameter logistic (3PL) item response functions.
//!
//! `P(θ) = c + (1 - c) / (1 + exp(-a(θ - b)))`
//!
//! Everything here is a pure function of its arguments.

use crate::model::ItemParameters;

/// Probabilities are clamped to `[PROB_EPSILON, 1 - PROB_EPSILON]` before
/// taking logarithms.
pub const PROB_EPSILON: f64 = 1e-10;

/// Numerically stable logistic function.
#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let exp_x = x.exp();
        exp_x / (1.0 + exp_x)
    }
}

/// Inverse of [`sigmoid`]. `p` must lie strictly inside `(0, 1)`.
#[inline]
pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

/// Probability of a correct response at ability `theta`.
#[inline]
pub fn probability(theta: f64, params: &ItemParameters) -> f64 {
    let c = params.guessing;
    c + (1.0 - c) * sigmoid(params.discrimination * (theta - params.difficulty))
}

/// Fisher information of one item at `theta`.
///
/// `I(θ) = a² (P - c)² (1 - P) / ((1 - c)² P)`
pub fn information(theta: f64, params: &ItemParameters) -> f64 {
    let p = probability(theta, params);
    if p <= 0.0 || p >= 1.0 {
        return 0.0;
    }
    let a = params.discrimination;
    let c = params.guessing;
    let numerator = a * a * (p - c).powi(2) * (1.0 - p);
    let denominator = (1.0 - c).powi(2) * p;
    if denominator <= 0.0 {
        return 0.0;
    }
    numerator / denominator
}

/// Test information: the sum of item informations at `theta`.
pub fn test_information<'a, I>(theta: f64, items: I) -> f64
where
    I: IntoIterator<Item = &'a ItemParameters>,
{
    items.into_iter().map(|p| information(theta, p)).sum()
}

/// Log-likelihood of a scored response pattern at `theta`.
pub fn log_likelihood(theta: f64, responses: &[(ItemParameters, bool)]) -> f64 {
    responses
        .iter()
        .map(|(params, correct)| {
            let p = probability(theta, params).clamp(PROB_EPSILON, 1.0 - PROB_EPSILON);
            if *correct {
                p.ln()
            } else {
                (1.0 - p).ln()
            }
        })
        .sum()
}

/// Standard normal CDF (Abramowitz & Stegun 7.1.26, |error| < 1.5e-7).
pub fn normal_cdf(z: f64) -> f64 {
    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let sign = if z < 0.0 { -1.0 } else { 1.0 };
    let x = z.abs() / std::f64::consts::SQRT_2;
    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    0.5 * (1.0 + sign * y)
}
