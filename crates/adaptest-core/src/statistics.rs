//! Descriptive statistics used by calibration and simulation summaries.

use serde::{Deserialize, Serialize};

/// Arithmetic mean; `0.0` for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Mean absolute error between paired values.
pub fn mean_absolute_error(estimated: &[f64], observed: &[f64]) -> f64 {
    let n = estimated.len().min(observed.len());
    if n == 0 {
        return 0.0;
    }
    estimated
        .iter()
        .zip(observed)
        .map(|(e, o)| (e - o).abs())
        .sum::<f64>()
        / n as f64
}

/// Root mean squared error between paired values.
pub fn root_mean_squared_error(estimated: &[f64], observed: &[f64]) -> f64 {
    let n = estimated.len().min(observed.len());
    if n == 0 {
        return 0.0;
    }
    (estimated
        .iter()
        .zip(observed)
        .map(|(e, o)| (e - o).powi(2))
        .sum::<f64>()
        / n as f64)
        .sqrt()
}

/// Pearson product-moment correlation.
///
/// `None` with fewer than two pairs or when either side has zero variance.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    let n = x.len().min(y.len());
    if n < 2 {
        return None;
    }
    let (x, y) = (&x[..n], &y[..n]);
    let mx = mean(x);
    let my = mean(y);

    let mut cov = 0.0;
    let mut vx = 0.0;
    let mut vy = 0.0;
    for (a, b) in x.iter().zip(y) {
        let dx = a - mx;
        let dy = b - my;
        cov += dx * dy;
        vx += dx * dx;
        vy += dy * dy;
    }
    if vx <= 0.0 || vy <= 0.0 {
        return None;
    }
    Some((cov / (vx * vy).sqrt()).clamp(-1.0, 1.0))
}

/// Spearman rank correlation (Pearson on average ranks).
pub fn spearman(x: &[f64], y: &[f64]) -> Option<f64> {
    let n = x.len().min(y.len());
    pearson(&ranks(&x[..n]), &ranks(&y[..n]))
}

/// Point-biserial correlation between a dichotomous score and a continuous
/// total.
pub fn point_biserial(scores: &[bool], totals: &[f64]) -> Option<f64> {
    let numeric: Vec<f64> = scores.iter().map(|s| if *s { 1.0 } else { 0.0 }).collect();
    pearson(&numeric, totals)
}

/// 1-based ranks with ties sharing their average rank.
fn ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut out = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let avg = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            out[idx] = avg;
        }
        i = j + 1;
    }
    out
}

/// Agreement between estimated and observed values of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorStatistics {
    pub mae: f64,
    pub rmse: f64,
    pub pearson: Option<f64>,
    pub spearman: Option<f64>,
    /// Number of pairs.
    pub n: usize,
}

impl ErrorStatistics {
    pub fn from_pairs(estimated: &[f64], observed: &[f64]) -> Self {
        Self {
            mae: mean_absolute_error(estimated, observed),
            rmse: root_mean_squared_error(estimated, observed),
            pearson: pearson(estimated, observed),
            spearman: spearman(estimated, observed),
            n: estimated.len().min(observed.len()),
        }
    }
}
