//! Monte Carlo simulation of examinees taking adaptive tests.
//!
//! Each synthetic examinee has a true ability drawn from a normal
//! distribution and answers every served item by sampling the 3PL response
//! probability at that ability. Examinees run concurrently through a real
//! [`AdaptiveEngine`], bounded by a semaphore, and the summary reports how
//! well the engine recovered the true abilities.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::engine::AdaptiveEngine;
use crate::irt;
use crate::model::SessionId;
use crate::session::{NextItem, TerminationReason};
use crate::statistics;

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub examinees: usize,
    /// Maximum examinees in flight.
    pub parallelism: usize,
    pub seed: u64,
    pub ability_mean: f64,
    pub ability_sd: f64,
    /// Simulated response times are drawn uniformly from this range.
    pub response_time_ms: (i64, i64),
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            examinees: 100,
            parallelism: 8,
            seed: 42,
            ability_mean: 0.0,
            ability_sd: 1.0,
            response_time_ms: (15_000, 120_000),
        }
    }
}

/// Progress reporting trait.
pub trait SimulationObserver: Send + Sync {
    fn on_examinee_complete(&self, outcome: &ExamineeOutcome);
    fn on_examinee_error(&self, index: usize, error: &str);
    fn on_simulation_complete(
        &self,
        total: usize,
        completed: usize,
        failed: usize,
        elapsed: Duration,
    );
}

/// No-op observer.
pub struct NoopObserver;

impl SimulationObserver for NoopObserver {
    fn on_examinee_complete(&self, _: &ExamineeOutcome) {}
    fn on_examinee_error(&self, _: usize, _: &str) {}
    fn on_simulation_complete(&self, _: usize, _: usize, _: usize, _: Duration) {}
}

/// How one synthetic examinee's session ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamineeOutcome {
    pub index: usize,
    pub session_id: SessionId,
    pub true_theta: f64,
    pub estimated_theta: f64,
    pub standard_error: f64,
    pub items_administered: usize,
    pub termination: TerminationReason,
    pub scaled_score: Option<u32>,
    pub passed: Option<bool>,
}

/// Aggregate recovery statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSummary {
    pub examinees: usize,
    pub completed: usize,
    pub exhausted: usize,
    pub failed: usize,
    /// Mean of `estimated - true`.
    pub bias: f64,
    pub rmse: f64,
    pub correlation: Option<f64>,
    pub mean_items: f64,
    pub mean_standard_error: f64,
    pub pass_rate: f64,
    pub max_exposure_rate: f64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationReport {
    pub summary: SimulationSummary,
    pub outcomes: Vec<ExamineeOutcome>,
}

/// Drive `config.examinees` synthetic examinees through `engine`.
pub async fn run_simulation(
    engine: &AdaptiveEngine,
    config: &SimulationConfig,
    observer: &dyn SimulationObserver,
) -> Result<SimulationReport> {
    let start = Instant::now();
    let ability = Normal::new(config.ability_mean, config.ability_sd)
        .map_err(|e| anyhow::anyhow!("invalid ability distribution: {e}"))?;
    let (min_ms, max_ms) = config.response_time_ms;
    if min_ms < 0 || min_ms > max_ms {
        anyhow::bail!("invalid response time range {min_ms}..={max_ms}");
    }
    let semaphore = Arc::new(Semaphore::new(config.parallelism.max(1)));

    let mut futures = FuturesUnordered::new();
    for index in 0..config.examinees {
        let semaphore = Arc::clone(&semaphore);
        let seed = config.seed.wrapping_add(index as u64);
        futures.push(async move {
            let inner = async {
                let _permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| anyhow::anyhow!("semaphore closed"))?;
                let mut rng = Pcg64::seed_from_u64(seed);
                let true_theta = ability.sample(&mut rng);
                simulate_examinee(engine, index, true_theta, (min_ms, max_ms), &mut rng).await
            };
            (index, inner.await)
        });
    }

    let mut outcomes = Vec::new();
    let mut failed = 0usize;
    let total = futures.len();

    while let Some((index, result)) = futures.next().await {
        match result {
            Ok(outcome) => {
                observer.on_examinee_complete(&outcome);
                outcomes.push(outcome);
            }
            Err(e) => {
                tracing::error!("simulated examinee {index} failed: {e:#}");
                observer.on_examinee_error(index, &e.to_string());
                failed += 1;
            }
        }
    }
    outcomes.sort_by_key(|o| o.index);

    let elapsed = start.elapsed();
    observer.on_simulation_complete(total, outcomes.len(), failed, elapsed);

    let max_exposure_rate = engine
        .exposure()
        .snapshot()
        .iter()
        .map(|e| e.exposure_rate)
        .fold(0.0, f64::max);
    let summary = summarize(&outcomes, failed, max_exposure_rate, elapsed);

    tracing::info!(
        examinees = summary.examinees,
        bias = summary.bias,
        rmse = summary.rmse,
        mean_items = summary.mean_items,
        "simulation complete"
    );
    Ok(SimulationReport { summary, outcomes })
}

async fn simulate_examinee(
    engine: &AdaptiveEngine,
    index: usize,
    true_theta: f64,
    response_time_ms: (i64, i64),
    rng: &mut Pcg64,
) -> Result<ExamineeOutcome> {
    let session_id = engine.start_session(&format!("sim-{index:05}")).await?;

    let signal = loop {
        match engine.next_item(session_id).await? {
            NextItem::Item(item) => {
                let p = irt::probability(true_theta, &item.params());
                let correct = rng.random::<f64>() < p;
                let elapsed = rng.random_range(response_time_ms.0..=response_time_ms.1);
                engine
                    .submit_response(session_id, &item.id, correct, elapsed)
                    .await?;
            }
            NextItem::Terminated(signal) => break signal,
        }
    };

    let (scaled_score, passed) = if signal.reason.is_complete() {
        let result = engine.get_result(session_id).await?;
        (Some(result.scaled_score), Some(result.passed))
    } else {
        (None, None)
    };
    engine.remove_session(session_id).await?;

    Ok(ExamineeOutcome {
        index,
        session_id,
        true_theta,
        estimated_theta: signal.theta,
        standard_error: signal.standard_error,
        items_administered: signal.items_administered,
        termination: signal.reason,
        scaled_score,
        passed,
    })
}

/// Aggregate per-examinee outcomes.
pub fn summarize(
    outcomes: &[ExamineeOutcome],
    failed: usize,
    max_exposure_rate: f64,
    elapsed: Duration,
) -> SimulationSummary {
    let truth: Vec<f64> = outcomes.iter().map(|o| o.true_theta).collect();
    let estimates: Vec<f64> = outcomes.iter().map(|o| o.estimated_theta).collect();
    let errors: Vec<f64> = estimates.iter().zip(&truth).map(|(e, t)| e - t).collect();
    let items: Vec<f64> = outcomes.iter().map(|o| o.items_administered as f64).collect();
    let ses: Vec<f64> = outcomes.iter().map(|o| o.standard_error).collect();

    let scored: Vec<bool> = outcomes.iter().filter_map(|o| o.passed).collect();
    let pass_rate = if scored.is_empty() {
        0.0
    } else {
        scored.iter().filter(|p| **p).count() as f64 / scored.len() as f64
    };

    SimulationSummary {
        examinees: outcomes.len() + failed,
        completed: outcomes
            .iter()
            .filter(|o| o.termination.is_complete())
            .count(),
        exhausted: outcomes
            .iter()
            .filter(|o| o.termination == TerminationReason::Exhausted)
            .count(),
        failed,
        bias: statistics::mean(&errors),
        rmse: statistics::root_mean_squared_error(&estimates, &truth),
        correlation: statistics::pearson(&estimates, &truth),
        mean_items: statistics::mean(&items),
        mean_standard_error: statistics::mean(&ses),
        pass_rate,
        max_exposure_rate,
        duration_ms: elapsed.as_millis() as u64,
    }
}
