//! Per-examinee adaptive session state machine.
//!
//! ```text
//! Init ──next_item──▶ Active ──stop rule──▶ Terminated(Complete)
//!                       │   ──cancel/idle─▶ Terminated(Abandoned)
//!                       └── no eligible ──▶ Terminated(Exhausted)
//! ```
//!
//! A session owns its response history and its pinned catalog snapshot. All
//! mutation happens in the transition methods below; everything else reads a
//! [`SessionSnapshot`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ExamConfig;
use crate::error::EngineError;
use crate::estimator::{AbilityEstimator, Estimate, EstimateSource};
use crate::exposure::{ExposureController, SessionContext};
use crate::model::{
    CatalogSnapshot, ContentArea, Item, ItemId, ItemParameters, Response, SessionId,
};
use crate::report::{AreaPerformance, SessionReport};
use crate::scoring::{self, ScoringEngine};
use crate::selector::{ItemSelector, SessionView};

/// Longest response time accepted as plausible (3 hours).
pub const MAX_RESPONSE_TIME_MS: i64 = 3 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Init,
    Active,
    Terminated,
}

/// Which stop rule completed the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopRule {
    SeTarget,
    MaxItems,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonCause {
    Cancelled,
    IdleTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationReason {
    Complete { rule: StopRule },
    Abandoned { cause: AbandonCause },
    /// No eligible item remained before a stop rule fired.
    Exhausted,
}

impl TerminationReason {
    pub fn is_complete(&self) -> bool {
        matches!(self, TerminationReason::Complete { .. })
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::Complete { rule: StopRule::SeTarget } => {
                f.write_str("complete (standard error target reached)")
            }
            TerminationReason::Complete { rule: StopRule::MaxItems } => {
                f.write_str("complete (maximum test length)")
            }
            TerminationReason::Abandoned { cause: AbandonCause::Cancelled } => {
                f.write_str("abandoned (cancelled)")
            }
            TerminationReason::Abandoned { cause: AbandonCause::IdleTimeout } => {
                f.write_str("abandoned (idle timeout)")
            }
            TerminationReason::Exhausted => f.write_str("exhausted (no eligible items)"),
        }
    }
}

/// Terminal state reported in place of a next item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationSignal {
    pub reason: TerminationReason,
    pub theta: f64,
    pub standard_error: f64,
    pub items_administered: usize,
}

/// Result of asking a session for its next item.
#[derive(Debug, Clone, PartialEq)]
pub enum NextItem {
    Item(Item),
    Terminated(TerminationSignal),
}

/// Returned after an accepted response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub theta: f64,
    pub standard_error: f64,
    pub source: EstimateSource,
    pub items_administered: usize,
    /// The session terminated as a result of this response.
    pub done: bool,
}

/// Read-only copy of session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub examinee_id: String,
    pub status: SessionStatus,
    pub termination: Option<TerminationReason>,
    pub theta: f64,
    pub standard_error: f64,
    pub administered: Vec<ItemId>,
    pub pending_item: Option<ItemId>,
    pub theta_history: Vec<f64>,
    pub catalog_version: String,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A validated response that has not been applied yet.
///
/// Produced by [`Session::prepare_response`] so the record can be persisted
/// before [`Session::commit_response`] makes it part of the session.
#[derive(Debug, Clone)]
pub struct PendingResponse {
    pub response: Response,
    estimate: Estimate,
    params: ItemParameters,
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    examinee_id: String,
    config: Arc<ExamConfig>,
    catalog: Arc<CatalogSnapshot>,
    estimator: AbilityEstimator,
    context: SessionContext,
    status: SessionStatus,
    termination: Option<TerminationReason>,
    theta: f64,
    standard_error: f64,
    administered: Vec<ItemId>,
    responses: Vec<(ItemParameters, bool)>,
    pending: Option<ItemId>,
    theta_history: Vec<f64>,
    started_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(
        id: SessionId,
        examinee_id: impl Into<String>,
        config: Arc<ExamConfig>,
        catalog: Arc<CatalogSnapshot>,
        seed: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let estimator = AbilityEstimator::new(config.estimator.clone());
        let prior_se = config.estimator.prior_standard_error;
        Self {
            id,
            examinee_id: examinee_id.into(),
            config,
            catalog,
            estimator,
            context: SessionContext::new(seed),
            status: SessionStatus::Init,
            termination: None,
            theta: 0.0,
            standard_error: prior_se,
            administered: Vec::new(),
            responses: Vec::new(),
            pending: None,
            theta_history: Vec::new(),
            started_at: now,
            last_activity_at: now,
            completed_at: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        self.termination
    }

    pub fn theta(&self) -> f64 {
        self.theta
    }

    pub fn standard_error(&self) -> f64 {
        self.standard_error
    }

    pub fn config(&self) -> &ExamConfig {
        &self.config
    }

    pub fn administered(&self) -> &[ItemId] {
        &self.administered
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_activity_at
    }

    /// When the session terminated, if it has.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Serve the next item, entering `Active` on the first call.
    ///
    /// An unanswered item is served again rather than replaced.
    pub fn next_item(
        &mut self,
        selector: &ItemSelector,
        exposure: &ExposureController,
        now: DateTime<Utc>,
    ) -> NextItem {
        if self.termination.is_some() {
            return NextItem::Terminated(self.signal());
        }
        if self.status == SessionStatus::Init {
            self.status = SessionStatus::Active;
            tracing::debug!(session = %self.id, "session active");
        }
        self.last_activity_at = now;

        if let Some(pending) = &self.pending {
            if let Some(item) = self.catalog.get(pending) {
                return NextItem::Item(item.clone());
            }
        }

        if self.administered.len() >= self.config.max_items {
            self.terminate(TerminationReason::Complete { rule: StopRule::MaxItems }, now);
            return NextItem::Terminated(self.signal());
        }

        let view = SessionView {
            theta: self.theta,
            administered: &self.administered,
        };
        match selector.select_next(view, &self.catalog, exposure, &mut self.context) {
            Some(item) => {
                let item = item.clone();
                exposure.record_served(&item.id);
                self.pending = Some(item.id.clone());
                NextItem::Item(item)
            }
            None => {
                tracing::info!(
                    session = %self.id,
                    administered = self.administered.len(),
                    "no eligible items left; session exhausted"
                );
                self.terminate(TerminationReason::Exhausted, now);
                NextItem::Terminated(self.signal())
            }
        }
    }

    /// Validate a response and compute the updated estimate without
    /// mutating the session.
    pub fn prepare_response(
        &self,
        item_id: &str,
        is_correct: bool,
        response_time_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<PendingResponse, EngineError> {
        if self.termination.is_some() {
            return Err(EngineError::SessionTerminated(self.id));
        }
        if !(0..=MAX_RESPONSE_TIME_MS).contains(&response_time_ms) {
            return Err(EngineError::InvalidInput(format!(
                "response time {response_time_ms} ms outside [0, {MAX_RESPONSE_TIME_MS}]"
            )));
        }
        let item = self
            .catalog
            .get(item_id)
            .ok_or_else(|| EngineError::UnknownItem(item_id.to_string()))?;
        if self.administered.iter().any(|id| id == item_id) {
            return Err(EngineError::InvalidInput(format!(
                "item {item_id} was already answered in this session"
            )));
        }
        match &self.pending {
            Some(pending) if pending == item_id => {}
            Some(pending) => {
                return Err(EngineError::InvalidInput(format!(
                    "response for {item_id} but {pending} is awaiting an answer"
                )))
            }
            None => {
                return Err(EngineError::InvalidInput(format!(
                    "item {item_id} was not served to this session"
                )))
            }
        }

        let params = item.params();
        let mut history = self.responses.clone();
        history.push((params, is_correct));
        let estimate = self.estimator.estimate(&history);

        Ok(PendingResponse {
            response: Response {
                session_id: self.id,
                item_id: item_id.to_string(),
                is_correct,
                response_time_ms: response_time_ms as u64,
                theta_at_response: self.theta,
                recorded_at: now,
            },
            estimate,
            params,
        })
    }

    /// Apply a prepared response and evaluate the stop rules.
    pub fn commit_response(&mut self, pending: PendingResponse, now: DateTime<Utc>) -> SubmitOutcome {
        let PendingResponse {
            response,
            estimate,
            params,
        } = pending;

        self.responses.push((params, response.is_correct));
        self.administered.push(response.item_id);
        self.pending = None;
        self.theta = estimate.theta;
        self.standard_error = estimate.standard_error;
        self.theta_history.push(estimate.theta);
        self.last_activity_at = now;

        if estimate.source == EstimateSource::EapFallback {
            tracing::debug!(session = %self.id, theta = estimate.theta, "estimate from EAP fallback");
        }

        let done = match self.stop_rule() {
            Some(rule) => {
                self.terminate(TerminationReason::Complete { rule }, now);
                true
            }
            None => false,
        };

        SubmitOutcome {
            theta: self.theta,
            standard_error: self.standard_error,
            source: estimate.source,
            items_administered: self.administered.len(),
            done,
        }
    }

    fn stop_rule(&self) -> Option<StopRule> {
        let n = self.administered.len();
        if n >= self.config.max_items {
            Some(StopRule::MaxItems)
        } else if n >= self.config.min_items && self.standard_error <= self.config.se_target {
            Some(StopRule::SeTarget)
        } else {
            None
        }
    }

    /// Stop serving items. Returns `false` if the session had already
    /// terminated.
    pub fn abandon(&mut self, cause: AbandonCause, now: DateTime<Utc>) -> bool {
        if self.termination.is_some() {
            return false;
        }
        self.terminate(TerminationReason::Abandoned { cause }, now);
        true
    }

    /// Whether the session has been idle past its timeout.
    pub fn is_idle(&self, now: DateTime<Utc>) -> bool {
        self.termination.is_none() && now - self.last_activity_at > self.config.idle_timeout()
    }

    fn terminate(&mut self, reason: TerminationReason, now: DateTime<Utc>) {
        self.status = SessionStatus::Terminated;
        self.termination = Some(reason);
        self.pending = None;
        self.completed_at = Some(now);
        tracing::info!(
            session = %self.id,
            items = self.administered.len(),
            theta = self.theta,
            se = self.standard_error,
            "session terminated: {reason}"
        );
    }

    fn signal(&self) -> TerminationSignal {
        TerminationSignal {
            reason: self.termination.unwrap_or(TerminationReason::Exhausted),
            theta: self.theta,
            standard_error: self.standard_error,
            items_administered: self.administered.len(),
        }
    }

    /// Correct count, precision and per-area breakdown so far.
    pub fn report(&self) -> SessionReport {
        let mut areas: BTreeMap<ContentArea, AreaPerformance> = ContentArea::ALL
            .iter()
            .map(|area| (*area, AreaPerformance::default()))
            .collect();
        let mut difficulty_sums: BTreeMap<ContentArea, f64> = BTreeMap::new();
        for (id, (params, correct)) in self.administered.iter().zip(&self.responses) {
            let Some(item) = self.catalog.get(id) else {
                continue;
            };
            let perf = areas.entry(item.content_area).or_default();
            perf.total += 1;
            if *correct {
                perf.correct += 1;
            }
            *difficulty_sums.entry(item.content_area).or_insert(0.0) += params.difficulty;
        }

        let n = self.administered.len();
        for (area, perf) in areas.iter_mut() {
            if perf.total == 0 {
                continue;
            }
            perf.percentage = perf.correct as f64 / perf.total as f64 * 100.0;
            perf.average_difficulty =
                difficulty_sums.get(area).copied().unwrap_or(0.0) / perf.total as f64;
            perf.share = perf.total as f64 / n as f64;
        }

        let scorer = ScoringEngine::new(self.config.scoring.clone());
        let score = self
            .termination
            .filter(TerminationReason::is_complete)
            .map(|_| scorer.score(self.theta, self.standard_error));

        SessionReport {
            session_id: self.id,
            examinee_id: self.examinee_id.clone(),
            status: self.status,
            termination: self.termination,
            items_administered: n,
            correct_count: self.responses.iter().filter(|(_, c)| *c).count(),
            theta: self.theta,
            standard_error: self.standard_error,
            precision_percent: scoring::precision_percent(self.standard_error),
            pass_probability: scorer.pass_probability(self.theta, self.standard_error),
            score,
            areas,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            examinee_id: self.examinee_id.clone(),
            status: self.status,
            termination: self.termination,
            theta: self.theta,
            standard_error: self.standard_error,
            administered: self.administered.clone(),
            pending_item: self.pending.clone(),
            theta_history: self.theta_history.clone(),
            catalog_version: self.catalog.version.clone(),
            started_at: self.started_at,
            last_activity_at: self.last_activity_at,
            completed_at: self.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContentArea;
    use uuid::Uuid;

    fn catalog(n: usize) -> Arc<CatalogSnapshot> {
        let items = (0..n)
            .map(|i| Item {
                id: format!("q{i:03}"),
                content_area: ContentArea::ALL[i % 5],
                difficulty: -2.0 + 4.0 * i as f64 / n.max(1) as f64,
                discrimination: 1.5,
                guessing: 0.2,
                active: true,
                exposure_count: 0,
                infit: None,
                outfit: None,
            })
            .collect();
        Arc::new(CatalogSnapshot::new("test", "v1", items))
    }

    fn session(config: ExamConfig, n: usize) -> Session {
        Session::new(
            Uuid::new_v4(),
            "examinee-1",
            Arc::new(config),
            catalog(n),
            42,
            Utc::now(),
        )
    }

    fn serve(s: &mut Session, exposure: &ExposureController) -> Item {
        match s.next_item(&ItemSelector::default(), exposure, Utc::now()) {
            NextItem::Item(item) => item,
            NextItem::Terminated(sig) => panic!("unexpected termination: {}", sig.reason),
        }
    }

    fn answer(s: &mut Session, item: &str, correct: bool) -> SubmitOutcome {
        let now = Utc::now();
        let pending = s.prepare_response(item, correct, 5_000, now).unwrap();
        s.commit_response(pending, now)
    }

    #[test]
    fn starts_in_init_with_prior() {
        let s = session(ExamConfig::default(), 20);
        assert_eq!(s.status(), SessionStatus::Init);
        assert_eq!(s.theta(), 0.0);
        assert_eq!(s.standard_error(), 1.0);
    }

    #[test]
    fn first_item_activates_session() {
        let exposure = ExposureController::default();
        let mut s = session(ExamConfig::default(), 20);
        serve(&mut s, &exposure);
        assert_eq!(s.status(), SessionStatus::Active);
        assert!(s.snapshot().pending_item.is_some());
    }

    #[test]
    fn pending_item_is_served_again() {
        let exposure = ExposureController::default();
        let mut s = session(ExamConfig::default(), 20);
        let first = serve(&mut s, &exposure);
        let again = serve(&mut s, &exposure);
        assert_eq!(first.id, again.id);
        assert_eq!(exposure.served_count(&first.id), 1);
    }

    #[test]
    fn max_items_terminates_complete() {
        let exposure = ExposureController::default();
        let config = ExamConfig {
            max_items: 5,
            min_items: 5,
            se_target: 0.01,
            ..Default::default()
        };
        let mut s = session(config, 30);
        for i in 0..5 {
            let item = serve(&mut s, &exposure);
            let outcome = answer(&mut s, &item.id, i % 2 == 0);
            assert_eq!(outcome.done, i == 4);
        }
        assert_eq!(
            s.termination(),
            Some(TerminationReason::Complete { rule: StopRule::MaxItems })
        );
        assert_eq!(s.administered().len(), 5);
        assert!(matches!(
            s.next_item(&ItemSelector::default(), &exposure, Utc::now()),
            NextItem::Terminated(_)
        ));
    }

    #[test]
    fn small_bank_is_exhausted() {
        let exposure = ExposureController::default();
        let mut s = session(ExamConfig::default(), 3);
        for _ in 0..3 {
            let item = serve(&mut s, &exposure);
            answer(&mut s, &item.id, true);
        }
        match s.next_item(&ItemSelector::default(), &exposure, Utc::now()) {
            NextItem::Terminated(sig) => {
                assert_eq!(sig.reason, TerminationReason::Exhausted);
                assert_eq!(sig.items_administered, 3);
            }
            NextItem::Item(item) => panic!("served {} from an exhausted bank", item.id),
        }
    }

    #[test]
    fn rejects_bad_responses_without_mutation() {
        let exposure = ExposureController::default();
        let mut s = session(ExamConfig::default(), 20);
        let item = serve(&mut s, &exposure);
        let before = s.snapshot();
        let now = Utc::now();

        assert!(s.prepare_response(&item.id, true, -1, now).is_err());
        assert!(s
            .prepare_response(&item.id, true, MAX_RESPONSE_TIME_MS + 1, now)
            .is_err());
        assert!(matches!(
            s.prepare_response("nope", true, 10, now),
            Err(EngineError::UnknownItem(_))
        ));
        let other = s
            .catalog
            .items()
            .iter()
            .find(|i| i.id != item.id)
            .unwrap()
            .id
            .clone();
        assert!(matches!(
            s.prepare_response(&other, true, 10, now),
            Err(EngineError::InvalidInput(_))
        ));
        assert_eq!(s.snapshot(), before);
    }

    #[test]
    fn abandon_is_idempotent_and_stops_serving() {
        let exposure = ExposureController::default();
        let mut s = session(ExamConfig::default(), 20);
        let item = serve(&mut s, &exposure);
        answer(&mut s, &item.id, true);

        assert!(s.abandon(AbandonCause::Cancelled, Utc::now()));
        assert!(!s.abandon(AbandonCause::IdleTimeout, Utc::now()));
        assert_eq!(
            s.termination(),
            Some(TerminationReason::Abandoned { cause: AbandonCause::Cancelled })
        );
        // Recorded responses survive.
        assert_eq!(s.administered().len(), 1);
        assert!(matches!(
            s.prepare_response("q000", true, 10, Utc::now()),
            Err(EngineError::SessionTerminated(_))
        ));
    }

    #[test]
    fn idle_detection_uses_timeout() {
        let s = session(ExamConfig::default(), 5);
        let later = s.last_activity_at() + chrono::Duration::minutes(31);
        assert!(s.is_idle(later));
        assert!(!s.is_idle(s.last_activity_at() + chrono::Duration::minutes(5)));
    }

    #[test]
    fn theta_history_tracks_each_response() {
        let exposure = ExposureController::default();
        let mut s = session(ExamConfig::default(), 40);
        for i in 0..4 {
            let item = serve(&mut s, &exposure);
            answer(&mut s, &item.id, i != 1);
        }
        let snap = s.snapshot();
        assert_eq!(snap.theta_history.len(), 4);
        assert_eq!(*snap.theta_history.last().unwrap(), snap.theta);
    }

    #[test]
    fn report_counts_correct_answers_per_area() {
        let exposure = ExposureController::default();
        let config = ExamConfig {
            max_items: 6,
            min_items: 6,
            se_target: 0.01,
            ..Default::default()
        };
        let mut s = session(config, 30);

        let in_progress = s.report();
        assert_eq!(in_progress.items_administered, 0);
        assert!(in_progress.score.is_none());
        assert_eq!(in_progress.areas.len(), 5);

        let mut answered = Vec::new();
        for i in 0..6 {
            let item = serve(&mut s, &exposure);
            let correct = i % 3 != 0;
            answer(&mut s, &item.id, correct);
            answered.push((item, correct));
        }

        let report = s.report();
        assert_eq!(report.items_administered, 6);
        assert_eq!(report.correct_count, 4);
        assert!((report.percent_correct() - 400.0 / 6.0).abs() < 1e-9);
        assert_eq!(report.score, Some(ScoringEngine::default().score(s.theta(), s.standard_error())));
        assert!(
            (report.precision_percent - scoring::precision_percent(s.standard_error())).abs() < 1e-12
        );

        for area in ContentArea::ALL {
            let rows: Vec<&(Item, bool)> =
                answered.iter().filter(|(i, _)| i.content_area == area).collect();
            let perf = &report.areas[&area];
            assert_eq!(perf.total, rows.len());
            assert_eq!(perf.correct, rows.iter().filter(|(_, c)| *c).count());
            if rows.is_empty() {
                assert_eq!(perf.percentage, 0.0);
                continue;
            }
            let mean_b = rows.iter().map(|(i, _)| i.difficulty).sum::<f64>() / rows.len() as f64;
            assert!((perf.average_difficulty - mean_b).abs() < 1e-12);
            assert!((perf.share - rows.len() as f64 / 6.0).abs() < 1e-12);
        }
    }
}
