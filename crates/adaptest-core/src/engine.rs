//! The adaptive testing engine.
//!
//! Owns the shared pieces (catalog cache, exposure counters, repositories)
//! and routes requests to per-session state machines. Sessions are
//! independent: each lives behind its own async mutex, so one examinee's
//! calls are serialized while different examinees proceed in parallel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::calibration::{CalibrationConfig, CalibrationMonitor};
use crate::config::ExamConfig;
use crate::error::EngineError;
use crate::exposure::{ExposureConfig, ExposureController};
use crate::model::{CatalogSnapshot, SessionId};
use crate::report::{CalibrationReport, SessionReport};
use crate::scoring::{ScoreResult, ScoringEngine};
use crate::selector::ItemSelector;
use crate::session::{AbandonCause, NextItem, Session, SessionSnapshot, SubmitOutcome};
use crate::traits::{BatchWindow, ItemCatalogRepository, ResponseLogRepository};

/// Configuration for the adaptive engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Exam settings used by [`AdaptiveEngine::start_session`].
    pub exam: ExamConfig,
    pub exposure: ExposureConfig,
    pub calibration: CalibrationConfig,
    /// Reload the catalog when the cached snapshot is older than this.
    pub catalog_refresh_interval: Duration,
    /// Keep serving a cached snapshot after failed reloads for this long.
    pub catalog_max_staleness: Duration,
    /// Terminated sessions stay queryable for this long before
    /// [`AdaptiveEngine::expire_idle_sessions`] evicts them.
    pub session_retention: Duration,
    /// Base seed for per-session random streams. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            exam: ExamConfig::default(),
            exposure: ExposureConfig::default(),
            calibration: CalibrationConfig::default(),
            catalog_refresh_interval: Duration::from_secs(300),
            catalog_max_staleness: Duration::from_secs(3600),
            session_retention: Duration::from_secs(3600),
            seed: None,
        }
    }
}

struct CachedCatalog {
    snapshot: Arc<CatalogSnapshot>,
    fetched_at: Instant,
}

struct SessionEntry {
    selector: ItemSelector,
    session: Mutex<Session>,
}

/// The adaptive engine.
pub struct AdaptiveEngine {
    catalog_repo: Arc<dyn ItemCatalogRepository>,
    response_log: Arc<dyn ResponseLogRepository>,
    exposure: ExposureController,
    calibration: CalibrationMonitor,
    exam: Arc<ExamConfig>,
    config: EngineConfig,
    catalog: RwLock<Option<CachedCatalog>>,
    sessions: RwLock<HashMap<SessionId, Arc<SessionEntry>>>,
    seed_counter: AtomicU64,
}

impl AdaptiveEngine {
    pub fn new(
        catalog_repo: Arc<dyn ItemCatalogRepository>,
        response_log: Arc<dyn ResponseLogRepository>,
        config: EngineConfig,
    ) -> Self {
        Self {
            catalog_repo,
            response_log,
            exposure: ExposureController::new(config.exposure.clone()),
            calibration: CalibrationMonitor::new(config.calibration.clone()),
            exam: Arc::new(config.exam.clone()),
            config,
            catalog: RwLock::new(None),
            sessions: RwLock::new(HashMap::new()),
            seed_counter: AtomicU64::new(0),
        }
    }

    /// Replace the exposure counters, typically with ones restored through
    /// [`ExposureController::from_state`].
    pub fn with_exposure(mut self, exposure: ExposureController) -> Self {
        self.exposure = exposure;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared exposure counters.
    pub fn exposure(&self) -> &ExposureController {
        &self.exposure
    }

    /// Start a session under the engine's default exam settings.
    pub async fn start_session(&self, examinee_id: &str) -> Result<SessionId, EngineError> {
        self.open_session(examinee_id, Arc::clone(&self.exam)).await
    }

    /// Start a session under exam-specific settings.
    pub async fn start_session_with(
        &self,
        examinee_id: &str,
        exam: ExamConfig,
    ) -> Result<SessionId, EngineError> {
        exam.validate().map_err(EngineError::InvalidInput)?;
        self.open_session(examinee_id, Arc::new(exam)).await
    }

    async fn open_session(
        &self,
        examinee_id: &str,
        exam: Arc<ExamConfig>,
    ) -> Result<SessionId, EngineError> {
        if examinee_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("examinee id is empty".into()));
        }
        let catalog = self.current_catalog().await?;

        let id = Uuid::new_v4();
        let selector = ItemSelector::new(exam.selection.clone());
        let session = Session::new(
            id,
            examinee_id,
            exam,
            Arc::clone(&catalog),
            self.next_seed(),
            Utc::now(),
        );
        self.exposure.record_session_started();

        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                Arc::new(SessionEntry {
                    selector,
                    session: Mutex::new(session),
                }),
            );

        tracing::info!(
            session = %id,
            examinee = examinee_id,
            catalog_version = %catalog.version,
            "session started"
        );
        Ok(id)
    }

    /// Next item for the session, or its termination signal.
    pub async fn next_item(&self, session_id: SessionId) -> Result<NextItem, EngineError> {
        self.next_item_at(session_id, Utc::now()).await
    }

    pub async fn next_item_at(
        &self,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<NextItem, EngineError> {
        let entry = self.entry(session_id)?;
        let mut session = entry.session.lock().await;
        if session.is_idle(now) {
            session.abandon(AbandonCause::IdleTimeout, now);
        }
        Ok(session.next_item(&entry.selector, &self.exposure, now))
    }

    /// Record a response to the session's pending item.
    ///
    /// The response is written to the log before the session accepts it; if
    /// the write fails the session is unchanged and the call may be retried.
    pub async fn submit_response(
        &self,
        session_id: SessionId,
        item_id: &str,
        is_correct: bool,
        response_time_ms: i64,
    ) -> Result<SubmitOutcome, EngineError> {
        self.submit_response_at(session_id, item_id, is_correct, response_time_ms, Utc::now())
            .await
    }

    pub async fn submit_response_at(
        &self,
        session_id: SessionId,
        item_id: &str,
        is_correct: bool,
        response_time_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome, EngineError> {
        let entry = self.entry(session_id)?;
        let mut session = entry.session.lock().await;
        if session.is_idle(now) {
            session.abandon(AbandonCause::IdleTimeout, now);
        }

        let pending = session.prepare_response(item_id, is_correct, response_time_ms, now)?;
        self.response_log
            .append(&pending.response)
            .await
            .map_err(EngineError::Storage)?;

        let outcome = session.commit_response(pending, now);
        tracing::debug!(
            session = %session_id,
            item = item_id,
            correct = is_correct,
            theta = outcome.theta,
            se = outcome.standard_error,
            "response recorded"
        );
        Ok(outcome)
    }

    /// Scaled score of a completed session.
    pub async fn get_result(&self, session_id: SessionId) -> Result<ScoreResult, EngineError> {
        let entry = self.entry(session_id)?;
        let session = entry.session.lock().await;
        match session.termination() {
            Some(reason) if reason.is_complete() => {
                let scoring = ScoringEngine::new(session.config().scoring.clone());
                Ok(scoring.score(session.theta(), session.standard_error()))
            }
            Some(reason) => Err(EngineError::ResultUnavailable {
                session_id,
                reason: reason.to_string(),
            }),
            None => Err(EngineError::ResultUnavailable {
                session_id,
                reason: "session is still in progress".into(),
            }),
        }
    }

    /// Correct count, per-area breakdown and precision, in any state.
    pub async fn session_report(&self, session_id: SessionId) -> Result<SessionReport, EngineError> {
        let entry = self.entry(session_id)?;
        let session = entry.session.lock().await;
        Ok(session.report())
    }

    /// Cancel a session. Returns `false` if it had already terminated.
    pub async fn abandon_session(&self, session_id: SessionId) -> Result<bool, EngineError> {
        let entry = self.entry(session_id)?;
        let mut session = entry.session.lock().await;
        Ok(session.abandon(AbandonCause::Cancelled, Utc::now()))
    }

    /// Abandon every session idle past its timeout, then evict sessions
    /// that terminated longer than `session_retention` ago. Returns how many
    /// were abandoned.
    pub async fn expire_idle_sessions(&self, now: DateTime<Utc>) -> usize {
        let entries: Vec<(SessionId, Arc<SessionEntry>)> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(entry)))
            .collect();
        let retention = chrono::Duration::from_std(self.config.session_retention)
            .unwrap_or(chrono::Duration::MAX);

        let mut expired = 0;
        let mut evictable = Vec::new();
        for (id, entry) in entries {
            let mut session = entry.session.lock().await;
            if session.is_idle(now) && session.abandon(AbandonCause::IdleTimeout, now) {
                expired += 1;
            }
            if session
                .completed_at()
                .is_some_and(|at| now - at >= retention)
            {
                evictable.push(id);
            }
        }
        if expired > 0 {
            tracing::info!(expired, "abandoned idle sessions");
        }

        if !evictable.is_empty() {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            for id in &evictable {
                sessions.remove(id);
            }
            tracing::debug!(evicted = evictable.len(), "evicted terminated sessions");
        }
        expired
    }

    pub async fn session_snapshot(
        &self,
        session_id: SessionId,
    ) -> Result<SessionSnapshot, EngineError> {
        let entry = self.entry(session_id)?;
        let session = entry.session.lock().await;
        Ok(session.snapshot())
    }

    /// Drop a session from memory, returning its final state.
    pub async fn remove_session(
        &self,
        session_id: SessionId,
    ) -> Result<SessionSnapshot, EngineError> {
        let entry = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session_id)
            .ok_or(EngineError::UnknownSession(session_id))?;
        let session = entry.session.lock().await;
        Ok(session.snapshot())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Compare catalog parameters against logged responses in `window`.
    pub async fn run_calibration(
        &self,
        window: &BatchWindow,
    ) -> Result<CalibrationReport, EngineError> {
        let catalog = self
            .catalog_repo
            .load_snapshot()
            .await
            .map_err(|e| EngineError::CatalogUnavailable(format!("{e:#}")))?;
        let responses = self
            .response_log
            .snapshot(window)
            .await
            .map_err(EngineError::Storage)?;
        Ok(self.calibration.validate(catalog.items(), &responses))
    }

    /// The catalog snapshot new sessions are pinned to, reloading it when
    /// the cache is due.
    pub async fn current_catalog(&self) -> Result<Arc<CatalogSnapshot>, EngineError> {
        let cached = self
            .catalog
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|c| (Arc::clone(&c.snapshot), c.fetched_at));

        if let Some((snapshot, fetched_at)) = &cached {
            if fetched_at.elapsed() < self.config.catalog_refresh_interval {
                return Ok(Arc::clone(snapshot));
            }
        }

        match self.catalog_repo.load_snapshot().await {
            Ok(snapshot) => {
                if snapshot.selectable_count() == 0 {
                    return Err(EngineError::CatalogUnavailable(format!(
                        "catalog '{}' has no selectable items",
                        snapshot.id
                    )));
                }
                let snapshot = Arc::new(snapshot);
                tracing::debug!(
                    source = self.catalog_repo.name(),
                    version = %snapshot.version,
                    items = snapshot.len(),
                    "catalog loaded"
                );
                *self.catalog.write().unwrap_or_else(|e| e.into_inner()) = Some(CachedCatalog {
                    snapshot: Arc::clone(&snapshot),
                    fetched_at: Instant::now(),
                });
                Ok(snapshot)
            }
            Err(e) => match cached {
                Some((snapshot, fetched_at))
                    if fetched_at.elapsed() <= self.config.catalog_max_staleness =>
                {
                    tracing::warn!(
                        source = self.catalog_repo.name(),
                        "catalog reload failed, serving cached snapshot: {e:#}"
                    );
                    Ok(snapshot)
                }
                _ => Err(EngineError::CatalogUnavailable(format!("{e:#}"))),
            },
        }
    }

    fn entry(&self, session_id: SessionId) -> Result<Arc<SessionEntry>, EngineError> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&session_id)
            .cloned()
            .ok_or(EngineError::UnknownSession(session_id))
    }

    fn next_seed(&self) -> u64 {
        let n = self.seed_counter.fetch_add(1, Ordering::Relaxed);
        match self.config.seed {
            Some(base) => base.wrapping_add(n),
            None => rand::random(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryCatalog, InMemoryResponseLog};
    use crate::model::{ContentArea, Item};
    use crate::session::{SessionStatus, TerminationReason};

    fn items(n: usize) -> Vec<Item> {
        (0..n)
            .map(|i| Item {
                id: format!("q{i:03}"),
                content_area: ContentArea::ALL[i % 5],
                difficulty: -2.5 + 5.0 * i as f64 / n as f64,
                discrimination: 1.4,
                guessing: 0.2,
                active: true,
                exposure_count: 0,
                infit: None,
                outfit: None,
            })
            .collect()
    }

    fn engine_with(
        catalog: Arc<InMemoryCatalog>,
        log: Arc<InMemoryResponseLog>,
    ) -> AdaptiveEngine {
        AdaptiveEngine::new(
            catalog,
            log,
            EngineConfig {
                seed: Some(17),
                ..Default::default()
            },
        )
    }

    fn engine(n: usize) -> (AdaptiveEngine, Arc<InMemoryResponseLog>) {
        let log = Arc::new(InMemoryResponseLog::new());
        let catalog = Arc::new(InMemoryCatalog::from_items(items(n)));
        (engine_with(catalog, Arc::clone(&log)), log)
    }

    async fn serve(engine: &AdaptiveEngine, id: SessionId) -> Item {
        match engine.next_item(id).await.unwrap() {
            NextItem::Item(item) => item,
            NextItem::Terminated(sig) => panic!("terminated early: {}", sig.reason),
        }
    }

    #[tokio::test]
    async fn full_session_completes_and_scores() {
        let (engine, log) = engine(120);
        let id = engine.start_session("ana").await.unwrap();
        let mut done = false;
        let mut n = 0;
        while !done {
            let item = serve(&engine, id).await;
            // Answer correctly below difficulty 0.5.
            let outcome = engine
                .submit_response(id, &item.id, item.difficulty < 0.5, 20_000)
                .await
                .unwrap();
            done = outcome.done;
            n += 1;
            assert!(n <= 30);
        }
        let snapshot = engine.session_snapshot(id).await.unwrap();
        assert_eq!(snapshot.status, SessionStatus::Terminated);
        assert_eq!(log.len(), n);

        let result = engine.get_result(id).await.unwrap();
        assert!(result.scaled_score <= 1000);
        assert!(result.standard_error.is_finite());
    }

    #[tokio::test]
    async fn empty_catalog_is_unavailable() {
        let (engine, _) = engine(0);
        let err = engine.start_session("ana").await.unwrap_err();
        assert!(err.is_fatal(), "got {err}");
    }

    #[tokio::test]
    async fn failed_reload_keeps_recent_snapshot() {
        let log = Arc::new(InMemoryResponseLog::new());
        let catalog = Arc::new(InMemoryCatalog::from_items(items(20)));
        let engine = AdaptiveEngine::new(
            catalog.clone(),
            log,
            EngineConfig {
                catalog_refresh_interval: Duration::ZERO,
                ..Default::default()
            },
        );
        engine.start_session("a").await.unwrap();
        catalog.set_failing(true);
        engine.start_session("b").await.unwrap();
        assert_eq!(catalog.load_count(), 2);
    }

    #[tokio::test]
    async fn failed_first_load_is_unavailable() {
        let log = Arc::new(InMemoryResponseLog::new());
        let catalog = Arc::new(InMemoryCatalog::from_items(items(20)));
        catalog.set_failing(true);
        let engine = engine_with(catalog, log);
        assert!(matches!(
            engine.start_session("a").await,
            Err(EngineError::CatalogUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_snapshot_is_not_served() {
        let log = Arc::new(InMemoryResponseLog::new());
        let catalog = Arc::new(InMemoryCatalog::from_items(items(20)));
        let engine = AdaptiveEngine::new(
            catalog.clone(),
            log,
            EngineConfig {
                catalog_refresh_interval: Duration::from_secs(60),
                catalog_max_staleness: Duration::from_secs(600),
                ..Default::default()
            },
        );
        engine.start_session("a").await.unwrap();
        catalog.set_failing(true);
        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(engine.start_session("b").await.is_ok());
        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(matches!(
            engine.start_session("c").await,
            Err(EngineError::CatalogUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn storage_failure_leaves_session_unchanged() {
        let log = Arc::new(InMemoryResponseLog::new());
        let catalog = Arc::new(InMemoryCatalog::from_items(items(40)));
        let engine = engine_with(catalog, Arc::clone(&log));
        let id = engine.start_session("ana").await.unwrap();
        let item = serve(&engine, id).await;

        log.set_failing(true);
        let err = engine
            .submit_response(id, &item.id, true, 1000)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
        let snapshot = engine.session_snapshot(id).await.unwrap();
        assert!(snapshot.administered.is_empty());
        assert_eq!(snapshot.pending_item.as_deref(), Some(item.id.as_str()));

        log.set_failing(false);
        engine.submit_response(id, &item.id, true, 1000).await.unwrap();
        assert_eq!(engine.session_snapshot(id).await.unwrap().administered.len(), 1);
    }

    #[tokio::test]
    async fn result_requires_completion() {
        let (engine, _) = engine(40);
        let id = engine.start_session("ana").await.unwrap();
        assert!(matches!(
            engine.get_result(id).await,
            Err(EngineError::ResultUnavailable { .. })
        ));
        assert!(engine.abandon_session(id).await.unwrap());
        assert!(!engine.abandon_session(id).await.unwrap());
        let err = engine.get_result(id).await.unwrap_err();
        assert!(err.to_string().contains("abandoned"));
    }

    #[tokio::test]
    async fn idle_sessions_expire() {
        let (engine, _) = engine(40);
        let id = engine.start_session("ana").await.unwrap();
        serve(&engine, id).await;
        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(engine.expire_idle_sessions(later).await, 1);
        let snapshot = engine.session_snapshot(id).await.unwrap();
        assert_eq!(
            snapshot.termination,
            Some(TerminationReason::Abandoned {
                cause: AbandonCause::IdleTimeout
            })
        );
        assert_eq!(engine.expire_idle_sessions(later).await, 0);
        assert_eq!(engine.session_count(), 1);
    }

    #[tokio::test]
    async fn terminated_sessions_are_evicted_after_retention() {
        let log = Arc::new(InMemoryResponseLog::new());
        let catalog = Arc::new(InMemoryCatalog::from_items(items(40)));
        let engine = AdaptiveEngine::new(
            catalog,
            log,
            EngineConfig {
                session_retention: Duration::from_secs(600),
                ..Default::default()
            },
        );
        let idle = engine.start_session("idle").await.unwrap();
        serve(&engine, idle).await;
        let cancelled = engine.start_session("cancelled").await.unwrap();
        engine.abandon_session(cancelled).await.unwrap();
        let patient = ExamConfig {
            idle_timeout_secs: 3 * 3600,
            ..Default::default()
        };
        let live = engine.start_session_with("live", patient).await.unwrap();
        assert_eq!(engine.session_count(), 3);

        // An hour on: `idle` is abandoned now, `cancelled` is past retention.
        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(engine.expire_idle_sessions(later).await, 1);
        assert_eq!(engine.session_count(), 2);
        assert!(engine.session_snapshot(cancelled).await.is_err());

        // Once `idle` has been terminated for the retention window it goes too.
        let much_later = later + chrono::Duration::minutes(11);
        assert_eq!(engine.expire_idle_sessions(much_later).await, 0);
        assert_eq!(engine.session_count(), 1);
        assert!(engine.session_snapshot(idle).await.is_err());
        assert!(engine.session_snapshot(live).await.is_ok());
    }

    #[tokio::test]
    async fn exposure_state_carries_over_to_a_new_engine() {
        let (first, _) = engine(40);
        for n in 0..5 {
            let id = first.start_session(&format!("e{n}")).await.unwrap();
            serve(&first, id).await;
        }
        let state = first.exposure().state();
        assert_eq!(state.sessions, 5);

        let (second, _) = engine(40);
        let exposure_config = second.config().exposure.clone();
        let second = second.with_exposure(ExposureController::from_state(
            exposure_config,
            state,
        ));
        assert_eq!(second.exposure().sessions(), 5);
        assert_eq!(second.exposure().snapshot(), first.exposure().snapshot());
        second.start_session("e5").await.unwrap();
        assert_eq!(second.exposure().sessions(), 6);
    }

    #[tokio::test]
    async fn unknown_session_is_input_error() {
        let (engine, _) = engine(10);
        let err = engine.next_item(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_input_error());
    }

    #[tokio::test]
    async fn invalid_exam_config_rejected() {
        let (engine, _) = engine(10);
        let exam = ExamConfig {
            min_items: 50,
            max_items: 5,
            ..Default::default()
        };
        assert!(matches!(
            engine.start_session_with("ana", exam).await,
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn remove_session_returns_final_state() {
        let (engine, _) = engine(10);
        let id = engine.start_session("ana").await.unwrap();
        assert_eq!(engine.session_count(), 1);
        let snapshot = engine.remove_session(id).await.unwrap();
        assert_eq!(snapshot.id, id);
        assert_eq!(engine.session_count(), 0);
        assert!(engine.session_snapshot(id).await.is_err());
    }
}
