//! Engine error types.
//!
//! Every fallible engine boundary returns [`EngineError`], so callers can tell
//! a retryable input mistake apart from a fatal missing catalog without
//! string matching. Estimation divergence has its own type because it never
//! crosses the engine boundary: the estimator recovers from it locally.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the adaptive engine to its callers.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The request was malformed or implausible (e.g. negative response time).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No session with this id is known to the engine.
    #[error("unknown session: {0}")]
    UnknownSession(Uuid),

    /// The item id is not part of the session's catalog snapshot.
    #[error("unknown item: {0}")]
    UnknownItem(String),

    /// A response or item request arrived after the session terminated.
    #[error("session {0} is already terminated")]
    SessionTerminated(Uuid),

    /// A score was requested for a session that did not complete normally.
    #[error("no reportable result for session {session_id}: {reason}")]
    ResultUnavailable { session_id: Uuid, reason: String },

    /// No usable item catalog: the snapshot could not be loaded, is too
    /// stale, or has no selectable items.
    #[error("item catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// The response log or another repository failed.
    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
}

impl EngineError {
    /// Returns `true` for validation failures the caller can correct and retry.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidInput(_)
                | EngineError::UnknownSession(_)
                | EngineError::UnknownItem(_)
                | EngineError::SessionTerminated(_)
        )
    }

    /// Returns `true` if no session can proceed until the condition clears.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::CatalogUnavailable(_))
    }
}

/// Why maximum likelihood estimation failed to produce a finite estimate.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EstimationDivergence {
    /// All responses correct or all incorrect: the likelihood is monotone.
    #[error("extreme response pattern ({0}); likelihood has no interior maximum")]
    ExtremePattern(&'static str),

    /// Newton-Raphson did not settle within the iteration cap.
    #[error("no convergence after {0} iterations")]
    IterationCap(u32),

    /// The iterate escaped the plausible ability range.
    #[error("theta {0:.3} escaped the divergence bound")]
    OutOfBounds(f64),

    /// Test information vanished or a step became non-finite.
    #[error("degenerate newton step")]
    Degenerate,
}
