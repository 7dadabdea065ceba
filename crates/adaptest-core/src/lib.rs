//! adaptest-core — IRT scoring and computerized adaptive testing engine.
//!
//! This crate holds the data model, the 3PL item response math, ability
//! estimation, exposure control, item selection, the per-examinee session
//! state machine, scaled scoring, and the offline calibration monitor. The
//! [`engine::AdaptiveEngine`] facade ties them together behind injected
//! repositories.

pub mod calibration;
pub mod config;
pub mod engine;
pub mod error;
pub mod estimator;
pub mod exposure;
pub mod irt;
pub mod memory;
pub mod model;
pub mod parser;
pub mod report;
pub mod scoring;
pub mod selector;
pub mod session;
pub mod simulate;
pub mod statistics;
pub mod traits;

pub use config::ExamConfig;
pub use engine::{AdaptiveEngine, EngineConfig};
pub use error::EngineError;
pub use model::{CatalogSnapshot, ContentArea, Item, ItemParameters, Response};
pub use report::SessionReport;
pub use session::{NextItem, SessionSnapshot, SubmitOutcome, TerminationReason};
pub use traits::{BatchWindow, ItemCatalogRepository, ResponseLogRepository};
