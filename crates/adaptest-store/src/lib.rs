//! adaptest-store — file-backed repositories and configuration.
//!
//! Provides the TOML item catalog and JSON Lines response log the engine is
//! wired with outside of tests, plus the layered `adaptest.toml` loader.

pub mod config;
pub mod error;
pub mod file;

pub use config::{load_config, load_config_from, AdaptestConfig};
pub use error::StoreError;
pub use file::{JsonlResponseLog, TomlCatalog};
