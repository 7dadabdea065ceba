//! Store error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the file-backed repositories and the config loader.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A file could not be read or written.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A response log line is not a valid JSON response record.
    #[error("corrupt response log {path} at line {line}: {source}")]
    CorruptLine {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// The configuration parsed but its values are inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An environment override could not be parsed.
    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}
