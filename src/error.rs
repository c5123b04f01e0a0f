//! Error types for tracksniff.
//!
//! Only failures that stop a whole study (or the whole run) are errors. Anomalies inside a
//! capture, like a frame pointing at an unknown stream, are logged and skipped by the scanner.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Worker pool error: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The capture exists but is not a tshark JSON packet array
    #[error("Malformed capture {path}: {reason}")]
    Capture { path: PathBuf, reason: String },

    #[error("Public suffix list {path}: {reason}")]
    SuffixList { path: PathBuf, reason: String },

    /// The rule set could not be read or compiled into an engine
    #[error("Filter list error: {0}")]
    FilterList(String),
}

pub type Result<T> = std::result::Result<T, Error>;
