//! Error taxonomy for the sharded CI pipeline.
//!
//! The taxonomy mirrors the failure domains of the pipeline:
//! - tranche execution failures are retried locally and only become
//!   terminal after the attempt cap
//! - a missing artifact for a successful tranche is an infrastructure
//!   fault, distinct from a failed tranche
//! - aggregation errors are fatal to the run even if every tranche passed
//! - publication errors never appear here on the fatal path; the
//!   publisher logs and swallows them

use thiserror::Error;

/// Errors produced by the sharded CI pipeline.
#[derive(Debug, Error)]
pub enum CiError {
    #[error("tranche {index} failed after {attempts} attempt(s): {message}")]
    TrancheFailed {
        index: usize,
        attempts: u32,
        message: String,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("no coverage artifact for tranche {index} despite successful run")]
    MissingArtifact { index: usize },

    #[error("coverage aggregation failed: {0}")]
    Aggregation(String),

    #[error("artifact store error: {0}")]
    Store(String),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("run superseded by a newer run on the same ref")]
    Superseded,

    #[error("invalid tranche spec: index {index} out of range for count {count}")]
    InvalidTranche { index: usize, count: usize },

    #[error("run rejected by gate: {0}")]
    Gated(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, CiError>;

impl From<reqwest::Error> for CiError {
    fn from(err: reqwest::Error) -> Self {
        CiError::Http(err.to_string())
    }
}
