//! Error types shared by the sampler, the evaluation pool and the sample catalog.

use std::path::PathBuf;

use thiserror::Error;

use crate::controller::RunState;

/// Failure reported by an [`ObjectiveEvaluator`](crate::core::ObjectiveEvaluator).
///
/// A `Domain` failure means the parameter vector lies outside the region where the
/// objective is defined. The sampler recovers from it by rejecting the proposal and
/// counting it as *offboard*. A `Fatal` failure aborts the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObjectiveError {
    #[error("parameter vector lies outside the objective's valid domain")]
    Domain,
    #[error("objective failed: {0}")]
    Fatal(String),
}

impl ObjectiveError {
    /// Whether the sampler can keep going after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ObjectiveError::Domain)
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "csv")]
    #[error("catalog CSV encoding failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("catalog is corrupt: {0}")]
    Corrupt(String),

    #[error("row {sample_id} has {found} {what}, expected {expected}")]
    Shape {
        sample_id: u64,
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("another writer is appending to this catalog")]
    ConcurrentAppend,

    #[error("catalog {0} is locked by another writer")]
    Locked(PathBuf),
}

#[derive(Debug, Error)]
pub enum EnsembleError {
    /// The ensemble or sampler configuration can never be sampled from.
    #[error("invalid ensemble configuration: {0}")]
    InvariantViolation(String),

    #[error("objective failed for walker {walker}: {reason}")]
    FatalEvaluation { walker: usize, reason: String },

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("operation not allowed in run state {0:?}")]
    InvalidState(RunState),

    #[error("could not build the evaluation thread pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}
