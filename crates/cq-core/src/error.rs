//! Error types for the commit queue core.

use cq_state::StorageError;
use thiserror::Error;

use crate::ids::{ClId, RunId};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type CqResult<T> = std::result::Result<T, CqError>;

#[derive(Error, Debug)]
pub enum CqError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("CL not found: {clid}")]
    ClNotFound { clid: ClId },

    #[error("run not found: {run_id}")]
    RunNotFound { run_id: RunId },

    /// Data changed between being read for a decision and being acted on.
    #[error("stale data: {0}")]
    StaleData(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A mutation callback returned `MutateOutcome::Fail`.
    #[error("mutation callback failed: {0}")]
    Callback(#[source] BoxError),

    /// An external collaborator (tree status, submitter, purger) failed.
    #[error("{service} unavailable: {message}")]
    External { service: &'static str, message: String },

    #[error("delivery of {target} failed: {message}")]
    Delivery { target: String, message: String },
}

impl CqError {
    /// Whether the failed operation may succeed if retried later.
    pub fn is_transient(&self) -> bool {
        match self {
            CqError::Storage(e) => e.is_transient(),
            CqError::StaleData(_) | CqError::External { .. } | CqError::Delivery { .. } => true,
            CqError::ClNotFound { .. }
            | CqError::RunNotFound { .. }
            | CqError::Config(_)
            | CqError::Callback(_) => false,
        }
    }
}

impl From<serde_json::Error> for CqError {
    fn from(err: serde_json::Error) -> Self {
        CqError::Storage(StorageError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_are_transient() {
        let err = CqError::from(StorageError::Conflict { key: "cl/1".into() });
        assert!(err.is_transient());
        assert!(!CqError::ClNotFound { clid: ClId(1) }.is_transient());
        assert!(CqError::StaleData("eversion moved".into()).is_transient());
    }
}
