use serde::{Deserialize, Serialize};

use crate::ids::ClId;
use crate::run::model::RunStatus;
use crate::tasks::ClUpdatedEvent;

/// Result reported by a [`Submitter`](crate::run::Submitter).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionOutcome {
    Succeeded,
    /// Worth retrying with a fresh attempt.
    TransientFailure { message: String },
    PermanentFailure { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEvent {
    Start,
    Poke,
    VerificationCompleted { passed: bool },
    ReadyForSubmission,
    SubmissionCompleted { outcome: SubmissionOutcome },
    ClUpdated { clid: ClId, eversion: i64 },
    /// Several of the Run's CLs changed in one transaction.
    ClsUpdated { events: Vec<ClUpdatedEvent> },
    Cancel { reason: String },
    /// Terminal status reported by the legacy verifier.
    ExternalFinished { status: RunStatus },
}
