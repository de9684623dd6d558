//! The boundary to whatever actually lands CLs in the repository.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cq_state::Datastore;

use crate::error::CqResult;
use crate::ids::{ClId, RunId};
use crate::run::events::{RunEvent, SubmissionOutcome};
use crate::tasks::Task;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRequest {
    pub run_id: RunId,
    /// In submission order.
    pub cls: Vec<ClId>,
    pub attempt: u32,
    pub deadline: DateTime<Utc>,
}

/// Starts a submission and reports back later with
/// [`RunEvent::SubmissionCompleted`]. The queue never waits for the report;
/// a submitter that goes silent is caught by the deadline.
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(&self, request: SubmissionRequest) -> CqResult<()>;
}

/// Reports every submission as successful without talking to anything.
#[derive(Clone)]
pub struct OfflineSubmitter {
    store: Datastore,
}

impl OfflineSubmitter {
    pub fn new(store: Datastore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Submitter for OfflineSubmitter {
    async fn submit(&self, request: SubmissionRequest) -> CqResult<()> {
        let mut txn = self.store.begin();
        txn.enqueue(
            None,
            &Task::Run {
                run_id: request.run_id,
                event: RunEvent::SubmissionCompleted {
                    outcome: SubmissionOutcome::Succeeded,
                },
            },
        )?;
        txn.commit().await?;
        Ok(())
    }
}

/// Records requests and never reports back (testing).
#[derive(Debug, Default)]
pub struct RecordingSubmitter {
    requests: Mutex<Vec<SubmissionRequest>>,
}

impl RecordingSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<SubmissionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Submitter for RecordingSubmitter {
    async fn submit(&self, request: SubmissionRequest) -> CqResult<()> {
        self.requests.lock().unwrap().push(request);
        Ok(())
    }
}
