//! Removing triggers from CLs that cannot be processed.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::instrument;

use crate::changelist::{MutateOutcome, Mutator};
use crate::error::CqResult;
use crate::ids::ClId;
use crate::metrics::METRICS;
use crate::obs;
use crate::prjmanager::pcl::PurgeReason;

#[async_trait]
pub trait ClPurger: Send + Sync {
    /// Tell the CL's author why it cannot proceed and drop its trigger.
    async fn purge(&self, project: &str, clid: ClId, reasons: &[PurgeReason]) -> CqResult<()>;
}

/// Purger that clears the trigger in the stored snapshot.
#[derive(Clone)]
pub struct MutatorPurger {
    mutator: Mutator,
}

impl MutatorPurger {
    pub fn new(mutator: Mutator) -> Self {
        Self { mutator }
    }
}

#[async_trait]
impl ClPurger for MutatorPurger {
    #[instrument(skip(self, reasons), fields(project = %project, clid = %clid))]
    async fn purge(&self, project: &str, clid: ClId, reasons: &[PurgeReason]) -> CqResult<()> {
        let messages: Vec<String> = reasons.iter().map(PurgeReason::message).collect();
        self.mutator
            .update(project, clid, |cl| match cl.snapshot.as_mut() {
                Some(snapshot) if snapshot.trigger.is_some() => {
                    snapshot.trigger = None;
                    cl.purge_messages = messages.clone();
                    MutateOutcome::Mutate
                }
                _ => MutateOutcome::Skip,
            })
            .await?;
        for message in &messages {
            obs::emit_cl_purged(project, clid, message);
        }
        METRICS.inc_cls_purged();
        Ok(())
    }
}

/// Purger that only records its calls (testing).
#[derive(Debug, Default)]
pub struct RecordingPurger {
    calls: Mutex<Vec<(ClId, Vec<PurgeReason>)>>,
}

impl RecordingPurger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(ClId, Vec<PurgeReason>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClPurger for RecordingPurger {
    async fn purge(&self, _project: &str, clid: ClId, reasons: &[PurgeReason]) -> CqResult<()> {
        self.calls.lock().unwrap().push((clid, reasons.to_vec()));
        Ok(())
    }
}
