use cq_state::{conflict_backoff, Datastore, MAX_TXN_ATTEMPTS};
use tracing::{debug, instrument};

use crate::changelist::{finalize_batch, Mutator};
use crate::config::ProjectConfig;
use crate::error::{CqError, CqResult};
use crate::ids::RunId;
use crate::metrics::METRICS;
use crate::obs;
use crate::prjmanager::RunCandidate;
use crate::run::events::RunEvent;
use crate::run::model::{Run, RunCl, RunStatus};
use crate::tasks::Task;

/// Creates Runs atomically with the CL updates that reference them.
#[derive(Clone)]
pub struct RunCreator {
    store: Datastore,
    mutator: Mutator,
}

impl RunCreator {
    pub fn new(store: Datastore, mutator: Mutator) -> Self {
        Self { store, mutator }
    }

    /// Create the Run for `candidate`.
    ///
    /// Returns `Ok(None)` if a Run with the same ID already exists. Fails
    /// with [`CqError::StaleData`] if any CL changed since the candidate was
    /// formed.
    #[instrument(skip(self, candidate, config), fields(project = %project, cls = ?candidate.clids))]
    pub async fn create(
        &self,
        project: &str,
        candidate: &RunCandidate,
        config: &ProjectConfig,
    ) -> CqResult<Option<Run>> {
        let group = config
            .config_groups
            .get(candidate.config_group_index)
            .ok_or_else(|| {
                CqError::Config(format!(
                    "config group #{} not in project {project}",
                    candidate.config_group_index
                ))
            })?;
        let run_id = RunId::new(project, candidate.trigger_time, 1, &candidate.clids);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut txn = self.store.begin();
            if txn.get::<Run>(run_id.as_str()).await?.is_some() {
                debug!(run_id = %run_id, "run already exists");
                return Ok(None);
            }

            let mut muts = self
                .mutator
                .begin_batch(&mut txn, project, &candidate.clids)
                .await?;
            let mut run_cls = Vec::with_capacity(muts.len());
            for m in muts.iter_mut() {
                let expected = candidate
                    .cl_eversions
                    .iter()
                    .find(|(id, _)| *id == m.cl.id)
                    .map(|(_, ev)| *ev);
                if expected != Some(m.cl.eversion) {
                    return Err(CqError::StaleData(format!(
                        "CL {} is at eversion {}, run candidate saw {:?}",
                        m.cl.id, m.cl.eversion, expected
                    )));
                }
                let Some(trigger) = m.cl.trigger().cloned() else {
                    return Err(CqError::StaleData(format!(
                        "CL {} lost its trigger",
                        m.cl.id
                    )));
                };
                run_cls.push(RunCl {
                    clid: m.cl.id,
                    // Version after this transaction's own update.
                    eversion: m.cl.eversion + 1,
                    trigger,
                });
                m.cl.add_incomplete_run(&run_id);
            }
            finalize_batch(&mut txn, muts)?;

            let mut cls = candidate.clids.clone();
            cls.sort();
            let run = Run {
                id: run_id.clone(),
                project: project.to_string(),
                mode: candidate.mode,
                status: RunStatus::Pending,
                config_group_id: group.name.clone(),
                cls,
                run_cls,
                create_time: txn.now(),
                start_time: None,
                end_time: None,
                eversion: 1,
                submission: None,
                cancel_reason: None,
            };
            txn.put(&run)?;
            txn.enqueue(
                None,
                &Task::Run {
                    run_id: run_id.clone(),
                    event: RunEvent::Start,
                },
            )?;

            match txn.commit().await {
                Ok(()) => {
                    METRICS.inc_runs_created();
                    obs::emit_run_created(&run.id, run.mode.as_str(), run.cls.len());
                    return Ok(Some(run));
                }
                Err(e) if e.is_conflict() && attempt < MAX_TXN_ATTEMPTS => {
                    debug!(attempt, error = %e, "run creation conflicted, retrying");
                    conflict_backoff(attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
