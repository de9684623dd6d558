//! The only path through which a CL is created or modified.
//!
//! Every committed mutation bumps `eversion` by one, stamps `update_time`
//! with the transaction time and, in the same transaction, records a
//! `ClUpdated` outbox task addressed to the affected projects and Runs.
//!
//! ```ignore
//! let cl = mutator
//!     .update("chromium", clid, |cl| {
//!         if cl.deleted {
//!             return MutateOutcome::Skip;
//!         }
//!         cl.deleted = true;
//!         MutateOutcome::Mutate
//!     })
//!     .await?;
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use cq_state::{conflict_backoff, Datastore, Transaction, MAX_TXN_ATTEMPTS};
use tracing::{debug, instrument};

use crate::changelist::model::{Cl, ClMap};
use crate::error::{BoxError, CqError, CqResult};
use crate::ids::{ClId, ExternalId, RunId};
use crate::metrics::METRICS;
use crate::obs;
use crate::tasks::{ClUpdatedEvent, Task};

/// Sequence CL IDs are allocated from.
pub const CL_ID_SEQUENCE: &str = "cl";

/// What a mutation callback decided.
///
/// Callbacks may run more than once when a transaction is retried, so they
/// must decide from the CL they are given, not from outside state that a
/// previous attempt changed.
#[derive(Debug)]
pub enum MutateOutcome {
    /// Commit the changes made to the CL.
    Mutate,
    /// Nothing to do: write nothing, return the CL as stored (or `None`
    /// when it does not exist yet).
    Skip,
    /// Abort with an error; nothing is written.
    Fail(BoxError),
}

impl MutateOutcome {
    pub fn fail(err: impl Into<BoxError>) -> Self {
        MutateOutcome::Fail(err.into())
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Protected {
    id: ClId,
    external_id: ExternalId,
    eversion: i64,
    update_time: DateTime<Utc>,
}

impl Protected {
    fn of(cl: &Cl) -> Self {
        Self {
            id: cl.id,
            external_id: cl.external_id.clone(),
            eversion: cl.eversion,
            update_time: cl.update_time,
        }
    }
}

/// An in-progress mutation of one CL, bound to the transaction it was
/// begun in.
///
/// Change [`ClMutation::cl`] freely except for its identity and version
/// fields, then hand the mutation back with [`ClMutation::finalize`] or
/// [`Mutator::finalize_batch`] in the same transaction.
#[derive(Debug)]
pub struct ClMutation {
    pub cl: Cl,
    project: String,
    prior_project: Option<String>,
    txn_id: u64,
    loaded: Option<Cl>,
    protected: Protected,
}

impl ClMutation {
    fn existing(project: &str, txn_id: u64, cl: Cl) -> Self {
        Self {
            prior_project: cl.snapshot.as_ref().map(|s| s.project.clone()),
            project: project.to_string(),
            txn_id,
            protected: Protected::of(&cl),
            loaded: Some(cl.clone()),
            cl,
        }
    }

    fn new_cl(project: &str, txn_id: u64, id: ClId, external_id: ExternalId) -> Self {
        let cl = Cl {
            id,
            external_id,
            eversion: 0,
            update_time: DateTime::<Utc>::default(),
            snapshot: None,
            applicable_config: None,
            deleted: false,
            incomplete_runs: Vec::new(),
            purge_messages: Vec::new(),
        };
        Self {
            project: project.to_string(),
            prior_project: None,
            txn_id,
            protected: Protected::of(&cl),
            loaded: None,
            cl,
        }
    }

    /// True if the CL does not exist in the store yet.
    pub fn is_new(&self) -> bool {
        self.loaded.is_none()
    }

    /// The CL as it was when the mutation began.
    fn into_loaded(self) -> Option<Cl> {
        self.loaded
    }

    /// Projects to notify: the current one, plus the one that owned the CL
    /// before if it differs.
    fn notify_projects(&self) -> Vec<String> {
        let mut projects = vec![self.project.clone()];
        if let Some(prior) = &self.prior_project {
            if !prior.is_empty() && prior != &self.project {
                projects.push(prior.clone());
            }
        }
        projects
    }

    fn finish(self, txn: &mut Transaction) -> CqResult<(Cl, Vec<String>)> {
        if self.txn_id != txn.id() {
            panic!(
                "mutation of CL {} begun in transaction {} but finalized in transaction {}",
                self.cl.id,
                self.txn_id,
                txn.id()
            );
        }
        let after = Protected::of(&self.cl);
        if after != self.protected {
            panic!(
                "protected fields of CL {} modified by mutation: {:?} -> {:?}",
                self.protected.id, self.protected, after
            );
        }
        let projects = self.notify_projects();
        let mut cl = self.cl;
        cl.eversion += 1;
        cl.update_time = txn.now();
        cl.incomplete_runs.sort();
        cl.incomplete_runs.dedup();
        txn.put(&cl)?;
        Ok((cl, projects))
    }

    /// Write the CL into `txn` and record its notification.
    ///
    /// # Panics
    ///
    /// Panics if `txn` is not the transaction the mutation was begun in, or
    /// if the CL's ID, external ID, `eversion` or `update_time` was changed.
    pub fn finalize(self, txn: &mut Transaction) -> CqResult<Cl> {
        let (cl, projects) = self.finish(txn)?;
        txn.enqueue(
            None,
            &Task::ClUpdated {
                projects,
                runs: cl.incomplete_runs.clone(),
                event: ClUpdatedEvent {
                    clid: cl.id,
                    eversion: cl.eversion,
                },
            },
        )?;
        Ok(cl)
    }
}

#[derive(Clone)]
pub struct Mutator {
    store: Datastore,
}

impl Mutator {
    pub fn new(store: Datastore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Datastore {
        &self.store
    }

    /// Find or create the CL for `eid`, apply `callback` and commit.
    ///
    /// Returns `Ok(None)` when the CL did not exist and the callback
    /// returned [`MutateOutcome::Skip`]; nothing is created in that case.
    /// Concurrent upserts of the same new identity create a single CL.
    #[instrument(skip(self, callback), fields(project = %project, external_id = %eid))]
    pub async fn upsert<F>(
        &self,
        project: &str,
        eid: &ExternalId,
        mut callback: F,
    ) -> CqResult<Option<Cl>>
    where
        F: FnMut(&mut Cl) -> MutateOutcome + Send,
    {
        if let Some(map) = self.store.get::<ClMap>(eid.as_str()).await? {
            return self.update(project, map.clid, callback).await.map(Some);
        }

        let mut fresh_id: Option<ClId> = None;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut txn = self.store.begin();
            let mut mutation = match txn.get::<ClMap>(eid.as_str()).await? {
                Some(map) => self.begin(&mut txn, project, map.clid).await?,
                None => {
                    let id = match fresh_id {
                        Some(id) => id,
                        None => {
                            let id = ClId(self.store.allocate_id(CL_ID_SEQUENCE).await?);
                            fresh_id = Some(id);
                            id
                        }
                    };
                    txn.put(&ClMap {
                        external_id: eid.clone(),
                        clid: id,
                    })?;
                    ClMutation::new_cl(project, txn.id(), id, eid.clone())
                }
            };

            match callback(&mut mutation.cl) {
                MutateOutcome::Mutate => {}
                MutateOutcome::Skip => return Ok(mutation.into_loaded()),
                MutateOutcome::Fail(err) => return Err(CqError::Callback(err)),
            }
            let cl = mutation.finalize(&mut txn)?;
            match txn.commit().await {
                Ok(()) => {
                    METRICS.inc_cl_mutations();
                    obs::emit_cl_mutated(project, cl.id, cl.eversion);
                    return Ok(Some(cl));
                }
                Err(e) if e.is_conflict() && attempt < MAX_TXN_ATTEMPTS => {
                    debug!(attempt, error = %e, "upsert conflicted, retrying");
                    conflict_backoff(attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Apply `callback` to an existing CL and commit.
    ///
    /// With [`MutateOutcome::Skip`] the CL is returned as stored.
    #[instrument(skip(self, callback), fields(project = %project, clid = %id))]
    pub async fn update<F>(&self, project: &str, id: ClId, mut callback: F) -> CqResult<Cl>
    where
        F: FnMut(&mut Cl) -> MutateOutcome + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut txn = self.store.begin();
            let mut mutation = self.begin(&mut txn, project, id).await?;
            match callback(&mut mutation.cl) {
                MutateOutcome::Mutate => {}
                MutateOutcome::Skip => {
                    return mutation
                        .into_loaded()
                        .ok_or(CqError::ClNotFound { clid: id })
                }
                MutateOutcome::Fail(err) => return Err(CqError::Callback(err)),
            }
            let cl = mutation.finalize(&mut txn)?;
            match txn.commit().await {
                Ok(()) => {
                    METRICS.inc_cl_mutations();
                    obs::emit_cl_mutated(project, cl.id, cl.eversion);
                    return Ok(cl);
                }
                Err(e) if e.is_conflict() && attempt < MAX_TXN_ATTEMPTS => {
                    debug!(attempt, error = %e, "update conflicted, retrying");
                    conflict_backoff(attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Start mutating an existing CL inside the caller's transaction.
    pub async fn begin(
        &self,
        txn: &mut Transaction,
        project: &str,
        id: ClId,
    ) -> CqResult<ClMutation> {
        let cl = txn
            .get::<Cl>(&id.to_string())
            .await?
            .ok_or(CqError::ClNotFound { clid: id })?;
        Ok(ClMutation::existing(project, txn.id(), cl))
    }

    /// [`Mutator::begin`] for several CLs, in the given order.
    pub async fn begin_batch(
        &self,
        txn: &mut Transaction,
        project: &str,
        ids: &[ClId],
    ) -> CqResult<Vec<ClMutation>> {
        let mut muts = Vec::with_capacity(ids.len());
        for id in ids {
            muts.push(self.begin(txn, project, *id).await?);
        }
        Ok(muts)
    }

    /// Finalize several mutations, coalescing their notifications into a
    /// single outbox task keyed by project and by Run.
    ///
    /// # Panics
    ///
    /// Same contract as [`ClMutation::finalize`].
    pub fn finalize_batch(
        &self,
        txn: &mut Transaction,
        muts: Vec<ClMutation>,
    ) -> CqResult<Vec<Cl>> {
        finalize_batch(txn, muts)
    }
}

/// See [`Mutator::finalize_batch`].
pub fn finalize_batch(txn: &mut Transaction, muts: Vec<ClMutation>) -> CqResult<Vec<Cl>> {
    let mut projects: BTreeMap<String, Vec<ClUpdatedEvent>> = BTreeMap::new();
    let mut runs: BTreeMap<RunId, Vec<ClUpdatedEvent>> = BTreeMap::new();
    let mut cls = Vec::with_capacity(muts.len());
    for mutation in muts {
        let (cl, notify) = mutation.finish(txn)?;
        let event = ClUpdatedEvent {
            clid: cl.id,
            eversion: cl.eversion,
        };
        for project in notify {
            projects.entry(project).or_default().push(event);
        }
        for run in &cl.incomplete_runs {
            runs.entry(run.clone()).or_default().push(event);
        }
        cls.push(cl);
    }
    if !cls.is_empty() {
        txn.enqueue(None, &Task::BatchClUpdated { projects, runs })?;
    }
    Ok(cls)
}
