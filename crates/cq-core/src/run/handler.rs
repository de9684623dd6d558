//! The Run state machine.
//!
//! [`RunManager::handle`] applies one event to one Run inside a
//! transaction. Follow-up events are written to the outbox in the same
//! transaction; a submission is started only after the commit.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use cq_state::{conflict_backoff, Datastore, Transaction, MAX_TXN_ATTEMPTS};
use tracing::{debug, info, instrument, warn};

use crate::changelist::{finalize_batch, Cl, Mutator};
use crate::config::{ConfigGroup, ConfigProvider, ProjectConfig, SubmitOptions};
use crate::error::CqResult;
use crate::ids::{ClId, RunId};
use crate::metrics::METRICS;
use crate::obs::{self, RunSpan};
use crate::prjmanager::ProjectEvent;
use crate::run::events::{RunEvent, SubmissionOutcome};
use crate::run::model::{Run, RunStatus, Submission};
use crate::run::submit_queue;
use crate::run::submitter::{SubmissionRequest, Submitter};
use crate::tasks::{RunEventSink, Task};
use crate::tree::TreeClient;

#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Time a submission attempt may take before it is considered stuck.
    pub submission_duration: Duration,
    /// Delay between tree status checks while the tree is closed.
    pub tree_recheck_interval: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            submission_duration: Duration::minutes(20),
            tree_recheck_interval: Duration::minutes(1),
        }
    }
}

/// What the handler wants done after commit.
#[derive(Default)]
struct Effects {
    submit: Option<SubmissionRequest>,
}

#[derive(Clone)]
pub struct RunManager {
    store: Datastore,
    mutator: Mutator,
    configs: Arc<dyn ConfigProvider>,
    tree: Arc<dyn TreeClient>,
    submitter: Arc<dyn Submitter>,
    settings: RunSettings,
}

impl RunManager {
    pub fn new(
        store: Datastore,
        mutator: Mutator,
        configs: Arc<dyn ConfigProvider>,
        tree: Arc<dyn TreeClient>,
        submitter: Arc<dyn Submitter>,
        settings: RunSettings,
    ) -> Self {
        Self {
            store,
            mutator,
            configs,
            tree,
            submitter,
            settings,
        }
    }

    pub async fn load(&self, run_id: &RunId) -> CqResult<Option<Run>> {
        Ok(self.store.get::<Run>(run_id.as_str()).await?)
    }

    /// Apply `event` to the Run. Events for unknown Runs are dropped.
    #[instrument(skip(self, event), fields(run_id = %run_id))]
    pub async fn handle(&self, run_id: &RunId, event: RunEvent) -> CqResult<()> {
        let config = self.configs.project_config(run_id.project()).await?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut txn = self.store.begin();
            let Some(mut run) = txn.get::<Run>(run_id.as_str()).await? else {
                warn!(event = ?event, "event for unknown run dropped");
                return Ok(());
            };
            let before = run.status;
            let mut effects = Effects::default();
            let save = self
                .apply(&mut txn, &mut run, &event, config.as_ref(), &mut effects)
                .await?;
            if !save {
                return Ok(());
            }
            run.eversion += 1;
            txn.put(&run)?;
            match txn.commit().await {
                Ok(()) => {
                    {
                        let _span = RunSpan::enter(&run.id);
                        debug!(event = ?event, eversion = run.eversion, "run event applied");
                        if before != run.status {
                            obs::emit_run_status_changed(
                                &run.id,
                                before.as_str(),
                                run.status.as_str(),
                            );
                        }
                    }
                    if let Some(request) = effects.submit {
                        if let Err(e) = self.submitter.submit(request).await {
                            obs::emit_side_effect_error(&run.id, &e);
                        }
                    }
                    return Ok(());
                }
                Err(e) if e.is_conflict() && attempt < MAX_TXN_ATTEMPTS => {
                    debug!(attempt, error = %e, "run update conflicted, retrying");
                    conflict_backoff(attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Returns whether the Run (and anything else written) must be saved.
    async fn apply(
        &self,
        txn: &mut Transaction,
        run: &mut Run,
        event: &RunEvent,
        config: Option<&ProjectConfig>,
        effects: &mut Effects,
    ) -> CqResult<bool> {
        let group = config.and_then(|c| c.group_by_name(&run.config_group_id));
        let opts = config.and_then(|c| c.submit_options.as_ref());
        let now = txn.now();
        match event {
            RunEvent::Start => {
                if run.status != RunStatus::Pending {
                    return Ok(false);
                }
                run.status = RunStatus::Running;
                run.start_time = Some(now);
                Ok(true)
            }

            RunEvent::VerificationCompleted { passed } => {
                if !matches!(run.status, RunStatus::Pending | RunStatus::Running) {
                    return Ok(false);
                }
                if !passed {
                    self.end(txn, run, RunStatus::Failed).await?;
                    return Ok(true);
                }
                if run.mode.is_dry_run_class() {
                    self.end(txn, run, RunStatus::Succeeded).await?;
                    return Ok(true);
                }
                let order = self.submission_order(txn, &run.cls).await?;
                run.status = RunStatus::WaitingForSubmission;
                run.submission = Some(Submission {
                    cls: order,
                    ..Submission::default()
                });
                if !self.check_tree(run, group, now).await {
                    self.recheck_tree_later(txn, &run.id)?;
                    return Ok(true);
                }
                let waitlisted = submit_queue::try_acquire(
                    txn,
                    &run.id,
                    opts,
                    self.settings.submission_duration,
                )
                .await?;
                if !waitlisted {
                    let eta = submit_queue::burst_ready_at(txn, &run.project)
                        .await?
                        .unwrap_or(now);
                    self.schedule(txn, &run.id, eta, RunEvent::ReadyForSubmission)?;
                }
                Ok(true)
            }

            RunEvent::ReadyForSubmission => match run.status {
                s if s.is_ended() => {
                    submit_queue::release(txn, &run.id).await?;
                    Ok(true)
                }
                RunStatus::Submitting if !self.deadline_passed(run, now) => {
                    let deadline = run
                        .submission
                        .as_ref()
                        .and_then(|s| s.deadline)
                        .unwrap_or(now);
                    self.schedule(txn, &run.id, deadline, RunEvent::Poke)?;
                    Ok(true)
                }
                RunStatus::Submitting => {
                    self.acquire_and_submit(txn, run, opts, effects).await?;
                    Ok(true)
                }
                RunStatus::Running | RunStatus::WaitingForSubmission
                    if !run.mode.is_dry_run_class() =>
                {
                    let tree_open = run.submission.as_ref().is_some_and(|s| s.tree_open);
                    if !tree_open && !self.check_tree(run, group, now).await {
                        run.status = RunStatus::WaitingForSubmission;
                        self.recheck_tree_later(txn, &run.id)?;
                        return Ok(true);
                    }
                    self.acquire_and_submit(txn, run, opts, effects).await?;
                    Ok(true)
                }
                _ => Ok(false),
            },

            RunEvent::Poke => match run.status {
                RunStatus::WaitingForSubmission => {
                    let (tree_open, last_check) = run
                        .submission
                        .as_ref()
                        .map_or((false, None), |s| (s.tree_open, s.last_tree_check_time));
                    if !tree_open {
                        let due = last_check
                            .map_or(true, |t| now - t >= self.settings.tree_recheck_interval);
                        if !due {
                            return Ok(false);
                        }
                        if !self.check_tree(run, group, now).await {
                            self.recheck_tree_later(txn, &run.id)?;
                            return Ok(true);
                        }
                    }
                    self.acquire_and_submit(txn, run, opts, effects).await?;
                    Ok(true)
                }
                RunStatus::Submitting if self.deadline_passed(run, now) => {
                    self.acquire_and_submit(txn, run, opts, effects).await?;
                    Ok(true)
                }
                _ => Ok(false),
            },

            RunEvent::SubmissionCompleted { outcome } => {
                if run.status != RunStatus::Submitting {
                    if !run.status.is_ended() {
                        warn!(status = %run.status, "submission result for a run not submitting");
                    }
                    return Ok(false);
                }
                match outcome {
                    SubmissionOutcome::Succeeded => {
                        if let Some(s) = run.submission.as_mut() {
                            s.submitted_cls = s.cls.clone();
                        }
                        self.end(txn, run, RunStatus::Succeeded).await?;
                    }
                    SubmissionOutcome::TransientFailure { message } => {
                        info!(message = %message, "transient submission failure; retrying");
                        if let Some(s) = run.submission.as_mut() {
                            s.deadline = Some(now);
                        }
                        self.schedule(txn, &run.id, now, RunEvent::ReadyForSubmission)?;
                    }
                    SubmissionOutcome::PermanentFailure { message } => {
                        warn!(message = %message, "submission failed");
                        if let Some(s) = run.submission.as_mut() {
                            s.failed_cls = s.cls.clone();
                        }
                        self.end(txn, run, RunStatus::Failed).await?;
                    }
                }
                Ok(true)
            }

            RunEvent::ClUpdated { clid, .. } => {
                self.cancel_if_untriggered(txn, run, &[*clid]).await
            }

            RunEvent::ClsUpdated { events } => {
                let clids: Vec<ClId> = events.iter().map(|e| e.clid).collect();
                self.cancel_if_untriggered(txn, run, &clids).await
            }

            RunEvent::Cancel { reason } => {
                if run.status.is_ended() || run.status == RunStatus::Submitting {
                    return Ok(false);
                }
                run.cancel_reason = Some(reason.clone());
                self.end(txn, run, RunStatus::Cancelled).await?;
                Ok(true)
            }

            RunEvent::ExternalFinished { status } => {
                if run.status.is_ended() {
                    if *status != run.status {
                        warn!(
                            native = %run.status,
                            reported = %status,
                            "legacy verifier disagrees with final status; keeping native"
                        );
                    }
                    return Ok(false);
                }
                if !status.is_ended() {
                    warn!(reported = %status, "legacy verifier reported a non-final status");
                    return Ok(false);
                }
                if *status == RunStatus::Succeeded && !run.mode.is_dry_run_class() {
                    if let Some(s) = run.submission.as_mut() {
                        s.submitted_cls = s.cls.clone();
                    }
                }
                self.end(txn, run, *status).await?;
                Ok(true)
            }
        }
    }

    /// Cancel the Run if any of `clids` lost or changed the trigger the Run
    /// was created for. A submitting Run is left alone.
    async fn cancel_if_untriggered(
        &self,
        txn: &mut Transaction,
        run: &mut Run,
        clids: &[ClId],
    ) -> CqResult<bool> {
        if run.status.is_ended() || run.status == RunStatus::Submitting {
            return Ok(false);
        }
        for clid in clids {
            let Some(run_cl) = run.run_cl(*clid) else {
                continue;
            };
            let trigger = run_cl.trigger.clone();
            let cl = txn.get::<Cl>(&clid.to_string()).await?;
            let still_triggered = cl
                .as_ref()
                .is_some_and(|cl| !cl.deleted && cl.trigger() == Some(&trigger));
            if !still_triggered {
                run.cancel_reason = Some(format!("trigger of CL {clid} changed"));
                self.end(txn, run, RunStatus::Cancelled).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Take the queue slot and start submitting, or wait.
    async fn acquire_and_submit(
        &self,
        txn: &mut Transaction,
        run: &mut Run,
        opts: Option<&SubmitOptions>,
        effects: &mut Effects,
    ) -> CqResult<()> {
        let now = txn.now();
        let waitlisted =
            submit_queue::try_acquire(txn, &run.id, opts, self.settings.submission_duration)
                .await?;
        let submission = run.submission.get_or_insert_with(Submission::default);
        if waitlisted {
            run.status = RunStatus::WaitingForSubmission;
            submission.deadline = None;
            return Ok(());
        }
        if let Some(at) = submit_queue::burst_ready_at(txn, &run.project).await? {
            run.status = RunStatus::WaitingForSubmission;
            submission.deadline = None;
            self.schedule(txn, &run.id, at, RunEvent::ReadyForSubmission)?;
            return Ok(());
        }

        let deadline = now + self.settings.submission_duration;
        submission.deadline = Some(deadline);
        submission.attempt_count += 1;
        if submission.cls.is_empty() {
            submission.cls = run.cls.clone();
        }
        run.status = RunStatus::Submitting;
        submit_queue::extend_lease(txn, &run.id, deadline).await?;
        self.schedule(txn, &run.id, deadline, RunEvent::Poke)?;
        METRICS.inc_submissions();
        effects.submit = Some(SubmissionRequest {
            run_id: run.id.clone(),
            cls: submission.cls.clone(),
            attempt: submission.attempt_count,
            deadline,
        });
        Ok(())
    }

    /// Move the Run to a final status, free its queue slot and detach it
    /// from its CLs.
    async fn end(&self, txn: &mut Transaction, run: &mut Run, status: RunStatus) -> CqResult<()> {
        let now = txn.now();
        run.status = status;
        run.end_time = Some(now);

        let submitted: BTreeSet<ClId> = run
            .submission
            .as_ref()
            .map(|s| s.submitted_cls.iter().copied().collect())
            .unwrap_or_default();
        if submitted.is_empty() {
            submit_queue::release(txn, &run.id).await?;
        } else {
            submit_queue::release_on_success(txn, &run.id, submitted.len() as u32).await?;
        }

        let mut muts = self.mutator.begin_batch(txn, &run.project, &run.cls).await?;
        for m in muts.iter_mut() {
            m.cl.remove_incomplete_run(&run.id);
            if submitted.contains(&m.cl.id) {
                if let Some(snapshot) = m.cl.snapshot.as_mut() {
                    snapshot.submitted = true;
                }
            }
        }
        finalize_batch(txn, muts)?;
        txn.enqueue(
            None,
            &Task::Project {
                project: run.project.clone(),
                event: ProjectEvent::RunFinished {
                    run_id: run.id.clone(),
                },
            },
        )?;
        Ok(())
    }

    /// Record a fresh tree check on the Run; returns whether it is open.
    ///
    /// No tree configured means open; a failed check counts as closed.
    async fn check_tree(
        &self,
        run: &mut Run,
        group: Option<&ConfigGroup>,
        now: DateTime<Utc>,
    ) -> bool {
        let open = match group.and_then(|g| g.tree_status_url.as_deref()) {
            None => true,
            Some(url) => match self.tree.fetch_latest(url).await {
                Ok(status) => status.is_open(),
                Err(e) => {
                    warn!(url = %url, error = %e, "tree status check failed; treating as closed");
                    false
                }
            },
        };
        let submission = run.submission.get_or_insert_with(Submission::default);
        submission.tree_open = open;
        submission.last_tree_check_time = Some(now);
        open
    }

    fn recheck_tree_later(&self, txn: &mut Transaction, run_id: &RunId) -> CqResult<()> {
        let at = txn.now() + self.settings.tree_recheck_interval;
        self.schedule(txn, run_id, at, RunEvent::Poke)
    }

    fn deadline_passed(&self, run: &Run, now: DateTime<Utc>) -> bool {
        run.submission
            .as_ref()
            .and_then(|s| s.deadline)
            .map_or(true, |d| d <= now)
    }

    fn schedule(
        &self,
        txn: &mut Transaction,
        run_id: &RunId,
        at: DateTime<Utc>,
        event: RunEvent,
    ) -> CqResult<()> {
        let eta = if at > txn.now() { Some(at) } else { None };
        txn.enqueue(
            eta,
            &Task::Run {
                run_id: run_id.clone(),
                event,
            },
        )?;
        Ok(())
    }

    /// Dependencies before dependents; cycles broken by lowest CL ID.
    async fn submission_order(
        &self,
        txn: &mut Transaction,
        clids: &[ClId],
    ) -> CqResult<Vec<ClId>> {
        let mut cls = Vec::with_capacity(clids.len());
        for id in clids {
            if let Some(cl) = txn.get::<Cl>(&id.to_string()).await? {
                cls.push(cl);
            }
        }
        Ok(order_cls(&cls))
    }
}

fn order_cls(cls: &[Cl]) -> Vec<ClId> {
    let members: BTreeSet<ClId> = cls.iter().map(|c| c.id).collect();
    let mut pending: BTreeMap<ClId, BTreeSet<ClId>> = cls
        .iter()
        .map(|cl| {
            let deps = cl
                .snapshot
                .iter()
                .flat_map(|s| s.deps.iter())
                .map(|d| d.clid)
                .filter(|d| *d != cl.id && members.contains(d))
                .collect();
            (cl.id, deps)
        })
        .collect();
    let mut order = Vec::with_capacity(pending.len());
    loop {
        let free = pending.iter().find(|(_, deps)| deps.is_empty()).map(|(id, _)| *id);
        let next = match free.or_else(|| pending.keys().next().copied()) {
            Some(id) => id,
            None => break,
        };
        pending.remove(&next);
        for deps in pending.values_mut() {
            deps.remove(&next);
        }
        order.push(next);
    }
    order
}

#[async_trait]
impl RunEventSink for RunManager {
    async fn notify_run(&self, run_id: &RunId, event: RunEvent) -> CqResult<()> {
        self.handle(run_id, event).await
    }
}
