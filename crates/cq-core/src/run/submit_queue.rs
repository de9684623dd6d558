//! Per-project submission queue.
//!
//! One keyed record per project holds the Run currently allowed to submit
//! and a FIFO waitlist. Every function here runs inside the caller's
//! transaction, so two processes racing for the slot are serialized by the
//! store's conditional commit: the loser conflicts, retries and finds the
//! slot taken.
//!
//! A holder keeps the slot until it releases it or its lease runs out. An
//! expired holder is demoted the next time anyone looks at the queue.

use chrono::{DateTime, Duration, Utc};
use cq_state::{Datastore, Entity, Transaction};
use serde::{Deserialize, Serialize};

use crate::config::SubmitOptions;
use crate::error::CqResult;
use crate::ids::RunId;
use crate::metrics::METRICS;
use crate::obs;
use crate::run::events::RunEvent;
use crate::tasks::Task;

/// Extra time a holder keeps the slot past its submission deadline.
pub const LEASE_GRACE_SECS: i64 = 2 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holder {
    pub run_id: RunId,
    pub acquired_at: DateTime<Utc>,
    pub lease_until: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedBatch {
    pub run_id: RunId,
    pub cl_count: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitQueue {
    pub project: String,
    #[serde(default)]
    pub current: Option<Holder>,
    #[serde(default)]
    pub waitlist: Vec<RunId>,
    /// Recent successful submissions, oldest first.
    #[serde(default)]
    pub history: Vec<SubmittedBatch>,
    #[serde(default)]
    pub opts: Option<SubmitOptions>,
    /// Lease granted to a newly promoted holder.
    #[serde(default)]
    pub lease_secs: i64,
}

impl Entity for SubmitQueue {
    const KIND: &'static str = "submit_queue";

    fn entity_key(&self) -> String {
        self.project.clone()
    }
}

impl SubmitQueue {
    pub fn new(project: &str) -> Self {
        Self {
            project: project.to_string(),
            current: None,
            waitlist: Vec::new(),
            history: Vec::new(),
            opts: None,
            lease_secs: 0,
        }
    }

    fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.lease_secs + LEASE_GRACE_SECS)
    }

    fn is_current(&self, run_id: &RunId) -> bool {
        self.current.as_ref().is_some_and(|h| &h.run_id == run_id)
    }

    /// Earliest time another submission fits in the burst window, or
    /// `None` if one may start now.
    pub fn burst_ready_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let opts = self.opts.as_ref()?;
        if opts.max_burst == 0 {
            return None;
        }
        let window_start = now - opts.burst_delay();
        let recent: Vec<&SubmittedBatch> =
            self.history.iter().filter(|b| b.at > window_start).collect();
        let mut total: u64 = recent.iter().map(|b| u64::from(b.cl_count)).sum();
        if total < u64::from(opts.max_burst) {
            return None;
        }
        for batch in recent {
            total -= u64::from(batch.cl_count);
            if total < u64::from(opts.max_burst) {
                return Some(batch.at + opts.burst_delay());
            }
        }
        None
    }

    fn trim_history(&mut self, now: DateTime<Utc>) {
        match &self.opts {
            Some(opts) if opts.max_burst > 0 => {
                let window_start = now - opts.burst_delay();
                self.history.retain(|b| b.at > window_start);
            }
            _ => self.history.clear(),
        }
    }

    /// Hand the slot to the waitlist head and tell it so, unless it is
    /// `except` (the caller, which is about to act anyway).
    fn promote_next(
        &mut self,
        txn: &mut Transaction,
        now: DateTime<Utc>,
        except: Option<&RunId>,
    ) -> CqResult<Option<RunId>> {
        if self.waitlist.is_empty() {
            self.current = None;
            return Ok(None);
        }
        let next = self.waitlist.remove(0);
        self.current = Some(Holder {
            run_id: next.clone(),
            acquired_at: now,
            lease_until: self.lease_until(now),
        });
        if except != Some(&next) {
            let eta = self.burst_ready_at(now).filter(|at| *at > now);
            txn.enqueue(
                eta,
                &Task::Run {
                    run_id: next.clone(),
                    event: RunEvent::ReadyForSubmission,
                },
            )?;
        }
        Ok(Some(next))
    }

    /// Demote a holder whose lease ran out. Returns the demoted Run.
    fn expire(
        &mut self,
        txn: &mut Transaction,
        now: DateTime<Utc>,
        except: Option<&RunId>,
    ) -> CqResult<Option<RunId>> {
        let expired = match &self.current {
            Some(h) if h.lease_until <= now => h.run_id.clone(),
            _ => return Ok(None),
        };
        txn.enqueue(
            None,
            &Task::Run {
                run_id: expired.clone(),
                event: RunEvent::Poke,
            },
        )?;
        let next = self.promote_next(txn, now, except)?;
        obs::emit_queue_released(&self.project, &expired, next.as_ref());
        Ok(Some(expired))
    }
}

async fn load(txn: &mut Transaction, project: &str) -> CqResult<Option<SubmitQueue>> {
    Ok(txn.get::<SubmitQueue>(project).await?)
}

/// Try to become the Run allowed to submit for its project.
///
/// Returns `true` when the Run was put on (or already is on) the waitlist,
/// `false` when it holds the slot. A holder calling again renews its lease.
pub async fn try_acquire(
    txn: &mut Transaction,
    run_id: &RunId,
    opts: Option<&SubmitOptions>,
    lease: Duration,
) -> CqResult<bool> {
    let project = run_id.project();
    let now = txn.now();
    let mut q = load(txn, project)
        .await?
        .unwrap_or_else(|| SubmitQueue::new(project));
    q.opts = opts.cloned();
    q.lease_secs = lease.num_seconds();
    q.trim_history(now);

    if q.is_current(run_id) {
        let lease_until = q.lease_until(now);
        if let Some(h) = q.current.as_mut() {
            h.lease_until = lease_until;
        }
        txn.put(&q)?;
        return Ok(false);
    }

    q.expire(txn, now, Some(run_id))?;
    if q.current.is_none() {
        match q.waitlist.first() {
            Some(head) if head != run_id => {}
            _ => {
                q.waitlist.retain(|r| r != run_id);
                q.current = Some(Holder {
                    run_id: run_id.clone(),
                    acquired_at: now,
                    lease_until: q.lease_until(now),
                });
            }
        }
    }

    let waitlisted = !q.is_current(run_id);
    if waitlisted {
        if !q.waitlist.contains(run_id) {
            q.waitlist.push(run_id.clone());
            METRICS.inc_queue_waitlisted();
        }
        let position = q.waitlist.iter().position(|r| r == run_id).unwrap_or(0);
        obs::emit_queue_waitlisted(project, run_id, position);
    } else {
        METRICS.inc_queue_acquisitions();
        obs::emit_queue_acquired(project, run_id);
    }
    txn.put(&q)?;
    Ok(waitlisted)
}

/// Give up the slot or leave the waitlist. A no-op for unknown Runs.
pub async fn release(txn: &mut Transaction, run_id: &RunId) -> CqResult<()> {
    let Some(mut q) = load(txn, run_id.project()).await? else {
        return Ok(());
    };
    release_in(&mut q, txn, run_id)?;
    txn.put(&q)?;
    Ok(())
}

fn release_in(q: &mut SubmitQueue, txn: &mut Transaction, run_id: &RunId) -> CqResult<()> {
    let now = txn.now();
    if q.is_current(run_id) {
        let next = q.promote_next(txn, now, None)?;
        obs::emit_queue_released(&q.project, run_id, next.as_ref());
    } else {
        q.waitlist.retain(|r| r != run_id);
    }
    Ok(())
}

/// [`release`] after `cl_count` CLs were submitted, counting them against
/// the burst limit.
pub async fn release_on_success(
    txn: &mut Transaction,
    run_id: &RunId,
    cl_count: u32,
) -> CqResult<()> {
    let project = run_id.project();
    let now = txn.now();
    let mut q = load(txn, project)
        .await?
        .unwrap_or_else(|| SubmitQueue::new(project));
    q.trim_history(now);
    if q.opts.as_ref().is_some_and(|o| o.max_burst > 0) {
        q.history.push(SubmittedBatch {
            run_id: run_id.clone(),
            cl_count,
            at: now,
        });
    }
    release_in(&mut q, txn, run_id)?;
    txn.put(&q)?;
    Ok(())
}

/// Demote the holder if its lease ran out and promote the next Run.
pub async fn release_expired(txn: &mut Transaction, project: &str) -> CqResult<Option<RunId>> {
    let Some(mut q) = load(txn, project).await? else {
        return Ok(None);
    };
    let now = txn.now();
    let demoted = q.expire(txn, now, None)?;
    if demoted.is_some() {
        txn.put(&q)?;
    }
    Ok(demoted)
}

/// When the project's burst limit next admits a submission.
pub async fn burst_ready_at(
    txn: &mut Transaction,
    project: &str,
) -> CqResult<Option<DateTime<Utc>>> {
    let now = txn.now();
    Ok(load(txn, project)
        .await?
        .and_then(|q| q.burst_ready_at(now))
        .filter(|at| *at > now))
}

/// Keep the slot until `until` (plus grace) if `run_id` holds it.
pub async fn extend_lease(
    txn: &mut Transaction,
    run_id: &RunId,
    until: DateTime<Utc>,
) -> CqResult<()> {
    let Some(mut q) = load(txn, run_id.project()).await? else {
        return Ok(());
    };
    if let Some(h) = q.current.as_mut().filter(|h| &h.run_id == run_id) {
        h.lease_until = until + Duration::seconds(LEASE_GRACE_SECS);
        txn.put(&q)?;
    }
    Ok(())
}

/// The holder and waitlist of `project`, read outside any transaction.
pub async fn load_current_and_waitlist(
    store: &Datastore,
    project: &str,
) -> CqResult<(Option<RunId>, Vec<RunId>)> {
    Ok(match store.get::<SubmitQueue>(project).await? {
        Some(q) => (q.current.map(|h| h.run_id), q.waitlist),
        None => (None, Vec::new()),
    })
}
