//! Structured lifecycle events for CLs, Runs and the submission queue.
//!
//! Every emitter logs at `info!` (warnings at `warn!`) with an `event` field
//! naming what happened, so JSON output can be filtered on it.

use tracing::{info, warn};

use crate::ids::{ClId, RunId};

/// RAII guard keeping a span tagged with `run_id` entered.
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &RunId) -> Self {
        let span = tracing::info_span!("cq.run", run_id = %run_id);
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_cl_mutated(project: &str, clid: ClId, eversion: i64) {
    info!(event = "cl.mutated", project = %project, clid = clid.0, eversion = eversion);
}

pub fn emit_cl_purged(project: &str, clid: ClId, reason: &str) {
    info!(event = "cl.purged", project = %project, clid = clid.0, reason = %reason);
}

pub fn emit_triage_completed(project: &str, cls: usize, ready: usize, to_purge: usize) {
    info!(
        event = "triage.completed",
        project = %project,
        cls = cls,
        ready = ready,
        to_purge = to_purge,
    );
}

pub fn emit_run_created(run_id: &RunId, mode: &str, cls: usize) {
    info!(event = "run.created", run_id = %run_id, mode = %mode, cls = cls);
}

pub fn emit_run_status_changed(run_id: &RunId, from: &str, to: &str) {
    info!(event = "run.status_changed", run_id = %run_id, from = %from, to = %to);
}

pub fn emit_queue_acquired(project: &str, run_id: &RunId) {
    info!(event = "queue.acquired", project = %project, run_id = %run_id);
}

pub fn emit_queue_waitlisted(project: &str, run_id: &RunId, position: usize) {
    info!(event = "queue.waitlisted", project = %project, run_id = %run_id, position = position);
}

pub fn emit_queue_released(project: &str, run_id: &RunId, next: Option<&RunId>) {
    match next {
        Some(next) => {
            info!(event = "queue.released", project = %project, run_id = %run_id, next = %next)
        }
        None => info!(event = "queue.released", project = %project, run_id = %run_id),
    }
}

/// A handler failed after its transaction committed.
pub fn emit_side_effect_error(run_id: &RunId, error: &dyn std::fmt::Display) {
    warn!(event = "run.side_effect_error", run_id = %run_id, error = %error);
}
