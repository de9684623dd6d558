//! Process-wide counters for the commit queue.
//!
//! Call sites bump counters without logging anything above `trace`.
//! [`Metrics::flush`] reports every value in one `info!` event, typically
//! from the engine's resync tick.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    cl_mutations: AtomicU64,
    triage_passes: AtomicU64,
    cls_purged: AtomicU64,
    runs_created: AtomicU64,
    queue_acquisitions: AtomicU64,
    queue_waitlisted: AtomicU64,
    submissions: AtomicU64,
    tasks_delivered: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(metric = stringify!($field), "counter incremented");
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            cl_mutations: AtomicU64::new(0),
            triage_passes: AtomicU64::new(0),
            cls_purged: AtomicU64::new(0),
            runs_created: AtomicU64::new(0),
            queue_acquisitions: AtomicU64::new(0),
            queue_waitlisted: AtomicU64::new(0),
            submissions: AtomicU64::new(0),
            tasks_delivered: AtomicU64::new(0),
        }
    }

    counter!(inc_cl_mutations, cl_mutations, cl_mutations);
    counter!(inc_triage_passes, triage_passes, triage_passes);
    counter!(inc_cls_purged, cls_purged, cls_purged);
    counter!(inc_runs_created, runs_created, runs_created);
    counter!(inc_queue_acquisitions, queue_acquisitions, queue_acquisitions);
    counter!(inc_queue_waitlisted, queue_waitlisted, queue_waitlisted);
    counter!(inc_submissions, submissions, submissions);
    counter!(inc_tasks_delivered, tasks_delivered, tasks_delivered);

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            cl_mutations = self.cl_mutations(),
            triage_passes = self.triage_passes(),
            cls_purged = self.cls_purged(),
            runs_created = self.runs_created(),
            queue_acquisitions = self.queue_acquisitions(),
            queue_waitlisted = self.queue_waitlisted(),
            submissions = self.submissions(),
            tasks_delivered = self.tasks_delivered(),
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for c in [
            &self.cl_mutations,
            &self.triage_passes,
            &self.cls_purged,
            &self.runs_created,
            &self.queue_acquisitions,
            &self.queue_waitlisted,
            &self.submissions,
            &self.tasks_delivered,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}
