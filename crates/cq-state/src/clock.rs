//! Time sources.
//!
//! Transactions, deadlines and burst windows all read time through a
//! [`Clock`] so tests can drive time explicitly with [`TestClock`].

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Duration, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug)]
pub struct TestClock {
    base: DateTime<Utc>,
    elapsed_us: AtomicI64,
}

impl TestClock {
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            elapsed_us: AtomicI64::new(0),
        }
    }

    /// Move time forward.
    ///
    /// # Panics
    ///
    /// Panics if `by` is negative.
    pub fn advance(&self, by: Duration) {
        let us = by
            .num_microseconds()
            .unwrap_or(i64::MAX);
        assert!(us >= 0, "TestClock cannot move backwards (by {by})");
        self.elapsed_us.fetch_add(us, Ordering::SeqCst);
    }

    /// Jump to `target`, which must not be in the past.
    pub fn advance_to(&self, target: DateTime<Utc>) {
        let now = self.now();
        assert!(target >= now, "TestClock cannot move backwards: now={now}, target={target}");
        self.advance(target - now);
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        self.base + Duration::microseconds(self.elapsed_us.load(Ordering::SeqCst))
    }
}
