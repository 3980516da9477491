//! Time source for lazy state evaluation.

use crate::domain::{TimeMs, DAY_MS};
use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};

pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> TimeMs;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimeMs {
        TimeMs::now()
    }
}

/// A clock that only moves when told to. Used by tests and replay tooling.
#[derive(Debug)]
pub struct ManualClock {
    ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start: TimeMs) -> Self {
        Self {
            ms: AtomicI64::new(start.as_ms()),
        }
    }

    pub fn set(&self, at: TimeMs) {
        self.ms.store(at.as_ms(), Ordering::SeqCst);
    }

    pub fn advance_days(&self, days: i64) {
        self.ms.fetch_add(days * DAY_MS, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimeMs {
        TimeMs::new(self.ms.load(Ordering::SeqCst))
    }
}
