//! Monotonic time source consumed by the scheduler.
//!
//! The scheduler never reads wall-clock time directly; it asks a [`Clock`] for
//! monotonic nanoseconds so tests and simulations can drive sojourn times
//! deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic nanosecond time source.
pub trait Clock {
    /// Nanoseconds since an arbitrary, fixed origin.
    fn now_ns(&self) -> u64;
}

/// Default clock backed by [`std::time::Instant`].
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Manually advanced clock for tests and deterministic simulations.
///
/// Clones share the same underlying time, so a test can keep a handle while
/// the scheduler owns another.
#[derive(Clone, Default)]
pub struct ManualClock {
    ns: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        self.ns.fetch_add(delta.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Jump to an absolute nanosecond value.
    pub fn set_ns(&self, ns: u64) {
        self.ns.store(ns, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.ns.load(Ordering::Relaxed)
    }
}
