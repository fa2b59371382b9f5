//! Injected wall clock
//!
//! Expiry windows, hold limits, and rate-limit refill all depend on "now";
//! handlers and loops take an `Arc<dyn Clock>` so tests can drive time
//! deterministically.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch
    fn now(&self) -> i64;

    /// Milliseconds since the Unix epoch
    fn now_millis(&self) -> i64 {
        self.now() * 1000
    }
}

/// Production clock backed by the system time
#[derive(Debug, Default, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Test clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(epoch_secs: i64) -> Arc<Self> {
        Arc::new(Self {
            millis: AtomicI64::new(epoch_secs * 1000),
        })
    }

    pub fn set(&self, epoch_secs: i64) {
        self.millis.store(epoch_secs * 1000, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: i64) {
        self.millis.fetch_add(secs * 1000, Ordering::SeqCst);
    }

    pub fn advance_millis(&self, millis: i64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.millis.load(Ordering::SeqCst) / 1000
    }

    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}
