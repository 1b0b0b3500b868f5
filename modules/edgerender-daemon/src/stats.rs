//! Daemon counters for the status endpoint.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

pub struct DaemonStats {
    pub started_at: Instant,
    pub last_tick_unix: AtomicI64,
    pub polled: AtomicU64,
    pub dispatched: AtomicU64,
    pub dispatch_failures: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub retries_exhausted: AtomicU64,
    pub requeued_backpressure: AtomicU64,
}

impl DaemonStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            last_tick_unix: AtomicI64::new(0),
            polled: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            retries_scheduled: AtomicU64::new(0),
            retries_exhausted: AtomicU64::new(0),
            requeued_backpressure: AtomicU64::new(0),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_tick(&self, unix: i64) {
        self.last_tick_unix.store(unix, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "last_tick_unix": self.last_tick_unix.load(Ordering::Relaxed),
            "polled": self.polled.load(Ordering::Relaxed),
            "dispatched": self.dispatched.load(Ordering::Relaxed),
            "dispatch_failures": self.dispatch_failures.load(Ordering::Relaxed),
            "retries_scheduled": self.retries_scheduled.load(Ordering::Relaxed),
            "retries_exhausted": self.retries_exhausted.load(Ordering::Relaxed),
            "requeued_backpressure": self.requeued_backpressure.load(Ordering::Relaxed),
        })
    }
}

impl Default for DaemonStats {
    fn default() -> Self {
        Self::new()
    }
}
