//! Gateway counters, exposed as a JSON snapshot on the internal status
//! endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub cache_hits: AtomicU64,
    pub cache_stale_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub renders: AtomicU64,
    pub render_failures: AtomicU64,
    pub bypasses: AtomicU64,
    pub pulls: AtomicU64,
    pub pull_failures: AtomicU64,
    pub pushes: AtomicU64,
    pub under_replicated: AtomicU64,
    pub recaches_enqueued: AtomicU64,
    pub invalidations: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "cache_hits": self.cache_hits.load(Ordering::Relaxed),
            "cache_stale_hits": self.cache_stale_hits.load(Ordering::Relaxed),
            "cache_misses": self.cache_misses.load(Ordering::Relaxed),
            "renders": self.renders.load(Ordering::Relaxed),
            "render_failures": self.render_failures.load(Ordering::Relaxed),
            "bypasses": self.bypasses.load(Ordering::Relaxed),
            "pulls": self.pulls.load(Ordering::Relaxed),
            "pull_failures": self.pull_failures.load(Ordering::Relaxed),
            "pushes": self.pushes.load(Ordering::Relaxed),
            "under_replicated_total": self.under_replicated.load(Ordering::Relaxed),
            "recaches_enqueued": self.recaches_enqueued.load(Ordering::Relaxed),
            "invalidations": self.invalidations.load(Ordering::Relaxed),
        })
    }
}
