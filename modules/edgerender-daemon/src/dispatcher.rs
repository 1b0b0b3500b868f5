//! Recache dispatch: consume the internal channel, fan entries out to
//! healthy EGs round-robin, and drive the retry ladder on failure.
//!
//! Concurrency is bounded by the RS fleet's free capacity after the
//! reservation cut; when nothing is available, dispatch pauses while
//! polling continues to fill the channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use edgerender_cache::RecacheQueue;
use edgerender_cluster::{Registry, INTERNAL_AUTH_HEADER};
use edgerender_common::config::RecacheSettings;

use crate::capacity;
use crate::scheduler::WorkItem;
use crate::stats::DaemonStats;

pub struct Dispatcher {
    queues: Arc<dyn RecacheQueue>,
    registry: Arc<Registry>,
    settings: RecacheSettings,
    stats: Arc<DaemonStats>,
    client: reqwest::Client,
    auth_key: String,
    round_robin: AtomicUsize,
    in_flight: AtomicUsize,
    /// Dispatch attempts per member, daemon-local. Lost on restart; the
    /// queue member itself survives in Redis.
    attempts: DashMap<String, u32>,
}

impl Dispatcher {
    pub fn new(
        queues: Arc<dyn RecacheQueue>,
        registry: Arc<Registry>,
        settings: RecacheSettings,
        auth_key: String,
        stats: Arc<DaemonStats>,
    ) -> Self {
        Self {
            queues,
            registry,
            settings,
            stats,
            client: reqwest::Client::new(),
            auth_key,
            round_robin: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            attempts: DashMap::new(),
        }
    }

    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<WorkItem>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Dispatcher loop starting");
        loop {
            let item = tokio::select! {
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            // Hold dispatch until the RS fleet has headroom.
            if !self.wait_for_capacity(&mut shutdown).await {
                break;
            }

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.dispatch_one(item).await;
                this.in_flight.fetch_sub(1, Ordering::SeqCst);
            });
        }
        info!("Dispatcher loop stopping");
    }

    /// Returns false when shutdown arrived while waiting.
    async fn wait_for_capacity(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            let fleet = self.registry.get_healthy_rs().await;
            let available = capacity::available_for_recache(
                capacity::total_free(&fleet),
                self.settings.rs_capacity_reserved,
            ) as usize;
            if available > self.in_flight.load(Ordering::SeqCst) {
                return true;
            }

            debug!(available, "No recache capacity, dispatch paused");
            tokio::select! {
                _ = tokio::time::sleep(self.settings.tick_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
    }

    async fn dispatch_one(&self, item: WorkItem) {
        let egs = self.registry.get_healthy_egs().await;
        if egs.is_empty() {
            warn!(host_id = item.host_id, "No healthy EGs, scheduling retry");
            self.schedule_retry(item).await;
            return;
        }

        let index = self.round_robin.fetch_add(1, Ordering::Relaxed) % egs.len();
        let eg = &egs[index];
        let endpoint = format!(
            "{}/internal/cache/recache",
            eg.address.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "host_id": item.host_id,
            "urls": [item.member.url],
            "dimension_ids": [item.member.dimension_id],
            "priority": item.priority.as_str(),
        });

        let result = self
            .client
            .post(&endpoint)
            .header(INTERNAL_AUTH_HEADER, &self.auth_key)
            .timeout(self.settings.dispatch_timeout)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                DaemonStats::incr(&self.stats.dispatched);
                self.attempts.remove(&retry_key(&item));
                debug!(
                    eg_id = eg.eg_id.as_str(),
                    url = item.member.url.as_str(),
                    "Recache dispatched"
                );
            }
            Ok(resp) => {
                warn!(
                    eg_id = eg.eg_id.as_str(),
                    url = item.member.url.as_str(),
                    status = resp.status().as_u16(),
                    "Recache dispatch rejected"
                );
                self.schedule_retry(item).await;
            }
            Err(e) => {
                warn!(
                    eg_id = eg.eg_id.as_str(),
                    url = item.member.url.as_str(),
                    error = %e,
                    "Recache dispatch failed"
                );
                self.schedule_retry(item).await;
            }
        }
    }

    /// Exponential backoff back into the same priority queue, dropping the
    /// member once `max_retries` attempts are spent. Never blocks the
    /// channel.
    async fn schedule_retry(&self, item: WorkItem) {
        DaemonStats::incr(&self.stats.dispatch_failures);

        let key = retry_key(&item);
        let attempt = {
            let mut entry = self.attempts.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        if attempt >= self.settings.max_retries {
            self.attempts.remove(&key);
            DaemonStats::incr(&self.stats.retries_exhausted);
            warn!(
                host_id = item.host_id,
                url = item.member.url.as_str(),
                attempts = attempt,
                "Recache retries exhausted, dropping"
            );
            return;
        }

        let backoff = backoff_for_attempt(self.settings.retry_base_delay, attempt);
        let due = Utc::now().timestamp() as f64 + backoff.as_secs_f64();
        if let Err(e) = self
            .queues
            .add(item.host_id, item.priority, &item.member, due)
            .await
        {
            warn!(host_id = item.host_id, error = %e, "Retry requeue failed");
            return;
        }
        DaemonStats::incr(&self.stats.retries_scheduled);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

fn retry_key(item: &WorkItem) -> String {
    format!("{}:{}:{}", item.host_id, item.priority, item.member.encode())
}

/// `base * 2^(attempt-1)`: base after the first failure, doubling after.
pub fn backoff_for_attempt(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_for_attempt(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_for_attempt(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_for_attempt(base, 3), Duration::from_secs(4));
    }

    #[test]
    fn retry_key_distinguishes_members() {
        let a = WorkItem {
            host_id: 1,
            priority: edgerender_common::RecachePriority::High,
            member: edgerender_common::RecacheMember::new("https://h/a", 1),
            score: 0.0,
        };
        let mut b = a.clone();
        b.member = edgerender_common::RecacheMember::new("https://h/a", 2);
        assert_ne!(retry_key(&a), retry_key(&b));
    }
}
