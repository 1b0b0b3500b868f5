//! Tick-driven queue polling.
//!
//! Every tick the high queues of all hosts are polled; every
//! `normal_check_interval` the normal and autorecache queues join in.
//! Priority is strict within a cycle: no normal member moves while a due
//! high member exists. Due members pop into a bounded in-process channel;
//! when it fills, the remainder goes back to Redis with original scores
//! and polling stops until the dispatchers drain.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use edgerender_cache::RecacheQueue;
use edgerender_common::config::RecacheSettings;
use edgerender_common::{RecacheMember, RecachePriority};

use crate::stats::DaemonStats;

/// A due queue member handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub host_id: i32,
    pub priority: RecachePriority,
    pub member: RecacheMember,
    /// Original due time (unix seconds), kept for requeueing.
    pub score: f64,
}

pub struct Scheduler {
    queues: Arc<dyn RecacheQueue>,
    settings: RecacheSettings,
    host_ids: Vec<i32>,
    tx: mpsc::Sender<WorkItem>,
    stats: Arc<DaemonStats>,
}

impl Scheduler {
    pub fn new(
        queues: Arc<dyn RecacheQueue>,
        settings: RecacheSettings,
        host_ids: Vec<i32>,
        tx: mpsc::Sender<WorkItem>,
        stats: Arc<DaemonStats>,
    ) -> Self {
        Self {
            queues,
            settings,
            host_ids,
            tx,
            stats,
        }
    }

    /// The tick loop. `paused` freezes polling without touching Redis;
    /// `shutdown` ends the loop.
    pub async fn run(self, paused: watch::Receiver<bool>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.settings.tick_interval);
        let normal_every = (self.settings.normal_check_interval.as_millis()
            / self.settings.tick_interval.as_millis().max(1))
        .max(1) as u64;
        let mut tick_count: u64 = 0;

        info!(
            tick_ms = self.settings.tick_interval.as_millis() as u64,
            normal_every, "Scheduler loop starting"
        );

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Scheduler loop stopping");
                        return;
                    }
                }
            }

            let now = Utc::now();
            self.stats.mark_tick(now.timestamp());
            if *paused.borrow() {
                continue;
            }

            tick_count += 1;
            let include_low_priority = tick_count % normal_every == 0;
            self.poll_cycle(include_low_priority, now.timestamp() as f64)
                .await;
        }
    }

    /// One polling cycle over all hosts, in strict priority order.
    pub async fn poll_cycle(&self, include_low_priority: bool, now_unix: f64) {
        let priorities: &[RecachePriority] = if include_low_priority {
            &[
                RecachePriority::High,
                RecachePriority::Normal,
                RecachePriority::Autorecache,
            ]
        } else {
            &[RecachePriority::High]
        };

        for &priority in priorities {
            for &host_id in &self.host_ids {
                if !self.poll_queue(host_id, priority, now_unix).await {
                    // Channel full: stop polling entirely until drain.
                    return;
                }
            }
        }
    }

    /// Poll one queue. Returns false when the channel filled up.
    async fn poll_queue(&self, host_id: i32, priority: RecachePriority, now_unix: f64) -> bool {
        let slots = self.tx.capacity();
        if slots == 0 {
            return false;
        }
        let batch = self.settings.batch_size.min(slots);

        let members = match self.queues.take_due(host_id, priority, now_unix, batch).await {
            Ok(members) => members,
            Err(e) => {
                warn!(host_id, priority = %priority, error = %e, "Queue poll failed");
                return true;
            }
        };
        if members.is_empty() {
            return true;
        }

        for (index, (member, score)) in members.iter().enumerate() {
            let item = WorkItem {
                host_id,
                priority,
                member: member.clone(),
                score: *score,
            };
            if self.tx.try_send(item).is_err() {
                // Overflow: everything not yet handed over returns to
                // Redis at its original score.
                let rest = &members[index..];
                if let Err(e) = self.queues.requeue(host_id, priority, rest).await {
                    warn!(host_id, error = %e, "Backpressure requeue failed, members dropped");
                }
                for _ in rest {
                    DaemonStats::incr(&self.stats.requeued_backpressure);
                }
                return false;
            }
            DaemonStats::incr(&self.stats.polled);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgerender_cache::MemoryRecacheQueue;

    fn settings() -> RecacheSettings {
        RecacheSettings::default()
    }

    fn member(url: &str) -> RecacheMember {
        RecacheMember::new(url, 1)
    }

    async fn drain(rx: &mut mpsc::Receiver<WorkItem>) -> Vec<WorkItem> {
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn high_drains_before_normal_within_a_cycle() {
        let queues = Arc::new(MemoryRecacheQueue::new());
        queues
            .add(1, RecachePriority::Normal, &member("https://h/normal"), 10.0)
            .await
            .unwrap();
        queues
            .add(1, RecachePriority::High, &member("https://h/high-1"), 50.0)
            .await
            .unwrap();
        queues
            .add(1, RecachePriority::High, &member("https://h/high-2"), 20.0)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(100);
        let scheduler = Scheduler::new(
            queues,
            settings(),
            vec![1],
            tx,
            Arc::new(DaemonStats::new()),
        );
        scheduler.poll_cycle(true, 1000.0).await;

        let items = drain(&mut rx).await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].priority, RecachePriority::High);
        assert_eq!(items[1].priority, RecachePriority::High);
        assert_eq!(items[2].priority, RecachePriority::Normal);
        // FIFO by score within the high queue.
        assert_eq!(items[0].member.url, "https://h/high-2");
    }

    #[tokio::test]
    async fn low_priority_queues_skipped_between_intervals() {
        let queues = Arc::new(MemoryRecacheQueue::new());
        queues
            .add(1, RecachePriority::Normal, &member("https://h/normal"), 10.0)
            .await
            .unwrap();
        queues
            .add(1, RecachePriority::Autorecache, &member("https://h/auto"), 10.0)
            .await
            .unwrap();
        queues
            .add(1, RecachePriority::High, &member("https://h/high"), 10.0)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(100);
        let scheduler = Scheduler::new(
            Arc::clone(&queues) as Arc<dyn RecacheQueue>,
            settings(),
            vec![1],
            tx,
            Arc::new(DaemonStats::new()),
        );

        scheduler.poll_cycle(false, 1000.0).await;
        let items = drain(&mut rx).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].priority, RecachePriority::High);
        assert_eq!(queues.depth(1, RecachePriority::Normal).await.unwrap(), 1);
        assert_eq!(
            queues.depth(1, RecachePriority::Autorecache).await.unwrap(),
            1
        );

        scheduler.poll_cycle(true, 1000.0).await;
        let items = drain(&mut rx).await;
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn channel_overflow_requeues_with_original_scores() {
        let queues = Arc::new(MemoryRecacheQueue::new());
        for i in 0..5 {
            queues
                .add(
                    1,
                    RecachePriority::High,
                    &member(&format!("https://h/{i}")),
                    10.0 + i as f64,
                )
                .await
                .unwrap();
        }

        let (tx, mut rx) = mpsc::channel(2);
        let scheduler = Scheduler::new(
            Arc::clone(&queues) as Arc<dyn RecacheQueue>,
            settings(),
            vec![1],
            tx,
            Arc::new(DaemonStats::new()),
        );
        scheduler.poll_cycle(false, 1000.0).await;

        let items = drain(&mut rx).await;
        assert_eq!(items.len(), 2);
        // The three overflow members are back in Redis, scores intact.
        assert_eq!(queues.depth(1, RecachePriority::High).await.unwrap(), 3);
        let rest = queues
            .take_due(1, RecachePriority::High, 1000.0, 10)
            .await
            .unwrap();
        assert_eq!(rest[0].1, 12.0);
    }

    #[tokio::test]
    async fn not_due_members_are_left_alone() {
        let queues = Arc::new(MemoryRecacheQueue::new());
        queues
            .add(1, RecachePriority::High, &member("https://h/future"), 5000.0)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(10);
        let scheduler = Scheduler::new(
            Arc::clone(&queues) as Arc<dyn RecacheQueue>,
            settings(),
            vec![1],
            tx,
            Arc::new(DaemonStats::new()),
        );
        scheduler.poll_cycle(true, 1000.0).await;

        assert!(drain(&mut rx).await.is_empty());
        assert_eq!(queues.depth(1, RecachePriority::High).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn polls_every_configured_host() {
        let queues = Arc::new(MemoryRecacheQueue::new());
        queues
            .add(1, RecachePriority::High, &member("https://a/x"), 10.0)
            .await
            .unwrap();
        queues
            .add(2, RecachePriority::High, &member("https://b/x"), 10.0)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(10);
        let scheduler = Scheduler::new(
            queues,
            settings(),
            vec![1, 2],
            tx,
            Arc::new(DaemonStats::new()),
        );
        scheduler.poll_cycle(false, 1000.0).await;

        let items = drain(&mut rx).await;
        assert_eq!(items.len(), 2);
        let hosts: Vec<i32> = items.iter().map(|i| i.host_id).collect();
        assert!(hosts.contains(&1) && hosts.contains(&2));
    }
}
