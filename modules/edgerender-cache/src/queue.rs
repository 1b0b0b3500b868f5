//! Recache queues: per-host, per-priority Redis ZSETs keyed
//! `recache:<host>:<priority>`, scored by due time (unix seconds).
//!
//! Member identity is the JSON-encoded `(url, dimension_id)` pair, so
//! re-adding updates the score instead of duplicating. The autorecache add
//! is conditional (`ZADD LT`): an existing earlier schedule wins.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::warn;

use edgerender_common::{RecacheMember, RecachePriority};

use crate::error::Result;

#[async_trait]
pub trait RecacheQueue: Send + Sync {
    /// Schedule a member. An existing member's score is overwritten.
    async fn add(
        &self,
        host_id: i32,
        priority: RecachePriority,
        member: &RecacheMember,
        due_unix: f64,
    ) -> Result<()>;

    /// Autorecache add: keeps the earlier of the current and new scores.
    async fn add_keep_earlier(
        &self,
        host_id: i32,
        member: &RecacheMember,
        due_unix: f64,
    ) -> Result<()>;

    /// Pop up to `limit` due members (score <= `now_unix`), FIFO by score,
    /// lexicographic within equal scores. Popped members are removed.
    async fn take_due(
        &self,
        host_id: i32,
        priority: RecachePriority,
        now_unix: f64,
        limit: usize,
    ) -> Result<Vec<(RecacheMember, f64)>>;

    /// Put members back with their original scores (backpressure, retry).
    async fn requeue(
        &self,
        host_id: i32,
        priority: RecachePriority,
        members: &[(RecacheMember, f64)],
    ) -> Result<()>;

    async fn depth(&self, host_id: i32, priority: RecachePriority) -> Result<usize>;
}

pub struct RedisRecacheQueue {
    conn: ConnectionManager,
}

impl RedisRecacheQueue {
    pub async fn connect(addr: &str) -> Result<Self> {
        let client = redis::Client::open(addr)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl RecacheQueue for RedisRecacheQueue {
    async fn add(
        &self,
        host_id: i32,
        priority: RecachePriority,
        member: &RecacheMember,
        due_unix: f64,
    ) -> Result<()> {
        redis::cmd("ZADD")
            .arg(priority.queue_key(host_id))
            .arg(due_unix)
            .arg(member.encode())
            .query_async::<_, ()>(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn add_keep_earlier(
        &self,
        host_id: i32,
        member: &RecacheMember,
        due_unix: f64,
    ) -> Result<()> {
        // LT updates only when the new score is lower and still inserts
        // missing members.
        redis::cmd("ZADD")
            .arg(RecachePriority::Autorecache.queue_key(host_id))
            .arg("LT")
            .arg(due_unix)
            .arg(member.encode())
            .query_async::<_, ()>(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn take_due(
        &self,
        host_id: i32,
        priority: RecachePriority,
        now_unix: f64,
        limit: usize,
    ) -> Result<Vec<(RecacheMember, f64)>> {
        let key = priority.queue_key(host_id);
        let raw: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(now_unix)
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut self.conn.clone())
            .await?;

        if raw.is_empty() {
            return Ok(Vec::new());
        }

        let mut removal = redis::cmd("ZREM");
        removal.arg(&key);
        for (encoded, _) in &raw {
            removal.arg(encoded);
        }
        removal
            .query_async::<_, ()>(&mut self.conn.clone())
            .await?;

        let mut members = Vec::with_capacity(raw.len());
        for (encoded, score) in raw {
            match RecacheMember::decode(&encoded) {
                Ok(member) => members.push((member, score)),
                Err(e) => {
                    warn!(key = key.as_str(), error = %e, "Dropping malformed queue member")
                }
            }
        }
        Ok(members)
    }

    async fn requeue(
        &self,
        host_id: i32,
        priority: RecachePriority,
        members: &[(RecacheMember, f64)],
    ) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(priority.queue_key(host_id));
        for (member, score) in members {
            cmd.arg(*score).arg(member.encode());
        }
        cmd.query_async::<_, ()>(&mut self.conn.clone()).await?;
        Ok(())
    }

    async fn depth(&self, host_id: i32, priority: RecachePriority) -> Result<usize> {
        let n: usize = redis::cmd("ZCARD")
            .arg(priority.queue_key(host_id))
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(n)
    }
}

/// In-memory queue with the same scoring semantics, for tests.
#[derive(Default)]
pub struct MemoryRecacheQueue {
    queues: Mutex<HashMap<String, HashMap<String, f64>>>,
}

impl MemoryRecacheQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecacheQueue for MemoryRecacheQueue {
    async fn add(
        &self,
        host_id: i32,
        priority: RecachePriority,
        member: &RecacheMember,
        due_unix: f64,
    ) -> Result<()> {
        self.queues
            .lock()
            .unwrap()
            .entry(priority.queue_key(host_id))
            .or_default()
            .insert(member.encode(), due_unix);
        Ok(())
    }

    async fn add_keep_earlier(
        &self,
        host_id: i32,
        member: &RecacheMember,
        due_unix: f64,
    ) -> Result<()> {
        let mut queues = self.queues.lock().unwrap();
        let queue = queues
            .entry(RecachePriority::Autorecache.queue_key(host_id))
            .or_default();
        let slot = queue.entry(member.encode()).or_insert(due_unix);
        if due_unix < *slot {
            *slot = due_unix;
        }
        Ok(())
    }

    async fn take_due(
        &self,
        host_id: i32,
        priority: RecachePriority,
        now_unix: f64,
        limit: usize,
    ) -> Result<Vec<(RecacheMember, f64)>> {
        let mut queues = self.queues.lock().unwrap();
        let Some(queue) = queues.get_mut(&priority.queue_key(host_id)) else {
            return Ok(Vec::new());
        };

        let mut due: Vec<(String, f64)> = queue
            .iter()
            .filter(|(_, score)| **score <= now_unix)
            .map(|(member, score)| (member.clone(), *score))
            .collect();
        due.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        due.truncate(limit);

        let mut out = Vec::with_capacity(due.len());
        for (encoded, score) in due {
            queue.remove(&encoded);
            if let Ok(member) = RecacheMember::decode(&encoded) {
                out.push((member, score));
            }
        }
        Ok(out)
    }

    async fn requeue(
        &self,
        host_id: i32,
        priority: RecachePriority,
        members: &[(RecacheMember, f64)],
    ) -> Result<()> {
        let mut queues = self.queues.lock().unwrap();
        let queue = queues.entry(priority.queue_key(host_id)).or_default();
        for (member, score) in members {
            queue.insert(member.encode(), *score);
        }
        Ok(())
    }

    async fn depth(&self, host_id: i32, priority: RecachePriority) -> Result<usize> {
        Ok(self
            .queues
            .lock()
            .unwrap()
            .get(&priority.queue_key(host_id))
            .map(|q| q.len())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn re_adding_updates_score_without_duplicating() {
        let q = MemoryRecacheQueue::new();
        let member = RecacheMember::new("https://example.com/p", 1);

        q.add(1, RecachePriority::High, &member, 100.0).await.unwrap();
        q.add(1, RecachePriority::High, &member, 200.0).await.unwrap();

        assert_eq!(q.depth(1, RecachePriority::High).await.unwrap(), 1);
        let taken = q
            .take_due(1, RecachePriority::High, 500.0, 10)
            .await
            .unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].1, 200.0);
    }

    #[tokio::test]
    async fn autorecache_keeps_earlier_score() {
        let q = MemoryRecacheQueue::new();
        let member = RecacheMember::new("https://example.com/p", 1);

        q.add_keep_earlier(1, &member, 100.0).await.unwrap();
        q.add_keep_earlier(1, &member, 300.0).await.unwrap();

        let taken = q
            .take_due(1, RecachePriority::Autorecache, 500.0, 10)
            .await
            .unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].1, 100.0, "earlier schedule must win");

        // And a later-then-earlier sequence also converges on the minimum.
        q.add_keep_earlier(1, &member, 50.0).await.unwrap();
        let taken = q
            .take_due(1, RecachePriority::Autorecache, 500.0, 10)
            .await
            .unwrap();
        assert_eq!(taken[0].1, 50.0);
    }

    #[tokio::test]
    async fn take_due_is_fifo_by_score_then_lexicographic() {
        let q = MemoryRecacheQueue::new();
        q.add(1, RecachePriority::Normal, &RecacheMember::new("https://example.com/b", 1), 20.0)
            .await
            .unwrap();
        q.add(1, RecachePriority::Normal, &RecacheMember::new("https://example.com/a", 1), 10.0)
            .await
            .unwrap();
        q.add(1, RecachePriority::Normal, &RecacheMember::new("https://example.com/c", 1), 10.0)
            .await
            .unwrap();

        let taken = q
            .take_due(1, RecachePriority::Normal, 100.0, 10)
            .await
            .unwrap();
        let urls: Vec<&str> = taken.iter().map(|(m, _)| m.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://example.com/a",
                "https://example.com/c",
                "https://example.com/b"
            ]
        );
    }

    #[tokio::test]
    async fn not_yet_due_members_stay_queued() {
        let q = MemoryRecacheQueue::new();
        let member = RecacheMember::new("https://example.com/later", 1);
        q.add(1, RecachePriority::High, &member, 1000.0).await.unwrap();

        assert!(q
            .take_due(1, RecachePriority::High, 999.0, 10)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(q.depth(1, RecachePriority::High).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn requeue_restores_original_scores() {
        let q = MemoryRecacheQueue::new();
        let member = RecacheMember::new("https://example.com/p", 2);
        q.add(1, RecachePriority::High, &member, 10.0).await.unwrap();

        let taken = q.take_due(1, RecachePriority::High, 100.0, 10).await.unwrap();
        assert_eq!(q.depth(1, RecachePriority::High).await.unwrap(), 0);

        q.requeue(1, RecachePriority::High, &taken).await.unwrap();
        let retaken = q.take_due(1, RecachePriority::High, 100.0, 10).await.unwrap();
        assert_eq!(retaken[0].1, 10.0);
    }

    #[tokio::test]
    async fn queues_are_isolated_by_host_and_priority() {
        let q = MemoryRecacheQueue::new();
        let member = RecacheMember::new("https://example.com/p", 1);
        q.add(1, RecachePriority::High, &member, 10.0).await.unwrap();
        q.add(2, RecachePriority::High, &member, 10.0).await.unwrap();
        q.add(1, RecachePriority::Normal, &member, 10.0).await.unwrap();

        assert_eq!(q.depth(1, RecachePriority::High).await.unwrap(), 1);
        assert_eq!(q.depth(2, RecachePriority::High).await.unwrap(), 1);
        assert_eq!(q.depth(1, RecachePriority::Normal).await.unwrap(), 1);
        assert_eq!(q.depth(2, RecachePriority::Normal).await.unwrap(), 0);
    }
}
