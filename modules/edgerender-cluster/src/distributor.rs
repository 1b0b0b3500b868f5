//! Cache-key placement across the cluster.
//!
//! `compute_targets` is the write path: the rendering EG is always part of
//! its own target set (slot-0 substitution). `compute_hash_targets` is the
//! read path: the undisturbed "natural" replica set, used to decide whether
//! a pulled copy may be stored locally.
//!
//! hash_modulo is deterministic: same key, same sorted peer set, same
//! ordered targets.

use rand::seq::SliceRandom;
use xxhash_rust::xxh64::xxh64;

use edgerender_common::config::ShardStrategy;

#[derive(Debug, Clone)]
pub struct Distributor {
    strategy: ShardStrategy,
    replication_factor: usize,
}

impl Distributor {
    pub fn new(strategy: ShardStrategy, replication_factor: usize) -> Self {
        Self {
            strategy,
            replication_factor: replication_factor.max(1),
        }
    }

    pub fn strategy(&self) -> ShardStrategy {
        self.strategy
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// Write-path targets for a key. `peers` is the healthy cluster member
    /// list; order does not matter, it is sorted internally. Returns at
    /// most `min(replication_factor, |peers|)` unique ids, always
    /// containing `rendering_eg`.
    pub fn compute_targets(
        &self,
        cache_key: &str,
        rendering_eg: &str,
        peers: &[String],
    ) -> Vec<String> {
        match self.strategy {
            ShardStrategy::PrimaryOnly => vec![rendering_eg.to_string()],
            ShardStrategy::Random => {
                let mut sorted = sorted_peers(peers);
                let n = self.replication_factor.min(sorted.len());
                if n == 0 {
                    return vec![rendering_eg.to_string()];
                }
                sorted.shuffle(&mut rand::rng());
                let mut targets: Vec<String> = sorted.into_iter().take(n).collect();
                if !targets.iter().any(|t| t == rendering_eg) {
                    targets[0] = rendering_eg.to_string();
                }
                targets
            }
            ShardStrategy::HashModulo => {
                let mut targets =
                    hash_targets(cache_key, self.replication_factor, peers);
                if targets.is_empty() {
                    return vec![rendering_eg.to_string()];
                }
                if !targets.iter().any(|t| t == rendering_eg) {
                    targets[0] = rendering_eg.to_string();
                }
                targets
            }
        }
    }

    /// Read-path natural replica set, without the rendering-EG
    /// substitution. Empty under random and primary_only: pulled copies
    /// are never stored locally there.
    pub fn compute_hash_targets(&self, cache_key: &str, n: usize, peers: &[String]) -> Vec<String> {
        match self.strategy {
            ShardStrategy::HashModulo => hash_targets(cache_key, n, peers),
            ShardStrategy::Random | ShardStrategy::PrimaryOnly => Vec::new(),
        }
    }

    /// The key's natural primary, if any.
    pub fn primary_for(&self, cache_key: &str, peers: &[String]) -> Option<String> {
        self.compute_hash_targets(cache_key, 1, peers).into_iter().next()
    }
}

fn sorted_peers(peers: &[String]) -> Vec<String> {
    let mut sorted = peers.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
}

/// `n` consecutive peers starting at `xxh64(key) % len`, wrapping.
fn hash_targets(cache_key: &str, n: usize, peers: &[String]) -> Vec<String> {
    let sorted = sorted_peers(peers);
    if sorted.is_empty() {
        return Vec::new();
    }
    let n = n.min(sorted.len());
    let start = (xxh64(cache_key.as_bytes(), 0) % sorted.len() as u64) as usize;
    (0..n)
        .map(|i| sorted[(start + i) % sorted.len()].clone())
        .collect()
}
