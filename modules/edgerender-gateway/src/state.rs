//! Shared gateway state and the bounded in-memory HAR ring.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use edgerender_cache::{CacheStore, RecacheQueue};
use edgerender_cluster::{Distributor, Registry, ShardClient};
use edgerender_common::config::EgConfig;
use edgerender_common::Config;
use renderer_client::RendererClient;

use crate::error::SharedError;
use crate::metrics::Metrics;
use crate::pipeline::Served;
use crate::singleflight::SingleFlight;

/// Outcome published through single-flight: the leader's served page or
/// its failure, shared by every coalesced waiter.
pub type FlightResult = Result<Arc<Served>, SharedError>;

pub struct AppState {
    pub config: Arc<Config>,
    pub eg: EgConfig,
    pub store: CacheStore,
    pub registry: Arc<Registry>,
    pub distributor: Distributor,
    pub shard: ShardClient,
    pub renderer: RendererClient,
    pub queues: Arc<dyn RecacheQueue>,
    pub flights: SingleFlight<FlightResult>,
    pub har_store: HarStore,
    pub metrics: Metrics,
    /// Plain HTTP client for bypass origin fetches.
    pub origin: reqwest::Client,
    pub started_at: Instant,
}

/// Most recent HARs per host, serving the debug fetch endpoint. Bounded;
/// old entries fall off the back.
pub struct HarStore {
    per_host: DashMap<i32, VecDeque<(String, Arc<Vec<u8>>)>>,
    capacity: usize,
}

impl HarStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            per_host: DashMap::new(),
            capacity,
        }
    }

    pub fn put(&self, host_id: i32, request_id: &str, har_json: Vec<u8>) {
        let mut ring = self.per_host.entry(host_id).or_default();
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back((request_id.to_string(), Arc::new(har_json)));
    }

    pub fn get(&self, host_id: i32, request_id: &str) -> Option<Arc<Vec<u8>>> {
        self.per_host.get(&host_id)?.iter().rev().find_map(|(id, har)| {
            if id == request_id {
                Some(Arc::clone(har))
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn har_ring_evicts_oldest() {
        let store = HarStore::new(2);
        store.put(1, "r1", b"{}".to_vec());
        store.put(1, "r2", b"{}".to_vec());
        store.put(1, "r3", b"{}".to_vec());

        assert!(store.get(1, "r1").is_none());
        assert!(store.get(1, "r2").is_some());
        assert!(store.get(1, "r3").is_some());
        assert!(store.get(2, "r3").is_none());
    }
}
