//! Per-cache-key request coalescing.
//!
//! The first requester for a key becomes the leader and renders; later
//! arrivals subscribe to a watch channel and wait, bounded by their own
//! remaining deadline. The leader publishes one shared outcome — success
//! or failure — and every waiter observes it. A leader that disappears
//! without publishing (panic, cancellation) drops its sender, which
//! waiters see as a failure.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;

use edgerender_common::CacheKey;

#[derive(Debug, Clone)]
pub enum FlightState<T> {
    Pending,
    Done(T),
}

/// Outcome of waiting on another requester's flight.
#[derive(Debug, PartialEq)]
pub enum FlightWait<T> {
    Done(T),
    /// The leader went away without publishing.
    LeaderFailed,
    /// The waiter's own deadline expired first.
    TimedOut,
}

pub struct SingleFlight<T: Clone> {
    flights: Arc<DashMap<CacheKey, watch::Receiver<FlightState<T>>>>,
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
        }
    }

    /// Join the flight for a key: the first caller leads, the rest follow.
    pub fn join(&self, key: &CacheKey) -> Flight<T> {
        match self.flights.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                Flight::Waiter(entry.get().clone())
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(FlightState::Pending);
                slot.insert(rx);
                Flight::Leader(FlightLeader {
                    key: key.clone(),
                    tx: Some(tx),
                    flights: Arc::clone(&self.flights),
                })
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub enum Flight<T: Clone> {
    Leader(FlightLeader<T>),
    Waiter(watch::Receiver<FlightState<T>>),
}

pub struct FlightLeader<T: Clone> {
    key: CacheKey,
    tx: Option<watch::Sender<FlightState<T>>>,
    flights: Arc<DashMap<CacheKey, watch::Receiver<FlightState<T>>>>,
}

impl<T: Clone> FlightLeader<T> {
    /// Publish the outcome to every waiter and retire the flight.
    pub fn complete(mut self, value: T) {
        if let Some(tx) = self.tx.take() {
            // Send can only fail when no waiter subscribed, which is fine.
            let _ = tx.send(FlightState::Done(value));
        }
        self.flights.remove(&self.key);
    }
}

impl<T: Clone> Drop for FlightLeader<T> {
    fn drop(&mut self) {
        // Leader abandoned without completing: retire the flight so the
        // next requester can lead. Dropping the sender wakes waiters with
        // an error.
        if self.tx.is_some() {
            self.flights.remove(&self.key);
        }
    }
}

/// Wait for a flight's published outcome, up to `budget`.
pub async fn wait<T: Clone>(
    mut rx: watch::Receiver<FlightState<T>>,
    budget: Duration,
) -> FlightWait<T> {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        {
            let state = rx.borrow();
            if let FlightState::Done(value) = &*state {
                return FlightWait::Done(value.clone());
            }
        }
        match tokio::time::timeout_at(deadline, rx.changed()).await {
            Ok(Ok(())) => continue,
            Ok(Err(_)) => return FlightWait::LeaderFailed,
            Err(_) => return FlightWait::TimedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CacheKey {
        CacheKey::new(1, 1, "abcd")
    }

    #[tokio::test]
    async fn waiters_receive_the_leader_outcome() {
        let flights: SingleFlight<u32> = SingleFlight::new();

        let leader = match flights.join(&key()) {
            Flight::Leader(l) => l,
            Flight::Waiter(_) => panic!("first join must lead"),
        };

        let rx = match flights.join(&key()) {
            Flight::Waiter(rx) => rx,
            Flight::Leader(_) => panic!("second join must wait"),
        };

        let waiter = tokio::spawn(wait(rx, Duration::from_secs(1)));
        leader.complete(42);

        assert_eq!(waiter.await.unwrap(), FlightWait::Done(42));
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn abandoned_leader_fails_waiters_and_frees_the_key() {
        let flights: SingleFlight<u32> = SingleFlight::new();

        let leader = match flights.join(&key()) {
            Flight::Leader(l) => l,
            Flight::Waiter(_) => panic!(),
        };
        let rx = match flights.join(&key()) {
            Flight::Waiter(rx) => rx,
            Flight::Leader(_) => panic!(),
        };

        let waiter = tokio::spawn(wait(rx, Duration::from_secs(1)));
        drop(leader);

        assert_eq!(waiter.await.unwrap(), FlightWait::LeaderFailed);

        // Key is free again; the next join leads.
        assert!(matches!(flights.join(&key()), Flight::Leader(_)));
    }

    #[tokio::test]
    async fn waiter_deadline_expires_independently() {
        let flights: SingleFlight<u32> = SingleFlight::new();

        let _leader = match flights.join(&key()) {
            Flight::Leader(l) => l,
            Flight::Waiter(_) => panic!(),
        };
        let rx = match flights.join(&key()) {
            Flight::Waiter(rx) => rx,
            Flight::Leader(_) => panic!(),
        };

        assert_eq!(
            wait(rx, Duration::from_millis(20)).await,
            FlightWait::TimedOut
        );
    }

    #[tokio::test]
    async fn different_keys_fly_independently() {
        let flights: SingleFlight<u32> = SingleFlight::new();
        let other = CacheKey::new(2, 2, "efgh");

        assert!(matches!(flights.join(&key()), Flight::Leader(_)));
        assert!(matches!(flights.join(&other), Flight::Leader(_)));
        assert_eq!(flights.in_flight(), 2);
    }
}
