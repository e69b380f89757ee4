//! Chaos store for convergence testing
//!
//! Wraps a `MemoryStore` and simulates a hostile backend:
//! - Publish failures
//! - Reordered deliveries
//! - Duplicated deliveries
//!
//! Deliveries are queued rather than invoked, and released by `flush`.
//! Nothing is ever lost once published, so a full flush always leaves
//! every subscriber having seen the latest value.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use matchclock_core::{MatchclockError, MatchclockResult};
use matchclock_store::{MemoryStore, OnChange, StateStore, Subscription};

/// Store chaos configuration
#[derive(Clone, Debug)]
pub struct ChaosConfig {
    /// Publish failure rate (0.0 - 1.0)
    pub publish_failure_rate: f64,
    /// Reorder probability per delivery
    pub reorder_prob: f64,
    /// How far back a reordered delivery may jump
    pub reorder_depth: usize,
    /// Duplicate probability per delivery
    pub duplicate_prob: f64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self::lossy()
    }
}

impl ChaosConfig {
    /// Reliable, in-order backend
    pub fn calm() -> Self {
        ChaosConfig {
            publish_failure_rate: 0.0,
            reorder_prob: 0.0,
            reorder_depth: 0,
            duplicate_prob: 0.0,
        }
    }

    /// Flaky connection
    pub fn lossy() -> Self {
        ChaosConfig {
            publish_failure_rate: 0.1,
            reorder_prob: 0.2,
            reorder_depth: 3,
            duplicate_prob: 0.05,
        }
    }

    /// Hostile backend
    pub fn hostile() -> Self {
        ChaosConfig {
            publish_failure_rate: 0.3,
            reorder_prob: 0.5,
            reorder_depth: 10,
            duplicate_prob: 0.2,
        }
    }
}

/// Chaos store statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChaosStats {
    pub publishes: u64,
    pub publish_failures: u64,
    pub queued: u64,
    pub delivered: u64,
    pub reordered: u64,
    pub duplicated: u64,
    /// Queued for a subscription that was cancelled before flush
    pub discarded: u64,
}

struct Delivery<T> {
    on_change: OnChange<T>,
    value: Option<T>,
    alive: Arc<AtomicBool>,
}

impl<T: Clone> Clone for Delivery<T> {
    fn clone(&self) -> Self {
        Delivery {
            on_change: Arc::clone(&self.on_change),
            value: self.value.clone(),
            alive: Arc::clone(&self.alive),
        }
    }
}

struct ChaosState<T> {
    config: ChaosConfig,
    rng: StdRng,
    queue: Vec<Delivery<T>>,
    /// Every accepted publish, in arrival order
    log: Vec<(String, T)>,
    stats: ChaosStats,
}

impl<T: Clone> ChaosState<T> {
    fn enqueue(&mut self, delivery: Delivery<T>) {
        self.stats.queued += 1;

        if self.rng.gen::<f64>() < self.config.duplicate_prob {
            let at = self.rng.gen_range(0..=self.queue.len());
            self.queue.insert(at, delivery.clone());
            self.stats.duplicated += 1;
        }

        if self.rng.gen::<f64>() < self.config.reorder_prob && !self.queue.is_empty() {
            let depth = self.config.reorder_depth.min(self.queue.len());
            let back = self.rng.gen_range(0..=depth);
            let at = self.queue.len() - back;
            self.queue.insert(at, delivery);
            self.stats.reordered += 1;
        } else {
            self.queue.push(delivery);
        }
    }
}

/// Chaos store
pub struct ChaosStore<T> {
    memory: MemoryStore<T>,
    state: Arc<Mutex<ChaosState<T>>>,
}

impl<T> Clone for ChaosStore<T> {
    fn clone(&self) -> Self {
        ChaosStore {
            memory: self.memory.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ChaosStore<T> {
    /// Create a new chaos store with seed
    pub fn new(config: ChaosConfig, seed: u64) -> Self {
        ChaosStore {
            memory: MemoryStore::new(),
            state: Arc::new(Mutex::new(ChaosState {
                config,
                rng: StdRng::seed_from_u64(seed),
                queue: Vec::new(),
                log: Vec::new(),
                stats: ChaosStats::default(),
            })),
        }
    }

    pub fn calm() -> Self {
        Self::new(ChaosConfig::calm(), 0)
    }

    /// Authoritative value at `key`
    pub fn get(&self, key: &str) -> Option<T> {
        self.memory.get(key)
    }

    /// Every value accepted at `key`, oldest first
    pub fn published(&self, key: &str) -> Vec<T> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// The wrapped store
    pub fn memory(&self) -> &MemoryStore<T> {
        &self.memory
    }

    pub fn set_config(&self, config: ChaosConfig) {
        self.state.lock().config = config;
    }

    /// Deliveries waiting for `flush`
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn stats(&self) -> ChaosStats {
        self.state.lock().stats.clone()
    }

    /// Release up to `max` queued deliveries in queue order
    pub fn deliver(&self, max: usize) -> usize {
        let batch: Vec<Delivery<T>> = {
            let mut state = self.state.lock();
            let n = max.min(state.queue.len());
            state.queue.drain(..n).collect()
        };

        let mut delivered = 0;
        let mut discarded = 0;
        for delivery in batch {
            if delivery.alive.load(Ordering::SeqCst) {
                (delivery.on_change)(delivery.value);
                delivered += 1;
            } else {
                discarded += 1;
            }
        }

        let mut state = self.state.lock();
        state.stats.delivered += delivered as u64;
        state.stats.discarded += discarded;
        delivered
    }

    /// Release every queued delivery, including ones queued while flushing
    pub fn flush(&self) -> usize {
        let mut total = 0;
        while self.pending() > 0 {
            total += self.deliver(usize::MAX);
        }
        total
    }
}

#[async_trait]
impl<T> StateStore<T> for ChaosStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn publish(&self, key: &str, value: &T) -> MatchclockResult<()> {
        let failed = {
            let mut state = self.state.lock();
            state.stats.publishes += 1;
            let failed = state.rng.gen::<f64>() < state.config.publish_failure_rate;
            if failed {
                state.stats.publish_failures += 1;
            } else {
                state.log.push((key.to_string(), value.clone()));
            }
            failed
        };
        if failed {
            return Err(MatchclockError::TransportFailure(format!(
                "chaos: publish to {} dropped",
                key
            )));
        }
        self.memory.put(key, value.clone());
        Ok(())
    }

    async fn fetch(&self, key: &str) -> MatchclockResult<Option<T>> {
        self.memory.fetch(key).await
    }

    fn subscribe(&self, key: &str, on_change: OnChange<T>) -> Subscription {
        let alive = Arc::new(AtomicBool::new(true));
        let queue = Arc::clone(&self.state);
        let flag = Arc::clone(&alive);
        let inner = self.memory.subscribe(
            key,
            Arc::new(move |value: Option<T>| {
                queue.lock().enqueue(Delivery {
                    on_change: Arc::clone(&on_change),
                    value,
                    alive: Arc::clone(&flag),
                });
            }),
        );
        Subscription::new(key, move || {
            alive.store(false, Ordering::SeqCst);
            drop(inner);
        })
    }
}
