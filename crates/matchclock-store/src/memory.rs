//! In-memory store
//!
//! All clones share one set of slots, so clients in one process that hold
//! clones of the same `MemoryStore` observe each other's writes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;

use matchclock_core::{MatchclockError, MatchclockResult};

use crate::{OnChange, StateStore, Subscription};

struct Slot<T> {
    value: Option<T>,
    listeners: Vec<(u64, OnChange<T>)>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Slot {
            value: None,
            listeners: Vec::new(),
        }
    }
}

struct Inner<T> {
    slots: Mutex<HashMap<String, Slot<T>>>,
    next_listener: AtomicU64,
    available: AtomicBool,
    publishes: AtomicU64,
}

/// Process-local pub/sub store
pub struct MemoryStore<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for MemoryStore<T> {
    fn clone(&self) -> Self {
        MemoryStore {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        MemoryStore {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
                available: AtomicBool::new(true),
                publishes: AtomicU64::new(0),
            }),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> MemoryStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value at `key`
    pub fn get(&self, key: &str) -> Option<T> {
        self.inner
            .slots
            .lock()
            .get(key)
            .and_then(|slot| slot.value.clone())
    }

    /// Number of live subscriptions on `key`
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.inner
            .slots
            .lock()
            .get(key)
            .map_or(0, |slot| slot.listeners.len())
    }

    /// Live subscriptions across all keys
    pub fn total_subscribers(&self) -> usize {
        self.inner
            .slots
            .lock()
            .values()
            .map(|slot| slot.listeners.len())
            .sum()
    }

    /// Successful publishes so far
    pub fn publish_count(&self) -> u64 {
        self.inner.publishes.load(Ordering::SeqCst)
    }

    /// Simulate losing (or regaining) the connection to the backend.
    /// While unavailable every publish fails with `TransportFailure`.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Replace the value and fan out to subscribers
    pub fn put(&self, key: &str, value: T) {
        let listeners: Vec<OnChange<T>> = {
            let mut slots = self.inner.slots.lock();
            let slot = slots.entry(key.to_string()).or_default();
            slot.value = Some(value.clone());
            slot.listeners.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        self.inner.publishes.fetch_add(1, Ordering::SeqCst);

        // Callbacks run outside the lock so they may publish again.
        for listener in listeners {
            listener(Some(value.clone()));
        }
    }

    /// Remove the value at `key`; subscribers see `None`
    pub fn remove(&self, key: &str) {
        let listeners: Vec<OnChange<T>> = {
            let mut slots = self.inner.slots.lock();
            match slots.get_mut(key) {
                Some(slot) if slot.value.is_some() => {
                    slot.value = None;
                    slot.listeners.iter().map(|(_, cb)| Arc::clone(cb)).collect()
                }
                _ => Vec::new(),
            }
        };
        for listener in listeners {
            listener(None);
        }
    }
}

fn detach<T>(inner: &Weak<Inner<T>>, key: &str, id: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut slots = inner.slots.lock();
    if let Some(slot) = slots.get_mut(key) {
        slot.listeners.retain(|(listener, _)| *listener != id);
        if slot.listeners.is_empty() && slot.value.is_none() {
            slots.remove(key);
        }
    }
}

#[async_trait]
impl<T> StateStore<T> for MemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn publish(&self, key: &str, value: &T) -> MatchclockResult<()> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(MatchclockError::TransportFailure(format!(
                "memory store unavailable for {}",
                key
            )));
        }
        self.put(key, value.clone());
        Ok(())
    }

    async fn fetch(&self, key: &str) -> MatchclockResult<Option<T>> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(MatchclockError::TransportFailure(format!(
                "memory store unavailable for {}",
                key
            )));
        }
        Ok(self.get(key))
    }

    fn subscribe(&self, key: &str, on_change: OnChange<T>) -> Subscription {
        let id = self.inner.next_listener.fetch_add(1, Ordering::SeqCst);
        let current = {
            let mut slots = self.inner.slots.lock();
            let slot = slots.entry(key.to_string()).or_default();
            slot.listeners.push((id, Arc::clone(&on_change)));
            slot.value.clone()
        };
        on_change(current);

        let weak = Arc::downgrade(&self.inner);
        let owned_key = key.to_string();
        Subscription::new(key, move || detach(&weak, &owned_key, id))
    }
}
