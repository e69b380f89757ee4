//! State store adapter contract
//!
//! The store is treated as an untrusted, eventually consistent channel:
//! - `publish` is an atomic whole-value replace that may fail
//! - `fetch` is a one-shot read that leaves nothing registered
//! - `subscribe` delivers the current value (or `None`) immediately, then
//!   every later change, at least once and in no guaranteed order

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use matchclock_core::MatchclockResult;

use crate::{FileStore, FileStoreConfig, MemoryStore};

/// Change callback. `None` means the key is absent.
pub type OnChange<T> = Arc<dyn Fn(Option<T>) + Send + Sync>;

/// Pub/sub state store keyed by string
#[async_trait]
pub trait StateStore<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// Atomically replace the value at `key`
    async fn publish(&self, key: &str, value: &T) -> MatchclockResult<()>;

    /// Read the value at `key` once, without subscribing
    async fn fetch(&self, key: &str) -> MatchclockResult<Option<T>>;

    /// Watch `key`. The returned handle must be kept alive for as long as
    /// callbacks are wanted.
    fn subscribe(&self, key: &str, on_change: OnChange<T>) -> Subscription;
}

/// Live subscription. Unsubscribes on drop.
pub struct Subscription {
    key: String,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(key: impl Into<String>, cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Subscription {
            key: key.into(),
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }

    /// Stop receiving changes
    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Store implementation, chosen once at startup
#[derive(Clone, Debug, Default)]
pub enum StoreBackend {
    /// Process-local store
    #[default]
    Memory,
    /// JSON files in a shared directory
    File(FileStoreConfig),
}

impl StoreBackend {
    pub fn name(&self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::File(_) => "file",
        }
    }

    /// Open a store of `T` values on this backend
    pub fn open<T>(&self) -> MatchclockResult<Arc<dyn StateStore<T>>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        match self {
            StoreBackend::Memory => Ok(Arc::new(MemoryStore::<T>::new())),
            StoreBackend::File(config) => Ok(Arc::new(FileStore::<T>::open(config.clone())?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_subscription_cancels_once() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let mut sub = Subscription::new("timer", move || {
            assert!(!flag.swap(true, Ordering::SeqCst));
        });

        assert!(sub.is_active());
        sub.unsubscribe();
        assert!(!sub.is_active());
        drop(sub);
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_unsubscribes() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let sub = Subscription::new("timer", move || flag.store(true, Ordering::SeqCst));
        drop(sub);
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn test_backend_names() {
        assert_eq!(StoreBackend::Memory.name(), "memory");
        assert_eq!(
            StoreBackend::File(FileStoreConfig::default()).name(),
            "file"
        );
    }
}
