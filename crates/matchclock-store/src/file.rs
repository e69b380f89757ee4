//! File-backed store
//!
//! One JSON document per key under a shared directory. Writes replace the
//! whole document atomically (temp file + rename), so a reader never sees a
//! partial value. Subscribers in the same process are notified on publish;
//! writes from other processes are picked up by a polling watcher.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::runtime::RuntimeFlavor;

use matchclock_core::{MatchclockError, MatchclockResult};

use crate::{OnChange, StateStore, Subscription};

/// File store configuration
#[derive(Clone, Debug)]
pub struct FileStoreConfig {
    /// Directory holding one JSON file per key
    pub dir: PathBuf,
    /// How often watchers re-read their key
    pub poll_interval: Duration,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        FileStoreConfig {
            dir: std::env::temp_dir().join("matchclock"),
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl FileStoreConfig {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        FileStoreConfig {
            dir: dir.into(),
            ..Self::default()
        }
    }
}

/// Bytes last delivered to one subscriber, shared with its watcher
type LastSeen = Arc<Mutex<Option<Vec<u8>>>>;

struct Listener<T> {
    id: u64,
    on_change: OnChange<T>,
    last_seen: LastSeen,
}

struct Inner<T> {
    config: FileStoreConfig,
    listeners: Mutex<HashMap<String, Vec<Listener<T>>>>,
    next_id: AtomicU64,
    /// Serializes local writes against local watcher reads
    io: Arc<tokio::sync::Mutex<()>>,
}

/// JSON-file store
pub struct FileStore<T> {
    inner: Arc<Inner<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for FileStore<T> {
    fn clone(&self) -> Self {
        FileStore {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

impl<T> FileStore<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Open (creating if needed) the store directory
    pub fn open(config: FileStoreConfig) -> MatchclockResult<Self> {
        std::fs::create_dir_all(&config.dir)?;
        Ok(FileStore {
            inner: Arc::new(Inner {
                config,
                listeners: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                io: Arc::new(tokio::sync::Mutex::new(())),
            }),
            _marker: PhantomData,
        })
    }

    pub fn config(&self) -> &FileStoreConfig {
        &self.inner.config
    }

    /// Path of the document for `key`
    pub fn path_for(&self, key: &str) -> PathBuf {
        key_path(&self.inner.config.dir, key)
    }

    /// Read the current value at `key`
    pub fn get(&self, key: &str) -> MatchclockResult<Option<T>> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => decode(&bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.inner.listeners.lock().get(key).map_or(0, Vec::len)
    }

    fn notify_local(&self, key: &str, bytes: &[u8], value: &T) {
        let targets: Vec<(OnChange<T>, LastSeen)> = {
            let listeners = self.inner.listeners.lock();
            listeners
                .get(key)
                .map(|list| {
                    list.iter()
                        .map(|l| (Arc::clone(&l.on_change), Arc::clone(&l.last_seen)))
                        .collect()
                })
                .unwrap_or_default()
        };
        for (on_change, last_seen) in targets {
            *last_seen.lock() = Some(bytes.to_vec());
            on_change(Some(value.clone()));
        }
    }
}

/// Map a store key to a file path, one directory level per `/` segment.
/// Segments are restricted to `[A-Za-z0-9_-]`; anything else becomes `_`.
fn key_path(dir: &Path, key: &str) -> PathBuf {
    let mut path = dir.to_path_buf();
    let segments: Vec<String> = key
        .split('/')
        .map(|segment| {
            let clean: String = segment
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                        c
                    } else {
                        '_'
                    }
                })
                .collect();
            if clean.is_empty() {
                "_".to_string()
            } else {
                clean
            }
        })
        .collect();
    if let Some((last, parents)) = segments.split_last() {
        for parent in parents {
            path.push(parent);
        }
        path.push(format!("{}.json", last));
    }
    path
}

/// Synchronous read for `subscribe`, moved off the async worker when the
/// runtime allows blocking in place
fn read_initial(path: &Path) -> std::io::Result<Vec<u8>> {
    let read = || std::fs::read(path);
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(read)
        }
        _ => read(),
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> MatchclockResult<T> {
    serde_json::from_slice(bytes).map_err(|e| MatchclockError::Serialization(e.to_string()))
}

fn detach<T>(inner: &Weak<Inner<T>>, key: &str, id: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut listeners = inner.listeners.lock();
    if let Some(list) = listeners.get_mut(key) {
        list.retain(|l| l.id != id);
        if list.is_empty() {
            listeners.remove(key);
        }
    }
}

async fn watch_file<T>(
    path: PathBuf,
    poll_interval: Duration,
    io: Arc<tokio::sync::Mutex<()>>,
    on_change: OnChange<T>,
    last_seen: LastSeen,
) where
    T: DeserializeOwned + Send + 'static,
{
    let mut ticks = tokio::time::interval(poll_interval);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticks.tick().await;
        let _io = io.lock().await;
        let current = match tokio::fs::read(&path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "file store read failed");
                continue;
            }
        };

        let changed = {
            let mut seen = last_seen.lock();
            if *seen == current {
                false
            } else {
                *seen = current.clone();
                true
            }
        };
        if !changed {
            continue;
        }

        match current {
            Some(bytes) => match decode::<T>(&bytes) {
                Ok(value) => on_change(Some(value)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "ignoring unparseable store file")
                }
            },
            None => on_change(None),
        }
    }
}

#[async_trait]
impl<T> StateStore<T> for FileStore<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn publish(&self, key: &str, value: &T) -> MatchclockResult<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| MatchclockError::Serialization(e.to_string()))?;
        let path = self.path_for(key);
        let transport = |e: std::io::Error| {
            MatchclockError::TransportFailure(format!("{}: {}", path.display(), e))
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(transport)?;
        }
        let _io = self.inner.io.lock().await;
        let tmp = path.with_extension(format!(
            "json.{}.tmp",
            self.inner.next_id.fetch_add(1, Ordering::SeqCst)
        ));
        let written = match tokio::fs::write(&tmp, &bytes).await {
            Ok(()) => tokio::fs::rename(&tmp, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                if cleanup.kind() != ErrorKind::NotFound {
                    tracing::warn!(path = %tmp.display(), error = %cleanup, "temp file left behind");
                }
            }
            return Err(transport(e));
        }

        self.notify_local(key, &bytes, value);
        Ok(())
    }

    async fn fetch(&self, key: &str) -> MatchclockResult<Option<T>> {
        let path = self.path_for(key);
        let _io = self.inner.io.lock().await;
        match tokio::fs::read(&path).await {
            Ok(bytes) => decode(&bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MatchclockError::TransportFailure(format!(
                "{}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn subscribe(&self, key: &str, on_change: OnChange<T>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let path = self.path_for(key);

        let initial_bytes = match read_initial(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "file store read failed");
                }
                None
            }
        };
        let initial = initial_bytes.as_deref().and_then(|bytes| match decode::<T>(bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unparseable store file");
                None
            }
        });
        let last_seen: LastSeen = Arc::new(Mutex::new(initial_bytes));

        self.inner
            .listeners
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(Listener {
                id,
                on_change: Arc::clone(&on_change),
                last_seen: Arc::clone(&last_seen),
            });
        on_change(initial);

        let watcher = match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn(watch_file::<T>(
                path,
                self.inner.config.poll_interval,
                Arc::clone(&self.inner.io),
                on_change,
                last_seen,
            ))),
            Err(_) => {
                tracing::debug!(key, "no runtime; file store subscription is process-local");
                None
            }
        };

        let weak = Arc::downgrade(&self.inner);
        let owned_key = key.to_string();
        Subscription::new(key, move || {
            if let Some(watcher) = watcher {
                watcher.abort();
            }
            detach(&weak, &owned_key, id);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        n: u32,
    }

    fn recorder() -> (OnChange<Doc>, Arc<Mutex<Vec<Option<Doc>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (Arc::new(move |v| sink.lock().push(v)), seen)
    }

    fn fast_config(dir: &Path) -> FileStoreConfig {
        FileStoreConfig {
            dir: dir.to_path_buf(),
            poll_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_key_path_is_sanitized() {
        let dir = Path::new("/store");
        assert_eq!(key_path(dir, "timer"), PathBuf::from("/store/timer.json"));
        assert_eq!(
            key_path(dir, "timer/ABC"),
            PathBuf::from("/store/timer/ABC.json")
        );
        assert_eq!(
            key_path(dir, "timer/../../etc"),
            PathBuf::from("/store/timer/__/__/etc.json")
        );
    }

    #[tokio::test]
    async fn test_publish_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::<Doc>::open(fast_config(dir.path())).unwrap();

        assert_eq!(store.get("timer/x").unwrap(), None);
        store.publish("timer/x", &Doc { n: 4 }).await.unwrap();
        assert_eq!(store.get("timer/x").unwrap(), Some(Doc { n: 4 }));
        assert!(store.path_for("timer/x").exists());
    }

    #[tokio::test]
    async fn test_local_subscriber_notified() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::<Doc>::open(fast_config(dir.path())).unwrap();
        let (cb, seen) = recorder();

        let _sub = store.subscribe("timer", cb);
        store.publish("timer", &Doc { n: 1 }).await.unwrap();
        // watcher must not re-deliver bytes already delivered locally
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*seen.lock(), vec![None, Some(Doc { n: 1 })]);
    }

    #[tokio::test]
    async fn test_watcher_sees_other_process_writes() {
        let dir = tempfile::tempdir().unwrap();
        let reader = FileStore::<Doc>::open(fast_config(dir.path())).unwrap();
        let writer = FileStore::<Doc>::open(fast_config(dir.path())).unwrap();
        let (cb, seen) = recorder();

        let _sub = reader.subscribe("timer", cb);
        writer.publish("timer", &Doc { n: 8 }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(seen.lock().last().cloned(), Some(Some(Doc { n: 8 })));
    }

    #[tokio::test]
    async fn test_unparseable_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::<Doc>::open(fast_config(dir.path())).unwrap();
        std::fs::write(store.path_for("timer"), b"{not json").unwrap();

        let (cb, seen) = recorder();
        let _sub = store.subscribe("timer", cb);
        assert_eq!(*seen.lock(), vec![None]);
        assert!(store.get("timer").is_err());
    }

    #[tokio::test]
    async fn test_fetch_reads_without_subscribing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::<Doc>::open(fast_config(dir.path())).unwrap();

        assert_eq!(store.fetch("timer/x").await.unwrap(), None);
        store.publish("timer/x", &Doc { n: 6 }).await.unwrap();
        assert_eq!(store.fetch("timer/x").await.unwrap(), Some(Doc { n: 6 }));
        assert_eq!(store.subscriber_count("timer/x"), 0);
    }

    #[tokio::test]
    async fn test_failed_publish_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::<Doc>::open(fast_config(dir.path())).unwrap();
        // a non-empty directory where the document belongs makes the rename fail
        let target = store.path_for("timer");
        std::fs::create_dir_all(target.join("occupied")).unwrap();

        let err = store.publish("timer", &Doc { n: 1 }).await.unwrap_err();
        assert!(matches!(err, MatchclockError::TransportFailure(_)));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_subscribe_on_multi_thread_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::<Doc>::open(fast_config(dir.path())).unwrap();
        store.publish("timer", &Doc { n: 3 }).await.unwrap();

        let (cb, seen) = recorder();
        let _sub = store.subscribe("timer", cb);
        assert_eq!(*seen.lock(), vec![Some(Doc { n: 3 })]);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_watcher() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::<Doc>::open(fast_config(dir.path())).unwrap();
        let other = FileStore::<Doc>::open(fast_config(dir.path())).unwrap();
        let (cb, seen) = recorder();

        let mut sub = store.subscribe("timer", cb);
        assert_eq!(store.subscriber_count("timer"), 1);
        sub.unsubscribe();
        assert_eq!(store.subscriber_count("timer"), 0);

        other.publish("timer", &Doc { n: 2 }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(*seen.lock(), vec![None]);
    }
}
