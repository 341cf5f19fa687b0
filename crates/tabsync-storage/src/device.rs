//! Device-shared storage
//!
//! One [`DeviceStore`] stands for the persistent storage every context on a
//! device sees. Contexts reach it through a [`DeviceHandle`], which tags
//! writes with their origin so change notifications reach only the *other*
//! contexts, like the browser `storage` event.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tabsync_core::{ContextId, SyncError, SyncResult};

use crate::{KeyValueStore, MemoryStore};

/// A change observed on the device store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    pub new_value: Option<String>,
    pub origin: ContextId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

pub type StorageWatcher = Arc<dyn Fn(&StorageChange) + Send + Sync>;

/// Persistent storage shared by all contexts of one device
pub struct DeviceStore {
    backing: MemoryStore,
    watchers: RwLock<Vec<(WatchId, ContextId, StorageWatcher)>>,
    next_watch: AtomicU64,
}

impl DeviceStore {
    pub fn new() -> Arc<Self> {
        Self::with_backing(MemoryStore::new())
    }

    pub fn with_quota(bytes: usize) -> Arc<Self> {
        Self::with_backing(MemoryStore::with_quota(bytes))
    }

    fn with_backing(backing: MemoryStore) -> Arc<Self> {
        Arc::new(DeviceStore {
            backing,
            watchers: RwLock::new(Vec::new()),
            next_watch: AtomicU64::new(1),
        })
    }

    /// Handle for one context
    pub fn attach(self: &Arc<Self>, context: ContextId) -> DeviceHandle {
        DeviceHandle {
            device: Arc::clone(self),
            context,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Disable or enable storage for every context at once
    pub fn set_available(&self, available: bool) {
        self.backing.set_available(available);
    }

    /// Raw read that bypasses context availability; for inspection
    pub fn peek(&self, key: &str) -> Option<String> {
        self.backing.get(key).ok().flatten()
    }

    pub fn keys(&self) -> Vec<String> {
        self.backing.keys().unwrap_or_default()
    }

    fn notify(&self, change: StorageChange) {
        let targets: Vec<StorageWatcher> = self
            .watchers
            .read()
            .iter()
            .filter(|(_, ctx, _)| *ctx != change.origin)
            .map(|(_, _, w)| Arc::clone(w))
            .collect();
        for watcher in targets {
            watcher(&change);
        }
    }
}

impl std::fmt::Debug for DeviceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceStore")
            .field("keys", &self.backing.len())
            .field("watchers", &self.watchers.read().len())
            .finish()
    }
}

/// One context's view of the device store
#[derive(Clone)]
pub struct DeviceHandle {
    device: Arc<DeviceStore>,
    context: ContextId,
    available: Arc<AtomicBool>,
}

impl DeviceHandle {
    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn device(&self) -> &Arc<DeviceStore> {
        &self.device
    }

    /// Disable storage for this context only
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst) && self.device.backing.is_available()
    }

    /// Observe writes made by other contexts
    pub fn watch(&self, watcher: StorageWatcher) -> WatchId {
        let id = WatchId(self.device.next_watch.fetch_add(1, Ordering::Relaxed));
        self.device.watchers.write().push((id, self.context, watcher));
        id
    }

    pub fn unwatch(&self, id: WatchId) {
        self.device.watchers.write().retain(|(w, _, _)| *w != id);
    }

    fn check_available(&self) -> SyncResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::StorageUnavailable(format!(
                "storage disabled in context {}",
                self.context
            )))
        }
    }
}

impl KeyValueStore for DeviceHandle {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        self.check_available()?;
        self.device.backing.get(key)
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        self.check_available()?;
        let previous = self.device.backing.replace(key, value)?;
        if previous.as_deref() != Some(value) {
            self.device.notify(StorageChange {
                key: key.to_string(),
                new_value: Some(value.to_string()),
                origin: self.context,
            });
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        self.check_available()?;
        if self.device.backing.take(key)?.is_some() {
            self.device.notify(StorageChange {
                key: key.to_string(),
                new_value: None,
                origin: self.context,
            });
        }
        Ok(())
    }

    fn keys(&self) -> SyncResult<Vec<String>> {
        self.check_available()?;
        self.device.backing.keys()
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceHandle({:?})", self.context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_changes_reach_other_contexts_only() {
        let device = DeviceStore::new();
        let a = device.attach(ContextId::new(1));
        let b = device.attach(ContextId::new(2));

        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        let sink_a = Arc::clone(&seen_a);
        let sink_b = Arc::clone(&seen_b);
        a.watch(Arc::new(move |c: &StorageChange| sink_a.lock().push(c.clone())));
        b.watch(Arc::new(move |c: &StorageChange| sink_b.lock().push(c.clone())));

        a.set("k", "v").unwrap();

        assert!(seen_a.lock().is_empty());
        assert_eq!(seen_b.lock().len(), 1);
        assert_eq!(seen_b.lock()[0].origin, ContextId::new(1));
        assert_eq!(b.get("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_unchanged_write_is_silent() {
        let device = DeviceStore::new();
        let a = device.attach(ContextId::new(1));
        let b = device.attach(ContextId::new(2));
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        b.watch(Arc::new(move |_: &StorageChange| *sink.lock() += 1));

        a.set("k", "v").unwrap();
        a.set("k", "v").unwrap();
        a.remove("k").unwrap();
        a.remove("k").unwrap();

        assert_eq!(*count.lock(), 2);
    }

    #[test]
    fn test_per_context_availability() {
        let device = DeviceStore::new();
        let a = device.attach(ContextId::new(1));
        let b = device.attach(ContextId::new(2));

        a.set_available(false);
        assert!(a.set("k", "v").unwrap_err().is_storage());
        b.set("k", "v").unwrap();
        assert_eq!(device.peek("k").as_deref(), Some("v"));
    }

    #[test]
    fn test_unwatch() {
        let device = DeviceStore::new();
        let a = device.attach(ContextId::new(1));
        let b = device.attach(ContextId::new(2));
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let id = b.watch(Arc::new(move |_: &StorageChange| *sink.lock() += 1));
        b.unwatch(id);

        a.set("k", "v").unwrap();
        assert_eq!(*count.lock(), 0);
    }
}
