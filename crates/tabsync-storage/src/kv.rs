//! Key-value store capability and the in-memory implementation

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tabsync_core::{SyncError, SyncResult};

/// String key-value storage, the shape of browser web storage.
/// Every call may fail: quota exhaustion and disabled storage are normal.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> SyncResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> SyncResult<()>;

    fn remove(&self, key: &str) -> SyncResult<()>;

    fn keys(&self) -> SyncResult<Vec<String>>;
}

/// In-memory store with an optional byte quota and an availability switch
#[derive(Debug)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
    quota: Option<usize>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            entries: RwLock::new(BTreeMap::new()),
            quota: None,
            available: AtomicBool::new(true),
        }
    }

    /// Store that refuses writes once keys plus values exceed `bytes`
    pub fn with_quota(bytes: usize) -> Self {
        MemoryStore {
            quota: Some(bytes),
            ..MemoryStore::new()
        }
    }

    /// Simulate storage being disabled (restricted browsing mode)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn used_bytes(&self) -> usize {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn check_available(&self) -> SyncResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(SyncError::StorageUnavailable("storage disabled".into()))
        }
    }

    /// Write and return the previous value
    pub(crate) fn replace(&self, key: &str, value: &str) -> SyncResult<Option<String>> {
        self.check_available()?;
        let mut entries = self.entries.write();

        if let Some(quota) = self.quota {
            let used: usize = entries.iter().map(|(k, v)| k.len() + v.len()).sum();
            let freed = entries.get(key).map(|old| key.len() + old.len()).unwrap_or(0);
            let needed = key.len() + value.len();
            let available = quota.saturating_sub(used - freed);
            if needed > available {
                return Err(SyncError::QuotaExceeded {
                    key: key.to_string(),
                    needed,
                    available,
                });
            }
        }

        Ok(entries.insert(key.to_string(), value.to_string()))
    }

    /// Remove and return the previous value
    pub(crate) fn take(&self, key: &str) -> SyncResult<Option<String>> {
        self.check_available()?;
        Ok(self.entries.write().remove(key))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> SyncResult<Option<String>> {
        self.check_available()?;
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        self.replace(key, value).map(|_| ())
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        self.take(key).map(|_| ())
    }

    fn keys(&self) -> SyncResult<Vec<String>> {
        self.check_available()?;
        Ok(self.entries.read().keys().cloned().collect())
    }
}
