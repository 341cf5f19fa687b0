//! Engine events and local listeners
//!
//! Listeners are the same-context half of every change: they are invoked
//! synchronously by the mutating call, before anything is published.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::ItemId;

/// Events emitted to the rendering layer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    SelectionChanged {
        domain: String,
        value: Option<String>,
    },
    CollectionChanged {
        domain: String,
        members: BTreeSet<String>,
    },
    ItemLikeChanged {
        item: ItemId,
        liked: bool,
        count: u64,
    },
    ItemVoteChanged {
        item: ItemId,
        counts: BTreeMap<String, u64>,
        my_choice: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Same-context listener registry. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct Listeners {
    entries: Arc<RwLock<Vec<(ListenerId, Listener)>>>,
    next_id: Arc<AtomicU64>,
}

impl Listeners {
    pub fn new() -> Self {
        Listeners::default()
    }

    pub fn add(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Invoke every listener. The registry lock is released first so a
    /// listener may add or remove listeners.
    pub fn emit(&self, event: &EngineEvent) {
        let snapshot: Vec<Listener> = self
            .entries
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Listeners({})", self.len())
    }
}
