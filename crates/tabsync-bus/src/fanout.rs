//! Fan-out fact bus
//!
//! Publishes on every available transport and hands each logical fact to
//! subscribers once, however many transports carried it. Transport
//! listeners are installed on the first subscription to a topic and
//! removed with the last.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tabsync_core::{FactBus, FactHandler, FanOut, SubscriptionId, SyncFact, Topic};
use tracing::{debug, trace, warn};

use crate::{DedupWindow, FactSink, ListenId, Transport, TransportKind};

struct Shared {
    handlers: RwLock<HashMap<Topic, Vec<(SubscriptionId, FactHandler)>>>,
    dedup: Mutex<DedupWindow>,
}

impl Shared {
    fn deliver(&self, topic: &Topic, fact: SyncFact) {
        if !fact.is_consistent() {
            trace!(topic = %topic, "inconsistent fact dropped");
            return;
        }
        if !self.dedup.lock().accept(topic, fact.signature()) {
            trace!(topic = %topic, kind = ?fact.kind, "duplicate fact dropped");
            return;
        }
        let handlers: Vec<FactHandler> = self
            .handlers
            .read()
            .get(topic)
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(topic, &fact);
        }
    }
}

pub struct FanoutBus {
    transports: Vec<Arc<dyn Transport>>,
    shared: Arc<Shared>,
    listens: Mutex<HashMap<Topic, Vec<(usize, ListenId)>>>,
}

impl FanoutBus {
    pub fn new(transports: Vec<Arc<dyn Transport>>) -> Self {
        Self::with_dedup_capacity(transports, DedupWindow::DEFAULT_CAPACITY)
    }

    pub fn with_dedup_capacity(transports: Vec<Arc<dyn Transport>>, capacity: usize) -> Self {
        FanoutBus {
            transports,
            shared: Arc::new(Shared {
                handlers: RwLock::new(HashMap::new()),
                dedup: Mutex::new(DedupWindow::new(capacity)),
            }),
            listens: Mutex::new(HashMap::new()),
        }
    }

    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.transports
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.shared.handlers.read().get(topic).map_or(0, Vec::len)
    }

    fn install(&self, topic: &Topic) {
        let mut listens = self.listens.lock();
        if listens.contains_key(topic) {
            return;
        }
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let sink: FactSink = Arc::new(move |topic: &Topic, fact: SyncFact| {
            if let Some(shared) = weak.upgrade() {
                shared.deliver(topic, fact);
            }
        });

        let mut installed = Vec::new();
        for (index, transport) in self.transports.iter().enumerate() {
            match transport.listen(topic, Arc::clone(&sink)) {
                Ok(id) => installed.push((index, id)),
                Err(e) => warn!(transport = transport.name(), topic = %topic, error = %e, "listener not installed"),
            }
        }
        debug!(topic = %topic, transports = installed.len(), "listening");
        listens.insert(topic.clone(), installed);
    }

    fn uninstall(&self, topic: &Topic) {
        if let Some(installed) = self.listens.lock().remove(topic) {
            for (index, id) in installed {
                if let Some(transport) = self.transports.get(index) {
                    transport.unlisten(id);
                }
            }
            debug!(topic = %topic, "stopped listening");
        }
    }
}

impl FactBus for FanoutBus {
    fn publish_scoped(&self, topic: &Topic, fact: &SyncFact, fan_out: FanOut) -> usize {
        let mut sent = 0;
        for transport in &self.transports {
            if fan_out == FanOut::BroadcastOnly && transport.kind() != TransportKind::Broadcast {
                continue;
            }
            if !transport.is_available() {
                trace!(transport = transport.name(), "transport unavailable, skipped");
                continue;
            }
            match transport.send(topic, fact) {
                Ok(()) => sent += 1,
                Err(e) => warn!(transport = transport.name(), topic = %topic, error = %e, "publish failed"),
            }
        }
        sent
    }

    fn subscribe(&self, topic: &Topic, handler: FactHandler) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.shared
            .handlers
            .write()
            .entry(topic.clone())
            .or_default()
            .push((id, handler));
        self.install(topic);
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let emptied: Vec<Topic> = {
            let mut handlers = self.shared.handlers.write();
            for hs in handlers.values_mut() {
                hs.retain(|(s, _)| *s != id);
            }
            let emptied = handlers
                .iter()
                .filter(|(_, hs)| hs.is_empty())
                .map(|(t, _)| t.clone())
                .collect();
            handlers.retain(|_, hs| !hs.is_empty());
            emptied
        };
        for topic in emptied {
            self.uninstall(&topic);
        }
    }
}

impl Drop for FanoutBus {
    fn drop(&mut self) {
        let topics: Vec<Topic> = self.listens.lock().keys().cloned().collect();
        for topic in topics {
            self.uninstall(&topic);
        }
    }
}

impl std::fmt::Debug for FanoutBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.transports.iter().map(|t| t.name()).collect();
        f.debug_struct("FanoutBus")
            .field("transports", &names)
            .field("topics", &self.listens.lock().len())
            .finish()
    }
}
