//! Shared fixtures for store tests

use std::sync::Arc;

use parking_lot::Mutex;
use tabsync_core::{
    ContextId, EngineEvent, FactBus, FactHandler, FanOut, Identity, Listeners, SessionAuth,
    SubscriptionId, SyncFact, Timestamp, Topic,
};
use tabsync_time::ManualClock;

use crate::{DeviceHandle, DeviceStore, MemoryStore, NamespaceResolver, Planes, StoreContext};

/// Bus that records every publish and delivers nothing
#[derive(Default)]
pub(crate) struct RecordingBus {
    published: Mutex<Vec<(Topic, SyncFact, FanOut)>>,
}

impl RecordingBus {
    pub(crate) fn published(&self) -> Vec<(Topic, SyncFact, FanOut)> {
        self.published.lock().clone()
    }
}

impl FactBus for RecordingBus {
    fn publish_scoped(&self, topic: &Topic, fact: &SyncFact, fan_out: FanOut) -> usize {
        self.published
            .lock()
            .push((topic.clone(), fact.clone(), fan_out));
        1
    }

    fn subscribe(&self, _topic: &Topic, _handler: FactHandler) -> SubscriptionId {
        SubscriptionId::next()
    }

    fn unsubscribe(&self, _id: SubscriptionId) {}
}

pub(crate) struct Fixture {
    pub auth: Arc<SessionAuth>,
    pub ephemeral: Arc<MemoryStore>,
    pub device: Arc<DeviceStore>,
    pub persistent: DeviceHandle,
    pub bus: Arc<RecordingBus>,
    pub clock: Arc<ManualClock>,
    pub listeners: Listeners,
    events: Arc<Mutex<Vec<EngineEvent>>>,
}

impl Fixture {
    pub(crate) fn guest() -> Self {
        Self::with_auth(SessionAuth::anonymous())
    }

    pub(crate) fn signed_in(id: &str) -> Self {
        Self::with_auth(SessionAuth::signed_in(Identity::new(id)))
    }

    fn with_auth(auth: SessionAuth) -> Self {
        let device = DeviceStore::new();
        let persistent = device.attach(ContextId::new(1));
        let listeners = Listeners::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        listeners.add(Arc::new(move |e: &EngineEvent| sink.lock().push(e.clone())));

        Fixture {
            auth: Arc::new(auth),
            ephemeral: Arc::new(MemoryStore::new()),
            device,
            persistent,
            bus: Arc::new(RecordingBus::default()),
            clock: Arc::new(ManualClock::new(Timestamp::from_millis(1_000_000))),
            listeners,
            events,
        }
    }

    pub(crate) fn ctx(&self) -> StoreContext {
        StoreContext {
            resolver: NamespaceResolver::new(self.auth.clone()),
            planes: Planes::new(self.ephemeral.clone(), Arc::new(self.persistent.clone())),
            bus: self.bus.clone(),
            listeners: self.listeners.clone(),
            clock: self.clock.clone(),
        }
    }

    pub(crate) fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }
}
