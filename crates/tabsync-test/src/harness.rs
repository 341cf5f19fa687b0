//! Simulated device
//!
//! A [`Device`] owns what the contexts of one device share: persistent
//! storage, the broadcast hub, the session and the remote service. Each
//! [`Context`] opened on it is an independent engine with its own
//! ephemeral plane, bus and event log. All contexts read one clock that
//! follows tokio time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tabsync_bus::{BroadcastHub, BroadcastTransport, FanoutBus, PulseTransport, Transport};
use tabsync_core::{namespace_of, ContextId, Domain, EngineEvent, Identity, Namespace, SessionAuth};
use tabsync_runtime::{Engine, EngineConfig, EngineParts, TokioClock};
use tabsync_storage::{CollectionStore, DeviceHandle, DeviceStore, MemoryStore, Planes, SelectionStore};
use tracing::debug;

use crate::{ChaosConfig, ChaosTransport, ScriptedService};

pub const THEME: &str = "theme";
pub const PALETTE: &str = "palette";

pub fn theme_domain() -> Domain {
    Domain::new(THEME, ["light", "dark", "sepia"])
}

pub fn palette_domain() -> Domain {
    Domain::new(PALETTE, ["red", "green", "blue", "gold"])
}

pub struct Device {
    pub storage: Arc<DeviceStore>,
    pub hub: Arc<BroadcastHub>,
    pub auth: Arc<SessionAuth>,
    pub service: Arc<ScriptedService>,
    pub clock: Arc<TokioClock>,
    config: EngineConfig,
    next_context: AtomicU64,
}

impl Device {
    pub fn guest() -> Self {
        Device {
            storage: DeviceStore::new(),
            hub: BroadcastHub::new(),
            auth: Arc::new(SessionAuth::anonymous()),
            service: Arc::new(ScriptedService::new()),
            clock: Arc::new(TokioClock::new()),
            config: EngineConfig::default(),
            next_context: AtomicU64::new(1),
        }
    }

    pub fn signed_in(user: &str) -> Self {
        let device = Self::guest();
        device.auth.login(Identity::new(user));
        device
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_service(mut self, service: ScriptedService) -> Self {
        self.service = Arc::new(service);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn namespace(&self) -> Namespace {
        namespace_of(self.auth.as_ref())
    }

    /// Open and start a context
    pub fn open(&self) -> Context {
        let context = self.open_cold();
        // start only fails on an already-running engine, which this is not
        let _ = context.engine.start();
        context
    }

    /// Open and start a context whose transports lose and duplicate facts
    pub fn open_chaotic(&self, chaos: ChaosConfig, seed: u64) -> Context {
        let context = self.build(Some((chaos, seed)));
        let _ = context.engine.start();
        context
    }

    /// Open a context without starting it
    pub fn open_cold(&self) -> Context {
        self.build(None)
    }

    /// Sign in on every context of the device
    pub fn login(&self, user: &str) {
        self.auth.login(Identity::new(user));
    }

    /// Sign out; returns the namespace that was active
    pub fn logout(&self) -> Namespace {
        let prior = self.namespace();
        self.auth.logout();
        prior
    }

    fn build(&self, chaos: Option<(ChaosConfig, u64)>) -> Context {
        let id = ContextId::new(self.next_context.fetch_add(1, Ordering::Relaxed));
        let handle = self.storage.attach(id);
        let broadcast = Arc::new(BroadcastTransport::new(Arc::clone(&self.hub), id));
        let mut transports: Vec<Arc<dyn Transport>> = vec![
            broadcast.clone(),
            Arc::new(PulseTransport::new(handle.clone())),
        ];
        if let Some((config, seed)) = chaos {
            transports = transports
                .into_iter()
                .zip(seed..)
                .map(|(t, s)| Arc::new(ChaosTransport::new(t, config.clone(), s)) as Arc<dyn Transport>)
                .collect();
        }

        let parts = EngineParts {
            context: id,
            auth: self.auth.clone(),
            planes: Planes::new(Arc::new(MemoryStore::new()), Arc::new(handle.clone())),
            bus: Arc::new(FanoutBus::with_dedup_capacity(transports, self.config.dedup_capacity)),
            remote: self.service.clone(),
            clock: self.clock.clone(),
            selections: vec![theme_domain()],
            collections: vec![palette_domain()],
        };
        let engine = Engine::new(parts, self.config.clone());

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        engine.subscribe(Arc::new(move |event: &EngineEvent| sink.lock().push(event.clone())));
        debug!(context = %id, "context opened");

        Context {
            engine,
            handle,
            broadcast,
            events,
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("storage", &self.storage)
            .field("namespace", &self.namespace())
            .finish()
    }
}

/// One open context
pub struct Context {
    pub engine: Engine,
    /// This context's view of device storage
    pub handle: DeviceHandle,
    /// This context's broadcast endpoint
    pub broadcast: Arc<BroadcastTransport>,
    events: Arc<Mutex<Vec<EngineEvent>>>,
}

impl Context {
    pub fn id(&self) -> ContextId {
        self.engine.context()
    }

    pub fn palette(&self) -> Option<Arc<CollectionStore>> {
        self.engine.collection(PALETTE)
    }

    pub fn theme(&self) -> Option<Arc<SelectionStore>> {
        self.engine.selection(THEME)
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    /// Drain the event log
    pub fn take_events(&self) -> Vec<EngineEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Cut this context off from device storage and the broadcast hub,
    /// like a private browsing window
    pub fn restrict(&self) {
        self.handle.set_available(false);
        self.broadcast.set_enabled(false);
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("engine", &self.engine)
            .field("events", &self.events.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contexts_get_distinct_ids() {
        let device = Device::guest();
        let a = device.open();
        let b = device.open();
        assert_ne!(a.id(), b.id());
        assert!(a.engine.is_started());
        assert!(!device.open_cold().engine.is_started());
    }

    #[test]
    fn test_login_switches_namespace() {
        let device = Device::guest();
        assert!(device.namespace().is_default());
        device.login("ann");
        assert_eq!(device.namespace(), Namespace::new("user-ann"));
        assert_eq!(device.logout(), Namespace::new("user-ann"));
    }
}
