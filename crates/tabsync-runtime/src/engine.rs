//! Per-context engine
//!
//! Owns the stores, the intent hub and the reconciliation client of one
//! execution context, and routes facts from other contexts to them.
//! Several engines coexist in one process; each is started once and shut
//! down explicitly or on drop.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tabsync_bus::{BroadcastHub, BroadcastTransport, FanoutBus, PulseTransport, Transport};
use tabsync_core::{
    AuthStateProvider, ContextId, Domain, FactBus, FactData, ItemId, Listener, ListenerId,
    Listeners, Namespace, SubscriptionId, SyncError, SyncFact, SyncResult, Topic,
};
use tabsync_state::{LikeView, VoteView};
use tabsync_storage::{
    clear_ephemeral, migrate_legacy, purge_on_logout, CollectionStore, DeviceStore, MemoryStore,
    MigrationReport, NamespaceResolver, Planes, SelectionStore, StoreContext,
};
use tabsync_time::{Clock, SystemClock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::{EngineConfig, IntentHub, ReconciliationClient, RemoteService};

/// Handle to a background mutation; `None` when no runtime was available
pub type Pending<T> = Option<JoinHandle<SyncResult<T>>>;

/// Capabilities an engine is built from
pub struct EngineParts {
    pub context: ContextId,
    pub auth: Arc<dyn AuthStateProvider>,
    pub planes: Planes,
    pub bus: Arc<dyn FactBus>,
    pub remote: Arc<dyn RemoteService>,
    pub clock: Arc<dyn Clock>,
    pub selections: Vec<Domain>,
    pub collections: Vec<Domain>,
}

impl EngineParts {
    /// Wire a context onto a device: a private ephemeral plane, the
    /// device store as persistent plane, and a bus over the broadcast hub
    /// plus storage pulses.
    pub fn on_device(
        context: ContextId,
        device: &Arc<DeviceStore>,
        hub: &Arc<BroadcastHub>,
        auth: Arc<dyn AuthStateProvider>,
        remote: Arc<dyn RemoteService>,
        config: &EngineConfig,
    ) -> Self {
        let handle = device.attach(context);
        let transports: Vec<Arc<dyn Transport>> = vec![
            Arc::new(BroadcastTransport::new(Arc::clone(hub), context)),
            Arc::new(PulseTransport::new(handle.clone())),
        ];
        EngineParts {
            context,
            auth,
            planes: Planes::new(Arc::new(MemoryStore::new()), Arc::new(handle)),
            bus: Arc::new(FanoutBus::with_dedup_capacity(transports, config.dedup_capacity)),
            remote,
            clock: Arc::new(SystemClock),
            selections: Vec::new(),
            collections: Vec::new(),
        }
    }

    pub fn with_selection(mut self, domain: Domain) -> Self {
        self.selections.push(domain);
        self
    }

    pub fn with_collection(mut self, domain: Domain) -> Self {
        self.collections.push(domain);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

struct EngineInner {
    context: ContextId,
    store_ctx: StoreContext,
    selections: BTreeMap<String, Arc<SelectionStore>>,
    collections: BTreeMap<String, Arc<CollectionStore>>,
    hub: Arc<IntentHub>,
    client: ReconciliationClient,
    subscription: Mutex<Option<(Topic, SubscriptionId)>>,
}

impl EngineInner {
    fn route(&self, topic: &Topic, fact: &SyncFact) {
        if *topic.namespace() != self.store_ctx.resolver.namespace() {
            debug!(topic = %topic, "fact for inactive namespace dropped");
            return;
        }
        let at = fact.timestamp();
        match &fact.payload.data {
            FactData::Members { domain, members } => match self.collections.get(domain) {
                Some(store) => {
                    store.apply_remote(members, at);
                }
                None => trace!(domain = %domain, "fact for unknown collection ignored"),
            },
            FactData::Selection { domain, value } => match self.selections.get(domain) {
                Some(store) => {
                    store.apply_remote(value.as_deref(), at);
                }
                None => trace!(domain = %domain, "fact for unknown selection ignored"),
            },
            FactData::Like { .. } | FactData::Vote { .. } => {
                if let Some((item, outcome)) = self.hub.apply_fact(fact) {
                    if outcome.was_suppressed() {
                        self.client.schedule_followup(&item);
                    }
                }
            }
        }
    }

    fn hydrate(&self) {
        for store in self.selections.values() {
            store.hydrate();
        }
    }
}

pub struct Engine {
    inner: Arc<EngineInner>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(parts: EngineParts, config: EngineConfig) -> Self {
        let listeners = Listeners::new();
        let resolver = NamespaceResolver::new(parts.auth);
        let store_ctx = StoreContext {
            resolver: resolver.clone(),
            planes: parts.planes,
            bus: Arc::clone(&parts.bus),
            listeners: listeners.clone(),
            clock: Arc::clone(&parts.clock),
        };
        let selections = parts
            .selections
            .into_iter()
            .map(|d| {
                let name = d.name().to_string();
                (name, Arc::new(SelectionStore::new(d, store_ctx.clone())))
            })
            .collect();
        let collections = parts
            .collections
            .into_iter()
            .map(|d| {
                let name = d.name().to_string();
                (name, Arc::new(CollectionStore::new(d, store_ctx.clone())))
            })
            .collect();
        let hub = Arc::new(IntentHub::new(
            parts.context.actor(),
            config.window(),
            resolver,
            listeners,
            parts.bus,
            parts.clock,
        ));
        let client = ReconciliationClient::new(Arc::clone(&hub), parts.remote, &config);

        Engine {
            inner: Arc::new(EngineInner {
                context: parts.context,
                store_ctx,
                selections,
                collections,
                hub,
                client,
                subscription: Mutex::new(None),
            }),
            config,
        }
    }

    /// Migrate legacy keys, restore mirrored selections and start
    /// listening on the active namespace's channel. Idempotent.
    pub fn start(&self) -> SyncResult<MigrationReport> {
        if self.is_started() {
            return Ok(MigrationReport::default());
        }
        let scope = self.inner.store_ctx.resolver.scope();
        let selections: Vec<Domain> = self.inner.selections.values().map(|s| s.domain().clone()).collect();
        let collections: Vec<Domain> = self.inner.collections.values().map(|c| c.domain().clone()).collect();
        let report = migrate_legacy(&self.inner.store_ctx.planes, &scope, &selections, &collections);

        self.inner.hydrate();
        self.listen(&scope.namespace);
        info!(context = %self.inner.context, ns = %scope.namespace, "engine started");
        Ok(report)
    }

    /// Stop listening. Local state stays readable.
    pub fn shutdown(&self) {
        if let Some((topic, id)) = self.inner.subscription.lock().take() {
            self.inner.store_ctx.bus.unsubscribe(id);
            info!(context = %self.inner.context, topic = %topic, "engine shut down");
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.subscription.lock().is_some()
    }

    /// Re-resolve the namespace after a sign-in or sign-out. Switches the
    /// channel and drops item state of the previous namespace.
    pub fn on_auth_changed(&self) -> SyncResult<()> {
        let current = self
            .inner
            .subscription
            .lock()
            .as_ref()
            .map(|(topic, _)| topic.namespace().clone())
            .ok_or(SyncError::NotStarted)?;
        let ns = self.inner.store_ctx.resolver.namespace();
        if ns == current {
            return Ok(());
        }

        if let Some((_, id)) = self.inner.subscription.lock().take() {
            self.inner.store_ctx.bus.unsubscribe(id);
        }
        self.inner.hub.reset();
        self.inner.hydrate();
        self.listen(&ns);
        info!(context = %self.inner.context, from = %current, to = %ns, "namespace switched");
        Ok(())
    }

    /// Explicit logout: purge device state tied to `prior`, then follow
    /// the auth change. Returns the number of keys removed.
    pub fn on_logout(&self, prior: &Namespace) -> SyncResult<usize> {
        let removed = purge_on_logout(&self.inner.store_ctx.planes, prior);
        info!(context = %self.inner.context, ns = %prior, removed, "logout purge");
        match self.on_auth_changed() {
            Ok(()) | Err(SyncError::NotStarted) => Ok(removed),
            Err(e) => Err(e),
        }
    }

    /// Drop the anonymous partition of this context's ephemeral plane
    pub fn clear_guest_data(&self) -> usize {
        clear_ephemeral(&self.inner.store_ctx.planes)
    }

    /// Union each guest collection into the signed-in one
    pub fn adopt_guest_collections(&self) {
        for store in self.inner.collections.values() {
            store.adopt_guest();
        }
    }

    pub fn collection(&self, domain: &str) -> Option<Arc<CollectionStore>> {
        self.inner.collections.get(domain).cloned()
    }

    pub fn selection(&self, domain: &str) -> Option<Arc<SelectionStore>> {
        self.inner.selections.get(domain).cloned()
    }

    pub fn like_view(&self, item: &ItemId) -> LikeView {
        self.inner.hub.like_view(item)
    }

    /// Toggle a like. The optimistic view is returned at once; the handle
    /// resolves with the confirmed view or the mutation error.
    pub fn toggle_like(&self, item: &ItemId) -> (LikeView, Pending<LikeView>) {
        let (view, at) = self.inner.hub.toggle_like(item);
        let pending = self.inner.client.spawn_like(item, view.liked, at);
        (view, pending)
    }

    pub fn vote_view(&self, item: &ItemId) -> VoteView {
        self.inner.hub.vote_view(item)
    }

    /// Select `label`, or withdraw if it is the held choice
    pub fn vote(&self, item: &ItemId, label: &str) -> (VoteView, Pending<VoteView>) {
        let (view, at) = self.inner.hub.select_vote(item, label);
        let pending = self
            .inner
            .client
            .spawn_vote(item, view.my_choice.clone(), at);
        (view, pending)
    }

    /// Debounced reconciliation fetch for `item`
    pub fn refresh(&self, item: &ItemId) -> Option<JoinHandle<()>> {
        self.inner.client.request_fetch(item)
    }

    pub fn subscribe(&self, listener: Listener) -> ListenerId {
        self.inner.store_ctx.listeners.add(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.store_ctx.listeners.remove(id)
    }

    #[inline]
    pub fn context(&self) -> ContextId {
        self.inner.context
    }

    pub fn namespace(&self) -> Namespace {
        self.inner.store_ctx.resolver.namespace()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn client(&self) -> &ReconciliationClient {
        &self.inner.client
    }

    pub fn hub(&self) -> &Arc<IntentHub> {
        &self.inner.hub
    }

    fn listen(&self, ns: &Namespace) {
        let topic = Topic::for_namespace(ns);
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let id = self.inner.store_ctx.bus.subscribe(
            &topic,
            Arc::new(move |topic: &Topic, fact: &SyncFact| {
                if let Some(inner) = weak.upgrade() {
                    inner.route(topic, fact);
                }
            }),
        );
        *self.inner.subscription.lock() = Some((topic, id));
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("context", &self.inner.context)
            .field("started", &self.is_started())
            .field("selections", &self.inner.selections.keys().collect::<Vec<_>>())
            .field("collections", &self.inner.collections.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tabsync_core::{EngineEvent, Identity, SessionAuth};
    use tabsync_storage::KeyValueStore;

    use crate::Snapshot;

    struct Offline;

    #[async_trait]
    impl RemoteService for Offline {
        async fn snapshot(&self, _: &ItemId, _: &Namespace) -> SyncResult<Snapshot> {
            Err(SyncError::Network("offline".into()))
        }
        async fn mutate_like(&self, _: &ItemId, _: &Namespace, _: bool) -> SyncResult<Snapshot> {
            Err(SyncError::Network("offline".into()))
        }
        async fn mutate_vote(&self, _: &ItemId, _: &Namespace, _: Option<String>) -> SyncResult<Snapshot> {
            Err(SyncError::Network("offline".into()))
        }
    }

    fn engine_on(
        device: &Arc<DeviceStore>,
        hub: &Arc<BroadcastHub>,
        id: u64,
        auth: Arc<SessionAuth>,
    ) -> Engine {
        let parts = EngineParts::on_device(
            ContextId::new(id),
            device,
            hub,
            auth,
            Arc::new(Offline),
            &EngineConfig::default(),
        )
        .with_selection(Domain::new("theme", ["light", "dark"]))
        .with_collection(Domain::new("badges", ["gold", "silver"]));
        Engine::new(parts, EngineConfig::default())
    }

    #[test]
    fn test_collection_reaches_other_context() {
        let device = DeviceStore::new();
        let hub = BroadcastHub::new();
        let auth = Arc::new(SessionAuth::signed_in(Identity::new("ann")));
        let a = engine_on(&device, &hub, 1, auth.clone());
        let b = engine_on(&device, &hub, 2, auth);
        a.start().unwrap();
        b.start().unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        b.subscribe(Arc::new(move |e: &EngineEvent| sink.lock().push(e.clone())));

        a.collection("badges").unwrap().add("gold");

        assert!(b.collection("badges").unwrap().has("gold"));
        assert_eq!(events.lock().len(), 1);
    }

    #[test]
    fn test_shutdown_stops_delivery() {
        let device = DeviceStore::new();
        let hub = BroadcastHub::new();
        let auth = Arc::new(SessionAuth::anonymous());
        let a = engine_on(&device, &hub, 1, auth.clone());
        let b = engine_on(&device, &hub, 2, auth);
        a.start().unwrap();
        b.start().unwrap();
        b.shutdown();
        assert!(!b.is_started());

        a.selection("theme").unwrap().select("dark");
        assert_eq!(b.selection("theme").unwrap().get(), None);
    }

    #[test]
    fn test_start_migrates_and_hydrates() {
        let device = DeviceStore::new();
        let hub = BroadcastHub::new();
        let writer = device.attach(ContextId::new(9));
        writer.set("collected:badges", "[\"silver\"]").unwrap();
        writer
            .set("theme:mirror", r#"{"value":"dark","t":1,"ns":"user-ann"}"#)
            .unwrap();

        let auth = Arc::new(SessionAuth::signed_in(Identity::new("ann")));
        let engine = engine_on(&device, &hub, 1, auth);
        let report = engine.start().unwrap();

        assert_eq!(report.moved, vec!["collected:badges".to_string()]);
        assert!(engine.collection("badges").unwrap().has("silver"));
        assert!(engine.selection("theme").unwrap().is("dark"));
        assert!(engine.start().unwrap().is_empty());
    }

    #[test]
    fn test_guest_boot_leaves_legacy_keys_for_signed_in_boot() {
        let device = DeviceStore::new();
        let hub = BroadcastHub::new();
        device
            .attach(ContextId::new(9))
            .set("collected:badges", "[\"gold\"]")
            .unwrap();

        let guest = engine_on(&device, &hub, 1, Arc::new(SessionAuth::anonymous()));
        assert!(guest.start().unwrap().is_empty());
        assert!(!guest.collection("badges").unwrap().has("gold"));
        assert!(device.peek("collected:badges").is_some());

        let auth = Arc::new(SessionAuth::signed_in(Identity::new("ann")));
        let member = engine_on(&device, &hub, 2, auth);
        let report = member.start().unwrap();
        assert_eq!(report.moved, vec!["collected:badges".to_string()]);
        assert!(member.collection("badges").unwrap().has("gold"));
    }

    #[test]
    fn test_auth_change_requires_start() {
        let device = DeviceStore::new();
        let hub = BroadcastHub::new();
        let engine = engine_on(&device, &hub, 1, Arc::new(SessionAuth::anonymous()));
        assert!(matches!(engine.on_auth_changed(), Err(SyncError::NotStarted)));
    }

    #[test]
    fn test_logout_purges_mirror_and_switches_channel() {
        let device = DeviceStore::new();
        let hub = BroadcastHub::new();
        let auth = Arc::new(SessionAuth::signed_in(Identity::new("ann")));
        let engine = engine_on(&device, &hub, 1, auth.clone());
        engine.start().unwrap();
        engine.selection("theme").unwrap().select("dark");
        assert!(device.peek("theme:mirror").is_some());

        let prior = engine.namespace();
        auth.logout();
        engine.on_logout(&prior).unwrap();

        assert!(device.peek("theme:mirror").is_none());
        assert!(engine.namespace().is_default());
        assert_eq!(hub.endpoint_count("tabsync/user-ann"), 0);
        assert_eq!(hub.endpoint_count("tabsync/default"), 1);
    }

    #[test]
    fn test_like_without_runtime_stays_local() {
        let device = DeviceStore::new();
        let hub = BroadcastHub::new();
        let engine = engine_on(&device, &hub, 1, Arc::new(SessionAuth::anonymous()));
        let item = ItemId::new("p");

        let (view, pending) = engine.toggle_like(&item);
        assert_eq!(view, LikeView::new(true, 1));
        assert!(pending.is_none());
        assert_eq!(engine.like_view(&item), view);
    }
}
