//! In-process broadcast hub
//!
//! Stands in for a browser BroadcastChannel: named channels carrying
//! encoded facts to every *other* context of the device. Delivery is
//! synchronous in the posting thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tabsync_core::{ContextId, SyncError, SyncFact, SyncResult, Topic};
use tracing::trace;

use crate::{FactSink, ListenId, Transport, TransportKind};

pub type RawReceiver = Arc<dyn Fn(&str) + Send + Sync>;

struct Endpoint {
    id: ListenId,
    context: ContextId,
    receiver: RawReceiver,
}

/// Device-wide channel registry
pub struct BroadcastHub {
    channels: RwLock<HashMap<String, Vec<Endpoint>>>,
    next_id: AtomicU64,
    enabled: AtomicBool,
}

impl BroadcastHub {
    pub fn new() -> Arc<Self> {
        Arc::new(BroadcastHub {
            channels: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            enabled: AtomicBool::new(true),
        })
    }

    /// Disable the channel mechanism for the whole device
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn connect(&self, channel: &str, context: ContextId, receiver: RawReceiver) -> ListenId {
        let id = ListenId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.channels
            .write()
            .entry(channel.to_string())
            .or_default()
            .push(Endpoint {
                id,
                context,
                receiver,
            });
        id
    }

    pub fn disconnect(&self, id: ListenId) {
        let mut channels = self.channels.write();
        for endpoints in channels.values_mut() {
            endpoints.retain(|e| e.id != id);
        }
        channels.retain(|_, endpoints| !endpoints.is_empty());
    }

    /// Deliver `raw` to every endpoint on `channel` not owned by `origin`.
    /// Returns the number of receivers reached.
    pub fn post(&self, channel: &str, origin: ContextId, raw: &str) -> usize {
        if !self.is_enabled() {
            return 0;
        }
        let receivers: Vec<RawReceiver> = self
            .channels
            .read()
            .get(channel)
            .map(|endpoints| {
                endpoints
                    .iter()
                    .filter(|e| e.context != origin)
                    .map(|e| Arc::clone(&e.receiver))
                    .collect()
            })
            .unwrap_or_default();
        for receiver in &receivers {
            receiver(raw);
        }
        receivers.len()
    }

    pub fn endpoint_count(&self, channel: &str) -> usize {
        self.channels.read().get(channel).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("channels", &self.channels.read().len())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// One context's broadcast endpoint
pub struct BroadcastTransport {
    hub: Arc<BroadcastHub>,
    context: ContextId,
    enabled: AtomicBool,
}

impl BroadcastTransport {
    pub fn new(hub: Arc<BroadcastHub>, context: ContextId) -> Self {
        BroadcastTransport {
            hub,
            context,
            enabled: AtomicBool::new(true),
        }
    }

    /// Disable for this context only
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

impl Transport for BroadcastTransport {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Broadcast
    }

    fn is_available(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && self.hub.is_enabled()
    }

    fn send(&self, topic: &Topic, fact: &SyncFact) -> SyncResult<()> {
        if !self.is_available() {
            return Err(SyncError::TransportUnavailable(self.name()));
        }
        let raw = fact.encode()?;
        self.hub.post(&topic.channel_name(), self.context, &raw);
        Ok(())
    }

    fn listen(&self, topic: &Topic, sink: FactSink) -> SyncResult<ListenId> {
        if !self.is_available() {
            return Err(SyncError::TransportUnavailable(self.name()));
        }
        let owned = topic.clone();
        let receiver: RawReceiver = Arc::new(move |raw: &str| match SyncFact::decode(raw) {
            Ok(fact) => sink(&owned, fact),
            Err(e) => trace!(topic = %owned, error = %e, "malformed broadcast dropped"),
        });
        Ok(self.hub.connect(&topic.channel_name(), self.context, receiver))
    }

    fn unlisten(&self, id: ListenId) {
        self.hub.disconnect(id);
    }
}

impl std::fmt::Debug for BroadcastTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BroadcastTransport({})", self.context)
    }
}
