//! Capabilities shared by the stores of one context

use std::sync::Arc;

use tabsync_core::{FactBus, FanOut, Listeners, SyncFact, Timestamp, Topic};
use tabsync_time::Clock;

use crate::{NamespaceResolver, Plane, Planes, Scope};

#[derive(Clone)]
pub struct StoreContext {
    pub resolver: NamespaceResolver,
    pub planes: Planes,
    pub bus: Arc<dyn FactBus>,
    pub listeners: Listeners,
    pub clock: Arc<dyn Clock>,
}

impl StoreContext {
    /// Stamp for a local write that follows `previous`. Strictly later than
    /// it, so two writes within one millisecond never carry the same fact.
    pub fn stamp_after(&self, previous: Option<Timestamp>) -> Timestamp {
        let now = self.clock.now();
        match previous {
            Some(prev) if now <= prev => prev.next(),
            _ => now,
        }
    }

    /// Publish a fact about `scope`. Ephemeral state is broadcast only so it
    /// never reaches the shared persistent store.
    pub fn publish(&self, scope: &Scope, fact: &SyncFact) -> usize {
        let fan_out = match scope.plane {
            Plane::Persistent => FanOut::All,
            Plane::Ephemeral => FanOut::BroadcastOnly,
        };
        self.bus
            .publish_scoped(&Topic::for_namespace(&scope.namespace), fact, fan_out)
    }
}

impl std::fmt::Debug for StoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreContext")
            .field("resolver", &self.resolver)
            .field("listeners", &self.listeners)
            .finish()
    }
}
