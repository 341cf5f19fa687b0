//! FactBus capability
//!
//! The engine only ever talks to this trait. Concrete buses may fan out over
//! several transports, but they must deduplicate so each subscriber sees a
//! logical fact at most once, and `publish` must never fail loudly.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::{Namespace, SyncFact};

/// One logical channel per namespace
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic {
    namespace: Namespace,
}

impl Topic {
    pub fn for_namespace(namespace: &Namespace) -> Self {
        Topic {
            namespace: namespace.clone(),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn channel_name(&self) -> String {
        format!("tabsync/{}", self.namespace)
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.channel_name())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.channel_name())
    }
}

/// Which transports a publish may use
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FanOut {
    /// Every available transport, including the shared-storage pulse
    #[default]
    All,
    /// Broadcast only; nothing is written to shared storage
    BroadcastOnly,
}

/// Subscription handle returned by [`FactBus::subscribe`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl SubscriptionId {
    /// Process-unique id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SubscriptionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

pub type FactHandler = Arc<dyn Fn(&Topic, &SyncFact) + Send + Sync>;

/// Publish/subscribe capability for cross-context notification
pub trait FactBus: Send + Sync {
    /// Attempt every transport allowed by `fan_out`. Returns how many
    /// transports accepted the fact; unavailable transports are skipped.
    fn publish_scoped(&self, topic: &Topic, fact: &SyncFact, fan_out: FanOut) -> usize;

    fn publish(&self, topic: &Topic, fact: &SyncFact) -> usize {
        self.publish_scoped(topic, fact, FanOut::All)
    }

    fn subscribe(&self, topic: &Topic, handler: FactHandler) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);
}

/// Bus that accepts nothing and delivers nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NullBus;

impl FactBus for NullBus {
    fn publish_scoped(&self, _topic: &Topic, _fact: &SyncFact, _fan_out: FanOut) -> usize {
        0
    }

    fn subscribe(&self, _topic: &Topic, _handler: FactHandler) -> SubscriptionId {
        SubscriptionId::next()
    }

    fn unsubscribe(&self, _id: SubscriptionId) {}
}
