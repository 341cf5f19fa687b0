//! Transport abstraction

use std::sync::Arc;

use tabsync_core::{SyncFact, SyncResult, Topic};

/// Receives decoded facts from a transport
pub type FactSink = Arc<dyn Fn(&Topic, SyncFact) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Message channel between live contexts
    Broadcast,
    /// Writes to shared storage, observed through change events
    StoragePulse,
}

/// One way of moving facts between contexts of a device.
///
/// Implementations never deliver a context's own facts back to it and
/// drop payloads they cannot decode.
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> TransportKind;

    /// False when the mechanism is disabled, e.g. in a restricted mode
    fn is_available(&self) -> bool;

    fn send(&self, topic: &Topic, fact: &SyncFact) -> SyncResult<()>;

    fn listen(&self, topic: &Topic, sink: FactSink) -> SyncResult<ListenId>;

    fn unlisten(&self, id: ListenId);
}
