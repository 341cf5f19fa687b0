//! Storage-pulse transport
//!
//! Fallback for contexts that cannot share a broadcast channel: each fact
//! is written to `sync:{scope}:{ns}` in device storage, and the change
//! event carries it to the other contexts. A fresh nonce on every write
//! makes identical consecutive facts still register as a change.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tabsync_core::{
    FactData, FactKind, FactOp, FactPayload, Namespace, SyncError, SyncFact, SyncResult,
    Timestamp, Topic,
};
use tabsync_storage::keys::{pulse_key, PULSE_PREFIX};
use tabsync_storage::{DeviceHandle, KeyValueStore, StorageChange, WatchId};
use tracing::trace;

use crate::{FactSink, ListenId, Transport, TransportKind};

/// Pulse value: `{type, arr|k|d, t, kind, n}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PulseRecord {
    #[serde(rename = "type")]
    pub op: FactOp,
    /// Collection members
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arr: Option<Vec<String>>,
    /// Selection value; absent means cleared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<String>,
    /// Intent data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<FactData>,
    pub t: Timestamp,
    pub kind: FactKind,
    pub n: u64,
}

impl PulseRecord {
    pub fn from_fact(fact: &SyncFact, nonce: u64) -> Self {
        let (arr, k, d) = match &fact.payload.data {
            FactData::Members { members, .. } => (Some(members.clone()), None, None),
            FactData::Selection { value, .. } => (None, value.clone(), None),
            data @ (FactData::Like { .. } | FactData::Vote { .. }) => (None, None, Some(data.clone())),
        };
        PulseRecord {
            op: fact.payload.op,
            arr,
            k,
            d,
            t: fact.timestamp(),
            kind: fact.kind,
            n: nonce,
        }
    }

    /// Rebuild the fact; `scope` is the segment of the pulse key
    pub fn into_fact(self, scope: &str) -> SyncResult<SyncFact> {
        let data = match self.kind {
            FactKind::Collection => FactData::Members {
                domain: scope.to_string(),
                members: self
                    .arr
                    .ok_or_else(|| SyncError::MalformedFact("collection pulse without arr".into()))?,
            },
            FactKind::Selection => FactData::Selection {
                domain: scope.to_string(),
                value: self.k,
            },
            FactKind::Like | FactKind::Vote => self
                .d
                .ok_or_else(|| SyncError::MalformedFact("intent pulse without data".into()))?,
        };
        let fact = SyncFact {
            kind: self.kind,
            payload: FactPayload {
                op: self.op,
                data,
                timestamp: self.t,
            },
        };
        if fact.is_consistent() {
            Ok(fact)
        } else {
            Err(SyncError::MalformedFact(format!(
                "pulse kind {:?} does not match data",
                fact.kind
            )))
        }
    }
}

/// Scope segment of `key` if it is a pulse key for `ns`
fn pulse_scope<'a>(key: &'a str, ns: &Namespace) -> Option<&'a str> {
    key.strip_prefix(PULSE_PREFIX)?
        .strip_suffix(ns.as_str())?
        .strip_suffix(':')
        .filter(|scope| !scope.is_empty())
}

type Listeners = RwLock<Vec<(ListenId, Topic, FactSink)>>;

pub struct PulseTransport {
    handle: DeviceHandle,
    listeners: Arc<Listeners>,
    watch: Mutex<Option<WatchId>>,
    next_id: AtomicU64,
}

impl PulseTransport {
    pub fn new(handle: DeviceHandle) -> Self {
        PulseTransport {
            handle,
            listeners: Arc::new(RwLock::new(Vec::new())),
            watch: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    fn on_change(listeners: &Weak<Listeners>, change: &StorageChange) {
        let Some(listeners) = listeners.upgrade() else {
            return;
        };
        let Some(raw) = change.new_value.as_deref() else {
            return;
        };
        let targets: Vec<(Topic, FactSink, String)> = listeners
            .read()
            .iter()
            .filter_map(|(_, topic, sink)| {
                pulse_scope(&change.key, topic.namespace())
                    .map(|scope| (topic.clone(), Arc::clone(sink), scope.to_string()))
            })
            .collect();
        for (topic, sink, scope) in targets {
            let decoded = serde_json::from_str::<PulseRecord>(raw)
                .map_err(|e| SyncError::MalformedFact(e.to_string()))
                .and_then(|record| record.into_fact(&scope));
            match decoded {
                Ok(fact) => sink(&topic, fact),
                Err(e) => trace!(key = %change.key, error = %e, "malformed pulse dropped"),
            }
        }
    }
}

impl Transport for PulseTransport {
    fn name(&self) -> &'static str {
        "storage-pulse"
    }

    fn kind(&self) -> TransportKind {
        TransportKind::StoragePulse
    }

    fn is_available(&self) -> bool {
        self.handle.is_available()
    }

    fn send(&self, topic: &Topic, fact: &SyncFact) -> SyncResult<()> {
        let record = PulseRecord::from_fact(fact, rand::random());
        let key = pulse_key(fact.scope(), topic.namespace());
        self.handle.set(&key, &serde_json::to_string(&record)?)
    }

    fn listen(&self, topic: &Topic, sink: FactSink) -> SyncResult<ListenId> {
        let id = ListenId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, topic.clone(), sink));

        let mut watch = self.watch.lock();
        if watch.is_none() {
            let weak = Arc::downgrade(&self.listeners);
            *watch = Some(
                self.handle
                    .watch(Arc::new(move |change: &StorageChange| Self::on_change(&weak, change))),
            );
        }
        Ok(id)
    }

    fn unlisten(&self, id: ListenId) {
        let empty = {
            let mut listeners = self.listeners.write();
            listeners.retain(|(l, _, _)| *l != id);
            listeners.is_empty()
        };
        if empty {
            if let Some(watch) = self.watch.lock().take() {
                self.handle.unwatch(watch);
            }
        }
    }
}

impl Drop for PulseTransport {
    fn drop(&mut self) {
        if let Some(watch) = self.watch.lock().take() {
            self.handle.unwatch(watch);
        }
    }
}

impl std::fmt::Debug for PulseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PulseTransport({})", self.handle.context())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tabsync_core::{ContextId, ItemId};
    use tabsync_storage::DeviceStore;

    fn collecting_sink() -> (FactSink, Arc<Mutex<Vec<SyncFact>>>) {
        let got = Arc::new(Mutex::new(Vec::new()));
        let sink_got = Arc::clone(&got);
        let sink: FactSink = Arc::new(move |_t: &Topic, f: SyncFact| sink_got.lock().push(f));
        (sink, got)
    }

    fn topic() -> Topic {
        Topic::for_namespace(&Namespace::new("user-a"))
    }

    #[test]
    fn test_pulse_wire_shape() {
        let device = DeviceStore::new();
        let a = PulseTransport::new(device.attach(ContextId::new(1)));
        a.send(&topic(), &SyncFact::members("badges", ["gold"], Timestamp::from_millis(9)))
            .unwrap();

        let raw = device.peek("sync:badges:user-a").unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["type"], "set");
        assert_eq!(json["kind"], "collection");
        assert_eq!(json["arr"], serde_json::json!(["gold"]));
        assert_eq!(json["t"], 9);
        assert!(json["n"].is_u64());
    }

    #[test]
    fn test_identical_facts_both_delivered() {
        let device = DeviceStore::new();
        let a = PulseTransport::new(device.attach(ContextId::new(1)));
        let b = PulseTransport::new(device.attach(ContextId::new(2)));
        let (sink, got) = collecting_sink();
        b.listen(&topic(), sink).unwrap();

        let fact = SyncFact::selection("theme", Some("dark".into()), Timestamp::from_millis(3));
        a.send(&topic(), &fact).unwrap();
        a.send(&topic(), &fact).unwrap();

        assert_eq!(got.lock().as_slice(), &[fact.clone(), fact]);
    }

    #[test]
    fn test_intent_fact_restored() {
        let device = DeviceStore::new();
        let a = PulseTransport::new(device.attach(ContextId::new(1)));
        let b = PulseTransport::new(device.attach(ContextId::new(2)));
        let (sink, got) = collecting_sink();
        b.listen(&topic(), sink).unwrap();

        let mut counts = BTreeMap::new();
        counts.insert("yes".to_string(), 4);
        let fact = SyncFact::vote(
            FactOp::Assert,
            ItemId::new("poll-1"),
            counts,
            Some("yes".into()),
            ContextId::new(1).actor(),
            Timestamp::from_millis(11),
        );
        a.send(&topic(), &fact).unwrap();

        assert!(device.peek("sync:intent:user-a").is_some());
        assert_eq!(got.lock().as_slice(), &[fact]);
    }

    #[test]
    fn test_sender_and_other_namespaces_ignored() {
        let device = DeviceStore::new();
        let a = PulseTransport::new(device.attach(ContextId::new(1)));
        let b = PulseTransport::new(device.attach(ContextId::new(2)));
        let (sink_a, got_a) = collecting_sink();
        let (sink_b, got_b) = collecting_sink();
        a.listen(&topic(), sink_a).unwrap();
        b.listen(&Topic::for_namespace(&Namespace::new("user-b")), sink_b)
            .unwrap();

        a.send(&topic(), &SyncFact::selection("theme", None, Timestamp::ZERO))
            .unwrap();

        assert!(got_a.lock().is_empty());
        assert!(got_b.lock().is_empty());
    }

    #[test]
    fn test_malformed_pulse_dropped() {
        let device = DeviceStore::new();
        let writer = device.attach(ContextId::new(1));
        let b = PulseTransport::new(device.attach(ContextId::new(2)));
        let (sink, got) = collecting_sink();
        b.listen(&topic(), sink).unwrap();

        writer.set("sync:badges:user-a", "not json").unwrap();
        writer
            .set("sync:badges:user-a", r#"{"type":"set","t":1,"kind":"collection","n":1}"#)
            .unwrap();

        assert!(got.lock().is_empty());
    }

    #[test]
    fn test_unavailable_storage_fails_send() {
        let device = DeviceStore::new();
        let handle = device.attach(ContextId::new(1));
        handle.set_available(false);
        let a = PulseTransport::new(handle);

        assert!(!a.is_available());
        assert!(a
            .send(&topic(), &SyncFact::selection("theme", None, Timestamp::ZERO))
            .is_err());
    }

    #[test]
    fn test_scope_parsing() {
        let ns = Namespace::new("user-a");
        assert_eq!(pulse_scope("sync:intent:user-a", &ns), Some("intent"));
        assert_eq!(pulse_scope("sync:intent:xuser-a", &ns), None);
        assert_eq!(pulse_scope("sync::user-a", &ns), None);
        assert_eq!(pulse_scope("selection:x:user-a", &ns), None);
    }
}
