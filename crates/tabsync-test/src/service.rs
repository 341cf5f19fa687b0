//! Scripted authoritative service
//!
//! An in-memory stand-in for the remote service. Mutations are applied
//! when the request arrives and answered after the configured latency, so
//! a slow response can carry state that has since been superseded.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tabsync_core::{ItemId, Namespace, SyncError, SyncResult};
use tabsync_runtime::{RemoteService, Snapshot};

/// Authoritative state of one item in one namespace
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ItemRecord {
    pub liked: bool,
    pub likes: u64,
    pub votes: BTreeMap<String, u64>,
    pub my_choice: Option<String>,
}

impl ItemRecord {
    pub fn liked(liked: bool, likes: u64) -> Self {
        ItemRecord {
            liked,
            likes,
            ..ItemRecord::default()
        }
    }

    pub fn poll<'a>(counts: impl IntoIterator<Item = (&'a str, u64)>, my_choice: Option<&str>) -> Self {
        ItemRecord {
            votes: counts.into_iter().map(|(l, n)| (l.to_string(), n)).collect(),
            my_choice: my_choice.map(str::to_string),
            ..ItemRecord::default()
        }
    }

    fn like_snapshot(&self) -> Snapshot {
        Snapshot::like(self.liked, self.likes)
    }

    fn vote_snapshot(&self) -> Snapshot {
        Snapshot::vote(self.votes.clone(), self.my_choice.clone())
    }

    fn full_snapshot(&self) -> Snapshot {
        Snapshot {
            votes: Some(self.votes.clone()),
            my_choice: Some(self.my_choice.clone()),
            ..self.like_snapshot()
        }
    }
}

/// Injected failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Transient; the client retries with backoff
    Network,
    /// Definitive rejection
    Rejected,
}

impl Fault {
    fn into_error(self, item: &ItemId) -> SyncError {
        match self {
            Fault::Network => SyncError::Network("connection reset".into()),
            Fault::Rejected => SyncError::Remote {
                item: item.clone(),
                reason: "rejected".into(),
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct ScriptedService {
    records: Mutex<HashMap<(Namespace, ItemId), ItemRecord>>,
    latency: Mutex<Duration>,
    delays: Mutex<VecDeque<Duration>>,
    faults: Mutex<VecDeque<Fault>>,
    offline: Mutex<bool>,
    snapshots: AtomicUsize,
    mutations: AtomicUsize,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        let service = Self::new();
        service.set_latency(latency);
        service
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Override the latency of the next request only
    pub fn delay_next(&self, delay: Duration) {
        self.delays.lock().push_back(delay);
    }

    /// Fail the next `times` requests with `fault`
    pub fn fail_next(&self, fault: Fault, times: usize) {
        self.faults.lock().extend(std::iter::repeat(fault).take(times));
    }

    /// Fail every request with a network error until switched back
    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock() = offline;
    }

    pub fn seed(&self, ns: &Namespace, item: &ItemId, record: ItemRecord) {
        self.records.lock().insert((ns.clone(), item.clone()), record);
    }

    pub fn record(&self, ns: &Namespace, item: &ItemId) -> ItemRecord {
        self.records
            .lock()
            .get(&(ns.clone(), item.clone()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshot_calls(&self) -> usize {
        self.snapshots.load(Ordering::SeqCst)
    }

    pub fn mutation_calls(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.snapshot_calls() + self.mutation_calls()
    }

    fn admit(&self, item: &ItemId) -> SyncResult<Duration> {
        let delay = self
            .delays
            .lock()
            .pop_front()
            .unwrap_or_else(|| *self.latency.lock());
        if *self.offline.lock() {
            return Err(Fault::Network.into_error(item));
        }
        match self.faults.lock().pop_front() {
            Some(fault) => Err(fault.into_error(item)),
            None => Ok(delay),
        }
    }

    fn with_record<R>(&self, ns: &Namespace, item: &ItemId, f: impl FnOnce(&mut ItemRecord) -> R) -> R {
        let mut records = self.records.lock();
        f(records.entry((ns.clone(), item.clone())).or_default())
    }
}

#[async_trait]
impl RemoteService for ScriptedService {
    async fn snapshot(&self, item: &ItemId, ns: &Namespace) -> SyncResult<Snapshot> {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        let delay = self.admit(item)?;
        let snapshot = self.with_record(ns, item, |r| r.full_snapshot());
        tokio::time::sleep(delay).await;
        Ok(snapshot)
    }

    async fn mutate_like(&self, item: &ItemId, ns: &Namespace, liked: bool) -> SyncResult<Snapshot> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let delay = self.admit(item)?;
        let snapshot = self.with_record(ns, item, |r| {
            if r.liked != liked {
                r.liked = liked;
                r.likes = if liked { r.likes + 1 } else { r.likes.saturating_sub(1) };
            }
            r.like_snapshot()
        });
        tokio::time::sleep(delay).await;
        Ok(snapshot)
    }

    async fn mutate_vote(&self, item: &ItemId, ns: &Namespace, choice: Option<String>) -> SyncResult<Snapshot> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let delay = self.admit(item)?;
        let snapshot = self.with_record(ns, item, |r| {
            if r.my_choice != choice {
                if let Some(previous) = r.my_choice.take() {
                    if let Some(n) = r.votes.get_mut(&previous) {
                        *n = n.saturating_sub(1);
                    }
                }
                if let Some(label) = &choice {
                    *r.votes.entry(label.clone()).or_insert(0) += 1;
                }
                r.my_choice = choice;
            }
            r.vote_snapshot()
        });
        tokio::time::sleep(delay).await;
        Ok(snapshot)
    }
}
