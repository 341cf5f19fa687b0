//! Reconciliation client
//!
//! Talks to the authoritative service on behalf of one context:
//!
//! - Fetches are debounced per item, and at most one is in flight per item.
//!   A trigger that lands while one is running causes a single re-run.
//! - Snapshot values are merged as anonymous facts stamped with the time
//!   the request was issued, so a response to a superseded request loses
//!   to the newer assertion.
//! - Mutation results are merged as the local actor's confirmation and
//!   re-published for the other contexts.
//! - Failed fetches and mutations schedule a fetch with per-item capped
//!   exponential backoff. Nothing is rolled back.
//! - Responses that arrive after the namespace changed are discarded.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tabsync_core::{FactOp, ItemId, Namespace, SyncError, SyncResult, Timestamp};
use tabsync_state::{LikeView, MergeOutcome, Origin, VoteView};
use tabsync_time::{BackoffTracker, DebounceGate};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{EngineConfig, IntentHub, RemoteService, Snapshot};

/// Result of one snapshot fetch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    Merged {
        like: Option<MergeOutcome>,
        vote: Option<MergeOutcome>,
    },
    /// Another fetch for the item was running; it will re-run once
    Coalesced,
}

impl FetchOutcome {
    pub fn was_suppressed(&self) -> bool {
        match self {
            FetchOutcome::Merged { like, vote } => {
                like.is_some_and(MergeOutcome::was_suppressed)
                    || vote.is_some_and(MergeOutcome::was_suppressed)
            }
            FetchOutcome::Coalesced => false,
        }
    }
}

/// Spawn on the ambient tokio runtime, if there is one
pub(crate) fn spawn_task<F>(what: &'static str, fut: F) -> Option<JoinHandle<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => Some(handle.spawn(fut)),
        Err(_) => {
            warn!(task = what, "no tokio runtime, remote call skipped");
            None
        }
    }
}

struct Inner {
    hub: Arc<IntentHub>,
    remote: Arc<dyn RemoteService>,
    gate: DebounceGate<ItemId>,
    backoff: BackoffTracker<ItemId>,
    in_flight: Mutex<HashSet<ItemId>>,
    rerun: Mutex<HashSet<ItemId>>,
    followups: Mutex<HashSet<ItemId>>,
}

/// Holds the single-flight slot for one item. Dropping it frees the slot
/// and starts the coalesced re-run, even when the fetch was cancelled.
struct FlightSlot {
    inner: Arc<Inner>,
    item: ItemId,
}

impl FlightSlot {
    fn claim(inner: &Arc<Inner>, item: &ItemId) -> Option<Self> {
        inner.in_flight.lock().insert(item.clone()).then(|| FlightSlot {
            inner: Arc::clone(inner),
            item: item.clone(),
        })
    }
}

impl Drop for FlightSlot {
    fn drop(&mut self) {
        self.inner.in_flight.lock().remove(&self.item);
        if self.inner.rerun.lock().remove(&self.item) {
            self.inner.spawn_fetch(self.item.clone(), Duration::ZERO);
        }
    }
}

impl Inner {
    async fn fetch(self: Arc<Self>, item: ItemId) -> SyncResult<FetchOutcome> {
        let Some(slot) = FlightSlot::claim(&self, &item) else {
            self.rerun.lock().insert(item);
            return Ok(FetchOutcome::Coalesced);
        };

        let ns = self.hub.namespace();
        let issued_at = self.hub.clock().now();
        let result = self.remote.snapshot(&item, &ns).await;

        let outcome = result.and_then(|snapshot| {
            self.check_namespace(&ns)?;
            Ok(self.absorb(&item, &snapshot, issued_at))
        });
        match &outcome {
            Ok(merged) => {
                self.backoff.record_success(&item);
                if merged.was_suppressed() {
                    self.schedule_followup(&item);
                }
            }
            Err(e @ SyncError::NamespaceChanged { .. }) => {
                debug!(item = %item, error = %e, "snapshot discarded");
            }
            Err(e) if e.is_transient() => {
                warn!(item = %item, error = %e, "snapshot fetch failed");
                self.schedule_retry(&item);
            }
            Err(e) => warn!(item = %item, error = %e, "snapshot fetch rejected"),
        }

        drop(slot);
        outcome
    }

    fn absorb(&self, item: &ItemId, snapshot: &Snapshot, issued_at: Timestamp) -> FetchOutcome {
        let origin = Origin::anonymous(issued_at);
        let like = snapshot
            .has_like()
            .then(|| self.hub.merge_like(item, snapshot.like_update(), &origin).outcome);
        let vote = snapshot
            .has_vote()
            .then(|| self.hub.merge_vote(item, snapshot.vote_update(), &origin).outcome);
        FetchOutcome::Merged { like, vote }
    }

    async fn mutate_like(self: Arc<Self>, item: ItemId, liked: bool, asserted_at: Timestamp) -> SyncResult<LikeView> {
        let ns = self.hub.namespace();
        let result = self.remote.mutate_like(&item, &ns, liked).await;
        let snapshot = self.settle_mutation(&item, &ns, result)?;

        let origin = Origin::new(Some(self.hub.actor().clone()), asserted_at);
        let merge = self.hub.merge_like(&item, snapshot.like_update(), &origin);
        self.after_confirmation(&item, merge.outcome);
        if merge.outcome != MergeOutcome::Stale {
            self.hub
                .publish_like(FactOp::Confirm, &item, merge.view, asserted_at);
        }
        Ok(merge.view)
    }

    async fn mutate_vote(
        self: Arc<Self>,
        item: ItemId,
        choice: Option<String>,
        asserted_at: Timestamp,
    ) -> SyncResult<VoteView> {
        let ns = self.hub.namespace();
        let result = self.remote.mutate_vote(&item, &ns, choice).await;
        let snapshot = self.settle_mutation(&item, &ns, result)?;

        let origin = Origin::new(Some(self.hub.actor().clone()), asserted_at);
        let merge = self.hub.merge_vote(&item, snapshot.vote_update(), &origin);
        self.after_confirmation(&item, merge.outcome);
        if merge.outcome != MergeOutcome::Stale {
            self.hub
                .publish_vote(FactOp::Confirm, &item, &merge.view, asserted_at);
        }
        Ok(merge.view)
    }

    fn settle_mutation(
        self: &Arc<Self>,
        item: &ItemId,
        ns: &Namespace,
        result: SyncResult<Snapshot>,
    ) -> SyncResult<Snapshot> {
        match result.and_then(|snapshot| self.check_namespace(ns).map(|()| snapshot)) {
            Ok(snapshot) => Ok(snapshot),
            Err(e @ SyncError::NamespaceChanged { .. }) => {
                debug!(item = %item, error = %e, "mutation result discarded");
                Err(e)
            }
            Err(e) => {
                // the service may or may not have applied it; ask again later
                warn!(item = %item, error = %e, "mutation failed, optimistic state kept");
                self.schedule_retry(item);
                Err(e)
            }
        }
    }

    fn after_confirmation(self: &Arc<Self>, item: &ItemId, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Stale => debug!(item = %item, "confirmation superseded by newer assertion"),
            MergeOutcome::Suppressed => self.schedule_followup(item),
            _ => {}
        }
    }

    fn check_namespace(&self, expected: &Namespace) -> SyncResult<()> {
        let actual = self.hub.namespace();
        if actual == *expected {
            Ok(())
        } else {
            Err(SyncError::NamespaceChanged {
                expected: expected.clone(),
                actual,
            })
        }
    }

    fn schedule_retry(self: &Arc<Self>, item: &ItemId) {
        match self.backoff.record_failure(item) {
            Some(delay) => {
                debug!(item = %item, delay_ms = delay.as_millis() as u64, "fetch retry scheduled");
                self.spawn_fetch(item.clone(), delay);
            }
            None => warn!(
                item = %item,
                attempts = self.backoff.failures(item),
                "reconciliation retries exhausted"
            ),
        }
    }

    /// One fetch once the conflict window for `item` has closed
    fn schedule_followup(self: &Arc<Self>, item: &ItemId) {
        let Some(until) = self.hub.suppressed_until(item) else {
            return;
        };
        if !self.followups.lock().insert(item.clone()) {
            return;
        }
        let delay = until - self.hub.clock().now();
        let inner = Arc::clone(self);
        let owned = item.clone();
        let spawned = spawn_task("follow-up fetch", async move {
            tokio::time::sleep(delay).await;
            inner.followups.lock().remove(&owned);
            let _ = inner.fetch(owned).await;
        });
        if spawned.is_none() {
            self.followups.lock().remove(item);
        }
    }

    fn spawn_fetch(self: &Arc<Self>, item: ItemId, delay: Duration) -> Option<JoinHandle<()>> {
        let inner = Arc::clone(self);
        spawn_task("fetch", async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = inner.fetch(item).await;
        })
    }
}

/// Client for one context; cloning shares state
#[derive(Clone)]
pub struct ReconciliationClient {
    inner: Arc<Inner>,
}

impl ReconciliationClient {
    pub fn new(hub: Arc<IntentHub>, remote: Arc<dyn RemoteService>, config: &EngineConfig) -> Self {
        ReconciliationClient {
            inner: Arc::new(Inner {
                hub,
                remote,
                gate: DebounceGate::new(config.debounce),
                backoff: BackoffTracker::new(config.backoff),
                in_flight: Mutex::new(HashSet::new()),
                rerun: Mutex::new(HashSet::new()),
                followups: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn hub(&self) -> &Arc<IntentHub> {
        &self.inner.hub
    }

    /// Debounced fetch: only the last trigger within the quiet period runs
    pub fn request_fetch(&self, item: &ItemId) -> Option<JoinHandle<()>> {
        let ticket = self.inner.gate.arm(item);
        let quiet = self.inner.gate.quiet();
        let inner = Arc::clone(&self.inner);
        let item = item.clone();
        spawn_task("debounced fetch", async move {
            tokio::time::sleep(quiet).await;
            if inner.gate.settle(&item, ticket) {
                let _ = inner.fetch(item).await;
            }
        })
    }

    /// Fetch immediately, still single-flight
    pub async fn fetch_now(&self, item: &ItemId) -> SyncResult<FetchOutcome> {
        Arc::clone(&self.inner).fetch(item.clone()).await
    }

    pub async fn mutate_like(&self, item: &ItemId, liked: bool, asserted_at: Timestamp) -> SyncResult<LikeView> {
        Arc::clone(&self.inner)
            .mutate_like(item.clone(), liked, asserted_at)
            .await
    }

    pub async fn mutate_vote(
        &self,
        item: &ItemId,
        choice: Option<String>,
        asserted_at: Timestamp,
    ) -> SyncResult<VoteView> {
        Arc::clone(&self.inner)
            .mutate_vote(item.clone(), choice, asserted_at)
            .await
    }

    pub fn spawn_like(&self, item: &ItemId, liked: bool, asserted_at: Timestamp) -> Option<JoinHandle<SyncResult<LikeView>>> {
        spawn_task(
            "like mutation",
            Arc::clone(&self.inner).mutate_like(item.clone(), liked, asserted_at),
        )
    }

    pub fn spawn_vote(
        &self,
        item: &ItemId,
        choice: Option<String>,
        asserted_at: Timestamp,
    ) -> Option<JoinHandle<SyncResult<VoteView>>> {
        spawn_task(
            "vote mutation",
            Arc::clone(&self.inner).mutate_vote(item.clone(), choice, asserted_at),
        )
    }

    /// Refetch `item` once its conflict window closes
    pub fn schedule_followup(&self, item: &ItemId) {
        self.inner.schedule_followup(item);
    }

    pub fn is_in_flight(&self, item: &ItemId) -> bool {
        self.inner.in_flight.lock().contains(item)
    }

    pub fn failures(&self, item: &ItemId) -> u32 {
        self.inner.backoff.failures(item)
    }
}

impl std::fmt::Debug for ReconciliationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationClient")
            .field("in_flight", &self.inner.in_flight.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tabsync_core::{ActorId, Identity, Listeners, NullBus, SessionAuth};
    use tabsync_state::LikeUpdate;
    use tabsync_storage::NamespaceResolver;
    use tabsync_time::ConflictWindow;

    use crate::TokioClock;

    /// Answers from a queue after a fixed latency; an empty queue answers
    /// with a network failure.
    struct Script {
        latency: Duration,
        answers: Mutex<VecDeque<SyncResult<Snapshot>>>,
        calls: AtomicUsize,
        auth: Option<Arc<SessionAuth>>,
    }

    impl Script {
        fn new(latency_ms: u64, answers: Vec<SyncResult<Snapshot>>) -> Arc<Self> {
            Arc::new(Script {
                latency: Duration::from_millis(latency_ms),
                answers: Mutex::new(answers.into()),
                calls: AtomicUsize::new(0),
                auth: None,
            })
        }

        async fn answer(&self) -> SyncResult<Snapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            if let Some(auth) = &self.auth {
                auth.login(Identity::new("someone-else"));
            }
            self.answers
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(SyncError::Network("offline".into())))
        }
    }

    #[async_trait]
    impl RemoteService for Script {
        async fn snapshot(&self, _: &ItemId, _: &Namespace) -> SyncResult<Snapshot> {
            self.answer().await
        }
        async fn mutate_like(&self, _: &ItemId, _: &Namespace, _: bool) -> SyncResult<Snapshot> {
            self.answer().await
        }
        async fn mutate_vote(&self, _: &ItemId, _: &Namespace, _: Option<String>) -> SyncResult<Snapshot> {
            self.answer().await
        }
    }

    fn client_with(remote: Arc<Script>, auth: Arc<SessionAuth>) -> ReconciliationClient {
        let hub = Arc::new(IntentHub::new(
            ActorId::new("me"),
            ConflictWindow::default(),
            NamespaceResolver::new(auth),
            Listeners::new(),
            Arc::new(NullBus),
            Arc::new(TokioClock::anchored(Timestamp::from_millis(100_000))),
        ));
        ReconciliationClient::new(hub, remote, &EngineConfig::default())
    }

    fn client(remote: Arc<Script>) -> ReconciliationClient {
        client_with(remote, Arc::new(SessionAuth::signed_in(Identity::new("me"))))
    }

    fn item() -> ItemId {
        ItemId::new("post")
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_triggers_collapse() {
        let remote = Script::new(10, vec![Ok(Snapshot::like(true, 4))]);
        let client = client(remote.clone());

        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.extend(client.request_fetch(&item()));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.hub().like_view(&item()), LikeView::new(true, 4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetches_never_overlap() {
        let remote = Script::new(
            100,
            vec![Ok(Snapshot::like(false, 1)), Ok(Snapshot::like(false, 2))],
        );
        let client = client(remote.clone());

        let it = item();
        let (first, second) = tokio::join!(client.fetch_now(&it), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(client.is_in_flight(&it));
            client.fetch_now(&it).await
        });
        assert!(matches!(first, Ok(FetchOutcome::Merged { .. })));
        assert!(matches!(second, Ok(FetchOutcome::Coalesced)));

        // the coalesced trigger re-runs once after the first completes
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.hub().like_view(&item()).count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_fetch_releases_item() {
        let remote = Script::new(
            100,
            vec![Ok(Snapshot::like(true, 3)), Ok(Snapshot::like(true, 4))],
        );
        let client = client(remote.clone());

        let cut = tokio::time::timeout(Duration::from_millis(10), client.fetch_now(&item())).await;
        assert!(cut.is_err());
        assert!(!client.is_in_flight(&item()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        let again = client.fetch_now(&item()).await;
        assert!(matches!(again, Ok(FetchOutcome::Merged { .. })));
        assert_eq!(client.hub().like_view(&item()), LikeView::new(true, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_fetch_still_runs_coalesced_trigger() {
        let remote = Script::new(100, vec![Ok(Snapshot::like(false, 8))]);
        let client = client(remote.clone());
        let it = item();

        let cut = tokio::time::timeout(Duration::from_millis(50), async {
            tokio::join!(client.fetch_now(&it), async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                client.fetch_now(&it).await
            })
        })
        .await;
        assert!(cut.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.hub().like_view(&it), LikeView::new(false, 8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fetch_retries_with_backoff() {
        let remote = Script::new(
            0,
            vec![
                Err(SyncError::Network("down".into())),
                Err(SyncError::Network("down".into())),
                Ok(Snapshot::like(true, 9)),
            ],
        );
        let client = client(remote.clone());

        assert!(client.fetch_now(&item()).await.is_err());
        assert_eq!(client.failures(&item()), 1);

        // 500 ms, then 1000 ms
        tokio::time::sleep(Duration::from_millis(1_600)).await;
        assert_eq!(remote.calls.load(Ordering::SeqCst), 3);
        assert_eq!(client.failures(&item()), 0);
        assert_eq!(client.hub().like_view(&item()), LikeView::new(true, 9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_stop_after_budget() {
        let remote = Script::new(0, vec![]);
        let client = client(remote.clone());

        let _ = client.fetch_now(&item()).await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        // first call plus six retries
        assert_eq!(remote.calls.load(Ordering::SeqCst), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_confirms_and_replaces_count() {
        let remote = Script::new(50, vec![Ok(Snapshot::like(true, 42))]);
        let client = client(remote.clone());
        let (_, at) = client.hub().toggle_like(&item());

        let view = client.mutate_like(&item(), true, at).await.unwrap();
        assert_eq!(view, LikeView::new(true, 42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_mutation_keeps_optimistic_state() {
        let remote = Script::new(
            20,
            vec![Err(SyncError::Network("down".into())), Ok(Snapshot::like(true, 1))],
        );
        let client = client(remote.clone());
        let (optimistic, at) = client.hub().toggle_like(&item());

        assert!(client.mutate_like(&item(), true, at).await.is_err());
        assert_eq!(client.hub().like_view(&item()), optimistic);

        // the scheduled reconciliation fetch runs after the first backoff step
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_mutation_response_discarded() {
        let remote = Script::new(
            300,
            vec![Ok(Snapshot::like(true, 11)), Ok(Snapshot::like(false, 10))],
        );
        let client = client(remote.clone());
        client
            .hub()
            .merge_like(&item(), LikeUpdate::new(Some(false), Some(10)), &Origin::anonymous(Timestamp::ZERO));

        let (_, first_at) = client.hub().toggle_like(&item());
        let first = client.spawn_like(&item(), true, first_at).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let (_, second_at) = client.hub().toggle_like(&item());
        let second = client.spawn_like(&item(), false, second_at).unwrap();

        first.await.unwrap().unwrap();
        assert_eq!(client.hub().like_view(&item()), LikeView::new(false, 10));
        second.await.unwrap().unwrap();
        assert_eq!(client.hub().like_view(&item()), LikeView::new(false, 10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppressed_snapshot_schedules_followup() {
        let remote = Script::new(
            10,
            vec![Ok(Snapshot::like(false, 0)), Ok(Snapshot::like(false, 0))],
        );
        let client = client(remote.clone());
        client.hub().toggle_like(&item());

        let outcome = client.fetch_now(&item()).await.unwrap();
        assert!(outcome.was_suppressed());
        assert!(client.hub().like_view(&item()).liked);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
        assert!(!client.hub().like_view(&item()).liked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_after_namespace_change_discarded() {
        let auth = Arc::new(SessionAuth::signed_in(Identity::new("me")));
        let remote = Arc::new(Script {
            latency: Duration::from_millis(10),
            answers: Mutex::new(vec![Ok(Snapshot::like(true, 5))].into()),
            calls: AtomicUsize::new(0),
            auth: Some(auth.clone()),
        });
        let client = client_with(remote, auth);

        let result = client.fetch_now(&item()).await;
        assert!(matches!(result, Err(SyncError::NamespaceChanged { .. })));
        assert_eq!(client.hub().likes().known(&item()), None);
    }

    #[test]
    fn test_without_runtime_nothing_spawns() {
        let client = client(Script::new(0, vec![]));
        assert!(client.request_fetch(&item()).is_none());
        assert!(client.spawn_like(&item(), true, Timestamp::ZERO).is_none());
    }
}
