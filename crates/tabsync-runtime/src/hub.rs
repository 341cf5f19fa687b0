//! Intent hub
//!
//! Like and vote state of one context. Every merge that changes the
//! rendered view notifies local listeners; local actions are also
//! published so other contexts render them.

use std::sync::Arc;

use tabsync_core::{
    ActorId, EngineEvent, FactBus, FactData, FactOp, ItemId, Listeners, Namespace, SyncFact,
    Timestamp, Topic,
};
use tabsync_state::{
    IntentCache, LikeUpdate, LikeView, Merge, MergeOutcome, Origin, VoteBook, VoteUpdate, VoteView,
};
use tabsync_storage::NamespaceResolver;
use tabsync_time::{Clock, ConflictWindow};
use tracing::trace;

pub struct IntentHub {
    likes: IntentCache,
    votes: VoteBook,
    actor: ActorId,
    resolver: NamespaceResolver,
    listeners: Listeners,
    bus: Arc<dyn FactBus>,
    clock: Arc<dyn Clock>,
}

impl IntentHub {
    pub fn new(
        actor: ActorId,
        window: ConflictWindow,
        resolver: NamespaceResolver,
        listeners: Listeners,
        bus: Arc<dyn FactBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        IntentHub {
            likes: IntentCache::new(actor.clone(), window, clock.clone()),
            votes: VoteBook::new(actor.clone(), window, clock.clone()),
            actor,
            resolver,
            listeners,
            bus,
            clock,
        }
    }

    #[inline]
    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    pub fn namespace(&self) -> Namespace {
        self.resolver.namespace()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn likes(&self) -> &IntentCache {
        &self.likes
    }

    pub fn votes(&self) -> &VoteBook {
        &self.votes
    }

    pub fn like_view(&self, item: &ItemId) -> LikeView {
        self.likes.view(item)
    }

    pub fn vote_view(&self, item: &ItemId) -> VoteView {
        self.votes.view(item)
    }

    /// Local like toggle: assert, notify, publish
    pub fn toggle_like(&self, item: &ItemId) -> (LikeView, Timestamp) {
        let (view, at) = self.likes.toggle(item);
        self.emit_like(item, view);
        self.publish_like(FactOp::Assert, item, view, at);
        (view, at)
    }

    /// Local vote selection: assert, notify, publish
    pub fn select_vote(&self, item: &ItemId, label: &str) -> (VoteView, Timestamp) {
        let (view, at) = self.votes.select(item, label);
        self.emit_vote(item, &view);
        self.publish_vote(FactOp::Assert, item, &view, at);
        (view, at)
    }

    pub fn merge_like(&self, item: &ItemId, update: LikeUpdate, origin: &Origin) -> Merge<LikeView> {
        let merge = self.likes.apply_external(item, update, origin);
        if merge.changed {
            self.emit_like(item, merge.view);
        }
        merge
    }

    pub fn merge_vote(&self, item: &ItemId, update: VoteUpdate, origin: &Origin) -> Merge<VoteView> {
        let merge = self.votes.apply_external(item, update, origin);
        if merge.changed {
            self.emit_vote(item, &merge.view);
        }
        merge
    }

    /// Route a like or vote fact from another context. Returns the item
    /// and merge outcome, or `None` for facts of other kinds.
    pub fn apply_fact(&self, fact: &SyncFact) -> Option<(ItemId, MergeOutcome)> {
        let at = fact.timestamp();
        match &fact.payload.data {
            FactData::Like {
                item,
                liked,
                count,
                actor,
            } => {
                let origin = Origin::new(actor.clone(), at);
                let merge = self.merge_like(item, LikeUpdate::new(*liked, *count), &origin);
                trace!(item = %item, outcome = ?merge.outcome, "like fact merged");
                Some((item.clone(), merge.outcome))
            }
            FactData::Vote {
                item,
                counts,
                my_choice,
                actor,
            } => {
                let origin = Origin::new(actor.clone(), at);
                let update = VoteUpdate {
                    counts: Some(counts.clone()),
                    my_choice: Some(my_choice.clone()),
                };
                let merge = self.merge_vote(item, update, &origin);
                trace!(item = %item, outcome = ?merge.outcome, "vote fact merged");
                Some((item.clone(), merge.outcome))
            }
            FactData::Members { .. } | FactData::Selection { .. } => None,
        }
    }

    pub fn publish_like(&self, op: FactOp, item: &ItemId, view: LikeView, at: Timestamp) -> usize {
        let fact = SyncFact::like(
            op,
            item.clone(),
            Some(view.liked),
            Some(view.count),
            self.actor.clone(),
            at,
        );
        self.bus
            .publish(&Topic::for_namespace(&self.resolver.namespace()), &fact)
    }

    pub fn publish_vote(&self, op: FactOp, item: &ItemId, view: &VoteView, at: Timestamp) -> usize {
        let fact = SyncFact::vote(
            op,
            item.clone(),
            view.counts.clone(),
            view.my_choice.clone(),
            self.actor.clone(),
            at,
        );
        self.bus
            .publish(&Topic::for_namespace(&self.resolver.namespace()), &fact)
    }

    /// When a suppressed contradiction for `item` could next be adopted
    pub fn suppressed_until(&self, item: &ItemId) -> Option<Timestamp> {
        match (self.likes.suppressed_until(item), self.votes.suppressed_until(item)) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Drop all item state, e.g. after the namespace changed
    pub fn reset(&self) {
        self.likes.clear();
        self.votes.clear();
    }

    fn emit_like(&self, item: &ItemId, view: LikeView) {
        self.listeners.emit(&EngineEvent::ItemLikeChanged {
            item: item.clone(),
            liked: view.liked,
            count: view.count,
        });
    }

    fn emit_vote(&self, item: &ItemId, view: &VoteView) {
        self.listeners.emit(&EngineEvent::ItemVoteChanged {
            item: item.clone(),
            counts: view.counts.clone(),
            my_choice: view.my_choice.clone(),
        });
    }
}

impl std::fmt::Debug for IntentHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentHub")
            .field("actor", &self.actor)
            .field("likes", &self.likes)
            .field("votes", &self.votes)
            .finish()
    }
}
