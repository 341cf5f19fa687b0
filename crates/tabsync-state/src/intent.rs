//! Optimistic intent cache for likes
//!
//! A local action is rendered at once and stays the rendered truth while
//! its conflict window is open. External facts are merged by these rules:
//!
//! - Anything older than the current assertion, or than the newest fact
//!   already merged, is stale and discarded.
//! - Counts are adopted from any actor; they replace, never accumulate.
//! - The local actor's own results confirm. They never flip the asserted
//!   flag.
//! - A flag from any other actor is adopted only once the window has
//!   closed and only if it disagrees with the assertion.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tabsync_core::{ActorId, ItemId, Timestamp};
use tabsync_time::{Clock, ConflictWindow};
use tracing::debug;

use crate::{next_stamp, Merge, MergeOutcome, Origin};

/// Rendered like state of one item
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct LikeView {
    pub liked: bool,
    pub count: u64,
}

impl LikeView {
    pub fn new(liked: bool, count: u64) -> Self {
        LikeView { liked, count }
    }

    /// Flag flipped, count moved by one and floored at zero
    pub fn toggled(self) -> Self {
        if self.liked {
            LikeView::new(false, self.count.saturating_sub(1))
        } else {
            LikeView::new(true, self.count.saturating_add(1))
        }
    }
}

/// The latest local assertion for an item
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Assertion {
    pub liked: bool,
    pub asserted_at: Timestamp,
}

/// External like data; either field may be missing
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LikeUpdate {
    pub liked: Option<bool>,
    pub count: Option<u64>,
}

impl LikeUpdate {
    pub fn new(liked: Option<bool>, count: Option<u64>) -> Self {
        LikeUpdate { liked, count }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Entry {
    view: LikeView,
    assertion: Option<Assertion>,
    last_fact_at: Option<Timestamp>,
}

impl Entry {
    /// Facts stamped before this are stale
    fn floor(&self) -> Option<Timestamp> {
        self.assertion.map(|a| a.asserted_at).max(self.last_fact_at)
    }
}

pub struct IntentCache {
    actor: ActorId,
    window: ConflictWindow,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<ItemId, Entry>>,
}

impl IntentCache {
    pub fn new(actor: ActorId, window: ConflictWindow, clock: Arc<dyn Clock>) -> Self {
        IntentCache {
            actor,
            window,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    #[inline]
    pub fn window(&self) -> ConflictWindow {
        self.window
    }

    /// Rendered view; unknown items read as not liked with no likes
    pub fn view(&self, item: &ItemId) -> LikeView {
        self.entries
            .lock()
            .get(item)
            .map(|e| e.view)
            .unwrap_or_default()
    }

    pub fn known(&self, item: &ItemId) -> Option<LikeView> {
        self.entries.lock().get(item).map(|e| e.view)
    }

    pub fn assertion(&self, item: &ItemId) -> Option<Assertion> {
        self.entries.lock().get(item).and_then(|e| e.assertion)
    }

    /// Record a local intent. Returns the stamp the intent carries, which
    /// is strictly later than any earlier assertion for the item.
    pub fn assert(&self, item: &ItemId, liked: bool, count: u64) -> Timestamp {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let entry = entries.entry(item.clone()).or_default();
        let at = next_stamp(entry.floor(), now);
        entry.view = LikeView::new(liked, count);
        entry.assertion = Some(Assertion {
            liked,
            asserted_at: at,
        });
        at
    }

    /// Flip the rendered flag with a ±1 count step
    pub fn toggle(&self, item: &ItemId) -> (LikeView, Timestamp) {
        let next = self.view(item).toggled();
        let at = self.assert(item, next.liked, next.count);
        (next, at)
    }

    pub fn apply_external(&self, item: &ItemId, update: LikeUpdate, origin: &Origin) -> Merge<LikeView> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let entry = entries.entry(item.clone()).or_default();
        let before = entry.view;

        if let Some(floor) = entry.floor().filter(|floor| origin.at < *floor) {
            debug!(item = %item, at = %origin.at, floor = %floor, "stale like fact discarded");
            return Merge {
                outcome: MergeOutcome::Stale,
                changed: false,
                view: before,
            };
        }
        entry.last_fact_at = entry.last_fact_at.max(Some(origin.at));

        let outcome = match entry.assertion {
            None => {
                if let Some(liked) = update.liked {
                    entry.view.liked = liked;
                }
                if let Some(count) = update.count {
                    entry.view.count = count;
                }
                MergeOutcome::Adopted
            }
            Some(assertion) => {
                if let Some(count) = update.count {
                    entry.view.count = count;
                }
                let contradicts = update.liked.is_some_and(|l| l != assertion.liked);
                if origin.is_from(&self.actor) {
                    if contradicts {
                        debug!(item = %item, "own result contradicts assertion, flag kept");
                        MergeOutcome::Suppressed
                    } else {
                        MergeOutcome::Confirmed
                    }
                } else if !contradicts {
                    MergeOutcome::CountOnly
                } else if self.window.is_open(assertion.asserted_at, now) {
                    debug!(item = %item, "contradicting like suppressed by conflict window");
                    MergeOutcome::Suppressed
                } else {
                    let liked = !assertion.liked;
                    entry.view.liked = liked;
                    entry.assertion = Some(Assertion {
                        liked,
                        asserted_at: assertion.asserted_at,
                    });
                    MergeOutcome::Adopted
                }
            }
        };

        let view = entry.view;
        let changed = view != before;
        let outcome = match outcome {
            MergeOutcome::Adopted | MergeOutcome::CountOnly if !changed => MergeOutcome::Unchanged,
            other => other,
        };
        Merge {
            outcome,
            changed,
            view,
        }
    }

    /// While the window for `item` is open: the instant it closes
    pub fn suppressed_until(&self, item: &ItemId) -> Option<Timestamp> {
        let assertion = self.assertion(item)?;
        let now = self.clock.now();
        self.window
            .is_open(assertion.asserted_at, now)
            .then(|| self.window.closes_at(assertion.asserted_at))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Forget everything, e.g. when the namespace changes
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl std::fmt::Debug for IntentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentCache")
            .field("actor", &self.actor)
            .field("items", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;
    use tabsync_time::ManualClock;

    fn cache() -> (IntentCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(10_000)));
        let cache = IntentCache::new(ActorId::new("me"), ConflictWindow::default(), clock.clone());
        (cache, clock)
    }

    fn item() -> ItemId {
        ItemId::new("post-1")
    }

    fn seed(cache: &IntentCache, liked: bool, count: u64) {
        cache.apply_external(
            &item(),
            LikeUpdate::new(Some(liked), Some(count)),
            &Origin::anonymous(Timestamp::ZERO),
        );
    }

    #[test]
    fn test_unasserted_item_adopts_directly() {
        let (cache, _) = cache();
        let merge = cache.apply_external(
            &item(),
            LikeUpdate::new(Some(true), Some(3)),
            &Origin::anonymous(Timestamp::from_millis(1)),
        );
        assert_eq!(merge.outcome, MergeOutcome::Adopted);
        assert!(merge.changed);
        assert_eq!(cache.view(&item()), LikeView::new(true, 3));
    }

    #[test]
    fn test_toggle_twice_restores() {
        let (cache, _) = cache();
        seed(&cache, false, 10);

        assert_eq!(cache.toggle(&item()).0, LikeView::new(true, 11));
        assert_eq!(cache.toggle(&item()).0, LikeView::new(false, 10));
    }

    #[test]
    fn test_assert_stamps_strictly_increase() {
        let (cache, clock) = cache();
        let first = cache.assert(&item(), true, 1);
        let second = cache.assert(&item(), false, 0);
        assert!(second > first);

        clock.set(Timestamp::from_millis(5));
        assert!(cache.assert(&item(), true, 1) > second);
    }

    #[test]
    fn test_contradiction_inside_window_suppressed() {
        let (cache, clock) = cache();
        seed(&cache, false, 10);
        let (_, t0) = cache.toggle(&item());

        clock.advance(Duration::from_millis(600));
        let merge = cache.apply_external(
            &item(),
            LikeUpdate::new(Some(false), Some(10)),
            &Origin::new(Some(ActorId::new("other")), t0.next()),
        );

        assert_eq!(merge.outcome, MergeOutcome::Suppressed);
        assert!(merge.view.liked);
        // counts are always safe to take
        assert_eq!(merge.view.count, 10);
        assert!(cache.suppressed_until(&item()).is_some());
    }

    #[test]
    fn test_contradiction_after_window_adopted() {
        let (cache, clock) = cache();
        seed(&cache, false, 10);
        let (_, t0) = cache.toggle(&item());

        clock.advance(Duration::from_millis(1300));
        let merge = cache.apply_external(
            &item(),
            LikeUpdate::new(Some(false), None),
            &Origin::anonymous(t0.next()),
        );

        assert_eq!(merge.outcome, MergeOutcome::Adopted);
        assert_eq!(merge.view, LikeView::new(false, 11));
        assert_eq!(cache.suppressed_until(&item()), None);
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let (cache, clock) = cache();
        let t0 = cache.assert(&item(), true, 1);

        clock.set(t0 + ConflictWindow::DEFAULT_TTL);
        let origin = Origin::anonymous(t0);
        let merge = cache.apply_external(&item(), LikeUpdate::new(Some(false), None), &origin);
        assert_eq!(merge.outcome, MergeOutcome::Suppressed);

        clock.advance(Duration::from_millis(1));
        let merge = cache.apply_external(&item(), LikeUpdate::new(Some(false), None), &origin);
        assert_eq!(merge.outcome, MergeOutcome::Adopted);
    }

    #[test]
    fn test_own_result_never_flips_flag() {
        let (cache, clock) = cache();
        let t0 = cache.assert(&item(), true, 5);

        for wait in [100, 5_000] {
            clock.advance(Duration::from_millis(wait));
            let merge = cache.apply_external(
                &item(),
                LikeUpdate::new(Some(false), Some(4)),
                &Origin::new(Some(ActorId::new("me")), t0),
            );
            assert!(merge.view.liked);
            assert_eq!(merge.view.count, 4);
        }
    }

    #[test]
    fn test_confirmation_replaces_count() {
        let (cache, clock) = cache();
        seed(&cache, false, 10);
        let (_, t0) = cache.toggle(&item());

        clock.advance(Duration::from_millis(600));
        let merge = cache.apply_external(
            &item(),
            LikeUpdate::new(Some(true), Some(14)),
            &Origin::new(Some(ActorId::new("me")), t0),
        );
        assert_eq!(merge.outcome, MergeOutcome::Confirmed);
        assert_eq!(merge.view, LikeView::new(true, 14));

        // a later toggle starts from the authoritative count
        assert_eq!(cache.toggle(&item()).0, LikeView::new(false, 13));
    }

    #[test]
    fn test_rapid_reclick_discards_superseded_confirmation() {
        let (cache, clock) = cache();
        seed(&cache, false, 10);

        let (first, t_first) = cache.toggle(&item());
        assert_eq!(first, LikeView::new(true, 11));

        clock.advance(Duration::from_millis(200));
        let (second, _) = cache.toggle(&item());
        assert_eq!(second, LikeView::new(false, 10));

        clock.advance(Duration::from_millis(400));
        let confirm = cache.apply_external(
            &item(),
            LikeUpdate::new(Some(true), Some(11)),
            &Origin::new(Some(ActorId::new("me")), t_first),
        );
        assert_eq!(confirm.outcome, MergeOutcome::Stale);

        clock.advance(Duration::from_millis(300));
        let late = cache.apply_external(
            &item(),
            LikeUpdate::new(Some(true), Some(11)),
            &Origin::new(Some(ActorId::new("me")), t_first),
        );
        assert_eq!(late.outcome, MergeOutcome::Stale);
        assert!(!late.changed);
        assert_eq!(cache.view(&item()), LikeView::new(false, 10));
    }

    #[test]
    fn test_agreeing_fact_is_count_only() {
        let (cache, _) = cache();
        let t0 = cache.assert(&item(), true, 2);
        let merge = cache.apply_external(
            &item(),
            LikeUpdate::new(Some(true), Some(7)),
            &Origin::new(Some(ActorId::new("other")), t0),
        );
        assert_eq!(merge.outcome, MergeOutcome::CountOnly);
        assert_eq!(merge.view, LikeView::new(true, 7));

        let again = cache.apply_external(
            &item(),
            LikeUpdate::new(Some(true), Some(7)),
            &Origin::new(Some(ActorId::new("other")), t0),
        );
        assert_eq!(again.outcome, MergeOutcome::Unchanged);
    }

    #[test]
    fn test_older_foreign_fact_loses_on_unasserted_item() {
        let (cache, _) = cache();
        let other = |at| Origin::new(Some(ActorId::new("tab-2")), Timestamp::from_millis(at));

        let newer = cache.apply_external(&item(), LikeUpdate::new(Some(false), Some(10)), &other(300));
        assert_eq!(newer.outcome, MergeOutcome::Adopted);

        let older = cache.apply_external(&item(), LikeUpdate::new(Some(true), Some(11)), &other(100));
        assert_eq!(older.outcome, MergeOutcome::Stale);
        assert!(!older.changed);
        assert_eq!(cache.view(&item()), LikeView::new(false, 10));
    }

    #[test]
    fn test_older_fact_cannot_undo_adoption_after_window() {
        let (cache, clock) = cache();
        let t0 = cache.assert(&item(), true, 1);
        clock.advance(Duration::from_millis(2_000));
        let other = |at| Origin::new(Some(ActorId::new("tab-2")), at);

        let adopted = cache.apply_external(&item(), LikeUpdate::new(Some(false), Some(0)), &other(t0 + Duration::from_millis(900)));
        assert_eq!(adopted.outcome, MergeOutcome::Adopted);

        let older = cache.apply_external(&item(), LikeUpdate::new(Some(true), Some(1)), &other(t0 + Duration::from_millis(400)));
        assert_eq!(older.outcome, MergeOutcome::Stale);
        assert_eq!(cache.view(&item()), LikeView::new(false, 0));
    }

    #[test]
    fn test_assertion_stamped_after_newest_fact() {
        let (cache, _) = cache();
        let ahead = Timestamp::from_millis(50_000);
        cache.apply_external(&item(), LikeUpdate::new(Some(false), Some(3)), &Origin::anonymous(ahead));

        let (_, at) = cache.toggle(&item());
        assert!(at > ahead);
    }

        #[test]
    fn test_clear_forgets_items() {
        let (cache, _) = cache();
        cache.assert(&item(), true, 1);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.view(&item()), LikeView::default());
    }

    proptest! {
        #[test]
        fn prop_double_toggle_is_identity(liked in any::<bool>(), count in 0u64..1_000) {
            let (cache, _) = cache();
            // a liked item counts at least its own like
            let count = if liked { count.max(1) } else { count };
            seed(&cache, liked, count);
            let start = cache.view(&item());
            cache.toggle(&item());
            cache.toggle(&item());
            prop_assert_eq!(cache.view(&item()), start);
        }

        #[test]
        fn prop_count_never_wraps_below_zero(
            start in 0u64..3,
            steps in prop::collection::vec((any::<bool>(), prop::option::of(0u64..3), 0u64..2_000), 1..60),
        ) {
            let (cache, clock) = cache();
            seed(&cache, false, start);
            let mut bound = start;
            for (toggle, count, wait) in steps {
                clock.advance(Duration::from_millis(wait));
                if toggle {
                    cache.toggle(&item());
                    bound += 1;
                } else {
                    let origin = Origin::anonymous(clock.now());
                    cache.apply_external(&item(), LikeUpdate::new(Some(false), count), &origin);
                    bound = bound.max(count.unwrap_or(0));
                }
                prop_assert!(cache.view(&item()).count <= bound);
            }
        }
    }
}
