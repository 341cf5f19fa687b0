//! Vote book
//!
//! Single-choice votes: no choice or exactly one label. Selecting the held
//! label withdraws the vote; selecting another label moves it. Counts are
//! replaced by every authoritative snapshot while the local choice follows
//! the same window rules as like flags.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tabsync_core::{ActorId, ItemId, Timestamp};
use tabsync_time::{Clock, ConflictWindow};
use tracing::debug;

use crate::{next_stamp, Merge, MergeOutcome, Origin};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VoteView {
    pub counts: BTreeMap<String, u64>,
    pub my_choice: Option<String>,
}

impl VoteView {
    pub fn new(counts: BTreeMap<String, u64>, my_choice: Option<String>) -> Self {
        VoteView { counts, my_choice }
    }

    pub fn count(&self, label: &str) -> u64 {
        self.counts.get(label).copied().unwrap_or(0)
    }

    /// The view after the local actor picks `label`
    pub fn select(&self, label: &str) -> Self {
        let mut next = self.clone();
        if self.my_choice.as_deref() == Some(label) {
            next.decrement(label);
            next.my_choice = None;
            return next;
        }
        if let Some(previous) = &self.my_choice {
            next.decrement(previous);
        }
        *next.counts.entry(label.to_string()).or_insert(0) += 1;
        next.my_choice = Some(label.to_string());
        next
    }

    fn decrement(&mut self, label: &str) {
        if let Some(count) = self.counts.get_mut(label) {
            *count = count.saturating_sub(1);
        }
    }
}

/// External vote data. `my_choice: Some(None)` is an explicit "no choice".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VoteUpdate {
    pub counts: Option<BTreeMap<String, u64>>,
    pub my_choice: Option<Option<String>>,
}

#[derive(Clone, Debug, Default)]
struct Entry {
    view: VoteView,
    /// Choice asserted locally and when
    assertion: Option<(Option<String>, Timestamp)>,
    last_fact_at: Option<Timestamp>,
}

impl Entry {
    fn floor(&self) -> Option<Timestamp> {
        self.assertion.as_ref().map(|(_, at)| *at).max(self.last_fact_at)
    }
}

pub struct VoteBook {
    actor: ActorId,
    window: ConflictWindow,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<ItemId, Entry>>,
}

impl VoteBook {
    pub fn new(actor: ActorId, window: ConflictWindow, clock: Arc<dyn Clock>) -> Self {
        VoteBook {
            actor,
            window,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn view(&self, item: &ItemId) -> VoteView {
        self.entries
            .lock()
            .get(item)
            .map(|e| e.view.clone())
            .unwrap_or_default()
    }

    pub fn asserted_at(&self, item: &ItemId) -> Option<Timestamp> {
        self.entries
            .lock()
            .get(item)
            .and_then(|e| e.assertion.as_ref().map(|(_, at)| *at))
    }

    /// Apply the local selection optimistically
    pub fn select(&self, item: &ItemId, label: &str) -> (VoteView, Timestamp) {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let entry = entries.entry(item.clone()).or_default();
        let at = next_stamp(entry.floor(), now);
        entry.view = entry.view.select(label);
        entry.assertion = Some((entry.view.my_choice.clone(), at));
        (entry.view.clone(), at)
    }

    pub fn apply_external(&self, item: &ItemId, update: VoteUpdate, origin: &Origin) -> Merge<VoteView> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let entry = entries.entry(item.clone()).or_default();
        let before = entry.view.clone();

        if let Some(floor) = entry.floor().filter(|floor| origin.at < *floor) {
            debug!(item = %item, at = %origin.at, floor = %floor, "stale vote fact discarded");
            return Merge {
                outcome: MergeOutcome::Stale,
                changed: false,
                view: before,
            };
        }
        entry.last_fact_at = entry.last_fact_at.max(Some(origin.at));

        let outcome = match entry.assertion.clone() {
            None => {
                if let Some(counts) = update.counts {
                    entry.view.counts = counts;
                }
                if let Some(choice) = update.my_choice {
                    entry.view.my_choice = choice;
                }
                MergeOutcome::Adopted
            }
            Some((asserted, asserted_at)) => {
                if let Some(counts) = update.counts {
                    entry.view.counts = counts;
                }
                let incoming = update.my_choice.filter(|c| *c != asserted);
                match incoming {
                    None if origin.is_from(&self.actor) => MergeOutcome::Confirmed,
                    None => MergeOutcome::CountOnly,
                    Some(_) if origin.is_from(&self.actor) => {
                        debug!(item = %item, "own result contradicts vote, choice kept");
                        MergeOutcome::Suppressed
                    }
                    Some(_) if self.window.is_open(asserted_at, now) => {
                        debug!(item = %item, "contradicting choice suppressed by conflict window");
                        MergeOutcome::Suppressed
                    }
                    Some(choice) => {
                        entry.view.my_choice = choice.clone();
                        entry.assertion = Some((choice, asserted_at));
                        MergeOutcome::Adopted
                    }
                }
            }
        };

        let view = entry.view.clone();
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

    pub fn suppressed_until(&self, item: &ItemId) -> Option<Timestamp> {
        let asserted_at = self.asserted_at(item)?;
        let now = self.clock.now();
        self.window
            .is_open(asserted_at, now)
            .then(|| self.window.closes_at(asserted_at))
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl std::fmt::Debug for VoteBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoteBook")
            .field("actor", &self.actor)
            .field("items", &self.entries.lock().len())
            .finish()
    }
}
