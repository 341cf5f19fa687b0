//! Merge outcomes

use tabsync_core::{ActorId, Timestamp};

/// What an external fact did to an item
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MergeOutcome {
    /// Item had no pending assertion, or the window had closed
    Adopted,
    /// Local actor's own result; counts replaced
    Confirmed,
    /// Only counts were taken
    CountOnly,
    /// Contradicted an assertion whose window is still open
    Suppressed,
    /// Older than the current assertion; discarded
    Stale,
    /// Nothing new
    Unchanged,
}

impl MergeOutcome {
    /// Whether a later fetch could still bring something to adopt
    #[inline]
    pub fn was_suppressed(self) -> bool {
        matches!(self, MergeOutcome::Suppressed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Merge<V> {
    pub outcome: MergeOutcome,
    /// Rendered view differs from before the merge
    pub changed: bool,
    pub view: V,
}

/// Provenance of an external fact
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Origin {
    pub actor: Option<ActorId>,
    /// When the producing request was issued or the sender asserted
    pub at: Timestamp,
}

impl Origin {
    pub fn new(actor: Option<ActorId>, at: Timestamp) -> Self {
        Origin { actor, at }
    }

    /// Service snapshot with no actor attribution
    pub fn anonymous(at: Timestamp) -> Self {
        Origin { actor: None, at }
    }

    pub fn is_from(&self, actor: &ActorId) -> bool {
        self.actor.as_ref() == Some(actor)
    }
}

/// Stamp for a new assertion: strictly after the previous one, even if the
/// clock stood still or stepped back.
pub fn next_stamp(previous: Option<Timestamp>, now: Timestamp) -> Timestamp {
    match previous {
        Some(prev) if now <= prev => prev.next(),
        _ => now,
    }
}
