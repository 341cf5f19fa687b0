//! Conflict window and debounce gate

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tabsync_core::Timestamp;

/// Time-boxed suppression of contradictory external facts after a local
/// assertion. The window is open while `now - asserted_at <= ttl`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConflictWindow {
    ttl: Duration,
}

impl ConflictWindow {
    pub const DEFAULT_TTL: Duration = Duration::from_millis(1200);

    pub fn new(ttl: Duration) -> Self {
        ConflictWindow { ttl }
    }

    #[inline]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Contradictions are still suppressed
    #[inline]
    pub fn is_open(&self, asserted_at: Timestamp, now: Timestamp) -> bool {
        now.since(asserted_at) <= self.ttl
    }

    /// First instant at which the window counts as elapsed
    #[inline]
    pub fn closes_at(&self, asserted_at: Timestamp) -> Timestamp {
        asserted_at.saturating_add(self.ttl).next()
    }

    /// Time left until the window closes; zero once it has
    pub fn remaining(&self, asserted_at: Timestamp, now: Timestamp) -> Duration {
        self.closes_at(asserted_at) - now
    }
}

impl Default for ConflictWindow {
    fn default() -> Self {
        ConflictWindow::new(Self::DEFAULT_TTL)
    }
}

/// Ticket handed out by [`DebounceGate::arm`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ticket(u64);

/// Per-key trailing-edge debounce. Every trigger arms a fresh ticket; after
/// the quiet period only the holder of the latest ticket proceeds.
#[derive(Debug)]
pub struct DebounceGate<K> {
    quiet: Duration,
    latest: Mutex<HashMap<K, Ticket>>,
    next: AtomicU64,
}

impl<K: Eq + Hash + Clone> DebounceGate<K> {
    pub const DEFAULT_QUIET: Duration = Duration::from_millis(250);

    pub fn new(quiet: Duration) -> Self {
        DebounceGate {
            quiet,
            latest: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    #[inline]
    pub fn quiet(&self) -> Duration {
        self.quiet
    }

    /// Register a trigger for `key`, superseding earlier ones
    pub fn arm(&self, key: &K) -> Ticket {
        let ticket = Ticket(self.next.fetch_add(1, Ordering::Relaxed));
        self.latest.lock().insert(key.clone(), ticket);
        ticket
    }

    pub fn is_current(&self, key: &K, ticket: Ticket) -> bool {
        self.latest.lock().get(key) == Some(&ticket)
    }

    /// Claim the trigger. Returns `false` if a newer trigger superseded it.
    pub fn settle(&self, key: &K, ticket: Ticket) -> bool {
        let mut latest = self.latest.lock();
        if latest.get(key) == Some(&ticket) {
            latest.remove(key);
            true
        } else {
            false
        }
    }
}

impl<K: Eq + Hash + Clone> Default for DebounceGate<K> {
    fn default() -> Self {
        Self::new(Self::DEFAULT_QUIET)
    }
}
