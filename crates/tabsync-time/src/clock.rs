//! Clock implementations

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tabsync_core::Timestamp;

/// Source of wall-clock time. Injected everywhere so tests and simulations
/// control time explicitly.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Operating-system wall clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            // Clock set before 1970: report the epoch rather than panic
            .unwrap_or(0);
        Timestamp::from_millis(millis)
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        ManualClock {
            millis: AtomicI64::new(start.as_millis()),
        }
    }

    /// Advance by `dt`; returns the new time
    pub fn advance(&self, dt: Duration) -> Timestamp {
        let step = dt.as_millis() as i64;
        Timestamp::from_millis(self.millis.fetch_add(step, Ordering::SeqCst) + step)
    }

    /// Jump to an absolute time. May move backwards, which is how skewed
    /// contexts are simulated.
    pub fn set(&self, t: Timestamp) {
        self.millis.store(t.as_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.now() > Timestamp::from_millis(1_577_836_800_000));
    }

    #[test]
    fn test_manual_clock_advance_and_set() {
        let clock = ManualClock::new(Timestamp::from_millis(1_000));
        assert_eq!(clock.advance(Duration::from_millis(250)), Timestamp::from_millis(1_250));
        assert_eq!(clock.now(), Timestamp::from_millis(1_250));

        clock.set(Timestamp::from_millis(900));
        assert_eq!(clock.now(), Timestamp::from_millis(900));
    }
}
