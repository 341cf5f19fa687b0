//! Clock driven by the tokio timer
//!
//! Follows `tokio::time`, so a paused test runtime advances it together
//! with every sleep the client schedules.

use tabsync_core::Timestamp;
use tabsync_time::{Clock, SystemClock};
use tokio::time::Instant;

#[derive(Clone, Copy, Debug)]
pub struct TokioClock {
    origin: Instant,
    origin_ts: Timestamp,
}

impl TokioClock {
    /// Anchored to the system clock at creation
    pub fn new() -> Self {
        Self::anchored(SystemClock.now())
    }

    pub fn anchored(origin_ts: Timestamp) -> Self {
        TokioClock {
            origin: Instant::now(),
            origin_ts,
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Timestamp {
        self.origin_ts + self.origin.elapsed()
    }
}
