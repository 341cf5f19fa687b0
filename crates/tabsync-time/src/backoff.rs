//! Capped exponential backoff with per-key attempt tracking

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;

/// Retry schedule: `base * multiplier^attempt`, capped at `max_delay`,
/// for at most `max_attempts` retries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            base: Duration::from_millis(500),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
            max_attempts: 6,
        }
    }
}

impl BackoffPolicy {
    /// Short delays for tests and demos
    pub fn fast() -> Self {
        BackoffPolicy {
            base: Duration::from_millis(20),
            multiplier: 2,
            max_delay: Duration::from_millis(200),
            max_attempts: 4,
        }
    }

    /// For degraded, high-latency services
    pub fn patient() -> Self {
        BackoffPolicy {
            base: Duration::from_secs(1),
            multiplier: 3,
            max_delay: Duration::from_secs(120),
            max_attempts: 8,
        }
    }

    /// Delay before retry number `attempt` (0-indexed)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Per-key failure counts, reset on success
#[derive(Debug)]
pub struct BackoffTracker<K> {
    policy: BackoffPolicy,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> BackoffTracker<K> {
    pub fn new(policy: BackoffPolicy) -> Self {
        BackoffTracker {
            policy,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Record a failure. Returns the delay before the next retry, or `None`
    /// once the retry budget for this key is spent.
    pub fn record_failure(&self, key: &K) -> Option<Duration> {
        let mut failures = self.failures.lock();
        let count = failures.entry(key.clone()).or_insert(0);
        let attempt = *count;
        *count += 1;
        if self.policy.allows(attempt) {
            Some(self.policy.delay(attempt))
        } else {
            None
        }
    }

    pub fn record_success(&self, key: &K) {
        self.failures.lock().remove(key);
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}

impl<K: Eq + Hash + Clone> Default for BackoffTracker<K> {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}
