//! Engine and logging configuration
//!
//! Durations are carried as milliseconds in JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tabsync_core::SyncResult;
use tabsync_time::{BackoffPolicy, ConflictWindow, DebounceGate};

/// Engine configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a local assertion suppresses contradicting facts
    #[serde(with = "millis", rename = "conflict_window_ms")]
    pub conflict_window: Duration,
    /// Quiet period before a triggered fetch is sent
    #[serde(with = "millis", rename = "debounce_ms")]
    pub debounce: Duration,
    /// Recently seen facts remembered by the bus
    pub dedup_capacity: usize,
    #[serde(with = "backoff")]
    pub backoff: BackoffPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            conflict_window: ConflictWindow::DEFAULT_TTL,
            debounce: DebounceGate::<()>::DEFAULT_QUIET,
            dedup_capacity: 256,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Short windows for tests and demos
    pub fn responsive() -> Self {
        EngineConfig {
            conflict_window: Duration::from_millis(300),
            debounce: Duration::from_millis(20),
            dedup_capacity: 256,
            backoff: BackoffPolicy::fast(),
        }
    }

    /// Slow or flaky networks
    pub fn conservative() -> Self {
        EngineConfig {
            conflict_window: Duration::from_millis(2500),
            debounce: Duration::from_millis(600),
            dedup_capacity: 1024,
            backoff: BackoffPolicy::patient(),
        }
    }

    pub fn from_json(raw: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    #[inline]
    pub fn window(&self) -> ConflictWindow {
        ConflictWindow::new(self.conflict_window)
    }
}

/// Subscriber configuration for [`crate::init_tracing`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Directive used when `RUST_LOG` is unset, e.g. `info` or `tabsync_runtime=debug`
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod backoff {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use tabsync_time::BackoffPolicy;

    #[derive(Serialize, Deserialize)]
    #[serde(default)]
    struct Repr {
        base_ms: u64,
        multiplier: u32,
        max_delay_ms: u64,
        max_attempts: u32,
    }

    impl Default for Repr {
        fn default() -> Self {
            Repr::from(&BackoffPolicy::default())
        }
    }

    impl From<&BackoffPolicy> for Repr {
        fn from(p: &BackoffPolicy) -> Self {
            Repr {
                base_ms: p.base.as_millis() as u64,
                multiplier: p.multiplier,
                max_delay_ms: p.max_delay.as_millis() as u64,
                max_attempts: p.max_attempts,
            }
        }
    }

    pub fn serialize<S: Serializer>(p: &BackoffPolicy, s: S) -> Result<S::Ok, S::Error> {
        Repr::from(p).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BackoffPolicy, D::Error> {
        let r = Repr::deserialize(d)?;
        Ok(BackoffPolicy {
            base: Duration::from_millis(r.base_ms),
            multiplier: r.multiplier,
            max_delay: Duration::from_millis(r.max_delay_ms),
            max_attempts: r.max_attempts,
        })
    }
}
