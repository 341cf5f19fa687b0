//! Chaos transport
//!
//! Wraps a real transport and makes it unreliable:
//! - Loss (a send reports success but nothing is delivered)
//! - Duplication (a send is delivered twice)
//!
//! Decisions come from a seeded RNG so failing runs can be replayed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tabsync_bus::{FactSink, ListenId, Transport, TransportKind};
use tabsync_core::{SyncFact, SyncResult, Topic};
use tracing::trace;

/// Transport chaos configuration
#[derive(Clone, Debug, PartialEq)]
pub struct ChaosConfig {
    /// Probability a send is silently lost (0.0 - 1.0)
    pub loss_rate: f64,
    /// Probability a delivered send is repeated
    pub duplicate_rate: f64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        ChaosConfig {
            loss_rate: 0.05,
            duplicate_rate: 0.05,
        }
    }
}

impl ChaosConfig {
    /// Every fact delivered exactly once
    pub fn reliable() -> Self {
        ChaosConfig {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
        }
    }

    /// Nothing lost, everything delivered twice
    pub fn echo() -> Self {
        ChaosConfig {
            loss_rate: 0.0,
            duplicate_rate: 1.0,
        }
    }

    pub fn hostile() -> Self {
        ChaosConfig {
            loss_rate: 0.3,
            duplicate_rate: 0.3,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChaosStats {
    pub sent: u64,
    pub lost: u64,
    pub duplicated: u64,
}

pub struct ChaosTransport {
    inner: Arc<dyn Transport>,
    config: ChaosConfig,
    rng: Mutex<StdRng>,
    sent: AtomicU64,
    lost: AtomicU64,
    duplicated: AtomicU64,
}

impl ChaosTransport {
    pub fn new(inner: Arc<dyn Transport>, config: ChaosConfig, seed: u64) -> Self {
        ChaosTransport {
            inner,
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            sent: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            duplicated: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> ChaosStats {
        ChaosStats {
            sent: self.sent.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            duplicated: self.duplicated.load(Ordering::Relaxed),
        }
    }

    fn roll(&self) -> (bool, bool) {
        let mut rng = self.rng.lock();
        let lose = rng.gen_bool(self.config.loss_rate.clamp(0.0, 1.0));
        let repeat = rng.gen_bool(self.config.duplicate_rate.clamp(0.0, 1.0));
        (lose, repeat)
    }
}

impl Transport for ChaosTransport {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn kind(&self) -> TransportKind {
        self.inner.kind()
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    fn send(&self, topic: &Topic, fact: &SyncFact) -> SyncResult<()> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        let (lose, repeat) = self.roll();
        if lose {
            self.lost.fetch_add(1, Ordering::Relaxed);
            trace!(transport = self.name(), "fact lost");
            return Ok(());
        }
        self.inner.send(topic, fact)?;
        if repeat {
            self.duplicated.fetch_add(1, Ordering::Relaxed);
            self.inner.send(topic, fact)?;
        }
        Ok(())
    }

    fn listen(&self, topic: &Topic, sink: FactSink) -> SyncResult<ListenId> {
        self.inner.listen(topic, sink)
    }

    fn unlisten(&self, id: ListenId) {
        self.inner.unlisten(id)
    }
}

impl std::fmt::Debug for ChaosTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosTransport")
            .field("inner", &self.inner.name())
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabsync_bus::{BroadcastHub, BroadcastTransport};
    use tabsync_core::{ContextId, Namespace, Timestamp};

    fn pair(config: ChaosConfig, seed: u64) -> (ChaosTransport, Arc<Mutex<Vec<SyncFact>>>, Topic) {
        let hub = BroadcastHub::new();
        let topic = Topic::for_namespace(&Namespace::default_partition());
        let sender = ChaosTransport::new(
            Arc::new(BroadcastTransport::new(hub.clone(), ContextId::new(1))),
            config,
            seed,
        );
        let receiver = BroadcastTransport::new(hub, ContextId::new(2));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        receiver
            .listen(&topic, Arc::new(move |_: &Topic, fact: SyncFact| sink.lock().push(fact)))
            .unwrap();
        // The hub holds the receiver's endpoint; the transport itself may go
        (sender, seen, topic)
    }

    #[test]
    fn test_reliable_delivers_once() {
        let (sender, seen, topic) = pair(ChaosConfig::reliable(), 7);
        for i in 0..10 {
            sender
                .send(&topic, &SyncFact::selection("theme", None, Timestamp::from_millis(i)))
                .unwrap();
        }
        assert_eq!(seen.lock().len(), 10);
        assert_eq!(sender.stats().lost, 0);
    }

    #[test]
    fn test_echo_duplicates_everything() {
        let (sender, seen, topic) = pair(ChaosConfig::echo(), 7);
        sender
            .send(&topic, &SyncFact::selection("theme", None, Timestamp::ZERO))
            .unwrap();
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(sender.stats().duplicated, 1);
    }

    #[test]
    fn test_same_seed_same_losses() {
        let run = |seed| {
            let (sender, seen, topic) = pair(ChaosConfig::hostile(), seed);
            for i in 0..50 {
                let _ = sender.send(&topic, &SyncFact::selection("theme", None, Timestamp::from_millis(i)));
            }
            let delivered = seen.lock().len();
            (sender.stats(), delivered)
        };
        assert_eq!(run(42), run(42));
    }
}
