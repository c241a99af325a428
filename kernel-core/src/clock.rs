use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::types::Timestamp;

/// Time is a capability injected into the kernel rather than read globally,
/// so scenario tests can run deterministically under a `TestClock`. The wake
/// loop reads wall-clock only once per iteration via `now_ms`, and uses
/// `monotonic_now` for interval math between reads — never mixing the two.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Timestamp;
    fn monotonic_now(&self) -> Instant;
}

/// Real wall-clock + steady monotonic source.
#[derive(Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as Timestamp
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }
}

/// A controllable clock for deterministic tests. `monotonic_now` is derived
/// from the same advance-by-hand counter as `now_ms`, so sleeps computed
/// against it behave consistently under `tokio::time::pause`.
pub struct TestClock {
    epoch_ms: AtomicI64,
    base_instant: Instant,
}

impl TestClock {
    pub fn new(start_ms: Timestamp) -> Arc<Self> {
        Arc::new(Self {
            epoch_ms: AtomicI64::new(start_ms),
            base_instant: Instant::now(),
        })
    }

    pub fn advance(&self, by: Duration) {
        self.epoch_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, ms: Timestamp) {
        self.epoch_ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_ms(&self) -> Timestamp {
        self.epoch_ms.load(Ordering::SeqCst)
    }

    fn monotonic_now(&self) -> Instant {
        let elapsed_ms = self.epoch_ms.load(Ordering::SeqCst).max(0) as u64;
        self.base_instant + Duration::from_millis(elapsed_ms)
    }
}
