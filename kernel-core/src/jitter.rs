use std::sync::Mutex;

/// EWMA-based jitter tracker. Each `armed -> fired` transition
/// reports how late (or early) the wake loop actually fired relative to
/// `fire_at`; the tracker folds that into a smoothed estimate used to
/// compute a bounded wake-offset compensation for future timers. The
/// compensation only nudges when the wheel wakes the loop early — it never
/// changes a timer's `fire_at` itself.
pub struct JitterTracker {
    alpha: f64,
    max_compensation_ms: i64,
    state: Mutex<f64>,
}

impl JitterTracker {
    pub fn new(max_compensation_ms: i64) -> Self {
        Self {
            alpha: 0.2,
            max_compensation_ms,
            state: Mutex::new(0.0),
        }
    }

    /// Folds an observed `jitter_ms` (actual fire time minus `fire_at`) into
    /// the running estimate.
    pub fn observe(&self, jitter_ms: i64) {
        let mut ewma = self.state.lock().expect("jitter mutex poisoned");
        *ewma = self.alpha * jitter_ms as f64 + (1.0 - self.alpha) * *ewma;
    }

    /// Current smoothed jitter estimate, in milliseconds.
    pub fn estimate_ms(&self) -> i64 {
        *self.state.lock().expect("jitter mutex poisoned") as i64
    }

    /// How far ahead of `fire_at` the wake loop should aim to wake, capped
    /// by `max_compensation_ms`. Only
    /// positive estimates (the loop has tended to fire late) produce a
    /// nonzero compensation.
    pub fn wake_offset_ms(&self) -> i64 {
        self.estimate_ms().max(0).min(self.max_compensation_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_consistent_lateness() {
        let tracker = JitterTracker::new(250);
        for _ in 0..20 {
            tracker.observe(50);
        }
        assert!(tracker.estimate_ms() > 40);
        assert_eq!(tracker.wake_offset_ms(), 49);
    }

    #[test]
    fn compensation_is_capped() {
        let tracker = JitterTracker::new(10);
        for _ in 0..20 {
            tracker.observe(500);
        }
        assert_eq!(tracker.wake_offset_ms(), 10);
    }

    #[test]
    fn negative_jitter_never_produces_negative_offset() {
        let tracker = JitterTracker::new(250);
        tracker.observe(-30);
        assert_eq!(tracker.wake_offset_ms(), 0);
    }
}
