use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;

use uuid::Uuid;

use crate::types::{TimerKey, Timestamp};

/// Slots per wheel level, and the span in milliseconds a single slot at each
/// level covers. Four levels gives horizons of ~1ms, ~256ms, ~65.5s, ~4.66h
/// before a timer overflows into the heap.
const SLOTS_PER_LEVEL: usize = 256;
const LEVEL_SPAN_MS: [u64; 4] = [1, 256, 65_536, 16_777_216];

/// A near-horizon entry sits in exactly one `(level, slot)` bucket.
#[derive(Clone)]
struct Entry {
    key: TimerKey,
    fire_at: Timestamp,
}

/// An overflow entry waiting to be pulled down into the wheel once it comes
/// within the top level's horizon.
#[derive(Clone, Eq, PartialEq)]
struct OverflowEntry {
    fire_at: Timestamp,
    key: TimerKey,
}

impl Ord for OverflowEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then_with(|| self.key.timer_id.cmp(&other.key.timer_id))
    }
}

impl PartialOrd for OverflowEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    levels: [Vec<Vec<Entry>>; 4],
    /// Timers whose `fire_at` is beyond the top level's horizon from `base_ms`.
    overflow: BinaryHeap<Reverse<OverflowEntry>>,
    /// Index for O(1) removal by key: tracks which level/slot (or overflow)
    /// a key currently lives in.
    index: HashMap<TimerKey, Location>,
    base_ms: Timestamp,
}

#[derive(Clone, Copy)]
enum Location {
    Wheel { level: usize, slot: usize },
    Overflow,
}

/// Hierarchical timing wheel with a min-heap overflow for far-horizon timers,
/// generalized from a flat "drain past-due, keep the rest" min-heap tick loop
/// into explicit levels instead of one flat heap.
///
/// Exclusively owned by the wake loop task — `insert`/`remove` take `&self`
/// behind an internal `Mutex` so RPC handlers (running on other tasks) can
/// mutate it directly without round-tripping through a channel, while still
/// allowing direct calls from `HorologyEngine::schedule`/`cancel`.
pub struct TimingWheel {
    inner: Mutex<Inner>,
}

impl TimingWheel {
    pub fn new(base_ms: Timestamp) -> Self {
        Self {
            inner: Mutex::new(Inner {
                levels: [
                    vec![Vec::new(); SLOTS_PER_LEVEL],
                    vec![Vec::new(); SLOTS_PER_LEVEL],
                    vec![Vec::new(); SLOTS_PER_LEVEL],
                    vec![Vec::new(); SLOTS_PER_LEVEL],
                ],
                overflow: BinaryHeap::new(),
                index: HashMap::new(),
                base_ms,
            }),
        }
    }

    /// Insert or re-insert a timer at `fire_at`. Idempotent: re-inserting an
    /// already-present key first removes its old placement.
    pub fn insert(&self, key: TimerKey, fire_at: Timestamp) {
        let mut inner = self.inner.lock().expect("wheel mutex poisoned");
        inner.remove_indexed(&key);
        let base = inner.base_ms;
        let delta = fire_at.saturating_sub(base).max(0) as u64;
        match level_for_delta(delta) {
            Some((level, slot)) => {
                inner.levels[level][slot].push(Entry {
                    key: key.clone(),
                    fire_at,
                });
                inner.index.insert(key, Location::Wheel { level, slot });
            }
            None => {
                inner.overflow.push(Reverse(OverflowEntry { fire_at, key: key.clone() }));
                inner.index.insert(key, Location::Overflow);
            }
        }
    }

    pub fn remove(&self, key: &TimerKey) -> bool {
        let mut inner = self.inner.lock().expect("wheel mutex poisoned");
        inner.remove_indexed(key)
    }

    pub fn contains(&self, key: &TimerKey) -> bool {
        let inner = self.inner.lock().expect("wheel mutex poisoned");
        inner.index.contains_key(key)
    }

    /// The earliest `fire_at` across every bucket and the overflow heap, or
    /// `None` if the wheel is empty. Used by the wake loop to compute how
    /// long it may sleep before the next due timer.
    pub fn next_wake(&self) -> Option<Timestamp> {
        let inner = self.inner.lock().expect("wheel mutex poisoned");
        let wheel_min = inner
            .levels
            .iter()
            .flat_map(|level| level.iter())
            .flat_map(|slot| slot.iter())
            .map(|e| e.fire_at)
            .min();
        let overflow_min = inner.overflow.peek().map(|Reverse(e)| e.fire_at);
        match (wheel_min, overflow_min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Drain every entry due at or before `now_ms`, advancing the wheel's
    /// base clock and pulling any now-in-range overflow entries down into
    /// the wheel's top level as a side effect. Returns keys in `fire_at`
    /// order (ties broken by timer id for determinism).
    pub fn drain_due(&self, now_ms: Timestamp) -> Vec<TimerKey> {
        let mut inner = self.inner.lock().expect("wheel mutex poisoned");
        inner.base_ms = now_ms;

        // Pull overflow entries that now fit within the top level's horizon.
        let top_horizon = now_ms + LEVEL_SPAN_MS[3] as Timestamp * SLOTS_PER_LEVEL as Timestamp;
        let mut pulled = Vec::new();
        while let Some(Reverse(entry)) = inner.overflow.peek() {
            if entry.fire_at < top_horizon {
                let Reverse(entry) = inner.overflow.pop().unwrap();
                pulled.push(entry);
            } else {
                break;
            }
        }
        for entry in pulled {
            let delta = entry.fire_at.saturating_sub(now_ms).max(0) as u64;
            if let Some((level, slot)) = level_for_delta(delta) {
                inner.index.insert(
                    entry.key.clone(),
                    Location::Wheel { level, slot },
                );
                inner.levels[level][slot].push(Entry {
                    key: entry.key,
                    fire_at: entry.fire_at,
                });
            } else {
                inner.overflow.push(Reverse(entry.clone()));
                inner.index.insert(entry.key, Location::Overflow);
            }
        }

        let mut due = Vec::new();
        for level in inner.levels.iter_mut() {
            for slot in level.iter_mut() {
                slot.retain(|e| {
                    if e.fire_at <= now_ms {
                        due.push(e.clone());
                        false
                    } else {
                        true
                    }
                });
            }
        }
        due.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then(a.key.timer_id.cmp(&b.key.timer_id)));
        for e in &due {
            inner.index.remove(&e.key);
        }
        due.into_iter().map(|e| e.key).collect()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("wheel mutex poisoned");
        inner.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn remove_indexed(&mut self, key: &TimerKey) -> bool {
        match self.index.remove(key) {
            Some(Location::Wheel { level, slot }) => {
                let before = self.levels[level][slot].len();
                self.levels[level][slot].retain(|e| &e.key != key);
                before != self.levels[level][slot].len()
            }
            Some(Location::Overflow) => {
                let before = self.overflow.len();
                self.overflow.retain(|Reverse(e)| &e.key != key);
                before != self.overflow.len()
            }
            None => false,
        }
    }
}

/// Which `(level, slot)` a delta-from-base (in ms) falls into, or `None` if
/// it exceeds the top level's horizon and belongs in the overflow heap.
fn level_for_delta(delta_ms: u64) -> Option<(usize, usize)> {
    let mut remaining = delta_ms;
    for (level, &span) in LEVEL_SPAN_MS.iter().enumerate() {
        let horizon = span * SLOTS_PER_LEVEL as u64;
        if remaining < horizon {
            let slot = (remaining / span) as usize % SLOTS_PER_LEVEL;
            return Some((level, slot));
        }
        remaining -= horizon;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: u128) -> TimerKey {
        TimerKey::new("tenant-a", Uuid::from_u128(id))
    }

    #[test]
    fn insert_and_drain_due_in_order() {
        let wheel = TimingWheel::new(0);
        wheel.insert(key(1), 100);
        wheel.insert(key(2), 50);
        wheel.insert(key(3), 500_000);

        let due = wheel.drain_due(200);
        assert_eq!(due, vec![key(2), key(1)]);
        assert!(wheel.contains(&key(3)));
    }

    #[test]
    fn remove_before_due_drops_entry() {
        let wheel = TimingWheel::new(0);
        wheel.insert(key(1), 100);
        assert!(wheel.remove(&key(1)));
        assert!(wheel.drain_due(1000).is_empty());
    }

    #[test]
    fn reinsert_overwrites_previous_placement() {
        let wheel = TimingWheel::new(0);
        wheel.insert(key(1), 100);
        wheel.insert(key(1), 200_000_000);
        assert!(wheel.drain_due(1000).is_empty());
        assert_eq!(wheel.next_wake(), Some(200_000_000));
    }

    #[test]
    fn overflow_entries_pull_down_as_base_advances() {
        let wheel = TimingWheel::new(0);
        let far = LEVEL_SPAN_MS[3] as Timestamp * SLOTS_PER_LEVEL as Timestamp + 10;
        wheel.insert(key(1), far);
        assert!(wheel.drain_due(0).is_empty());
        let due = wheel.drain_due(far);
        assert_eq!(due, vec![key(1)]);
    }

    #[test]
    fn next_wake_reports_overall_minimum() {
        let wheel = TimingWheel::new(0);
        wheel.insert(key(1), 900);
        wheel.insert(key(2), 10_000_000_000);
        assert_eq!(wheel.next_wake(), Some(900));
    }
}
