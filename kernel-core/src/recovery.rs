use std::sync::Arc;

use anyhow::{Context, Result};

use crate::clock::Clock;
use crate::engine::HorologyEngine;
use crate::store::KernelStore;
use crate::types::Seq;

/// Outcome of a startup recovery pass, logged by `kernel-server::main`.
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub restored_from_snapshot: bool,
    pub replayed_commands: u64,
    pub active_timers_reinserted: usize,
    pub late_timers_fired: usize,
    /// Entries whose `epoch` regressed against the highest epoch already
    /// seen earlier in the (seq-ordered) log — evidence of a stale writer
    /// that kept appending after losing the lease. Never applied.
    pub stale_epoch_entries_skipped: usize,
}

/// Runs once at startup before the gRPC server begins serving: loads the
/// latest snapshot, replays any command-log entries appended after it,
/// reinserts every non-terminal timer into the wheel, then immediately
/// fires (exactly once each) any timer whose `fire_at` has already passed —
/// in ascending `fire_at` order, so a crash during a burst of due timers
/// cannot reorder their delivery. `Armed` is never persisted, so every
/// reloaded non-terminal timer starts this pass as plain `Scheduled` and may
/// re-arm; the store's per-timer idempotent state machine plus the
/// dedupe-keyed publish cache make firing it again here safe even if it had
/// already fired once before the crash but never got recorded as such.
pub async fn restore(
    store: Arc<dyn KernelStore>,
    engine: &HorologyEngine,
    clock: Arc<dyn Clock>,
) -> Result<RestoreReport> {
    let mut report = RestoreReport::default();

    let snapshot = store.load_latest_snapshot().await.context("loading snapshot")?;
    let last_seq: Seq = match &snapshot {
        Some(s) => {
            report.restored_from_snapshot = true;
            s.last_seq
        }
        None => 0,
    };

    let commands = store
        .read_commands_since(last_seq)
        .await
        .context("reading command log since snapshot")?;
    report.replayed_commands = commands.len() as u64;
    // Command log entries are already applied to `timer_records` by the
    // engine before being appended (append-then-mutate-then-emit), so replay
    // here is informational: the store's own timer rows are already
    // authoritative. What remains is rebuilding the in-memory wheel, which
    // holds no durable state of its own.
    //
    // Still enforce the epoch-monotonicity safety invariant over the
    // seq-ordered log: an entry whose epoch is lower than the highest one
    // already observed was written by a node that had already lost the
    // lease, and must never be treated as authoritative.
    let mut max_epoch_seen = 0u64;
    for entry in &commands {
        if entry.epoch < max_epoch_seen {
            report.stale_epoch_entries_skipped += 1;
            tracing::warn!(
                seq = entry.seq, epoch = entry.epoch, max_epoch_seen,
                "skipping command log entry with epoch below the highest seen so far"
            );
            continue;
        }
        max_epoch_seen = entry.epoch;
    }

    let active = store
        .load_active_timers()
        .await
        .context("loading active timers")?;
    let wheel = engine.wheel();
    for timer in &active {
        wheel.insert(timer.key(), timer.fire_at);
    }
    report.active_timers_reinserted = active.len();

    let now = clock.now_ms();
    report.late_timers_fired = engine.drain_and_fire(now).await?;

    tracing::info!(
        restored_from_snapshot = report.restored_from_snapshot,
        replayed_commands = report.replayed_commands,
        active_timers_reinserted = report.active_timers_reinserted,
        late_timers_fired = report.late_timers_fired,
        stale_epoch_entries_skipped = report.stale_epoch_entries_skipped,
        "recovery complete"
    );
    Ok(report)
}
