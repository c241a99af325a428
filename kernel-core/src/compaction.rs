use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::clock::Clock;
use crate::store::KernelStore;
use crate::types::Snapshot;

/// Writes a fresh snapshot of every active timer and truncates the command
/// log up to the new last-applied `seq`, if the log has grown past
/// `min_log_len` entries since the previous snapshot. Returns whether a
/// snapshot was actually written.
pub async fn compact_once(
    store: &Arc<dyn KernelStore>,
    clock: &dyn Clock,
    min_log_len: usize,
) -> Result<bool> {
    let last_seq = store
        .load_latest_snapshot()
        .await
        .context("loading latest snapshot")?
        .map(|s| s.last_seq)
        .unwrap_or(0);
    let pending = store
        .read_commands_since(last_seq)
        .await
        .context("reading command log since last snapshot")?;
    if pending.len() < min_log_len {
        return Ok(false);
    }

    let new_last_seq = store.last_command_seq().await.context("reading last command seq")?;
    let active = store.load_active_timers().await.context("loading active timers")?;
    let snapshot = Snapshot {
        last_seq: new_last_seq,
        created_at: clock.now_ms(),
        timers: active,
    };
    store
        .write_snapshot_and_truncate(&snapshot)
        .await
        .context("writing snapshot and truncating log")?;

    tracing::info!(
        last_seq = new_last_seq,
        timers = snapshot.timers.len(),
        truncated_entries = pending.len(),
        "compacted command log"
    );
    Ok(true)
}

/// Background task spawned once at startup: wakes every `interval_ms` and
/// attempts a compaction pass, logging (not panicking) on failure so a
/// transient store error never takes down the rest of the process.
pub async fn run_loop(store: Arc<dyn KernelStore>, clock: Arc<dyn Clock>, interval_ms: u64, min_log_len: usize) {
    loop {
        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        match compact_once(&store, clock.as_ref(), min_log_len).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!("compaction skipped, log below min_log_len"),
            Err(e) => tracing::warn!(error = %e, "compaction pass failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::store_memory::MemoryStore;
    use crate::types::{CommandKind, CommandLogEntry};
    use uuid::Uuid;

    fn entry(kind: CommandKind) -> CommandLogEntry {
        CommandLogEntry {
            seq: 0,
            epoch: 1,
            command_kind: kind,
            tenant_id: "tenant-a".into(),
            timer_id: Uuid::new_v4(),
            payload: serde_json::json!({}),
            appended_at: 0,
        }
    }

    #[tokio::test]
    async fn below_threshold_does_not_compact() {
        let store: Arc<dyn KernelStore> = Arc::new(MemoryStore::new());
        store.append_command(&entry(CommandKind::Schedule)).await.unwrap();
        let clock = TestClock::new(0);
        let compacted = compact_once(&store, clock.as_ref(), 10).await.unwrap();
        assert!(!compacted);
        assert!(store.load_latest_snapshot().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn above_threshold_writes_snapshot_and_truncates() {
        let store: Arc<dyn KernelStore> = Arc::new(MemoryStore::new());
        for _ in 0..5 {
            store.append_command(&entry(CommandKind::Schedule)).await.unwrap();
        }
        let clock = TestClock::new(0);
        let compacted = compact_once(&store, clock.as_ref(), 5).await.unwrap();
        assert!(compacted);
        let snapshot = store.load_latest_snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.last_seq, 5);
        assert!(store.read_commands_since(0).await.unwrap().is_empty());
    }
}
