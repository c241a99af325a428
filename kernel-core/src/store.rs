use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::types::{CommandLogEntry, LeaderLease, Seq, Snapshot, Timer, TimerStatus};

/// Persistence trait for all horology-kernel state. The engine and leader
/// coordinator operate exclusively through this trait, which is implemented
/// by both an in-memory adapter and a Postgres adapter for the kernel's
/// timer/command-log/snapshot/lease concerns.
#[async_trait]
pub trait KernelStore: Send + Sync {
    // ── Timers ──

    async fn save_timer(&self, timer: &Timer) -> Result<()>;
    async fn load_timer(&self, tenant_id: &str, timer_id: Uuid) -> Result<Option<Timer>>;

    /// All non-terminal timers, used to rebuild the wheel at startup once
    /// the snapshot+replay in `recovery::restore` has produced the
    /// authoritative in-memory set — stores themselves do not need to
    /// filter beyond status.
    async fn load_active_timers(&self) -> Result<Vec<Timer>>;

    async fn list_timers(
        &self,
        tenant_id: &str,
        status_filter: &[TimerStatus],
        label_filter: &[(String, String)],
        page_size: usize,
        page_token: Option<String>,
    ) -> Result<(Vec<Timer>, Option<String>)>;

    // ── Command log (append-only) ──

    async fn append_command(&self, entry: &CommandLogEntry) -> Result<Seq>;
    async fn read_commands_since(&self, seq: Seq) -> Result<Vec<CommandLogEntry>>;
    async fn last_command_seq(&self) -> Result<Seq>;

    /// Atomically writes `snapshot` and discards log entries with
    /// `seq <= snapshot.last_seq` in the same transaction.
    async fn write_snapshot_and_truncate(&self, snapshot: &Snapshot) -> Result<()>;
    async fn load_latest_snapshot(&self) -> Result<Option<Snapshot>>;

    // ── Leader lease ──

    /// Attempts to claim or renew the single lease row via
    /// compare-and-swap: succeeds if no lease is held, the caller already
    /// holds it, or the existing lease has expired. Returns the lease as it
    /// stands after the attempt (which may belong to a different node if
    /// the CAS lost a race).
    async fn claim_lease(
        &self,
        node_id: &str,
        now_ms: i64,
        lease_ms: u64,
    ) -> Result<LeaderLease>;

    async fn load_lease(&self) -> Result<Option<LeaderLease>>;

    // ── Dedupe cache for publish ──

    /// Records that `dedupe_key` has been published; returns `false` if it
    /// was already present (caller should suppress re-publish).
    async fn mark_published(&self, dedupe_key: &str) -> Result<bool>;
}
