use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::store::KernelStore;
use crate::types::LeaderLease;

/// Single-writer coordination over one relational lease row. No consensus
/// protocol is implemented — this reduces leader election to a
/// compare-and-swap the store performs atomically via a conditional
/// `ON CONFLICT ... WHERE` upsert: only the expired or self-held lease may
/// be overwritten.
pub struct LeaderCoordinator {
    node_id: String,
    store: Arc<dyn KernelStore>,
    clock: Arc<dyn Clock>,
    lease_ms: u64,
    current: RwLock<Option<LeaderLease>>,
    /// Mirrors `current.epoch` for lock-free reads from hot RPC paths.
    /// Shared with `HorologyEngine` so every command-log append is stamped
    /// with the epoch this node most recently held, not a stale copy.
    epoch: Arc<AtomicU64>,
}

impl LeaderCoordinator {
    pub fn new(config: &KernelConfig, store: Arc<dyn KernelStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_epoch_handle(config, store, clock, Arc::new(AtomicU64::new(0)))
    }

    /// Builds the coordinator over a caller-supplied epoch cell instead of a
    /// private one, so `kernel-server::main` can hand the same `Arc` to
    /// `HorologyEngine` and keep both sides reading the same value.
    pub fn with_epoch_handle(
        config: &KernelConfig,
        store: Arc<dyn KernelStore>,
        clock: Arc<dyn Clock>,
        epoch: Arc<AtomicU64>,
    ) -> Self {
        Self {
            node_id: config.node_id.clone(),
            store,
            clock,
            lease_ms: config.heartbeat_ms * 4,
            current: RwLock::new(None),
            epoch,
        }
    }

    /// Returns the shared epoch cell so other components (the engine) can
    /// read the same value this coordinator writes, without polling through
    /// the coordinator itself.
    pub fn epoch_handle(&self) -> Arc<AtomicU64> {
        self.epoch.clone()
    }

    /// Attempts to claim or renew the lease. Called on a `heartbeat_ms`
    /// interval by the owning task in `kernel-server::main`.
    pub async fn tick(&self) -> KernelResult<()> {
        let now = self.clock.now_ms();
        let lease = self
            .store
            .claim_lease(&self.node_id, now, self.lease_ms)
            .await?;
        self.epoch.store(lease.epoch, Ordering::SeqCst);
        *self.current.write().await = Some(lease);
        Ok(())
    }

    pub async fn is_leader(&self) -> bool {
        match self.current.read().await.as_ref() {
            Some(lease) => lease.node_id == self.node_id && lease.expires_at > self.clock.now_ms(),
            None => false,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub async fn leader_addr(&self) -> Option<String> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|lease| lease.node_id.clone())
    }

    /// Gate for every mutating RPC: returns `KernelError::NotLeader` with
    /// the current leader and a retry hint if this node does not presently
    /// hold the lease.
    pub async fn require_leader(&self) -> KernelResult<()> {
        if self.is_leader().await {
            return Ok(());
        }
        Err(KernelError::NotLeader {
            leader_addr: self.leader_addr().await,
            retry_after_ms: self.lease_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::store_memory::MemoryStore;

    fn config() -> KernelConfig {
        KernelConfig {
            rpc_addr: "0.0.0.0:0".into(),
            store_kind: crate::config::StoreKind::Memory,
            database_url: None,
            persist_path: None,
            node_id: "node-a".into(),
            heartbeat_ms: 100,
            election_timeout_ms: 500,
            envelope_secret: "secret".into(),
            signature_version: "hmac-sha256-v1".into(),
            bus_url: None,
            bus_subject: None,
            subscriber_queue_bound: 16,
            fire_grace_ms: 1000,
            max_compensation_ms: 250,
            settle_timeout_ms: 5000,
            compaction_interval_ms: 60_000,
            compaction_min_log_len: 500,
            bus_max_outage_ms: 30_000,
            bus_backlog_bound: 1_000,
        }
    }

    #[tokio::test]
    async fn claims_lease_and_reports_leader() {
        let store: Arc<dyn KernelStore> = Arc::new(MemoryStore::new());
        let clock = TestClock::new(0);
        let coordinator = LeaderCoordinator::new(&config(), store, clock.clone());
        coordinator.tick().await.unwrap();
        assert!(coordinator.is_leader().await);
        assert_eq!(coordinator.epoch(), 1);
    }

    #[tokio::test]
    async fn require_leader_fails_for_non_leader() {
        let store: Arc<dyn KernelStore> = Arc::new(MemoryStore::new());
        let clock = TestClock::new(0);
        store.claim_lease("node-b", 0, 10_000).await.unwrap();
        let coordinator = LeaderCoordinator::new(&config(), store, clock.clone());
        coordinator.tick().await.unwrap();
        assert!(!coordinator.is_leader().await);
        assert!(matches!(
            coordinator.require_leader().await,
            Err(KernelError::NotLeader { .. })
        ));
    }
}
