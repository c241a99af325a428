use crate::store::KernelStore;
use crate::types::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

struct Inner {
    timers: HashMap<(String, Uuid), Timer>,
    command_log: Vec<CommandLogEntry>,
    next_seq: Seq,
    snapshot: Option<Snapshot>,
    lease: Option<LeaderLease>,
    published: std::collections::HashSet<String>,
}

/// In-memory implementation of `KernelStore`, used by tests and as the
/// default runtime backend (`KERNEL_STORE=memory` or unset). Holds every
/// timer, the command log, the latest snapshot, and the lease row behind a
/// single `RwLock<Inner>`.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                timers: HashMap::new(),
                command_log: Vec::new(),
                next_seq: 1,
                snapshot: None,
                lease: None,
                published: std::collections::HashSet::new(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KernelStore for MemoryStore {
    async fn save_timer(&self, timer: &Timer) -> Result<()> {
        let mut w = self.inner.write().await;
        w.timers.insert((timer.tenant_id.clone(), timer.timer_id), timer.clone());
        Ok(())
    }

    async fn load_timer(&self, tenant_id: &str, timer_id: Uuid) -> Result<Option<Timer>> {
        let r = self.inner.read().await;
        Ok(r.timers.get(&(tenant_id.to_string(), timer_id)).cloned())
    }

    async fn load_active_timers(&self) -> Result<Vec<Timer>> {
        let r = self.inner.read().await;
        Ok(r.timers
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn list_timers(
        &self,
        tenant_id: &str,
        status_filter: &[TimerStatus],
        label_filter: &[(String, String)],
        page_size: usize,
        page_token: Option<String>,
    ) -> Result<(Vec<Timer>, Option<String>)> {
        let r = self.inner.read().await;
        let mut matching: Vec<&Timer> = r
            .timers
            .values()
            .filter(|t| t.tenant_id == tenant_id)
            .filter(|t| status_filter.is_empty() || status_filter.contains(&t.status))
            .filter(|t| {
                label_filter
                    .iter()
                    .all(|(k, v)| t.labels.get(k).map(|tv| tv == v).unwrap_or(false))
            })
            .collect();
        matching.sort_by(|a, b| a.timer_id.cmp(&b.timer_id));

        let start = match &page_token {
            Some(token) => {
                let token_id: Uuid = token
                    .parse()
                    .map_err(|_| anyhow!("invalid page token: {token}"))?;
                matching
                    .iter()
                    .position(|t| t.timer_id == token_id)
                    .map(|i| i + 1)
                    .unwrap_or(matching.len())
            }
            None => 0,
        };

        let page_size = page_size.max(1);
        let end = (start + page_size).min(matching.len());
        let page: Vec<Timer> = matching[start..end].iter().map(|t| (**t).clone()).collect();
        let next_page_token = if end < matching.len() {
            page.last().map(|t| t.timer_id.to_string())
        } else {
            None
        };
        Ok((page, next_page_token))
    }

    async fn append_command(&self, entry: &CommandLogEntry) -> Result<Seq> {
        let mut w = self.inner.write().await;
        let seq = w.next_seq;
        w.next_seq += 1;
        let mut entry = entry.clone();
        entry.seq = seq;
        w.command_log.push(entry);
        Ok(seq)
    }

    async fn read_commands_since(&self, seq: Seq) -> Result<Vec<CommandLogEntry>> {
        let r = self.inner.read().await;
        Ok(r.command_log
            .iter()
            .filter(|e| e.seq > seq)
            .cloned()
            .collect())
    }

    async fn last_command_seq(&self) -> Result<Seq> {
        let r = self.inner.read().await;
        Ok(r.command_log.last().map(|e| e.seq).unwrap_or(0))
    }

    async fn write_snapshot_and_truncate(&self, snapshot: &Snapshot) -> Result<()> {
        let mut w = self.inner.write().await;
        w.command_log.retain(|e| e.seq > snapshot.last_seq);
        w.snapshot = Some(snapshot.clone());
        Ok(())
    }

    async fn load_latest_snapshot(&self) -> Result<Option<Snapshot>> {
        let r = self.inner.read().await;
        Ok(r.snapshot.clone())
    }

    async fn claim_lease(&self, node_id: &str, now_ms: i64, lease_ms: u64) -> Result<LeaderLease> {
        let mut w = self.inner.write().await;
        let should_claim = match &w.lease {
            None => true,
            Some(existing) => existing.node_id == node_id || existing.expires_at <= now_ms,
        };
        if should_claim {
            let epoch = w.lease.as_ref().map(|l| l.epoch + 1).unwrap_or(1);
            let lease = LeaderLease {
                node_id: node_id.to_string(),
                epoch,
                acquired_at: now_ms,
                expires_at: now_ms + lease_ms as i64,
            };
            w.lease = Some(lease.clone());
            Ok(lease)
        } else {
            Ok(w.lease.clone().expect("should_claim false implies a lease exists"))
        }
    }

    async fn load_lease(&self) -> Result<Option<LeaderLease>> {
        let r = self.inner.read().await;
        Ok(r.lease.clone())
    }

    async fn mark_published(&self, dedupe_key: &str) -> Result<bool> {
        let mut w = self.inner.write().await;
        Ok(w.published.insert(dedupe_key.to_string()))
    }
}
