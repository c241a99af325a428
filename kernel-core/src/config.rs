use std::time::Duration;

/// Kernel configuration, read from the environment at process start, for
/// every `KERNEL_*`/`EVENT_*`/`BUS_*` option.
#[derive(Clone, Debug)]
pub struct KernelConfig {
    pub rpc_addr: String,
    pub store_kind: StoreKind,
    pub database_url: Option<String>,
    pub persist_path: Option<String>,
    pub node_id: String,
    pub heartbeat_ms: u64,
    pub election_timeout_ms: u64,
    pub envelope_secret: String,
    pub signature_version: String,
    pub bus_url: Option<String>,
    pub bus_subject: Option<String>,
    pub subscriber_queue_bound: usize,
    pub fire_grace_ms: u64,
    pub max_compensation_ms: u64,
    pub settle_timeout_ms: u64,
    pub compaction_interval_ms: u64,
    pub compaction_min_log_len: usize,
    pub bus_max_outage_ms: u64,
    pub bus_backlog_bound: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Sql,
}

impl KernelConfig {
    /// Populate from environment variables, falling back to the documented
    /// defaults for everything but the HMAC secret, which has no safe
    /// default and must be set explicitly.
    pub fn from_env() -> Self {
        Self {
            rpc_addr: env_or("KERNEL_RPC_ADDR", "0.0.0.0:7331"),
            store_kind: match std::env::var("KERNEL_STORE").as_deref() {
                Ok("sql") => StoreKind::Sql,
                _ => StoreKind::Memory,
            },
            database_url: std::env::var("KERNEL_DATABASE_URL").ok(),
            persist_path: std::env::var("KERNEL_PERSIST_PATH").ok(),
            node_id: env_or("KERNEL_NODE_ID", &default_node_id()),
            heartbeat_ms: env_or_u64("KERNEL_HEARTBEAT_MS", 250),
            election_timeout_ms: env_or_u64("KERNEL_ELECTION_TIMEOUT_MS", 1500),
            envelope_secret: std::env::var("EVENT_ENVELOPE_SECRET")
                .unwrap_or_else(|_| "dev-only-insecure-secret".to_string()),
            signature_version: env_or("EVENT_SIGNATURE_VERSION", "hmac-sha256-v1"),
            bus_url: std::env::var("BUS_URL").ok(),
            bus_subject: std::env::var("BUS_SUBJECT").ok(),
            subscriber_queue_bound: env_or_u64("KERNEL_SUBSCRIBER_QUEUE_BOUND", 256) as usize,
            fire_grace_ms: env_or_u64("KERNEL_FIRE_GRACE_MS", 5_000),
            max_compensation_ms: env_or_u64("KERNEL_MAX_COMPENSATION_MS", 250),
            settle_timeout_ms: env_or_u64("KERNEL_SETTLE_TIMEOUT_MS", 30_000),
            compaction_interval_ms: env_or_u64("KERNEL_COMPACTION_INTERVAL_MS", 60_000),
            compaction_min_log_len: env_or_u64("KERNEL_COMPACTION_MIN_LOG_LEN", 500) as usize,
            bus_max_outage_ms: env_or_u64("KERNEL_BUS_MAX_OUTAGE_MS", 30_000),
            bus_backlog_bound: env_or_u64("KERNEL_BUS_BACKLOG_BOUND", 1_000) as usize,
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    /// Heartbeat grace before a follower attempts promotion.
    pub fn lease_grace(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms * 2)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn default_node_id() -> String {
    format!("node-{}", uuid::Uuid::new_v4())
}
