use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Leader epoch — strictly increasing, bumped on every election.
pub type Epoch = u64;

/// Command log sequence number — globally monotonic within an epoch.
pub type Seq = u64;

// ─── Timer identity & status ───────────────────────────────────

/// Identity is the pair `(tenant_id, timer_id)`; `timer_id` is assigned at
/// schedule time and stable for the timer's lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerKey {
    pub tenant_id: String,
    pub timer_id: Uuid,
}

impl TimerKey {
    pub fn new(tenant_id: impl Into<String>, timer_id: Uuid) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            timer_id,
        }
    }
}

/// The timer lifecycle status domain.
///
/// `Armed` is derived-only: it signals "present in the near-horizon wheel"
/// and is never written to the store as a distinct status — on restart any
/// non-terminal timer reloads as `Scheduled` and may re-arm.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerStatus {
    Scheduled,
    Armed,
    Fired,
    Settled,
    Failed,
    Cancelled,
}

impl TimerStatus {
    /// No transition may leave a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TimerStatus::Settled | TimerStatus::Failed | TimerStatus::Cancelled
        )
    }
}

// ─── Timer record ───────────────────────────────────────────────

/// A single-shot scheduled timer. Opaque blobs (`metadata`, `action_bundle`,
/// `agent_binding`) are never interpreted by the kernel — only validated for
/// size and UTF-8 where applicable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Timer {
    pub tenant_id: String,
    pub timer_id: Uuid,
    pub name: String,
    pub requested_by: String,
    pub duration_ms: u64,
    pub fire_at: Timestamp,
    pub created_at: Timestamp,
    pub status: TimerStatus,
    pub metadata: Option<serde_json::Value>,
    pub labels: BTreeMap<String, String>,
    /// Opaque — kernel does not interpret.
    pub action_bundle: Option<Vec<u8>>,
    /// Opaque — kernel does not interpret.
    pub agent_binding: Option<Vec<u8>>,
    /// Signed: negative means the wake loop fired early (within slack).
    pub jitter_ms: i64,
    /// Monotonically increasing per mutation.
    pub state_version: u64,
    pub fired_at: Option<Timestamp>,
    pub cancelled_at: Option<Timestamp>,
    pub cancel_reason: Option<String>,
    pub cancelled_by: Option<String>,
    pub settled_at: Option<Timestamp>,
    pub failure_reason: Option<String>,
}

impl Timer {
    pub fn key(&self) -> TimerKey {
        TimerKey::new(self.tenant_id.clone(), self.timer_id)
    }
}

// ─── Timer spec (inbound, from Schedule) ───────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimerSpec {
    pub tenant_id: String,
    pub name: String,
    pub requested_by: String,
    pub duration_ms: u64,
    /// If set, takes precedence over `duration_ms` for computing `fire_at`.
    pub fire_at: Option<Timestamp>,
    pub metadata: Option<serde_json::Value>,
    pub labels: BTreeMap<String, String>,
    pub action_bundle: Option<Vec<u8>>,
    pub agent_binding: Option<Vec<u8>>,
}

// ─── Command log ────────────────────────────────────────────────

/// The kind of a durable command — matches each timer state transition plus
/// the housekeeping `SnapshotMarker`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Schedule,
    Cancel,
    Fire,
    Settle,
    Fail,
    SnapshotMarker,
}

/// Append-only command log entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandLogEntry {
    pub seq: Seq,
    pub epoch: Epoch,
    pub command_kind: CommandKind,
    pub tenant_id: String,
    pub timer_id: Uuid,
    /// JSON-encoded command payload (schedule spec, cancel reason, report, ...).
    pub payload: serde_json::Value,
    pub appended_at: Timestamp,
}

/// A durable serialization of all non-terminal timers plus the last applied
/// `seq`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_seq: Seq,
    pub created_at: Timestamp,
    pub timers: Vec<Timer>,
}

// ─── Leader lease ────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderLease {
    pub node_id: String,
    pub epoch: Epoch,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
}

// ─── Event envelope ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Scheduled,
    Armed,
    Fired,
    Cancelled,
    Settled,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub envelope_id: Uuid,
    pub tenant_id: String,
    pub dedupe_key: String,
    pub occurred_at: Timestamp,
    pub trace_id: Option<String>,
    pub event_type: EventType,
    pub timer_snapshot: Timer,
    pub reason: Option<String>,
    pub signature: Vec<u8>,
    pub signature_version: String,
}

/// Returns the current wall clock as epoch milliseconds.
///
/// Prefer `Clock::now_ms` inside engine logic (it is what makes scenario
/// tests deterministic); this free function exists only for call sites that
/// cannot thread a `Clock` through (serde defaults, debug formatting).
pub fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}
