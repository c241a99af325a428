use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::fanout::{BusSink, FanoutRegistry};
use crate::jitter::JitterTracker;
use crate::signer::EventSigner;
use crate::store::KernelStore;
use crate::types::*;

/// Tracks how long the bus side of fan-out has been unavailable. A single
/// `None` means healthy; the first failure after a healthy period stamps the
/// outage's start so `drain_and_fire` can tell a blip from a sustained one.
struct BusOutageTracker {
    first_failure_ms: Mutex<Option<i64>>,
}

impl BusOutageTracker {
    fn new() -> Self {
        Self {
            first_failure_ms: Mutex::new(None),
        }
    }

    fn record_failure(&self, now: i64) {
        let mut guard = self.first_failure_ms.lock().expect("bus outage mutex poisoned");
        if guard.is_none() {
            *guard = Some(now);
        }
    }

    fn clear(&self) {
        *self.first_failure_ms.lock().expect("bus outage mutex poisoned") = None;
    }

    fn duration_ms(&self, now: i64) -> i64 {
        match *self.first_failure_ms.lock().expect("bus outage mutex poisoned") {
            Some(first) => now - first,
            None => 0,
        }
    }

    fn is_beyond(&self, now: i64, max_ms: i64) -> bool {
        self.duration_ms(now) > max_ms
    }
}

/// `HorologyEngine` is the top-level facade wiring together the wheel,
/// store, signer, and fan-out registry; the gRPC layer delegates to this
/// for every mutating or reading operation on the timer state machine.
pub struct HorologyEngine {
    store: Arc<dyn KernelStore>,
    clock: Arc<dyn Clock>,
    wheel: Arc<crate::wheel::TimingWheel>,
    wake_notify: Arc<Notify>,
    signer: EventSigner,
    fanout: Arc<FanoutRegistry>,
    bus: Arc<dyn BusSink>,
    jitter: JitterTracker,
    fire_grace_ms: i64,
    idle_poll_ms: u64,
    settle_timeout_ms: i64,
    /// The leader epoch this node currently holds, shared with
    /// `LeaderCoordinator` so every command-log append carries the real
    /// epoch instead of a value local to the engine.
    epoch: Arc<AtomicU64>,
    bus_outage: BusOutageTracker,
    bus_backlog: Mutex<VecDeque<EventEnvelope>>,
    bus_backlog_bound: usize,
    bus_max_outage_ms: i64,
}

/// Fixed backoff applied to a due timer whose fire is stalled by a sustained
/// bus outage, so it re-enters the wheel instead of being dropped.
const BUS_STALL_RETRY_MS: i64 = 1_000;

impl HorologyEngine {
    pub fn new(
        config: &KernelConfig,
        store: Arc<dyn KernelStore>,
        clock: Arc<dyn Clock>,
        wheel: Arc<crate::wheel::TimingWheel>,
        fanout: Arc<FanoutRegistry>,
        bus: Arc<dyn BusSink>,
        epoch: Arc<AtomicU64>,
    ) -> Self {
        Self {
            store,
            clock,
            wheel,
            wake_notify: Arc::new(Notify::new()),
            signer: EventSigner::new(config.envelope_secret.clone(), config.signature_version.clone()),
            fanout,
            bus,
            jitter: JitterTracker::new(config.max_compensation_ms as i64),
            fire_grace_ms: config.fire_grace_ms as i64,
            idle_poll_ms: 60_000,
            settle_timeout_ms: config.settle_timeout_ms as i64,
            epoch,
            bus_outage: BusOutageTracker::new(),
            bus_backlog: Mutex::new(VecDeque::new()),
            bus_backlog_bound: config.bus_backlog_bound,
            bus_max_outage_ms: config.bus_max_outage_ms as i64,
        }
    }

    pub fn wheel(&self) -> Arc<crate::wheel::TimingWheel> {
        self.wheel.clone()
    }

    pub fn fanout(&self) -> Arc<FanoutRegistry> {
        self.fanout.clone()
    }

    /// Schedules a new timer. Validates `spec`, appends the command before
    /// mutating any derived state, stores the record, arms the wheel, and
    /// emits a `Scheduled` envelope — in that order, per the
    /// append-then-mutate-then-emit write protocol.
    pub async fn schedule(&self, spec: TimerSpec, trace_id: Option<String>) -> KernelResult<Timer> {
        validate_spec(&spec)?;
        let now = self.clock.now_ms();
        let fire_at = spec.fire_at.unwrap_or(now + spec.duration_ms as i64);
        if now - fire_at > self.fire_grace_ms {
            return Err(KernelError::validation(format!(
                "fire_at {fire_at} is more than {} ms in the past",
                self.fire_grace_ms
            )));
        }
        let timer = Timer {
            tenant_id: spec.tenant_id.clone(),
            timer_id: Uuid::now_v7(),
            name: spec.name.clone(),
            requested_by: spec.requested_by.clone(),
            duration_ms: spec.duration_ms,
            fire_at,
            created_at: now,
            status: TimerStatus::Scheduled,
            metadata: spec.metadata.clone(),
            labels: spec.labels.clone(),
            action_bundle: spec.action_bundle.clone(),
            agent_binding: spec.agent_binding.clone(),
            jitter_ms: 0,
            state_version: 1,
            fired_at: None,
            cancelled_at: None,
            cancel_reason: None,
            cancelled_by: None,
            settled_at: None,
            failure_reason: None,
        };

        self.append_command(&timer, CommandKind::Schedule, serde_json::to_value(&spec)?)
            .await?;
        self.store.save_timer(&timer).await?;
        self.wheel.insert(timer.key(), timer.fire_at);
        self.wake_notify.notify_one();

        tracing::info!(
            tenant_id = %timer.tenant_id, timer_id = %timer.timer_id, fire_at = timer.fire_at,
            "timer scheduled"
        );
        self.emit(&timer, EventType::Scheduled, trace_id, None).await;
        Ok(timer)
    }

    pub async fn get(&self, tenant_id: &str, timer_id: Uuid) -> KernelResult<Timer> {
        self.store
            .load_timer(tenant_id, timer_id)
            .await?
            .ok_or(KernelError::NotFound)
    }

    pub async fn list(
        &self,
        tenant_id: &str,
        status_filter: &[TimerStatus],
        label_filter: &[(String, String)],
        page_size: usize,
        page_token: Option<String>,
    ) -> KernelResult<(Vec<Timer>, Option<String>)> {
        Ok(self
            .store
            .list_timers(tenant_id, status_filter, label_filter, page_size, page_token)
            .await?)
    }

    /// Cancels a timer. Cancelling an already-cancelled timer is a no-op
    /// that returns the existing record unchanged — idempotent by design.
    /// Cancelling a timer that has already reached any other terminal
    /// status is a conflict: a fired timer cannot be un-fired.
    pub async fn cancel(
        &self,
        tenant_id: &str,
        timer_id: Uuid,
        reason: Option<String>,
        cancelled_by: &str,
        trace_id: Option<String>,
    ) -> KernelResult<Timer> {
        let mut timer = self.get(tenant_id, timer_id).await?;
        if timer.status == TimerStatus::Cancelled {
            return Ok(timer);
        }
        if timer.status.is_terminal() {
            return Err(KernelError::conflict(format!(
                "timer {timer_id} already reached terminal status {:?}",
                timer.status
            )));
        }

        let now = self.clock.now_ms();
        timer.status = TimerStatus::Cancelled;
        timer.cancelled_at = Some(now);
        timer.cancel_reason = reason.clone();
        timer.cancelled_by = Some(cancelled_by.to_string());
        timer.state_version += 1;

        self.append_command(
            &timer,
            CommandKind::Cancel,
            serde_json::json!({ "reason": reason, "cancelled_by": cancelled_by }),
        )
        .await?;
        self.store.save_timer(&timer).await?;
        self.wheel.remove(&timer.key());

        tracing::info!(tenant_id = %timer.tenant_id, timer_id = %timer.timer_id, "timer cancelled");
        self.emit(&timer, EventType::Cancelled, trace_id, timer.cancel_reason.clone())
            .await;
        Ok(timer)
    }

    /// Records the outcome of executing a fired timer's action. Only a
    /// `Fired` timer may be settled or failed.
    pub async fn report_execution(
        &self,
        tenant_id: &str,
        timer_id: Uuid,
        final_status: TimerStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
        trace_id: Option<String>,
    ) -> KernelResult<Timer> {
        if !matches!(final_status, TimerStatus::Settled | TimerStatus::Failed) {
            return Err(KernelError::validation(
                "final_status must be settled or failed",
            ));
        }
        let mut timer = self.get(tenant_id, timer_id).await?;
        if timer.status == final_status {
            return Ok(timer);
        }
        if timer.status != TimerStatus::Fired {
            return Err(KernelError::conflict(format!(
                "timer {timer_id} is not awaiting an execution report (status {:?})",
                timer.status
            )));
        }

        let now = self.clock.now_ms();
        timer.status = final_status;
        timer.state_version += 1;
        match final_status {
            TimerStatus::Settled => timer.settled_at = Some(now),
            TimerStatus::Failed => timer.failure_reason = error.clone(),
            _ => unreachable!(),
        }

        let command_kind = match final_status {
            TimerStatus::Settled => CommandKind::Settle,
            TimerStatus::Failed => CommandKind::Fail,
            _ => unreachable!(),
        };
        self.append_command(&timer, command_kind, serde_json::json!({ "result": result, "error": error }))
            .await?;
        self.store.save_timer(&timer).await?;

        let event_type = match final_status {
            TimerStatus::Settled => EventType::Settled,
            TimerStatus::Failed => EventType::Failed,
            _ => unreachable!(),
        };
        tracing::info!(tenant_id = %timer.tenant_id, timer_id = %timer.timer_id, status = ?final_status, "timer execution reported");
        self.emit(&timer, event_type, trace_id, timer.failure_reason.clone())
            .await;
        Ok(timer)
    }

    /// Fires one due timer (the wheel hands `key` to the engine once
    /// `fire_at` has passed). Skips silently if the timer is missing or
    /// already terminal — a race between cancel and drain is resolved by
    /// cancel winning, since `wheel.remove` happens under the same mutex the
    /// drain reads.
    pub async fn fire_one(&self, key: &TimerKey, now: Timestamp) -> KernelResult<()> {
        let Some(mut timer) = self.store.load_timer(&key.tenant_id, key.timer_id).await? else {
            return Ok(());
        };
        if timer.status.is_terminal() {
            return Ok(());
        }

        let jitter_ms = now - timer.fire_at;
        self.jitter.observe(jitter_ms);

        timer.status = TimerStatus::Fired;
        timer.fired_at = Some(now);
        timer.jitter_ms = jitter_ms;
        timer.state_version += 1;

        self.append_command(&timer, CommandKind::Fire, serde_json::json!({ "jitter_ms": jitter_ms }))
            .await?;
        self.store.save_timer(&timer).await?;

        tracing::info!(
            tenant_id = %timer.tenant_id, timer_id = %timer.timer_id, jitter_ms,
            "timer fired"
        );
        self.emit(&timer, EventType::Fired, None, None).await;
        Ok(())
    }

    /// Drains everything due at `now` and fires each in order. Exposed
    /// separately from the wake loop so `recovery::restore` can drive the
    /// at-most-once-armed replay of late timers without spawning a task.
    ///
    /// If the bus has been down longer than `bus_max_outage_ms`, due timers
    /// are not fired at all: each is reinserted into the wheel for a short
    /// retry instead, so a sustained outage stalls delivery rather than
    /// silently proceeding with an event stream no one downstream can see.
    pub async fn drain_and_fire(&self, now: Timestamp) -> KernelResult<usize> {
        let due = self.wheel.drain_due(now);
        if due.is_empty() {
            return Ok(0);
        }
        if self.bus_outage.is_beyond(now, self.bus_max_outage_ms) {
            tracing::warn!(
                outage_ms = self.bus_outage.duration_ms(now),
                stalled = due.len(),
                "bus outage exceeds max, stalling fire transitions"
            );
            for key in due {
                self.wheel.insert(key, now + BUS_STALL_RETRY_MS);
            }
            return Ok(0);
        }

        let count = due.len();
        for key in due {
            if let Err(e) = self.fire_one(&key, now).await {
                tracing::warn!(
                    tenant_id = %key.tenant_id, timer_id = %key.timer_id, error = %e,
                    "failed to fire timer"
                );
            }
        }
        Ok(count)
    }

    /// Transitions any `Fired` timer whose settle window has elapsed without
    /// an execution report into `Failed` with reason `executor_timeout`.
    /// Run once per wake-loop tick alongside `drain_and_fire`.
    pub async fn sweep_settle_timeouts(&self, now: Timestamp) -> KernelResult<usize> {
        let active = self.store.load_active_timers().await?;
        let mut failed = 0;
        for timer in active {
            if timer.status != TimerStatus::Fired {
                continue;
            }
            let Some(fired_at) = timer.fired_at else { continue };
            if now - fired_at <= self.settle_timeout_ms {
                continue;
            }
            match self
                .report_execution(
                    &timer.tenant_id,
                    timer.timer_id,
                    TimerStatus::Failed,
                    None,
                    Some("executor_timeout".into()),
                    None,
                )
                .await
            {
                Ok(_) => failed += 1,
                Err(e) => tracing::warn!(
                    tenant_id = %timer.tenant_id, timer_id = %timer.timer_id, error = %e,
                    "failed to apply settle-timeout transition"
                ),
            }
        }
        Ok(failed)
    }

    /// The dedicated wake-loop task: owns the wheel exclusively,
    /// sleeps until the next due timer (minus the jitter tracker's
    /// compensation offset), and wakes early whenever `schedule`/`cancel`
    /// notifies it of a change to the near horizon.
    pub async fn run_wake_loop(self: Arc<Self>) {
        loop {
            let now = self.clock.now_ms();
            if let Err(e) = self.drain_and_fire(now).await {
                tracing::warn!(error = %e, "wake loop tick failed");
            }
            if let Err(e) = self.sweep_settle_timeouts(now).await {
                tracing::warn!(error = %e, "settle-timeout sweep failed");
            }

            let sleep_for = match self.wheel.next_wake() {
                Some(next_wake) => {
                    let offset = self.jitter.wake_offset_ms();
                    let target = (next_wake - offset).max(now);
                    Duration::from_millis((target - now).max(0) as u64)
                }
                None => Duration::from_millis(self.idle_poll_ms),
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.wake_notify.notified() => {}
            }
        }
    }

    async fn emit(
        &self,
        timer: &Timer,
        event_type: EventType,
        trace_id: Option<String>,
        reason: Option<String>,
    ) {
        let envelope = self
            .signer
            .seal(timer, event_type, self.clock.now_ms(), trace_id, reason);
        match self.store.mark_published(&envelope.dedupe_key).await {
            Ok(true) => {
                let local_report = self.fanout.publish_local(&envelope);
                if !local_report.backpressured.is_empty() {
                    tracing::warn!(
                        tenant_id = %envelope.tenant_id, dedupe_key = %envelope.dedupe_key,
                        subscribers = ?local_report.backpressured,
                        "fan-out backpressured, subscriber(s) fell behind"
                    );
                }
                match self.bus.publish(&envelope).await {
                    Ok(()) => {
                        self.bus_outage.clear();
                        self.flush_bus_backlog().await;
                    }
                    Err(e) => {
                        tracing::warn!(tenant_id = %envelope.tenant_id, error = %e, "bus publish failed");
                        self.bus_outage.record_failure(self.clock.now_ms());
                        self.enqueue_bus_backlog(envelope.clone());
                    }
                }
            }
            Ok(false) => {
                tracing::debug!(dedupe_key = %envelope.dedupe_key, "envelope already published, suppressing duplicate");
            }
            Err(e) => tracing::warn!(error = %e, "failed to record published dedupe key"),
        }
    }

    /// Buffers an envelope the bus rejected, dropping the oldest buffered one
    /// if `bus_backlog_bound` is exceeded rather than growing unbounded.
    fn enqueue_bus_backlog(&self, envelope: EventEnvelope) {
        let mut backlog = self.bus_backlog.lock().expect("bus backlog mutex poisoned");
        if backlog.len() >= self.bus_backlog_bound {
            backlog.pop_front();
            tracing::warn!("bus backlog full, dropping oldest buffered envelope");
        }
        backlog.push_back(envelope);
    }

    /// Attempts to redeliver every buffered envelope now that the bus has
    /// accepted a publish. Stops at the first renewed failure instead of
    /// looping, leaving the remainder queued for the next successful emit.
    async fn flush_bus_backlog(&self) {
        loop {
            let next = {
                let mut backlog = self.bus_backlog.lock().expect("bus backlog mutex poisoned");
                backlog.pop_front()
            };
            let Some(envelope) = next else { break };
            if let Err(e) = self.bus.publish(&envelope).await {
                let mut backlog = self.bus_backlog.lock().expect("bus backlog mutex poisoned");
                backlog.push_front(envelope);
                self.bus_outage.record_failure(self.clock.now_ms());
                tracing::warn!(error = %e, "bus backlog flush failed, will retry later");
                break;
            }
        }
    }

    async fn append_command(
        &self,
        timer: &Timer,
        kind: CommandKind,
        payload: serde_json::Value,
    ) -> KernelResult<Seq> {
        let entry = CommandLogEntry {
            seq: 0,
            epoch: self.epoch.load(Ordering::SeqCst),
            command_kind: kind,
            tenant_id: timer.tenant_id.clone(),
            timer_id: timer.timer_id,
            payload,
            appended_at: self.clock.now_ms(),
        };
        Ok(self.store.append_command(&entry).await?)
    }
}

fn validate_spec(spec: &TimerSpec) -> KernelResult<()> {
    if spec.tenant_id.trim().is_empty() {
        return Err(KernelError::validation("tenant_id must not be empty"));
    }
    if spec.name.trim().is_empty() {
        return Err(KernelError::validation("name must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::config::{KernelConfig, StoreKind};
    use crate::fanout::{FanoutRegistry, NullBusSink};
    use crate::store_memory::MemoryStore;
    use crate::wheel::TimingWheel;
    use std::collections::BTreeMap;

    fn test_config() -> KernelConfig {
        KernelConfig {
            rpc_addr: "0.0.0.0:0".into(),
            store_kind: StoreKind::Memory,
            database_url: None,
            persist_path: None,
            node_id: "node-a".into(),
            heartbeat_ms: 50,
            election_timeout_ms: 200,
            envelope_secret: "test-secret".into(),
            signature_version: "hmac-sha256-v1".into(),
            bus_url: None,
            bus_subject: None,
            subscriber_queue_bound: 16,
            fire_grace_ms: 5000,
            max_compensation_ms: 250,
            settle_timeout_ms: 5000,
            compaction_interval_ms: 60_000,
            compaction_min_log_len: 500,
            bus_max_outage_ms: 30_000,
            bus_backlog_bound: 1_000,
        }
    }

    fn build_engine(clock: Arc<TestClock>) -> HorologyEngine {
        let store: Arc<dyn KernelStore> = Arc::new(MemoryStore::new());
        let wheel = Arc::new(TimingWheel::new(clock.now_ms()));
        let fanout = Arc::new(FanoutRegistry::new(16));
        HorologyEngine::new(
            &test_config(),
            store,
            clock,
            wheel,
            fanout,
            Arc::new(NullBusSink),
            Arc::new(AtomicU64::new(1)),
        )
    }

    fn spec(tenant: &str, duration_ms: u64) -> TimerSpec {
        TimerSpec {
            tenant_id: tenant.into(),
            name: "demo".into(),
            requested_by: "svc-a".into(),
            duration_ms,
            fire_at: None,
            metadata: None,
            labels: BTreeMap::new(),
            action_bundle: None,
            agent_binding: None,
        }
    }

    #[tokio::test]
    async fn schedule_then_fire_transitions_to_fired() {
        let clock = TestClock::new(0);
        let engine = build_engine(clock.clone());
        let timer = engine.schedule(spec("tenant-a", 100), None).await.unwrap();
        assert_eq!(timer.status, TimerStatus::Scheduled);

        clock.advance(Duration::from_millis(150));
        let fired = engine.drain_and_fire(clock.now_ms()).await.unwrap();
        assert_eq!(fired, 1);

        let reloaded = engine.get("tenant-a", timer.timer_id).await.unwrap();
        assert_eq!(reloaded.status, TimerStatus::Fired);
        assert!(reloaded.fired_at.is_some());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let clock = TestClock::new(0);
        let engine = build_engine(clock.clone());
        let timer = engine.schedule(spec("tenant-a", 1_000), None).await.unwrap();

        let first = engine
            .cancel("tenant-a", timer.timer_id, Some("no longer needed".into()), "user-1", None)
            .await
            .unwrap();
        let second = engine
            .cancel("tenant-a", timer.timer_id, Some("different reason".into()), "user-2", None)
            .await
            .unwrap();

        assert_eq!(first.state_version, second.state_version);
        assert_eq!(second.status, TimerStatus::Cancelled);
        assert_eq!(second.cancelled_by, first.cancelled_by);
    }

    #[tokio::test]
    async fn cancel_after_fire_is_conflict() {
        let clock = TestClock::new(0);
        let engine = build_engine(clock.clone());
        let timer = engine.schedule(spec("tenant-a", 10), None).await.unwrap();
        clock.advance(Duration::from_millis(20));
        engine.drain_and_fire(clock.now_ms()).await.unwrap();

        let result = engine
            .cancel("tenant-a", timer.timer_id, None, "user-1", None)
            .await;
        assert!(matches!(result, Err(KernelError::Conflict(_))));
    }

    #[tokio::test]
    async fn report_execution_requires_fired_status() {
        let clock = TestClock::new(0);
        let engine = build_engine(clock.clone());
        let timer = engine.schedule(spec("tenant-a", 1_000), None).await.unwrap();

        let result = engine
            .report_execution("tenant-a", timer.timer_id, TimerStatus::Settled, None, None, None)
            .await;
        assert!(matches!(result, Err(KernelError::Conflict(_))));

        clock.advance(Duration::from_millis(1_500));
        engine.drain_and_fire(clock.now_ms()).await.unwrap();
        let settled = engine
            .report_execution("tenant-a", timer.timer_id, TimerStatus::Settled, None, None, None)
            .await
            .unwrap();
        assert_eq!(settled.status, TimerStatus::Settled);
        assert!(settled.settled_at.is_some());
    }

    #[tokio::test]
    async fn report_execution_same_status_repeat_is_idempotent() {
        let clock = TestClock::new(0);
        let engine = build_engine(clock.clone());
        let timer = engine.schedule(spec("tenant-a", 1_000), None).await.unwrap();
        clock.advance(Duration::from_millis(1_500));
        engine.drain_and_fire(clock.now_ms()).await.unwrap();

        let first = engine
            .report_execution("tenant-a", timer.timer_id, TimerStatus::Settled, None, None, None)
            .await
            .unwrap();

        let second = engine
            .report_execution("tenant-a", timer.timer_id, TimerStatus::Settled, None, None, None)
            .await
            .unwrap();

        assert_eq!(first.state_version, second.state_version);
        assert_eq!(second.status, TimerStatus::Settled);

        let conflicting = engine
            .report_execution(
                "tenant-a",
                timer.timer_id,
                TimerStatus::Failed,
                None,
                Some("late executor error".into()),
                None,
            )
            .await;
        assert!(matches!(conflicting, Err(KernelError::Conflict(_))));
    }

    #[tokio::test]
    async fn settle_timeout_sweep_fails_stale_fired_timer() {
        let clock = TestClock::new(0);
        let engine = build_engine(clock.clone());
        let timer = engine.schedule(spec("tenant-a", 100), None).await.unwrap();
        clock.advance(Duration::from_millis(150));
        engine.drain_and_fire(clock.now_ms()).await.unwrap();

        // settle_timeout_ms in test_config is 5000; nothing should trip yet.
        clock.advance(Duration::from_millis(1_000));
        let swept = engine.sweep_settle_timeouts(clock.now_ms()).await.unwrap();
        assert_eq!(swept, 0);

        clock.advance(Duration::from_millis(6_000));
        let swept = engine.sweep_settle_timeouts(clock.now_ms()).await.unwrap();
        assert_eq!(swept, 1);

        let reloaded = engine.get("tenant-a", timer.timer_id).await.unwrap();
        assert_eq!(reloaded.status, TimerStatus::Failed);
        assert_eq!(reloaded.failure_reason.as_deref(), Some("executor_timeout"));
    }

    #[tokio::test]
    async fn fired_envelope_is_signed_and_delivered_to_subscriber() {
        let clock = TestClock::new(0);
        let engine = build_engine(clock.clone());
        let (_id, mut rx) = engine.fanout().subscribe("tenant-a");

        engine.schedule(spec("tenant-a", 50), None).await.unwrap();
        let scheduled_envelope = rx.recv().await.expect("scheduled envelope delivered");
        assert_eq!(scheduled_envelope.event_type, EventType::Scheduled);

        clock.advance(Duration::from_millis(60));
        engine.drain_and_fire(clock.now_ms()).await.unwrap();
        let fired_envelope = rx.recv().await.expect("fired envelope delivered");
        assert_eq!(fired_envelope.event_type, EventType::Fired);
        assert!(!fired_envelope.signature.is_empty());
    }
}
