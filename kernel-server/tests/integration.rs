//! Integration tests for the distributed horology kernel.
//!
//! The gRPC handlers in `kernel_server::grpc` are thin wrappers that parse
//! proto requests and delegate to `HorologyEngine`, so exercising the engine
//! directly validates the full stack without standing up a transport.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use kernel_core::clock::{Clock, TestClock};
use kernel_core::config::{KernelConfig, StoreKind};
use kernel_core::engine::HorologyEngine;
use kernel_core::error::KernelError;
use kernel_core::fanout::{FanoutRegistry, NullBusSink};
use kernel_core::leader::LeaderCoordinator;
use kernel_core::recovery;
use kernel_core::signer::EventSigner;
use kernel_core::store::KernelStore;
use kernel_core::store_memory::MemoryStore;
use kernel_core::types::{EventType, TimerSpec, TimerStatus};
use kernel_core::wheel::TimingWheel;

fn config() -> KernelConfig {
    KernelConfig {
        rpc_addr: "0.0.0.0:0".into(),
        store_kind: StoreKind::Memory,
        database_url: None,
        persist_path: None,
        node_id: "node-a".into(),
        heartbeat_ms: 100,
        election_timeout_ms: 500,
        envelope_secret: "integration-test-secret".into(),
        signature_version: "hmac-sha256-v1".into(),
        bus_url: None,
        bus_subject: None,
        subscriber_queue_bound: 32,
        fire_grace_ms: 5_000,
        max_compensation_ms: 250,
        settle_timeout_ms: 30_000,
        compaction_interval_ms: 60_000,
        compaction_min_log_len: 500,
        bus_max_outage_ms: 30_000,
        bus_backlog_bound: 1_000,
    }
}

fn spec(tenant: &str, name: &str, duration_ms: u64) -> TimerSpec {
    TimerSpec {
        tenant_id: tenant.into(),
        name: name.into(),
        requested_by: "svc-a".into(),
        duration_ms,
        fire_at: None,
        metadata: None,
        labels: BTreeMap::new(),
        action_bundle: None,
        agent_binding: None,
    }
}

fn build_engine(store: Arc<dyn KernelStore>, clock: Arc<TestClock>) -> Arc<HorologyEngine> {
    let wheel = Arc::new(TimingWheel::new(clock.now_ms()));
    let fanout = Arc::new(FanoutRegistry::new(config().subscriber_queue_bound));
    Arc::new(HorologyEngine::new(
        &config(),
        store,
        clock,
        wheel,
        fanout,
        Arc::new(NullBusSink),
        Arc::new(AtomicU64::new(1)),
    ))
}

/// S1: basic fire — schedule a 200ms timer, expect a `scheduled` event
/// immediately and a `fired` event once the clock advances past `fire_at`.
#[tokio::test]
async fn s1_basic_fire() {
    let store: Arc<dyn KernelStore> = Arc::new(MemoryStore::new());
    let clock = TestClock::new(1_000_000);
    let engine = build_engine(store, clock.clone());
    let (_id, mut rx) = engine.fanout().subscribe("t1");

    let timer = engine.schedule(spec("t1", "a", 200), None).await.unwrap();
    let scheduled = rx.recv().await.unwrap();
    assert_eq!(scheduled.event_type, EventType::Scheduled);

    clock.advance(Duration::from_millis(200));
    engine.drain_and_fire(clock.now_ms()).await.unwrap();

    let fired = rx.recv().await.unwrap();
    assert_eq!(fired.event_type, EventType::Fired);

    let reloaded = engine.get("t1", timer.timer_id).await.unwrap();
    assert_eq!(reloaded.status, TimerStatus::Fired);
    assert!(reloaded.jitter_ms.abs() <= 50);
}

/// S2: idempotent cancel — two identical cancel calls return the same
/// terminal record and only one `cancelled` event is emitted.
#[tokio::test]
async fn s2_idempotent_cancel() {
    let store: Arc<dyn KernelStore> = Arc::new(MemoryStore::new());
    let clock = TestClock::new(0);
    let engine = build_engine(store, clock.clone());
    let (_id, mut rx) = engine.fanout().subscribe("t1");

    let timer = engine.schedule(spec("t1", "a", 10_000), None).await.unwrap();
    let _ = rx.recv().await.unwrap(); // scheduled

    clock.advance(Duration::from_millis(100));
    let first = engine
        .cancel("t1", timer.timer_id, Some("user".into()), "user-1", None)
        .await
        .unwrap();
    let cancelled = rx.recv().await.unwrap();
    assert_eq!(cancelled.event_type, EventType::Cancelled);

    clock.advance(Duration::from_millis(50));
    let second = engine
        .cancel("t1", timer.timer_id, Some("user".into()), "user-1", None)
        .await
        .unwrap();

    assert_eq!(first.state_version, second.state_version);
    assert_eq!(second.status, TimerStatus::Cancelled);

    // No second cancelled envelope — the channel should have nothing queued.
    assert!(rx.try_recv().is_err());
}

/// S3: crash recovery — schedule three timers, simulate a restart by
/// building a fresh engine/wheel over the same store, and confirm all three
/// reload as `Scheduled` and fire at their original `fire_at`.
#[tokio::test]
async fn s3_crash_recovery() {
    let store: Arc<dyn KernelStore> = Arc::new(MemoryStore::new());
    let clock = TestClock::new(0);
    let durations = [60_000u64, 120_000, 180_000];
    let timer_ids: Vec<uuid::Uuid> = {
        let engine = build_engine(store.clone(), clock.clone());
        let mut ids = Vec::new();
        for d in durations {
            ids.push(engine.schedule(spec("t1", "a", d), None).await.unwrap().timer_id);
        }
        ids
    };

    // "Restart": fresh engine, fresh wheel, same store — recovery must
    // reinsert every non-terminal timer.
    clock.advance(Duration::from_millis(10_000));
    let engine = build_engine(store.clone(), clock.clone());
    let report = recovery::restore(store.clone(), &engine, clock.clone() as Arc<dyn Clock>)
        .await
        .unwrap();
    assert_eq!(report.active_timers_reinserted, 3);

    for (id, d) in timer_ids.iter().zip(durations) {
        let timer = engine.get("t1", *id).await.unwrap();
        assert_eq!(timer.status, TimerStatus::Scheduled);
        assert_eq!(timer.fire_at, d as i64);
    }

    // Advance to the first timer's fire_at and confirm it fires.
    clock.set(durations[0]);
    let fired = engine.drain_and_fire(clock.now_ms()).await.unwrap();
    assert_eq!(fired, 1);
    let first = engine.get("t1", timer_ids[0]).await.unwrap();
    assert_eq!(first.status, TimerStatus::Fired);
}

/// S4: leader failover — two coordinators share one store; killing the
/// leader (letting its lease expire) allows the other to claim it with an
/// advanced epoch.
#[tokio::test]
async fn s4_leader_failover() {
    let store: Arc<dyn KernelStore> = Arc::new(MemoryStore::new());
    let clock = TestClock::new(0);

    let mut node_a_config = config();
    node_a_config.node_id = "node-a".into();
    let coordinator_a = LeaderCoordinator::new(&node_a_config, store.clone(), clock.clone());
    coordinator_a.tick().await.unwrap();
    assert!(coordinator_a.is_leader().await);
    let epoch_before = coordinator_a.epoch();

    // node-a is killed: its lease is never renewed again. Advance time past
    // the lease's expiry (4 heartbeats) and have node-b claim it.
    clock.advance(Duration::from_millis(node_a_config.heartbeat_ms * 5));
    let mut node_b_config = config();
    node_b_config.node_id = "node-b".into();
    let coordinator_b = LeaderCoordinator::new(&node_b_config, store, clock.clone());
    coordinator_b.tick().await.unwrap();

    assert!(coordinator_b.is_leader().await);
    assert!(!coordinator_a.is_leader().await);
    assert!(coordinator_b.epoch() > epoch_before);
}

/// S5: execution report — a fired timer can be settled once; a second
/// report (even with a different outcome) is a conflict and the original
/// settled status is preserved.
#[tokio::test]
async fn s5_execution_report() {
    let store: Arc<dyn KernelStore> = Arc::new(MemoryStore::new());
    let clock = TestClock::new(0);
    let engine = build_engine(store, clock.clone());

    let timer = engine.schedule(spec("t1", "a", 1_000), None).await.unwrap();
    clock.advance(Duration::from_millis(1_050));
    engine.drain_and_fire(clock.now_ms()).await.unwrap();

    let settled = engine
        .report_execution("t1", timer.timer_id, TimerStatus::Settled, None, None, None)
        .await
        .unwrap();
    assert_eq!(settled.status, TimerStatus::Settled);
    assert!(settled.settled_at.is_some());

    // Repeating the same final status is idempotent, not a conflict.
    let repeat = engine
        .report_execution("t1", timer.timer_id, TimerStatus::Settled, None, None, None)
        .await
        .unwrap();
    assert_eq!(repeat.state_version, settled.state_version);

    let conflict = engine
        .report_execution(
            "t1",
            timer.timer_id,
            TimerStatus::Failed,
            None,
            Some("executor crashed".into()),
            None,
        )
        .await;
    assert!(matches!(conflict, Err(KernelError::Conflict(_))));

    let reloaded = engine.get("t1", timer.timer_id).await.unwrap();
    assert_eq!(reloaded.status, TimerStatus::Settled);
}

/// S6: signature tampering — flipping a byte of the signed envelope's
/// `timer_id` must invalidate the HMAC and therefore the dedupe identity.
#[tokio::test]
async fn s6_signature_tampering() {
    let store: Arc<dyn KernelStore> = Arc::new(MemoryStore::new());
    let clock = TestClock::new(0);
    let engine = build_engine(store, clock.clone());
    let (_id, mut rx) = engine.fanout().subscribe("t1");

    engine.schedule(spec("t1", "a", 50), None).await.unwrap();
    let _ = rx.recv().await.unwrap(); // scheduled
    clock.advance(Duration::from_millis(60));
    engine.drain_and_fire(clock.now_ms()).await.unwrap();
    let mut fired = rx.recv().await.unwrap();
    assert_eq!(fired.event_type, EventType::Fired);

    let signer = EventSigner::new(b"integration-test-secret".to_vec(), "hmac-sha256-v1");
    assert!(signer.verify(&fired));

    let mut bytes = fired.timer_snapshot.timer_id.into_bytes();
    bytes[0] ^= 0xFF;
    fired.timer_snapshot.timer_id = uuid::Uuid::from_bytes(bytes);

    assert!(!signer.verify(&fired));

    let recomputed_dedupe = kernel_core::signer::dedupe_key(
        &fired.tenant_id,
        fired.timer_snapshot.timer_id,
        fired.timer_snapshot.state_version,
        fired.event_type,
    );
    assert_ne!(
        fired.dedupe_key, recomputed_dedupe,
        "dedupe identity recomputed over the tampered timer_id must diverge from the original"
    );
}
