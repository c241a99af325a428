use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use kernel_core::clock::{Clock, SystemClock};
use kernel_core::config::{KernelConfig, StoreKind};
use kernel_core::engine::HorologyEngine;
use kernel_core::fanout::{FanoutRegistry, LoggingBusSink};
use kernel_core::leader::LeaderCoordinator;
use kernel_core::recovery;
use kernel_core::store::KernelStore;
use kernel_core::store_memory::MemoryStore;
use kernel_core::wheel::TimingWheel;
use kernel_server::grpc::proto::horology_kernel_server::HorologyKernelServer;
use kernel_server::grpc::KernelService;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = KernelConfig::from_env();
    let addr = config.rpc_addr.parse()?;

    let store: Arc<dyn KernelStore> = match config.store_kind {
        #[cfg(feature = "postgres")]
        StoreKind::Sql => {
            let url = config
                .database_url
                .clone()
                .ok_or("KERNEL_STORE=sql requires KERNEL_DATABASE_URL")?;
            tracing::info!("connecting to PostgreSQL");
            let pool = sqlx::PgPool::connect(&url).await?;
            let pg = kernel_core::store_postgres::PostgresStore::new(pool);
            pg.migrate().await?;
            tracing::info!("using PostgresStore (migrations applied)");
            Arc::new(pg)
        }
        #[cfg(not(feature = "postgres"))]
        StoreKind::Sql => {
            tracing::warn!("KERNEL_STORE=sql but the postgres feature is not enabled, using MemoryStore");
            Arc::new(MemoryStore::new())
        }
        StoreKind::Memory => {
            tracing::info!("using MemoryStore");
            Arc::new(MemoryStore::new())
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let wheel = Arc::new(TimingWheel::new(clock.now_ms()));
    let fanout = Arc::new(FanoutRegistry::new(config.subscriber_queue_bound));
    let bus = Arc::new(LoggingBusSink);

    // Shared with `LeaderCoordinator` below so every command-log append is
    // stamped with the epoch this node currently holds.
    let epoch = Arc::new(AtomicU64::new(0));

    let engine = Arc::new(HorologyEngine::new(
        &config,
        store.clone(),
        clock.clone(),
        wheel,
        fanout,
        bus,
        epoch.clone(),
    ));

    let report = recovery::restore(store.clone(), &engine, clock.clone()).await?;
    tracing::info!(?report, "startup recovery finished");

    let coordinator = Arc::new(LeaderCoordinator::with_epoch_handle(
        &config,
        store.clone(),
        clock.clone(),
        epoch,
    ));
    let heartbeat = config.heartbeat();
    let coordinator_loop = coordinator.clone();
    tokio::spawn(async move {
        loop {
            if let Err(e) = coordinator_loop.tick().await {
                tracing::warn!(error = %e, "leader lease renewal failed");
            }
            tokio::time::sleep(heartbeat).await;
        }
    });

    tokio::spawn(engine.clone().run_wake_loop());
    tokio::spawn(kernel_core::compaction::run_loop(
        store,
        clock,
        config.compaction_interval_ms,
        config.compaction_min_log_len,
    ));

    tracing::info!(addr = %config.rpc_addr, node_id = %config.node_id, "horology kernel listening");

    let service = KernelService {
        engine: engine.clone(),
        coordinator,
    };

    Server::builder()
        .add_service(HorologyKernelServer::new(service))
        .serve(addr)
        .await?;

    Ok(())
}
