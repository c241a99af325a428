use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::types::EventEnvelope;

/// External message-bus side of fan-out — an out-of-scope collaborator
/// reached only through its contract. No concrete client is wired up;
/// deployments provide their own `BusSink`.
#[async_trait]
pub trait BusSink: Send + Sync {
    async fn publish(&self, envelope: &EventEnvelope) -> anyhow::Result<()>;
}

/// Discards nothing, logs nothing — used where a bus is entirely absent
/// (unit tests exercising only the RPC stream side of fan-out).
pub struct NullBusSink;

#[async_trait]
impl BusSink for NullBusSink {
    async fn publish(&self, _envelope: &EventEnvelope) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Logs every envelope at `debug` instead of actually publishing — useful
/// for local runs and integration tests that want to see fan-out traffic
/// without standing up a bus.
pub struct LoggingBusSink;

#[async_trait]
impl BusSink for LoggingBusSink {
    async fn publish(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        tracing::debug!(
            tenant_id = %envelope.tenant_id,
            dedupe_key = %envelope.dedupe_key,
            event_type = ?envelope.event_type,
            "bus publish (logging sink)"
        );
        Ok(())
    }
}

/// Outcome of a single `FanoutRegistry::publish` call, reported back to the
/// engine so a saturated subscriber can be surfaced rather than silently
/// dropped.
#[derive(Debug, Default)]
pub struct FanoutReport {
    pub delivered: usize,
    pub backpressured: Vec<Uuid>,
    pub bus_error: Option<String>,
}

struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<EventEnvelope>,
}

/// Sole owner of the tenant-to-subscriber mapping, resolving the cyclic
/// timer/subscriber/bus reference by making this registry the single
/// authority. Built on bounded `mpsc` channels plus `ReceiverStream` for the
/// RPC-facing side, push-based: the engine calls `publish` once per envelope
/// instead of subscribers polling a log.
pub struct FanoutRegistry {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    queue_bound: usize,
}

impl FanoutRegistry {
    pub fn new(queue_bound: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            queue_bound,
        }
    }

    /// Registers a new subscriber for `tenant_id` and returns the receiving
    /// half of its bounded channel plus a handle used to unregister it when
    /// the RPC stream ends.
    pub fn subscribe(&self, tenant_id: &str) -> (Uuid, mpsc::Receiver<EventEnvelope>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue_bound);
        let mut subs = self.subscribers.lock().expect("fanout mutex poisoned");
        subs.entry(tenant_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, tenant_id: &str, id: Uuid) {
        let mut subs = self.subscribers.lock().expect("fanout mutex poisoned");
        if let Some(list) = subs.get_mut(tenant_id) {
            list.retain(|s| s.id != id);
            if list.is_empty() {
                subs.remove(tenant_id);
            }
        }
    }

    /// Best-effort `try_send` to every subscriber of `envelope.tenant_id`: a
    /// full channel is reported in `backpressured` instead of blocking the
    /// caller or silently dropping the event.
    pub fn publish_local(&self, envelope: &EventEnvelope) -> FanoutReport {
        let subs = self.subscribers.lock().expect("fanout mutex poisoned");
        let mut report = FanoutReport::default();
        if let Some(list) = subs.get(&envelope.tenant_id) {
            for sub in list {
                match sub.tx.try_send(envelope.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => report.backpressured.push(sub.id),
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }
        report
    }

    pub async fn publish(
        &self,
        envelope: &EventEnvelope,
        bus: &dyn BusSink,
    ) -> FanoutReport {
        let mut report = self.publish_local(envelope);
        if let Err(e) = bus.publish(envelope).await {
            report.bus_error = Some(e.to_string());
        }
        report
    }
}
