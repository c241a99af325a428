use std::sync::Arc;

use tonic::{Request, Response, Status};
use uuid::Uuid;

use kernel_core::engine::HorologyEngine;
use kernel_core::error::KernelError;
use kernel_core::leader::LeaderCoordinator;
use kernel_core::types::{Timer, TimerSpec, TimerStatus};

#[allow(clippy::enum_variant_names)]
pub mod proto {
    tonic::include_proto!("kernel.v1");
}

use proto::horology_kernel_server::HorologyKernel;
use proto::*;

pub struct KernelService {
    pub engine: Arc<HorologyEngine>,
    pub coordinator: Arc<LeaderCoordinator>,
}

// --- Proto <-> core conversions ---

fn timer_to_proto(timer: &Timer) -> TimerRecord {
    TimerRecord {
        tenant_id: timer.tenant_id.clone(),
        timer_id: timer.timer_id.to_string(),
        name: timer.name.clone(),
        requested_by: timer.requested_by.clone(),
        duration_ms: timer.duration_ms,
        fire_at_ms: timer.fire_at,
        created_at_ms: timer.created_at,
        status: status_to_proto(timer.status),
        metadata_json: timer
            .metadata
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default(),
        labels: timer.labels.clone().into_iter().collect(),
        action_bundle: timer.action_bundle.clone().unwrap_or_default(),
        agent_binding: timer.agent_binding.clone().unwrap_or_default(),
        jitter_ms: timer.jitter_ms,
        state_version: timer.state_version,
        fired_at_ms: timer.fired_at.unwrap_or(0),
        cancelled_at_ms: timer.cancelled_at.unwrap_or(0),
        cancel_reason: timer.cancel_reason.clone().unwrap_or_default(),
        cancelled_by: timer.cancelled_by.clone().unwrap_or_default(),
        settled_at_ms: timer.settled_at.unwrap_or(0),
        failure_reason: timer.failure_reason.clone().unwrap_or_default(),
    }
}

fn status_to_proto(status: TimerStatus) -> String {
    match status {
        TimerStatus::Scheduled => "scheduled",
        TimerStatus::Armed => "armed",
        TimerStatus::Fired => "fired",
        TimerStatus::Settled => "settled",
        TimerStatus::Failed => "failed",
        TimerStatus::Cancelled => "cancelled",
    }
    .to_string()
}

fn status_from_str(s: &str) -> Result<TimerStatus, Status> {
    match s {
        "scheduled" => Ok(TimerStatus::Scheduled),
        "armed" => Ok(TimerStatus::Armed),
        "fired" => Ok(TimerStatus::Fired),
        "settled" => Ok(TimerStatus::Settled),
        "failed" => Ok(TimerStatus::Failed),
        "cancelled" => Ok(TimerStatus::Cancelled),
        other => Err(Status::invalid_argument(format!("unknown status filter: {other}"))),
    }
}

fn event_type_to_proto(event_type: kernel_core::types::EventType) -> String {
    format!("{event_type:?}").to_lowercase()
}

fn envelope_to_proto(envelope: &kernel_core::types::EventEnvelope) -> TimerEventEnvelope {
    TimerEventEnvelope {
        envelope_id: envelope.envelope_id.to_string(),
        tenant_id: envelope.tenant_id.clone(),
        dedupe_key: envelope.dedupe_key.clone(),
        occurred_at_ms: envelope.occurred_at,
        trace_id: envelope.trace_id.clone().unwrap_or_default(),
        event_type: event_type_to_proto(envelope.event_type),
        timer_snapshot: Some(timer_to_proto(&envelope.timer_snapshot)),
        reason: envelope.reason.clone().unwrap_or_default(),
        signature: envelope.signature.clone(),
        signature_version: envelope.signature_version.clone(),
    }
}

#[allow(clippy::result_large_err)]
fn parse_uuid(s: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(s).map_err(|e| Status::invalid_argument(format!("invalid timer_id: {e}")))
}

/// Maps the internal error taxonomy onto gRPC status codes, one explicit
/// match arm per `KernelError` variant.
fn kernel_error_to_status(err: KernelError) -> Status {
    match err {
        KernelError::Validation(msg) => Status::invalid_argument(msg),
        KernelError::NotLeader { leader_addr, retry_after_ms } => {
            let mut status = Status::failed_precondition("not leader");
            status.metadata_mut().insert(
                "retry-after-ms",
                retry_after_ms.to_string().parse().expect("decimal string is valid metadata value"),
            );
            if let Some(addr) = leader_addr {
                status.metadata_mut().insert(
                    "leader-addr",
                    addr.parse().unwrap_or_else(|_| "unknown".parse().unwrap()),
                );
            }
            status
        }
        KernelError::NotFound => Status::not_found("timer not found"),
        KernelError::Conflict(msg) => Status::failed_precondition(msg),
        KernelError::PersistenceTransient(msg) => Status::unavailable(msg),
        KernelError::Fatal(msg) => Status::internal(msg),
        KernelError::Serialization(e) => Status::invalid_argument(e.to_string()),
    }
}

fn headers_trace_id(headers: &Option<Headers>) -> Option<String> {
    headers.as_ref().and_then(|h| {
        if h.trace_id.is_empty() {
            None
        } else {
            Some(h.trace_id.clone())
        }
    })
}

fn require_tenant(headers: &Option<Headers>) -> Result<String, Status> {
    let tenant_id = headers
        .as_ref()
        .map(|h| h.tenant_id.clone())
        .unwrap_or_default();
    if tenant_id.is_empty() {
        return Err(Status::invalid_argument("headers.tenant_id is required"));
    }
    Ok(tenant_id)
}

#[tonic::async_trait]
impl HorologyKernel for KernelService {
    async fn schedule(
        &self,
        request: Request<ScheduleRequest>,
    ) -> Result<Response<TimerRecord>, Status> {
        let req = request.into_inner();
        self.coordinator
            .require_leader()
            .await
            .map_err(kernel_error_to_status)?;
        let tenant_id = require_tenant(&req.headers)?;
        let trace_id = headers_trace_id(&req.headers);

        let metadata = if req.metadata_json.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str(&req.metadata_json)
                    .map_err(|e| Status::invalid_argument(format!("invalid metadata_json: {e}")))?,
            )
        };

        let spec = TimerSpec {
            tenant_id,
            name: req.name,
            requested_by: req.requested_by,
            duration_ms: req.duration_ms,
            fire_at: if req.fire_at_ms == 0 { None } else { Some(req.fire_at_ms) },
            metadata,
            labels: req.labels.into_iter().collect(),
            action_bundle: if req.action_bundle.is_empty() { None } else { Some(req.action_bundle) },
            agent_binding: if req.agent_binding.is_empty() { None } else { Some(req.agent_binding) },
        };

        let timer = self
            .engine
            .schedule(spec, trace_id)
            .await
            .map_err(kernel_error_to_status)?;
        Ok(Response::new(timer_to_proto(&timer)))
    }

    async fn get_timer(
        &self,
        request: Request<GetTimerRequest>,
    ) -> Result<Response<TimerRecord>, Status> {
        let req = request.into_inner();
        let tenant_id = require_tenant(&req.headers)?;
        let timer_id = parse_uuid(&req.timer_id)?;
        let timer = self
            .engine
            .get(&tenant_id, timer_id)
            .await
            .map_err(kernel_error_to_status)?;
        Ok(Response::new(timer_to_proto(&timer)))
    }

    async fn list_timers(
        &self,
        request: Request<ListTimersRequest>,
    ) -> Result<Response<ListTimersResponse>, Status> {
        let req = request.into_inner();
        let tenant_id = require_tenant(&req.headers)?;
        let status_filter: Vec<TimerStatus> = req
            .status_filter
            .iter()
            .map(|s| status_from_str(s))
            .collect::<Result<_, _>>()?;
        let label_filter: Vec<(String, String)> = req.label_filter.into_iter().collect();
        let page_size = if req.page_size == 0 { 50 } else { req.page_size as usize };
        let page_token = if req.page_token.is_empty() { None } else { Some(req.page_token) };

        let (timers, next_page_token) = self
            .engine
            .list(&tenant_id, &status_filter, &label_filter, page_size, page_token)
            .await
            .map_err(kernel_error_to_status)?;

        Ok(Response::new(ListTimersResponse {
            timers: timers.iter().map(timer_to_proto).collect(),
            next_page_token: next_page_token.unwrap_or_default(),
        }))
    }

    async fn cancel_timer(
        &self,
        request: Request<CancelTimerRequest>,
    ) -> Result<Response<TimerRecord>, Status> {
        let req = request.into_inner();
        self.coordinator
            .require_leader()
            .await
            .map_err(kernel_error_to_status)?;
        let tenant_id = require_tenant(&req.headers)?;
        let trace_id = headers_trace_id(&req.headers);
        let timer_id = parse_uuid(&req.timer_id)?;
        let reason = if req.reason.is_empty() { None } else { Some(req.reason) };

        let timer = self
            .engine
            .cancel(&tenant_id, timer_id, reason, &req.cancelled_by, trace_id)
            .await
            .map_err(kernel_error_to_status)?;
        Ok(Response::new(timer_to_proto(&timer)))
    }

    type StreamTimerEventsStream =
        tokio_stream::wrappers::ReceiverStream<Result<TimerEventEnvelope, Status>>;

    async fn stream_timer_events(
        &self,
        request: Request<StreamTimerEventsRequest>,
    ) -> Result<Response<Self::StreamTimerEventsStream>, Status> {
        let req = request.into_inner();
        let tenant_id = require_tenant(&req.headers)?;
        let topics: std::collections::HashSet<String> =
            req.topics.iter().map(|t| t.to_lowercase()).collect();

        let fanout = self.engine.fanout();
        let (sub_id, mut rx) = fanout.subscribe(&tenant_id);
        let (tx, out_rx) = tokio::sync::mpsc::channel(64);

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if !topics.is_empty() && !topics.contains(&event_type_to_proto(envelope.event_type)) {
                    continue;
                }
                if tx.send(Ok(envelope_to_proto(&envelope))).await.is_err() {
                    break;
                }
            }
            fanout.unsubscribe(&tenant_id, sub_id);
        });

        Ok(Response::new(tokio_stream::wrappers::ReceiverStream::new(out_rx)))
    }

    async fn report_timer_execution(
        &self,
        request: Request<ReportTimerExecutionRequest>,
    ) -> Result<Response<TimerRecord>, Status> {
        let req = request.into_inner();
        self.coordinator
            .require_leader()
            .await
            .map_err(kernel_error_to_status)?;
        let tenant_id = require_tenant(&req.headers)?;
        let trace_id = headers_trace_id(&req.headers);
        let timer_id = parse_uuid(&req.timer_id)?;
        let final_status = status_from_str(&req.final_status.to_lowercase())?;
        let result = if req.result_json.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str(&req.result_json)
                    .map_err(|e| Status::invalid_argument(format!("invalid result_json: {e}")))?,
            )
        };
        let error = if req.error.is_empty() { None } else { Some(req.error) };

        let timer = self
            .engine
            .report_execution(&tenant_id, timer_id, final_status, result, error, trace_id)
            .await
            .map_err(kernel_error_to_status)?;
        Ok(Response::new(timer_to_proto(&timer)))
    }
}

