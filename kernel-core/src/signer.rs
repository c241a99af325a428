use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::types::{EventEnvelope, EventType, Timer};

type HmacSha256 = Hmac<Sha256>;

/// Signs outbound event envelopes with `HMAC-SHA256` over a canonical byte
/// encoding — a keyed MAC rather than a plain digest, so a subscriber can
/// trust an envelope's provenance without also holding write access to the
/// store.
pub struct EventSigner {
    secret: Vec<u8>,
    signature_version: String,
}

impl EventSigner {
    pub fn new(secret: impl Into<Vec<u8>>, signature_version: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            signature_version: signature_version.into(),
        }
    }

    /// Builds and signs an envelope for `event_type` over `timer`'s current
    /// state. `occurred_at` and `trace_id` are supplied by the caller since
    /// they come from the engine's clock/request context.
    pub fn seal(
        &self,
        timer: &Timer,
        event_type: EventType,
        occurred_at: i64,
        trace_id: Option<String>,
        reason: Option<String>,
    ) -> EventEnvelope {
        let dedupe_key = dedupe_key(&timer.tenant_id, timer.timer_id, timer.state_version, event_type);
        let mut envelope = EventEnvelope {
            envelope_id: Uuid::new_v4(),
            tenant_id: timer.tenant_id.clone(),
            dedupe_key,
            occurred_at,
            trace_id,
            event_type,
            timer_snapshot: timer.clone(),
            reason,
            signature: Vec::new(),
            signature_version: self.signature_version.clone(),
        };
        envelope.signature = self.sign(&envelope);
        envelope
    }

    /// Recomputes the signature over `envelope`'s current fields and checks
    /// it against `envelope.signature`. Used by tests and by subscribers
    /// that want to verify provenance before acting on an envelope.
    pub fn verify(&self, envelope: &EventEnvelope) -> bool {
        self.sign(envelope) == envelope.signature
    }

    fn sign(&self, envelope: &EventEnvelope) -> Vec<u8> {
        let canonical = canonical_bytes(envelope);
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(&canonical);
        mac.finalize().into_bytes().to_vec()
    }
}

/// `SHA-256` hex digest of `(tenant_id, timer_id, state_version, event_type)`,
/// used as the envelope's dedupe identity.
pub fn dedupe_key(tenant_id: &str, timer_id: Uuid, state_version: u64, event_type: EventType) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update(b"|");
    hasher.update(timer_id.as_bytes());
    hasher.update(b"|");
    hasher.update(state_version.to_be_bytes());
    hasher.update(b"|");
    hasher.update(format!("{event_type:?}").as_bytes());
    hex::encode(hasher.finalize())
}

/// Stable field-order byte encoding used for both hashing and signing, so
/// the signature is reproducible regardless of `serde_json` map ordering.
/// Excludes `envelope_id`, `signature`, and `signature_version` themselves —
/// the signature covers content, not its own metadata.
fn canonical_bytes(envelope: &EventEnvelope) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(envelope.tenant_id.as_bytes());
    buf.push(0);
    buf.extend_from_slice(envelope.dedupe_key.as_bytes());
    buf.push(0);
    buf.extend_from_slice(&envelope.occurred_at.to_be_bytes());
    buf.push(0);
    if let Some(trace_id) = &envelope.trace_id {
        buf.extend_from_slice(trace_id.as_bytes());
    }
    buf.push(0);
    buf.extend_from_slice(format!("{:?}", envelope.event_type).as_bytes());
    buf.push(0);
    buf.extend_from_slice(envelope.timer_snapshot.timer_id.as_bytes());
    buf.extend_from_slice(&envelope.timer_snapshot.state_version.to_be_bytes());
    buf.push(0);
    if let Some(reason) = &envelope.reason {
        buf.extend_from_slice(reason.as_bytes());
    }
    buf
}
