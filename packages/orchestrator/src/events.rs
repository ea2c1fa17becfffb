//! Append-only audit event log.
//!
//! `event_type` plus `payload_json` is effectively a tagged union. The
//! known variants are enumerated here; anything else round-trips as
//! [`EventType::Other`] so newer writers never break older readers.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Known audit event kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    Added,
    Picked,
    LeaseAcquired,
    LeaseRenewed,
    LeaseReleased,
    Retried,
    Done,
    Failed,
    Blocked,
    IdempotencySkipped,
    Guardrail,
    ReviewGate,
    Replan,
    /// Forward-compatible pass-through for unknown kinds.
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Added => "added",
            EventType::Picked => "picked",
            EventType::LeaseAcquired => "lease_acquired",
            EventType::LeaseRenewed => "lease_renewed",
            EventType::LeaseReleased => "lease_released",
            EventType::Retried => "retried",
            EventType::Done => "done",
            EventType::Failed => "failed",
            EventType::Blocked => "blocked",
            EventType::IdempotencySkipped => "idempotency_skipped",
            EventType::Guardrail => "guardrail",
            EventType::ReviewGate => "review_gate",
            EventType::Replan => "replan",
            EventType::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "added" => EventType::Added,
            "picked" => EventType::Picked,
            "lease_acquired" => EventType::LeaseAcquired,
            "lease_renewed" => EventType::LeaseRenewed,
            "lease_released" => EventType::LeaseReleased,
            "retried" => EventType::Retried,
            "done" => EventType::Done,
            "failed" => EventType::Failed,
            "blocked" => EventType::Blocked,
            "idempotency_skipped" => EventType::IdempotencySkipped,
            "guardrail" => EventType::Guardrail,
            "review_gate" => EventType::ReviewGate,
            "replan" => EventType::Replan,
            other => EventType::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One committed row of the `queue_events` log.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: i64,
    pub item_id: String,
    pub event_type: String,
    pub payload_json: String,
    pub created_at: String,
}

impl EventRecord {
    pub fn event_type(&self) -> EventType {
        EventType::parse(&self.event_type)
    }

    pub fn payload(&self) -> serde_json::Value {
        serde_json::from_str(&self.payload_json).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_types_roundtrip() {
        let all = [
            "added",
            "picked",
            "lease_acquired",
            "lease_renewed",
            "lease_released",
            "retried",
            "done",
            "failed",
            "blocked",
            "idempotency_skipped",
            "guardrail",
            "review_gate",
            "replan",
        ];
        for name in all {
            let parsed = EventType::parse(name);
            assert!(!matches!(parsed, EventType::Other(_)), "{name} parsed as Other");
            assert_eq!(parsed.as_str(), name);
        }
    }

    #[test]
    fn unknown_type_passes_through() {
        let parsed = EventType::parse("quota_probe");
        assert_eq!(parsed, EventType::Other("quota_probe".to_string()));
        assert_eq!(parsed.as_str(), "quota_probe");
    }

    #[test]
    fn record_payload_tolerates_garbage() {
        let rec = EventRecord {
            event_id: 1,
            item_id: "ORCH-001".to_string(),
            event_type: "added".to_string(),
            payload_json: "{not json".to_string(),
            created_at: "2026-01-01 09:00".to_string(),
        };
        assert_eq!(rec.payload(), serde_json::Value::Null);
        assert_eq!(rec.event_type(), EventType::Added);
    }
}
