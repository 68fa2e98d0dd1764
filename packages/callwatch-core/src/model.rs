//! Core data model for the realtime plane.
//!
//! Calls, events, and alerts are the three persisted row types; the ingest
//! payload and call mutation types sit at the API boundary. Timestamps are
//! Unix milliseconds internally and RFC 3339 on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle status of a realtime call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Active,
    Ended,
    #[default]
    Unknown,
}

impl CallStatus {
    /// Parses a provider status string, tolerating unknown values.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "active" | "connected" | "alerting" => Self::Active,
            "ended" | "disconnected" | "terminated" => Self::Ended,
            _ => Self::Unknown,
        }
    }
}

/// Which side of the call produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Agent,
    Customer,
    System,
}

/// Category of a realtime event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Transcript,
    Sentiment,
    Status,
    Metric,
    AlertTrigger,
    AudioChunk,
    End,
    Custom,
}

/// Severity of a supervisor alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// One realtime call, keyed by the upstream-assigned `call_id`.
///
/// Created on first ingest and never destroyed; `ended` is terminal for
/// status but events may still attach (late transcripts, batch backfill).
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeCall {
    pub call_id: String,
    pub provider: String,
    pub status: CallStatus,
    pub risk_score: f64,
    pub sentiment_score: f64,
    /// Unix milliseconds of the last mutation.
    pub updated_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    pub metadata: Map<String, Value>,
}

impl RealtimeCall {
    /// Creates a fresh call row with zeroed scores.
    #[must_use]
    pub fn new(call_id: &str, now_ms: u64) -> Self {
        Self {
            call_id: call_id.to_string(),
            provider: "unknown".to_string(),
            status: CallStatus::Unknown,
            risk_score: 0.0,
            sentiment_score: 0.0,
            updated_at: now_ms,
            agent_id: None,
            customer_id: None,
            metadata: Map::new(),
        }
    }
}

/// Partial mutation merged into a call row by `upsert_call`.
///
/// `None` fields leave the stored value untouched; `updated_at` is always
/// refreshed by the repository.
#[derive(Debug, Clone, Default)]
pub struct CallMutation {
    pub provider: Option<String>,
    pub status: Option<CallStatus>,
    pub risk_score: Option<f64>,
    pub sentiment_score: Option<f64>,
    pub agent_id: Option<String>,
    pub customer_id: Option<String>,
    /// Keys merged into the call's metadata map (shallow).
    pub metadata: Option<Map<String, Value>>,
}

/// One append-only realtime event row.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeEvent {
    /// Globally monotonic id; per-call ordering follows from it.
    pub id: i64,
    pub call_id: String,
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<Speaker>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Unix milliseconds the event occurred (upstream clock when provided).
    pub occurred_at: u64,
    pub metadata: Map<String, Value>,
}

/// One persisted supervisor alert row.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorAlert {
    pub id: i64,
    pub call_id: String,
    /// Rule tag, e.g. `negative_sentiment` or `escalation_keyword`.
    pub alert_type: String,
    pub severity: Severity,
    pub message: String,
    pub acknowledged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<u64>,
    pub created_at: u64,
    pub metadata: Map<String, Value>,
}

/// Ingest payload accepted by `POST /api/realtime/events`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestEventPayload {
    #[serde(default)]
    pub provider: Option<String>,
    pub call_id: String,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub speaker: Option<Speaker>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub sentiment: Option<f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
    /// RFC 3339; server clock used when absent or unparseable.
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl IngestEventPayload {
    /// Resolves the declared event type, defaulting to `custom`.
    #[must_use]
    pub fn resolved_event_type(&self) -> EventType {
        match self
            .event_type
            .as_deref()
            .unwrap_or("custom")
            .to_ascii_lowercase()
            .as_str()
        {
            "transcript" => EventType::Transcript,
            "sentiment" => EventType::Sentiment,
            "status" => EventType::Status,
            "metric" => EventType::Metric,
            "alert_trigger" => EventType::AlertTrigger,
            "audio_chunk" => EventType::AudioChunk,
            "end" => EventType::End,
            _ => EventType::Custom,
        }
    }
}

/// Reads `metadata.metrics.<key>` as an f64, accepting integers.
#[must_use]
pub fn metric_f64(metadata: &Map<String, Value>, key: &str) -> Option<f64> {
    metadata
        .get("metrics")
        .and_then(Value::as_object)
        .and_then(|metrics| metrics.get(key))
        .and_then(Value::as_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_status_parse_tolerates_unknown() {
        assert_eq!(CallStatus::parse("active"), CallStatus::Active);
        assert_eq!(CallStatus::parse("Disconnected"), CallStatus::Ended);
        assert_eq!(CallStatus::parse("weird"), CallStatus::Unknown);
    }

    #[test]
    fn event_type_resolution_defaults_to_custom() {
        let payload = IngestEventPayload {
            call_id: "RT-1".into(),
            event_type: Some("presence_update".into()),
            ..Default::default()
        };
        assert_eq!(payload.resolved_event_type(), EventType::Custom);

        let payload = IngestEventPayload {
            call_id: "RT-1".into(),
            event_type: Some("Transcript".into()),
            ..Default::default()
        };
        assert_eq!(payload.resolved_event_type(), EventType::Transcript);
    }

    #[test]
    fn metric_extraction_reads_nested_numbers() {
        let metadata = json!({"metrics": {"dead_air_seconds": 7, "risk": 0.4}})
            .as_object()
            .cloned()
            .unwrap();
        assert_eq!(metric_f64(&metadata, "dead_air_seconds"), Some(7.0));
        assert_eq!(metric_f64(&metadata, "risk"), Some(0.4));
        assert_eq!(metric_f64(&metadata, "missing"), None);
    }

    #[test]
    fn severity_ordering_matches_escalation() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }
}
