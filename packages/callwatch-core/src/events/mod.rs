//! Event envelopes for real-time client communication.
//!
//! This module provides:
//! - [`Envelope`]: the tagged JSON message shape delivered on SSE streams
//! - [`CallEventBus`]: topic-per-call fan-out to stream subscribers
//!
//! The actual transport (SSE framing, keepalives) is handled in the `api`
//! module.

mod bus;

pub use bus::{CallEventBus, SUBSCRIBER_CHANNEL_CAPACITY};

use serde::Serialize;

use crate::model::{RealtimeCall, RealtimeEvent, SupervisorAlert};
use crate::utils::millis_to_rfc3339;

/// Messages broadcast to stream subscribers.
///
/// Serialized shape is `{"type": <tag>, ...payload}`; payload fields are
/// flattened into the envelope object.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Emitted for every ingested event.
    RealtimeEvent {
        #[serde(flatten)]
        event: RealtimeEvent,
    },

    /// Emitted when a new alert is created.
    SupervisorAlert {
        #[serde(flatten)]
        alert: SupervisorAlert,
    },

    /// Emitted when an alert is acknowledged.
    SupervisorAlertAck {
        #[serde(flatten)]
        alert: SupervisorAlert,
    },

    /// Emitted when the call's state changes.
    Status {
        #[serde(flatten)]
        call: RealtimeCall,
    },

    /// Emitted periodically on otherwise-silent streams.
    Heartbeat { timestamp: String },
}

impl Envelope {
    /// Builds a heartbeat envelope for the given instant.
    #[must_use]
    pub fn heartbeat(now_ms: u64) -> Self {
        Self::Heartbeat {
            timestamp: millis_to_rfc3339(now_ms),
        }
    }

    /// Serializes to the compact JSON line sent on the wire.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_envelope_is_tagged() {
        let json = Envelope::heartbeat(1_700_000_000_000).to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "heartbeat");
        assert!(value["timestamp"].as_str().unwrap().starts_with("2023-"));
    }

    #[test]
    fn event_envelope_flattens_payload() {
        let event = RealtimeEvent {
            id: 7,
            call_id: "RT-1".into(),
            event_type: crate::model::EventType::Transcript,
            speaker: None,
            text: Some("hi".into()),
            sentiment: None,
            confidence: None,
            occurred_at: 0,
            metadata: serde_json::Map::new(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&Envelope::RealtimeEvent { event }.to_json()).unwrap();
        assert_eq!(value["type"], "realtime_event");
        assert_eq!(value["id"], 7);
        assert_eq!(value["call_id"], "RT-1");
    }
}
