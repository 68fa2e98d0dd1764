//! Realtime ingest and alert engine.
//!
//! One entry point, [`IngestService::ingest_event`], fuses an inbound event
//! into per-call state: upsert the call, append the event row, run the alert
//! evaluator against the pre-event state, persist fired alerts, and publish
//! envelopes to the call's topic. The `realtime_event` envelope is always
//! published before its alerts.

use std::sync::Arc;

use crate::alerts::AlertEvaluator;
use crate::audio::{AudioSnapshot, LiveAudioStore};
use crate::error::{CallwatchError, CallwatchResult};
use crate::events::{CallEventBus, Envelope};
use crate::model::{
    CallMutation, CallStatus, EventType, IngestEventPayload, RealtimeCall, RealtimeEvent,
    SupervisorAlert,
};
use crate::repository::{NewAlert, NewEvent, RealtimeRepository};
use crate::utils::{now_millis, rfc3339_to_millis};

/// Events returned in a snapshot.
const SNAPSHOT_EVENT_LIMIT: usize = 50;

/// Open alerts returned in a snapshot.
const SNAPSHOT_ALERT_LIMIT: usize = 20;

/// Alert history consulted for cooldown decisions.
const COOLDOWN_HISTORY_LIMIT: usize = 50;

/// Result of fusing one event.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub call: RealtimeCall,
    pub event: RealtimeEvent,
    pub alerts: Vec<SupervisorAlert>,
}

/// Current view of a call for dashboards.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CallSnapshot {
    pub call: RealtimeCall,
    pub recent_events: Vec<RealtimeEvent>,
    pub open_alerts: Vec<SupervisorAlert>,
    pub audio: AudioSnapshot,
}

/// Shared ingest pipeline used by the HTTP API.
pub struct IngestService {
    repository: Arc<RealtimeRepository>,
    audio: Arc<LiveAudioStore>,
    bus: Arc<CallEventBus>,
    evaluator: AlertEvaluator,
}

impl IngestService {
    /// Wires the pipeline over shared stores.
    pub fn new(
        repository: Arc<RealtimeRepository>,
        audio: Arc<LiveAudioStore>,
        bus: Arc<CallEventBus>,
        evaluator: AlertEvaluator,
    ) -> Self {
        Self {
            repository,
            audio,
            bus,
            evaluator,
        }
    }

    /// Fuses one event payload into call state and fires alerts.
    pub fn ingest_event(&self, payload: IngestEventPayload) -> CallwatchResult<IngestOutcome> {
        if payload.call_id.trim().is_empty() {
            return Err(CallwatchError::InvalidRequest("call_id is required".into()));
        }

        // Wall clock read once; everything downstream is deterministic.
        let now_ms = now_millis();
        let occurred_at = payload
            .timestamp
            .as_deref()
            .and_then(rfc3339_to_millis)
            .unwrap_or(now_ms);

        let event_type = payload.resolved_event_type();
        let call_id = payload.call_id.clone();
        let prior_status = self
            .repository
            .get_call(&call_id)
            .map(|c| c.status)
            .unwrap_or(CallStatus::Unknown);

        // Merge identity fields before evaluation so the evaluator sees
        // current prior scores with fresh metadata.
        let call = self.repository.upsert_call(
            &call_id,
            CallMutation {
                provider: payload.provider.clone(),
                status: resolve_status(&payload, event_type, prior_status),
                agent_id: payload.agent_id.clone(),
                customer_id: payload.customer_id.clone(),
                metadata: payload.metadata.clone(),
                ..Default::default()
            },
            now_ms,
        );

        let event = self.repository.append_event(NewEvent {
            call_id: call_id.clone(),
            event_type,
            speaker: payload.speaker,
            text: payload.text.clone(),
            sentiment: payload.sentiment,
            confidence: payload.confidence,
            occurred_at,
            metadata: payload.metadata.clone().unwrap_or_default(),
        });

        let history =
            self.repository
                .recent_alerts(Some(&call_id), false, COOLDOWN_HISTORY_LIMIT);
        let (scores, drafts) = self.evaluator.evaluate(&call, &event, &history, now_ms);

        let call = self.repository.upsert_call(
            &call_id,
            CallMutation {
                risk_score: Some(scores.risk_score),
                sentiment_score: Some(scores.sentiment_score),
                ..Default::default()
            },
            now_ms,
        );

        let alerts: Vec<SupervisorAlert> = drafts
            .into_iter()
            .map(|draft| {
                self.repository.append_alert(
                    NewAlert {
                        call_id: call_id.clone(),
                        alert_type: draft.alert_type.to_string(),
                        severity: draft.severity,
                        message: draft.message,
                        metadata: draft.metadata,
                    },
                    now_ms,
                )
            })
            .collect();

        // Publish order contract: the event envelope precedes its alerts.
        self.bus.publish(
            &call_id,
            Envelope::RealtimeEvent {
                event: event.clone(),
            },
        );
        for alert in &alerts {
            log::info!(
                "[Ingest] Alert fired: call={} type={} severity={:?}",
                call_id,
                alert.alert_type,
                alert.severity
            );
            self.bus.publish(
                &call_id,
                Envelope::SupervisorAlert {
                    alert: alert.clone(),
                },
            );
        }
        if call.status != prior_status {
            self.bus
                .publish(&call_id, Envelope::Status { call: call.clone() });
        }

        Ok(IngestOutcome {
            call,
            event,
            alerts,
        })
    }

    /// Acknowledges an alert and publishes the ack on its call's topic.
    pub fn ack_alert(&self, alert_id: i64) -> CallwatchResult<SupervisorAlert> {
        let alert = self.repository.ack_alert(alert_id, now_millis())?;
        self.bus.publish(
            &alert.call_id,
            Envelope::SupervisorAlertAck {
                alert: alert.clone(),
            },
        );
        Ok(alert)
    }

    /// Builds the dashboard snapshot for a call.
    ///
    /// Unknown calls get an idle snapshot (status unknown, zero scores)
    /// rather than an error, so dashboards can subscribe ahead of traffic.
    #[must_use]
    pub fn snapshot(&self, call_id: &str) -> CallSnapshot {
        let call = self
            .repository
            .get_call(call_id)
            .unwrap_or_else(|| RealtimeCall::new(call_id, now_millis()));
        CallSnapshot {
            recent_events: self
                .repository
                .recent_events(call_id, SNAPSHOT_EVENT_LIMIT),
            open_alerts: self
                .repository
                .recent_alerts(Some(call_id), true, SNAPSHOT_ALERT_LIMIT),
            audio: self.audio.snapshot(call_id),
            call,
        }
    }
}

/// Resolves the status mutation for an inbound event.
///
/// Explicit status wins; `end` events terminate the call; any other traffic
/// on a not-yet-ended call marks it active.
fn resolve_status(
    payload: &IngestEventPayload,
    event_type: EventType,
    prior: CallStatus,
) -> Option<CallStatus> {
    if let Some(raw) = payload.status.as_deref() {
        return Some(CallStatus::parse(raw));
    }
    if event_type == EventType::End {
        return Some(CallStatus::Ended);
    }
    if prior == CallStatus::Unknown {
        return Some(CallStatus::Active);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RealtimeConfig;
    use serde_json::json;

    fn service() -> IngestService {
        let repository = Arc::new(RealtimeRepository::new());
        let audio = Arc::new(LiveAudioStore::new(300, None));
        let bus = Arc::new(CallEventBus::new());
        let evaluator = AlertEvaluator::from_config(&RealtimeConfig::default());
        IngestService::new(repository, audio, bus, evaluator)
    }

    fn negative_payload(call_id: &str) -> IngestEventPayload {
        IngestEventPayload {
            call_id: call_id.into(),
            event_type: Some("transcript".into()),
            sentiment: Some(-0.8),
            ..Default::default()
        }
    }

    #[test]
    fn empty_call_id_is_rejected() {
        let svc = service();
        let payload = IngestEventPayload {
            call_id: "  ".into(),
            ..Default::default()
        };
        assert!(matches!(
            svc.ingest_event(payload),
            Err(CallwatchError::InvalidRequest(_))
        ));
    }

    #[test]
    fn negative_sentiment_scenario() {
        let svc = service();
        let outcome = svc.ingest_event(negative_payload("RT-1")).unwrap();
        assert_eq!(outcome.alerts.len(), 1);
        assert_eq!(outcome.alerts[0].alert_type, "negative_sentiment");
        assert!(outcome.call.risk_score >= 0.32 - 1e-9);
        assert_eq!(outcome.call.status, CallStatus::Active);
    }

    #[test]
    fn cooldown_scenario_second_ingest_fires_nothing() {
        let svc = service();
        let first = svc.ingest_event(negative_payload("RT-1")).unwrap();
        assert_eq!(first.alerts.len(), 1);
        let second = svc.ingest_event(negative_payload("RT-1")).unwrap();
        assert!(second.alerts.is_empty());
    }

    #[test]
    fn end_event_terminates_the_call() {
        let svc = service();
        svc.ingest_event(negative_payload("RT-1")).unwrap();
        let outcome = svc
            .ingest_event(IngestEventPayload {
                call_id: "RT-1".into(),
                event_type: Some("end".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(outcome.call.status, CallStatus::Ended);
    }

    #[test]
    fn upstream_timestamp_is_honored() {
        let svc = service();
        let outcome = svc
            .ingest_event(IngestEventPayload {
                call_id: "RT-1".into(),
                timestamp: Some("2024-06-01T12:00:00Z".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(outcome.event.occurred_at, 1_717_243_200_000);
    }

    #[test]
    fn event_envelope_precedes_alert_envelope() {
        let svc = service();
        let mut rx = svc.bus.subscribe("RT-1");
        svc.ingest_event(negative_payload("RT-1")).unwrap();

        match rx.try_recv().unwrap() {
            Envelope::RealtimeEvent { .. } => {}
            other => panic!("expected realtime_event first, got {:?}", other),
        }
        match rx.try_recv().unwrap() {
            Envelope::SupervisorAlert { alert } => {
                assert_eq!(alert.alert_type, "negative_sentiment");
            }
            other => panic!("expected supervisor_alert second, got {:?}", other),
        }
        // Status envelope last: the call went unknown -> active.
        match rx.try_recv().unwrap() {
            Envelope::Status { call } => assert_eq!(call.status, CallStatus::Active),
            other => panic!("expected status, got {:?}", other),
        }
    }

    #[test]
    fn snapshot_for_unknown_call_is_idle() {
        let svc = service();
        let snapshot = svc.snapshot("RT-404");
        assert_eq!(snapshot.call.status, CallStatus::Unknown);
        assert_eq!(snapshot.call.risk_score, 0.0);
        assert!(snapshot.recent_events.is_empty());
        assert!(snapshot.open_alerts.is_empty());
        assert!(!snapshot.audio.available);
    }

    #[test]
    fn escalation_metadata_flows_into_event_row() {
        let svc = service();
        let outcome = svc
            .ingest_event(IngestEventPayload {
                call_id: "RT-1".into(),
                text: Some("get me your supervisor".into()),
                sentiment: Some(-0.9),
                metadata: json!({"metrics": {"dead_air_seconds": 7}})
                    .as_object()
                    .cloned(),
                ..Default::default()
            })
            .unwrap();
        let types: Vec<&str> = outcome
            .alerts
            .iter()
            .map(|a| a.alert_type.as_str())
            .collect();
        assert_eq!(
            types,
            vec!["negative_sentiment", "escalation_keyword", "dead_air"]
        );
        assert!(outcome.event.metadata.contains_key("metrics"));
    }

    #[test]
    fn two_subscribers_see_events_in_order_without_duplicates() {
        let svc = service();
        let mut rx_a = svc.bus.subscribe("RT-2");
        let mut rx_b = svc.bus.subscribe("RT-2");

        for text in ["A", "B", "C"] {
            svc.ingest_event(IngestEventPayload {
                call_id: "RT-2".into(),
                event_type: Some("transcript".into()),
                text: Some(text.into()),
                ..Default::default()
            })
            .unwrap();
        }

        for rx in [&mut rx_a, &mut rx_b] {
            let mut ids = Vec::new();
            let mut texts = Vec::new();
            while let Ok(envelope) = rx.try_recv() {
                if let Envelope::RealtimeEvent { event } = envelope {
                    ids.push(event.id);
                    texts.push(event.text.unwrap());
                }
            }
            assert_eq!(texts, vec!["A", "B", "C"]);
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn ack_publishes_on_call_topic() {
        let svc = service();
        let outcome = svc.ingest_event(negative_payload("RT-1")).unwrap();
        let mut rx = svc.bus.subscribe("RT-1");
        let acked = svc.ack_alert(outcome.alerts[0].id).unwrap();
        assert!(acked.acknowledged);
        match rx.try_recv().unwrap() {
            Envelope::SupervisorAlertAck { alert } => assert_eq!(alert.id, acked.id),
            other => panic!("expected ack envelope, got {:?}", other),
        }
    }
}
