//! In-process repository for calls, events, and alerts.
//!
//! Backing is in-memory (the realtime plane's replay contract is
//! best-effort): calls live in a `DashMap`, events and alerts in append-only
//! vectors ordered by their monotonic ids. All writers are internally
//! synchronized; readers only ever observe fully committed rows.

use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::error::{CallwatchError, CallwatchResult};
use crate::model::{
    CallMutation, EventType, RealtimeCall, RealtimeEvent, Speaker, SupervisorAlert, Severity,
};

/// Fields for a new event row; the repository assigns the id.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub call_id: String,
    pub event_type: EventType,
    pub speaker: Option<Speaker>,
    pub text: Option<String>,
    pub sentiment: Option<f64>,
    pub confidence: Option<f64>,
    pub occurred_at: u64,
    pub metadata: Map<String, Value>,
}

/// Fields for a new alert row; the repository assigns id and created_at.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub call_id: String,
    pub alert_type: String,
    pub severity: Severity,
    pub message: String,
    pub metadata: Map<String, Value>,
}

/// Shared store for realtime rows.
#[derive(Default)]
pub struct RealtimeRepository {
    calls: DashMap<String, RealtimeCall>,
    events: RwLock<Vec<RealtimeEvent>>,
    alerts: RwLock<Vec<SupervisorAlert>>,
    next_event_id: AtomicI64,
    next_alert_id: AtomicI64,
}

impl RealtimeRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
            events: RwLock::new(Vec::new()),
            alerts: RwLock::new(Vec::new()),
            next_event_id: AtomicI64::new(1),
            next_alert_id: AtomicI64::new(1),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Calls
    // ─────────────────────────────────────────────────────────────────────

    /// Merges a mutation into a call row, creating it on first sight.
    ///
    /// `None` fields are left untouched; `updated_at` is always refreshed to
    /// `now_ms`. Returns the post-mutation row.
    pub fn upsert_call(&self, call_id: &str, mutation: CallMutation, now_ms: u64) -> RealtimeCall {
        let mut entry = self
            .calls
            .entry(call_id.to_string())
            .or_insert_with(|| RealtimeCall::new(call_id, now_ms));
        let call = entry.value_mut();

        if let Some(provider) = mutation.provider {
            call.provider = provider;
        }
        if let Some(status) = mutation.status {
            call.status = status;
        }
        if let Some(risk) = mutation.risk_score {
            call.risk_score = risk.clamp(0.0, 1.0);
        }
        if let Some(sentiment) = mutation.sentiment_score {
            call.sentiment_score = sentiment.clamp(-1.0, 1.0);
        }
        if let Some(agent_id) = mutation.agent_id {
            call.agent_id = Some(agent_id);
        }
        if let Some(customer_id) = mutation.customer_id {
            call.customer_id = Some(customer_id);
        }
        if let Some(metadata) = mutation.metadata {
            for (key, value) in metadata {
                call.metadata.insert(key, value);
            }
        }
        call.updated_at = now_ms;
        call.clone()
    }

    /// Returns a call row by id.
    #[must_use]
    pub fn get_call(&self, call_id: &str) -> Option<RealtimeCall> {
        self.calls.get(call_id).map(|r| r.value().clone())
    }

    /// Returns all known calls, most recently updated first.
    #[must_use]
    pub fn list_calls(&self) -> Vec<RealtimeCall> {
        let mut calls: Vec<RealtimeCall> = self.calls.iter().map(|r| r.value().clone()).collect();
        calls.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        calls
    }

    // ─────────────────────────────────────────────────────────────────────
    // Events
    // ─────────────────────────────────────────────────────────────────────

    /// Appends an event row and returns it with its assigned id.
    pub fn append_event(&self, new: NewEvent) -> RealtimeEvent {
        let mut events = self.events.write();
        // Allocate under the write lock so insertion order matches id order.
        let id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
        let event = RealtimeEvent {
            id,
            call_id: new.call_id,
            event_type: new.event_type,
            speaker: new.speaker,
            text: new.text,
            sentiment: new.sentiment,
            confidence: new.confidence,
            occurred_at: new.occurred_at,
            metadata: new.metadata,
        };
        events.push(event.clone());
        event
    }

    /// Returns the most recent `limit` events for a call, newest first.
    #[must_use]
    pub fn recent_events(&self, call_id: &str, limit: usize) -> Vec<RealtimeEvent> {
        self.events
            .read()
            .iter()
            .rev()
            .filter(|e| e.call_id == call_id)
            .take(limit)
            .cloned()
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Alerts
    // ─────────────────────────────────────────────────────────────────────

    /// Appends an alert row and returns it with its assigned id.
    pub fn append_alert(&self, new: NewAlert, now_ms: u64) -> SupervisorAlert {
        let mut alerts = self.alerts.write();
        let id = self.next_alert_id.fetch_add(1, Ordering::Relaxed);
        let alert = SupervisorAlert {
            id,
            call_id: new.call_id,
            alert_type: new.alert_type,
            severity: new.severity,
            message: new.message,
            acknowledged: false,
            acknowledged_at: None,
            created_at: now_ms,
            metadata: new.metadata,
        };
        alerts.push(alert.clone());
        alert
    }

    /// Returns alerts newest first, optionally filtered by call and ack state.
    #[must_use]
    pub fn recent_alerts(
        &self,
        call_id: Option<&str>,
        open_only: bool,
        limit: usize,
    ) -> Vec<SupervisorAlert> {
        self.alerts
            .read()
            .iter()
            .rev()
            .filter(|a| call_id.map_or(true, |id| a.call_id == id))
            .filter(|a| !open_only || !a.acknowledged)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Acknowledges an alert idempotently.
    ///
    /// The first ack stamps `acknowledged_at`; repeats return the row
    /// unchanged with the original timestamp.
    pub fn ack_alert(&self, alert_id: i64, now_ms: u64) -> CallwatchResult<SupervisorAlert> {
        let mut alerts = self.alerts.write();
        let alert = alerts
            .iter_mut()
            .find(|a| a.id == alert_id)
            .ok_or_else(|| CallwatchError::NotFound(format!("alert {}", alert_id)))?;
        if !alert.acknowledged {
            alert.acknowledged = true;
            alert.acknowledged_at = Some(now_ms);
        }
        Ok(alert.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CallStatus;

    fn event_for(call_id: &str) -> NewEvent {
        NewEvent {
            call_id: call_id.to_string(),
            event_type: EventType::Transcript,
            speaker: Some(Speaker::Customer),
            text: Some("hello".into()),
            sentiment: None,
            confidence: None,
            occurred_at: 1_000,
            metadata: Map::new(),
        }
    }

    fn alert_for(call_id: &str, alert_type: &str) -> NewAlert {
        NewAlert {
            call_id: call_id.to_string(),
            alert_type: alert_type.to_string(),
            severity: Severity::High,
            message: "test".into(),
            metadata: Map::new(),
        }
    }

    #[test]
    fn upsert_merges_non_null_fields() {
        let repo = RealtimeRepository::new();
        repo.upsert_call(
            "RT-1",
            CallMutation {
                provider: Some("genesys".into()),
                agent_id: Some("agent-7".into()),
                ..Default::default()
            },
            100,
        );
        let call = repo.upsert_call(
            "RT-1",
            CallMutation {
                status: Some(CallStatus::Active),
                ..Default::default()
            },
            200,
        );
        assert_eq!(call.provider, "genesys");
        assert_eq!(call.agent_id.as_deref(), Some("agent-7"));
        assert_eq!(call.status, CallStatus::Active);
        assert_eq!(call.updated_at, 200);
    }

    #[test]
    fn upsert_clamps_scores() {
        let repo = RealtimeRepository::new();
        let call = repo.upsert_call(
            "RT-1",
            CallMutation {
                risk_score: Some(1.7),
                sentiment_score: Some(-2.0),
                ..Default::default()
            },
            1,
        );
        assert_eq!(call.risk_score, 1.0);
        assert_eq!(call.sentiment_score, -1.0);
    }

    #[test]
    fn event_ids_are_strictly_increasing() {
        let repo = RealtimeRepository::new();
        let a = repo.append_event(event_for("RT-1"));
        let b = repo.append_event(event_for("RT-2"));
        let c = repo.append_event(event_for("RT-1"));
        assert!(a.id < b.id && b.id < c.id);
    }

    #[test]
    fn recent_events_filters_and_orders_newest_first() {
        let repo = RealtimeRepository::new();
        for _ in 0..5 {
            repo.append_event(event_for("RT-1"));
            repo.append_event(event_for("RT-2"));
        }
        let events = repo.recent_events("RT-1", 3);
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].id > w[1].id));
        assert!(events.iter().all(|e| e.call_id == "RT-1"));
    }

    #[test]
    fn recent_alerts_open_only_filter() {
        let repo = RealtimeRepository::new();
        let a = repo.append_alert(alert_for("RT-1", "dead_air"), 10);
        repo.append_alert(alert_for("RT-1", "high_risk"), 20);
        repo.ack_alert(a.id, 30).unwrap();
        let open = repo.recent_alerts(Some("RT-1"), true, 10);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].alert_type, "high_risk");
    }

    #[test]
    fn ack_is_idempotent_with_stable_timestamp() {
        let repo = RealtimeRepository::new();
        let alert = repo.append_alert(alert_for("RT-1", "dead_air"), 10);
        let first = repo.ack_alert(alert.id, 42).unwrap();
        let second = repo.ack_alert(alert.id, 99).unwrap();
        assert!(first.acknowledged && second.acknowledged);
        assert_eq!(first.acknowledged_at, Some(42));
        assert_eq!(second.acknowledged_at, Some(42));
    }

    #[test]
    fn ack_unknown_alert_is_not_found() {
        let repo = RealtimeRepository::new();
        assert!(matches!(
            repo.ack_alert(31, 0),
            Err(CallwatchError::NotFound(_))
        ));
    }
}
