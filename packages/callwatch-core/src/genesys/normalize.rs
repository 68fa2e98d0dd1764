//! Normalization of provider notification frames into ingest payloads.
//!
//! Conversation topics map onto the realtime event schema (conversation id
//! becomes `call_id`, participant states drive status and identity fields).
//! Anything else is preserved as a `custom` event with the raw frame under
//! `metadata.genesys`.

use serde_json::{json, Map, Value};

/// Outcome of inspecting one websocket frame.
#[derive(Debug, PartialEq)]
pub enum NormalizedFrame {
    /// Provider keep-alive; acknowledge freshness and move on.
    KeepAlive,
    /// A payload for the ingest API.
    Event(Value),
    /// Nothing usable (missing topic or body).
    Ignored,
}

/// Normalizes one parsed notification frame.
pub fn normalize_frame(frame: &Value) -> NormalizedFrame {
    let topic = frame
        .get("topicName")
        .and_then(Value::as_str)
        .unwrap_or_default();

    if topic.is_empty() {
        return NormalizedFrame::Ignored;
    }
    // Channel metadata frames are the provider's heartbeat.
    if topic == "channel.metadata" {
        return NormalizedFrame::KeepAlive;
    }

    let Some(body) = frame.get("eventBody") else {
        return NormalizedFrame::Ignored;
    };

    if topic.contains(".conversations") {
        normalize_conversation(topic, body)
            .map(NormalizedFrame::Event)
            .unwrap_or(NormalizedFrame::Ignored)
    } else {
        // Presence, routing estimates, and anything else we don't model:
        // keep as custom with the raw payload attached.
        NormalizedFrame::Event(json!({
            "provider": "genesys",
            "call_id": format!("genesys-topic:{}", topic),
            "event_type": "custom",
            "metadata": {
                "genesys": {
                    "topic": topic,
                    "raw": body,
                }
            }
        }))
    }
}

/// Maps a conversation event body onto the ingest schema.
fn normalize_conversation(topic: &str, body: &Value) -> Option<Value> {
    let call_id = body
        .get("id")
        .or_else(|| body.get("conversationId"))
        .and_then(Value::as_str)?;

    let empty = Vec::new();
    let participants = body
        .get("participants")
        .and_then(Value::as_array)
        .unwrap_or(&empty);

    let mut agent_id = None;
    let mut customer_id = None;
    let mut any_connected = false;
    let mut any_participant = false;
    let mut wrapup: Option<String> = None;

    for participant in participants {
        any_participant = true;
        let purpose = participant
            .get("purpose")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let state = participant
            .get("state")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_ascii_lowercase();
        if matches!(state.as_str(), "connected" | "alerting" | "dialing" | "contacting") {
            any_connected = true;
        }
        match purpose {
            "agent" | "user" => {
                agent_id = participant
                    .get("userId")
                    .or_else(|| participant.get("id"))
                    .and_then(Value::as_str)
                    .map(String::from)
                    .or(agent_id);
            }
            "customer" | "external" => {
                customer_id = participant
                    .get("id")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .or(customer_id);
            }
            _ => {}
        }
        if wrapup.is_none() {
            wrapup = participant
                .get("wrapup")
                .and_then(|w| w.get("code"))
                .and_then(Value::as_str)
                .map(String::from);
        }
    }

    let ended = any_participant && !any_connected;
    let (event_type, status) = if ended {
        ("end", "ended")
    } else {
        ("status", "active")
    };

    let mut metadata = Map::new();
    metadata.insert(
        "genesys".into(),
        json!({
            "topic": topic,
            "participant_count": participants.len(),
            "wrapup_code": wrapup,
        }),
    );

    let mut payload = Map::new();
    payload.insert("provider".into(), json!("genesys"));
    payload.insert("call_id".into(), json!(call_id));
    payload.insert("event_type".into(), json!(event_type));
    payload.insert("status".into(), json!(status));
    payload.insert("metadata".into(), Value::Object(metadata));
    if let Some(agent_id) = agent_id {
        payload.insert("agent_id".into(), json!(agent_id));
    }
    if let Some(customer_id) = customer_id {
        payload.insert("customer_id".into(), json!(customer_id));
    }

    Some(Value::Object(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_metadata_is_keepalive() {
        let frame = json!({
            "topicName": "channel.metadata",
            "eventBody": {"message": "WebSocket Heartbeat"}
        });
        assert_eq!(normalize_frame(&frame), NormalizedFrame::KeepAlive);
    }

    #[test]
    fn frame_without_topic_is_ignored() {
        assert_eq!(normalize_frame(&json!({})), NormalizedFrame::Ignored);
    }

    #[test]
    fn active_conversation_maps_to_status_event() {
        let frame = json!({
            "topicName": "v2.routing.queues.q-1.conversations",
            "eventBody": {
                "id": "conv-42",
                "participants": [
                    {"purpose": "agent", "userId": "agent-7", "state": "connected"},
                    {"purpose": "customer", "id": "cust-3", "state": "connected"}
                ]
            }
        });
        let NormalizedFrame::Event(payload) = normalize_frame(&frame) else {
            panic!("expected event");
        };
        assert_eq!(payload["call_id"], "conv-42");
        assert_eq!(payload["event_type"], "status");
        assert_eq!(payload["status"], "active");
        assert_eq!(payload["agent_id"], "agent-7");
        assert_eq!(payload["customer_id"], "cust-3");
        assert_eq!(payload["provider"], "genesys");
    }

    #[test]
    fn fully_disconnected_conversation_maps_to_end() {
        let frame = json!({
            "topicName": "v2.users.u-1.conversations",
            "eventBody": {
                "id": "conv-42",
                "participants": [
                    {"purpose": "agent", "userId": "agent-7", "state": "disconnected",
                     "wrapup": {"code": "resolved"}},
                    {"purpose": "customer", "id": "cust-3", "state": "disconnected"}
                ]
            }
        });
        let NormalizedFrame::Event(payload) = normalize_frame(&frame) else {
            panic!("expected event");
        };
        assert_eq!(payload["event_type"], "end");
        assert_eq!(payload["status"], "ended");
        assert_eq!(payload["metadata"]["genesys"]["wrapup_code"], "resolved");
    }

    #[test]
    fn non_conversation_topic_becomes_custom_with_raw_payload() {
        let frame = json!({
            "topicName": "v2.users.u-1.presence",
            "eventBody": {"presenceDefinition": {"systemPresence": "Away"}}
        });
        let NormalizedFrame::Event(payload) = normalize_frame(&frame) else {
            panic!("expected event");
        };
        assert_eq!(payload["event_type"], "custom");
        assert_eq!(
            payload["metadata"]["genesys"]["topic"],
            "v2.users.u-1.presence"
        );
        assert_eq!(
            payload["metadata"]["genesys"]["raw"]["presenceDefinition"]["systemPresence"],
            "Away"
        );
    }

    #[test]
    fn conversation_without_id_is_ignored() {
        let frame = json!({
            "topicName": "v2.routing.queues.q-1.conversations",
            "eventBody": {"participants": []}
        });
        assert_eq!(normalize_frame(&frame), NormalizedFrame::Ignored);
    }
}
