//! Server-sent event streamer.
//!
//! One long-lived connection per subscriber. Envelopes from the call's topic
//! are framed as `data: <json>\n\n`; a `: keepalive` comment plus a heartbeat
//! envelope go out every 15 s of silence to defeat proxy buffering. The
//! subscription is a broadcast receiver owned by the response stream, so it
//! is released as soon as the client disconnects.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Query, State},
    http::header,
    response::Response,
};
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, MissedTickBehavior};

use crate::api::AppState;
use crate::events::Envelope;
use crate::utils::now_millis;

/// Cadence of keepalive comments and heartbeat envelopes.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Deserialize)]
pub(super) struct StreamQuery {
    call_id: String,
}

/// Frames an envelope as one SSE data line.
fn sse_data(envelope: &Envelope) -> Bytes {
    Bytes::from(format!("data: {}\n\n", envelope.to_json()))
}

/// `GET /api/realtime/stream?call_id=…`
pub(super) async fn stream_call_events(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let call_id = query.call_id;
    let mut rx = state.bus.subscribe(&call_id);
    let shutdown = state.shutdown.clone();
    log::info!("[SSE] Subscriber connected: call={}", call_id);

    let stream_call_id = call_id.clone();
    let stream = async_stream::stream! {
        let mut keepalive = interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    // Final envelope before the process exits.
                    yield Ok::<Bytes, Infallible>(sse_data(&Envelope::heartbeat(now_millis())));
                    break;
                }

                result = rx.recv() => match result {
                    Ok(envelope) => yield Ok(sse_data(&envelope)),
                    Err(RecvError::Lagged(n)) => {
                        // Oldest messages were dropped for this subscriber;
                        // resume from the live edge.
                        log::warn!(
                            "[SSE] Subscriber lagged by {} envelope(s): call={}",
                            n,
                            stream_call_id
                        );
                    }
                    Err(RecvError::Closed) => break,
                },

                _ = keepalive.tick() => {
                    yield Ok(Bytes::from_static(b": keepalive\n\n"));
                    yield Ok(sse_data(&Envelope::heartbeat(now_millis())));
                }
            }
        }

        log::info!("[SSE] Subscriber stream ended: call={}", stream_call_id);
    };

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventType, RealtimeEvent};

    #[test]
    fn sse_frame_is_data_line_with_blank_terminator() {
        let event = RealtimeEvent {
            id: 1,
            call_id: "RT-1".into(),
            event_type: EventType::Transcript,
            speaker: None,
            text: None,
            sentiment: None,
            confidence: None,
            occurred_at: 0,
            metadata: serde_json::Map::new(),
        };
        let frame = sse_data(&Envelope::RealtimeEvent { event });
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.starts_with("data: {"));
        assert!(text.ends_with("\n\n"));
        // Compact JSON: no spaces after separators.
        assert!(!text.contains("\": "));
    }
}
