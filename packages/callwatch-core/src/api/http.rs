//! HTTP route handlers.
//!
//! All handlers are thin - they delegate to the ingest service and shared
//! stores for business logic.

use std::path::{Path as FsPath, PathBuf};

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::prelude::*;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::response::api_success;
use crate::api::sse::stream_call_events;
use crate::api::AppState;
use crate::audio::strip_wav_header;
use crate::codec::{self, AudioEncoding};
use crate::error::{CallwatchError, CallwatchResult};
use crate::health::read_health;
use crate::model::{IngestEventPayload, Speaker};
use crate::utils::now_millis;

/// Default sample rate assumed when a chunk omits one (G.711 telephony).
const DEFAULT_SAMPLE_RATE: u32 = 8000;

// ─────────────────────────────────────────────────────────────────────────────
// Request Types
// ─────────────────────────────────────────────────────────────────────────────

/// Body of `POST /api/realtime/audio/chunk`.
#[derive(Deserialize)]
struct AudioChunkPayload {
    call_id: String,
    audio_b64: String,
    audio_encoding: String,
    #[serde(default)]
    sample_rate: Option<u32>,
    #[serde(default)]
    channels: Option<u16>,
    #[serde(default)]
    speaker: Option<Speaker>,
    #[serde(default)]
    transcript: Option<String>,
    #[serde(default)]
    transcript_segments: Option<Vec<TranscriptSegment>>,
    #[serde(default)]
    sentiment: Option<f64>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
    #[serde(default)]
    provider: Option<String>,
}

/// One transcript span attached to an audio chunk.
#[derive(Deserialize)]
struct TranscriptSegment {
    text: String,
    #[serde(default)]
    speaker: Option<Speaker>,
    #[serde(default)]
    sentiment: Option<f64>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Deserialize)]
struct AlertListQuery {
    #[serde(default)]
    call_id: Option<String>,
    /// Truthy strings accepted: 1, true, yes.
    #[serde(default)]
    open_only: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

fn is_truthy(value: Option<&str>) -> bool {
    value
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[derive(Deserialize)]
struct AudioQuery {
    #[serde(default)]
    fallback: Option<u8>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Creates the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/realtime/events", post(ingest_event))
        .route("/api/realtime/audio/chunk", post(ingest_audio_chunk))
        .route("/api/realtime/calls", get(list_calls))
        .route("/api/realtime/calls/{call_id}/snapshot", get(call_snapshot))
        .route("/api/realtime/calls/{call_id}/audio", get(call_audio))
        .route(
            "/api/realtime/calls/{call_id}/audio/meta",
            get(call_audio_meta),
        )
        .route("/api/realtime/alerts", get(list_alerts))
        .route("/api/realtime/alerts/{alert_id}/ack", post(ack_alert))
        .route("/api/realtime/stream", get(stream_call_events))
        .route("/api/integrations/genesys/health", get(connector_health))
        .route(
            "/api/integrations/genesys/audiohook/health",
            get(audiohook_health),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Auth
// ─────────────────────────────────────────────────────────────────────────────

/// Enforces the shared ingest token when one is configured.
///
/// Accepts either `X-Cloud-Token: <token>` or `Authorization: Bearer <token>`.
fn require_ingest_token(headers: &HeaderMap, expected: &str) -> CallwatchResult<()> {
    if expected.is_empty() {
        return Ok(());
    }
    let cloud_token = headers
        .get("x-cloud-token")
        .and_then(|v| v.to_str().ok());
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if cloud_token == Some(expected) || bearer == Some(expected) {
        Ok(())
    } else {
        Err(CallwatchError::Auth("invalid ingest token".into()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event Ingest
// ─────────────────────────────────────────────────────────────────────────────

async fn ingest_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> CallwatchResult<Response> {
    require_ingest_token(&headers, &state.config.ingest_token)?;
    let payload: IngestEventPayload = serde_json::from_value(body)
        .map_err(|e| CallwatchError::InvalidRequest(format!("invalid event payload: {}", e)))?;
    let outcome = state.ingest.ingest_event(payload)?;
    let snapshot = state.ingest.snapshot(&outcome.call.call_id);
    Ok(api_success(json!({
        "ok": true,
        "call_id": outcome.call.call_id,
        "risk_score": outcome.call.risk_score,
        "sentiment_score": outcome.call.sentiment_score,
        "alerts": outcome.alerts,
        "snapshot": snapshot,
    }))
    .into_response())
}

// ─────────────────────────────────────────────────────────────────────────────
// Audio Chunk Ingest
// ─────────────────────────────────────────────────────────────────────────────

async fn ingest_audio_chunk(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> CallwatchResult<Response> {
    require_ingest_token(&headers, &state.config.ingest_token)?;
    let payload: AudioChunkPayload = serde_json::from_value(body)
        .map_err(|e| CallwatchError::InvalidRequest(format!("invalid chunk payload: {}", e)))?;
    if payload.call_id.trim().is_empty() {
        return Err(CallwatchError::InvalidRequest("call_id is required".into()));
    }

    let mut warnings: Vec<String> = Vec::new();

    let raw = BASE64_STANDARD
        .decode(payload.audio_b64.as_bytes())
        .map_err(|e| CallwatchError::Decode(format!("invalid base64: {}", e)))?;

    let encoding = AudioEncoding::parse(&payload.audio_encoding)
        .map_err(|e| CallwatchError::Decode(e.to_string()))?;

    let pcm = match encoding {
        AudioEncoding::PcmS16le => raw,
        AudioEncoding::Wav => strip_wav_header(&raw).to_vec(),
        other => codec::decode(other, &raw)
            .map_err(|e| CallwatchError::Decode(e.to_string()))?,
    };

    if pcm.len() > state.config.audio_max_chunk_bytes {
        return Err(CallwatchError::InvalidRequest(format!(
            "chunk of {} bytes exceeds limit of {}",
            pcm.len(),
            state.config.audio_max_chunk_bytes
        )));
    }

    let sample_rate = payload.sample_rate.unwrap_or_else(|| {
        warnings.push(format!(
            "sample_rate not provided, assuming {}",
            DEFAULT_SAMPLE_RATE
        ));
        DEFAULT_SAMPLE_RATE
    });
    let channels = payload.channels.unwrap_or(1);
    if sample_rate == 0 || channels == 0 {
        return Err(CallwatchError::InvalidRequest(
            "sample_rate and channels must be positive".into(),
        ));
    }

    let chunk_id = state.audio.append(
        &payload.call_id,
        bytes::Bytes::from(pcm),
        sample_rate,
        channels,
    );

    // Event ingestion: segments win over a bare transcript; with neither, a
    // synthetic audio_chunk event keeps the call active.
    let mut alerts = Vec::new();
    let mut ingested_events = 0usize;

    let base_metadata = payload.metadata.clone().unwrap_or_default();
    let chunk_metadata = |extra: Value| -> Option<Map<String, Value>> {
        let mut map = base_metadata.clone();
        map.insert("chunk_id".into(), json!(chunk_id));
        if let Some(obj) = extra.as_object() {
            for (k, v) in obj {
                map.insert(k.clone(), v.clone());
            }
        }
        Some(map)
    };

    if let Some(segments) = &payload.transcript_segments {
        if payload.transcript.is_some() {
            warnings.push("transcript ignored because transcript_segments present".into());
        }
        for segment in segments {
            let outcome = state.ingest.ingest_event(IngestEventPayload {
                provider: payload.provider.clone(),
                call_id: payload.call_id.clone(),
                event_type: Some("transcript".into()),
                speaker: segment.speaker.or(payload.speaker),
                text: Some(segment.text.clone()),
                sentiment: segment.sentiment.or(payload.sentiment),
                confidence: segment.confidence.or(payload.confidence),
                status: None,
                timestamp: segment.timestamp.clone().or_else(|| payload.timestamp.clone()),
                agent_id: None,
                customer_id: None,
                metadata: chunk_metadata(json!({})),
            })?;
            ingested_events += 1;
            alerts.extend(outcome.alerts);
        }
    } else if let Some(transcript) = &payload.transcript {
        let outcome = state.ingest.ingest_event(IngestEventPayload {
            provider: payload.provider.clone(),
            call_id: payload.call_id.clone(),
            event_type: Some("transcript".into()),
            speaker: payload.speaker,
            text: Some(transcript.clone()),
            sentiment: payload.sentiment,
            confidence: payload.confidence,
            status: None,
            timestamp: payload.timestamp.clone(),
            agent_id: None,
            customer_id: None,
            metadata: chunk_metadata(json!({})),
        })?;
        ingested_events += 1;
        alerts.extend(outcome.alerts);
    } else {
        let outcome = state.ingest.ingest_event(IngestEventPayload {
            provider: payload.provider.clone(),
            call_id: payload.call_id.clone(),
            event_type: Some("audio_chunk".into()),
            speaker: payload.speaker,
            text: None,
            sentiment: payload.sentiment,
            confidence: None,
            status: None,
            timestamp: payload.timestamp.clone(),
            agent_id: None,
            customer_id: None,
            metadata: chunk_metadata(json!({
                "sample_rate": sample_rate,
                "channels": channels,
            })),
        })?;
        ingested_events += 1;
        alerts.extend(outcome.alerts);
    }

    let snapshot = state.ingest.snapshot(&payload.call_id);
    Ok(api_success(json!({
        "ok": true,
        "call_id": payload.call_id,
        "chunk_id": chunk_id,
        "audio": state.audio.snapshot(&payload.call_id),
        "ingested_events": ingested_events,
        "alerts": alerts,
        "snapshot": snapshot,
        "warnings": warnings,
    }))
    .into_response())
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshots & Calls
// ─────────────────────────────────────────────────────────────────────────────

async fn call_snapshot(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> Response {
    api_success(state.ingest.snapshot(&call_id)).into_response()
}

async fn list_calls(State(state): State<AppState>) -> Response {
    api_success(json!({ "calls": state.repository.list_calls() })).into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Audio
// ─────────────────────────────────────────────────────────────────────────────

/// Resolves a fallback recording `<uploads_dir>/<call_id>_*` for a call.
///
/// WAV beats MP3 beats anything else; ties break on file name.
fn resolve_fallback_recording(uploads_dir: &FsPath, call_id: &str) -> Option<PathBuf> {
    let prefix = format!("{}_", call_id);
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(uploads_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix))
        })
        .collect();
    let rank = |path: &FsPath| match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("wav") => 0,
        Some("mp3") => 1,
        _ => 2,
    };
    candidates.sort_by(|a, b| rank(a).cmp(&rank(b)).then(a.cmp(b)));
    candidates.into_iter().next()
}

fn recording_content_type(path: &FsPath) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        Some("m4a") => "audio/mp4",
        _ => "application/octet-stream",
    }
}

async fn call_audio(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
    Query(query): Query<AudioQuery>,
) -> CallwatchResult<Response> {
    if let Some(wav) = state.audio.render_wav(&call_id) {
        return Ok((
            [
                (header::CONTENT_TYPE, "audio/wav".to_string()),
                (header::CONTENT_LENGTH, wav.len().to_string()),
                (header::CACHE_CONTROL, "no-cache".to_string()),
            ],
            wav,
        )
            .into_response());
    }

    if query.fallback == Some(1) {
        if let Some(path) = resolve_fallback_recording(&state.config.uploads_dir, &call_id) {
            let body = tokio::fs::read(&path).await?;
            log::info!(
                "[Audio] Serving fallback recording for {}: {}",
                call_id,
                path.display()
            );
            return Ok((
                [
                    (
                        header::CONTENT_TYPE,
                        recording_content_type(&path).to_string(),
                    ),
                    (header::CONTENT_LENGTH, body.len().to_string()),
                ],
                body,
            )
                .into_response());
        }
    }

    Err(CallwatchError::NotFound(format!(
        "no audio for call {}",
        call_id
    )))
}

async fn call_audio_meta(
    State(state): State<AppState>,
    Path(call_id): Path<String>,
) -> Response {
    let snapshot = state.audio.snapshot(&call_id);
    let fallback = resolve_fallback_recording(&state.config.uploads_dir, &call_id);
    let source = if snapshot.available {
        Some("live")
    } else if fallback.is_some() {
        Some("fallback")
    } else {
        None
    };
    api_success(json!({
        "call_id": call_id,
        "audio": snapshot,
        "source": source,
        "fallback_available": fallback.is_some(),
    }))
    .into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Alerts
// ─────────────────────────────────────────────────────────────────────────────

async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertListQuery>,
) -> Response {
    let alerts = state.repository.recent_alerts(
        query.call_id.as_deref(),
        is_truthy(query.open_only.as_deref()),
        query.limit.unwrap_or(50).min(500),
    );
    api_success(json!({ "alerts": alerts })).into_response()
}

async fn ack_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<i64>,
) -> CallwatchResult<Response> {
    let alert = state.ingest.ack_alert(alert_id)?;
    Ok(api_success(json!({ "ok": true, "alert": alert })).into_response())
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker Health
// ─────────────────────────────────────────────────────────────────────────────

fn health_response(path: PathBuf, stale_after_seconds: u64) -> CallwatchResult<Response> {
    // Unhealthy workers still answer 200 with healthy=false; only an
    // unreadable status file is a server error.
    let report = read_health(&path, stale_after_seconds, now_millis())
        .map_err(|e| CallwatchError::Internal(format!("status file unreadable: {}", e)))?;
    Ok((StatusCode::OK, Json(report)).into_response())
}

async fn connector_health(State(state): State<AppState>) -> CallwatchResult<Response> {
    health_response(
        state.config.connector_status_path(),
        state.config.connector_health_stale_seconds,
    )
}

async fn audiohook_health(State(state): State<AppState>) -> CallwatchResult<Response> {
    health_response(
        state.config.audiohook_status_path(),
        state.config.audiohook_health_stale_seconds,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_check_accepts_either_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-cloud-token", "secret".parse().unwrap());
        assert!(require_ingest_token(&headers, "secret").is_ok());

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer secret".parse().unwrap());
        assert!(require_ingest_token(&headers, "secret").is_ok());
    }

    #[test]
    fn token_check_rejects_wrong_or_missing() {
        let headers = HeaderMap::new();
        assert!(require_ingest_token(&headers, "secret").is_err());

        let mut headers = HeaderMap::new();
        headers.insert("x-cloud-token", "wrong".parse().unwrap());
        assert!(require_ingest_token(&headers, "secret").is_err());
    }

    #[test]
    fn token_check_is_noop_when_unconfigured() {
        let headers = HeaderMap::new();
        assert!(require_ingest_token(&headers, "").is_ok());
    }

    #[test]
    fn truthy_query_values() {
        assert!(is_truthy(Some("1")));
        assert!(is_truthy(Some("true")));
        assert!(is_truthy(Some("YES")));
        assert!(!is_truthy(Some("0")));
        assert!(!is_truthy(Some("false")));
        assert!(!is_truthy(None));
    }

    #[test]
    fn fallback_resolver_prefers_wav() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("RT-1_recording.mp3"), b"mp3").unwrap();
        std::fs::write(dir.path().join("RT-1_recording.wav"), b"wav").unwrap();
        std::fs::write(dir.path().join("RT-2_other.wav"), b"wav").unwrap();

        let resolved = resolve_fallback_recording(dir.path(), "RT-1").unwrap();
        assert!(resolved.to_string_lossy().ends_with("RT-1_recording.wav"));
    }

    #[test]
    fn fallback_resolver_handles_missing_dir() {
        assert!(resolve_fallback_recording(FsPath::new("/nonexistent"), "RT-1").is_none());
    }
}
