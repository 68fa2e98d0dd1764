//! AudioHook media listener worker.
//!
//! Terminates the provider's dual-channel audio websocket. Control messages
//! negotiate media and drive the session lifecycle; binary frames are
//! decoded to S16LE, deinterleaved into per-speaker buffers, and flushed to
//! the audio ingest endpoint on a cadence. A bounded channel separates the
//! read loop from the forwarder so a stalled upstream shows up as buffer
//! growth here, not as websocket backpressure at the provider.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use base64::prelude::*;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::audiohook::protocol::{
    select_media, EgressMessage, IngressMessage, MediaOffer, OpenedParameters,
};
use crate::codec::{self, AudioEncoding};
use crate::config::AudioHookConfig;
use crate::error::{CallwatchError, CallwatchResult};
use crate::forward::Forwarder;
use crate::health::{StatusWriter, WorkerState};
use crate::model::Speaker;

/// Close code sent when a connection's buffers overflow.
const OVERLOAD_CLOSE_CODE: u16 = 1008;

/// Capacity of the per-connection flush queue.
const FLUSH_QUEUE_CAPACITY: usize = 16;

/// Status file heartbeat cadence.
const STATUS_HEARTBEAT: Duration = Duration::from_secs(30);

/// One payload bound for the ingest API.
enum FlushJob {
    Audio(Value),
    Event(Value),
}

/// Shared context for all websocket connections.
struct ListenerContext {
    config: AudioHookConfig,
    status: Arc<StatusWriter>,
    http: reqwest::Client,
    cancel: CancellationToken,
    dry_run: bool,
}

/// Long-running AudioHook websocket server.
pub struct AudioHookListener {
    context: Arc<ListenerContext>,
}

impl AudioHookListener {
    /// Builds the listener from validated configuration.
    pub fn new(config: AudioHookConfig, dry_run: bool) -> CallwatchResult<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CallwatchError::Configuration(e.to_string()))?;
        let status = Arc::new(StatusWriter::new(config.status_path.clone()));
        Ok(Self {
            context: Arc::new(ListenerContext {
                config,
                status,
                http,
                cancel: CancellationToken::new(),
                dry_run,
            }),
        })
    }

    /// Serves until the cancellation token fires.
    pub async fn run(&self, cancel: CancellationToken) -> CallwatchResult<()> {
        let ctx = Arc::clone(&self.context);
        ctx.status.set_state(WorkerState::Connecting);

        let addr = format!("{}:{}", ctx.config.host, ctx.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| CallwatchError::Configuration(format!("bind {} failed: {}", addr, e)))?;

        let app = Router::new()
            .route(&ctx.config.path, get(upgrade_handler))
            .with_state(Arc::clone(&ctx));

        ctx.status.set_state(WorkerState::Running);
        log::info!(
            "[AudioHook] Listening on ws://{}{}",
            addr,
            ctx.config.path
        );

        // Propagate process shutdown to every connection task.
        let conn_cancel = ctx.cancel.clone();
        let outer_cancel = cancel.clone();
        let heartbeat_status = Arc::clone(&ctx.status);
        let heartbeat = tokio::spawn(async move {
            let mut tick = interval(STATUS_HEARTBEAT);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = outer_cancel.cancelled() => break,
                    _ = tick.tick() => heartbeat_status.heartbeat(),
                }
            }
        });

        let shutdown = cancel.clone();
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                conn_cancel.cancel();
            })
            .await
            .map_err(|e| CallwatchError::Internal(e.to_string()));

        heartbeat.abort();
        self.context.status.set_state(WorkerState::Stopped);
        log::info!("[AudioHook] Listener stopped");
        result
    }
}

async fn upgrade_handler(
    State(ctx): State<Arc<ListenerContext>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, ctx))
}

/// Negotiated media and per-speaker buffering for one connection.
struct Session {
    call_id: String,
    encoding: AudioEncoding,
    sample_rate: u32,
    /// Channels in the negotiated frame layout (1 or 2).
    wire_channels: usize,
    agent: SpeakerBuffer,
    customer: SpeakerBuffer,
}

struct SpeakerBuffer {
    speaker: Speaker,
    pcm: Vec<u8>,
    last_flush: Instant,
}

impl SpeakerBuffer {
    fn new(speaker: Speaker) -> Self {
        Self {
            speaker,
            pcm: Vec::new(),
            last_flush: Instant::now(),
        }
    }

    fn duration_ms(&self, sample_rate: u32) -> u64 {
        if sample_rate == 0 {
            return 0;
        }
        (self.pcm.len() as u64 * 1000) / (sample_rate as u64 * 2)
    }
}

impl Session {
    fn new(call_id: String, offer: &MediaOffer) -> Self {
        Self {
            call_id,
            // select_media() only accepts offers with a decodable format.
            encoding: offer.encoding().unwrap_or(AudioEncoding::Pcmu),
            sample_rate: offer.rate,
            wire_channels: offer.channels.len().clamp(1, 2),
            agent: SpeakerBuffer::new(Speaker::Agent),
            customer: SpeakerBuffer::new(Speaker::Customer),
        }
    }

    /// Decodes one binary frame and routes samples to speaker buffers.
    ///
    /// Dual-channel frames carry the agent on the left (channel 0) and the
    /// customer on the right (channel 1); mono goes to the customer side.
    fn ingest_frame(&mut self, payload: &[u8]) -> Result<(), codec::DecodeError> {
        let pcm = codec::decode(self.encoding, payload)?;
        if self.wire_channels == 2 {
            for frame in pcm.chunks_exact(4) {
                self.agent.pcm.extend_from_slice(&frame[0..2]);
                self.customer.pcm.extend_from_slice(&frame[2..4]);
            }
        } else {
            self.customer.pcm.extend_from_slice(&pcm);
        }
        Ok(())
    }

    fn buffers_mut(&mut self) -> [&mut SpeakerBuffer; 2] {
        [&mut self.agent, &mut self.customer]
    }
}

/// Drives one websocket connection to `closed`.
async fn handle_connection(mut socket: WebSocket, ctx: Arc<ListenerContext>) {
    let conn_id = uuid::Uuid::new_v4();
    ctx.status.update(|s| s.active_connections += 1);
    log::info!("[AudioHook] Connection accepted: conn={}", conn_id);

    let (job_tx, job_rx) = mpsc::channel::<FlushJob>(FLUSH_QUEUE_CAPACITY);
    let forward_task = spawn_forwarder(Arc::clone(&ctx), job_rx);

    let mut session: Option<Session> = None;
    let mut overloaded = false;

    let mut flush_tick = interval(Duration::from_millis(ctx.config.flush_interval_ms));
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // 4x the max chunk duration, in bytes of mono S16LE per speaker.
    let cap_bytes = |sample_rate: u32| -> usize {
        (4 * ctx.config.max_chunk_duration_ms as usize * sample_rate as usize * 2) / 1000
    };

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                // Process shutdown: flush what we have and leave cleanly.
                if let Some(session) = session.as_mut() {
                    flush_all(session, &job_tx, &ctx, true).await;
                }
                let _ = socket
                    .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                        code: 1001,
                        reason: "shutting down".into(),
                    })))
                    .await;
                break;
            }

            _ = flush_tick.tick() => {
                if let Some(session) = session.as_mut() {
                    let sample_rate = session.sample_rate;
                    let call_id = session.call_id.clone();
                    let min_ms = ctx.config.min_chunk_duration_ms;
                    let interval_ms = ctx.config.flush_interval_ms;
                    for buffer in session.buffers_mut() {
                        let due = buffer.duration_ms(sample_rate) >= min_ms
                            && buffer.last_flush.elapsed()
                                >= Duration::from_millis(interval_ms);
                        if due
                            && !flush_buffer(buffer, &call_id, sample_rate, &job_tx, &ctx, false)
                                .await
                        {
                            overloaded = true;
                        }
                    }
                }
                if overloaded {
                    close_overloaded(&mut socket).await;
                    break;
                }
            }

            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else {
                    log::info!("[AudioHook] Connection closed by peer");
                    break;
                };
                match message {
                    Message::Text(text) => {
                        match handle_control(&text, &mut session, &mut socket, &job_tx, &ctx).await {
                            ControlFlow::Continue => {}
                            ControlFlow::Closed => break,
                        }
                    }
                    Message::Binary(payload) => {
                        let Some(session) = session.as_mut() else {
                            log::warn!("[AudioHook] Binary frame before open, dropping");
                            ctx.status.bump(|s| s.errors += 1);
                            continue;
                        };
                        if let Err(e) = session.ingest_frame(&payload) {
                            log::warn!("[AudioHook] Dropping undecodable frame: {}", e);
                            ctx.status.bump(|s| s.errors += 1);
                            continue;
                        }

                        // Hard cap: forwarding has stalled if a speaker
                        // buffer reaches 4x the max chunk duration.
                        let cap = cap_bytes(session.sample_rate);
                        if session.agent.pcm.len() > cap || session.customer.pcm.len() > cap {
                            close_overloaded(&mut socket).await;
                            break;
                        }

                        // Max-duration flush is immediate, independent of the
                        // interval gate.
                        let sample_rate = session.sample_rate;
                        let call_id = session.call_id.clone();
                        let max_ms = ctx.config.max_chunk_duration_ms;
                        for buffer in session.buffers_mut() {
                            if buffer.duration_ms(sample_rate) >= max_ms
                                && !flush_buffer(
                                    buffer, &call_id, sample_rate, &job_tx, &ctx, false,
                                )
                                .await
                            {
                                overloaded = true;
                            }
                        }
                        if overloaded {
                            close_overloaded(&mut socket).await;
                            break;
                        }
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Close(_) => {
                        log::info!("[AudioHook] Close frame received");
                        break;
                    }
                }
            }
        }
    }

    // Teardown: remaining audio is flushed by the close path above; here we
    // just release the forwarder and the connection slot.
    drop(job_tx);
    let _ = forward_task.await;
    ctx.status.update(|s| s.active_connections = s.active_connections.saturating_sub(1));
    log::info!("[AudioHook] Connection finished: conn={}", conn_id);
}

enum ControlFlow {
    Continue,
    Closed,
}

/// Handles one JSON control message.
async fn handle_control(
    text: &str,
    session: &mut Option<Session>,
    socket: &mut WebSocket,
    job_tx: &mpsc::Sender<FlushJob>,
    ctx: &Arc<ListenerContext>,
) -> ControlFlow {
    let message: IngressMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            log::warn!("[AudioHook] Dropping malformed control message: {}", e);
            ctx.status.bump(|s| s.errors += 1);
            return ControlFlow::Continue;
        }
    };

    match message {
        IngressMessage::Open { id, seq, parameters } => {
            let Some(offer) = select_media(&parameters.media) else {
                log::warn!(
                    "[AudioHook] No acceptable media in open for {}, closing",
                    parameters.conversation_id
                );
                let _ = socket
                    .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                        code: 1003,
                        reason: "no acceptable media".into(),
                    })))
                    .await;
                return ControlFlow::Closed;
            };
            log::info!(
                "[AudioHook] Session open: call={} media={}@{} channels={}",
                parameters.conversation_id,
                offer.format,
                offer.rate,
                offer.channels.len()
            );
            let accepted = offer.clone();
            *session = Some(Session::new(parameters.conversation_id.clone(), offer));
            send_egress(
                socket,
                &EgressMessage::Opened {
                    id,
                    seq: seq + 1,
                    parameters: OpenedParameters {
                        media: vec![accepted],
                        start_paused: false,
                    },
                },
            )
            .await;
            ControlFlow::Continue
        }

        IngressMessage::Ping { id, seq } => {
            send_egress(socket, &EgressMessage::Pong { id, seq: seq + 1 }).await;
            ControlFlow::Continue
        }

        IngressMessage::Event { parameters, .. } => {
            if let Some(session) = session.as_ref() {
                let payload = json!({
                    "provider": "audiohook",
                    "call_id": session.call_id,
                    "event_type": "custom",
                    "metadata": {"audiohook": parameters},
                });
                enqueue(job_tx, FlushJob::Event(payload), ctx).await;
            } else {
                log::warn!("[AudioHook] Event before open, dropping");
            }
            ControlFlow::Continue
        }

        IngressMessage::Close { id, seq, .. } => {
            if let Some(session) = session.as_mut() {
                flush_all(session, job_tx, ctx, true).await;
                let payload = json!({
                    "provider": "audiohook",
                    "call_id": session.call_id,
                    "event_type": "end",
                });
                enqueue(job_tx, FlushJob::Event(payload), ctx).await;
            }
            send_egress(socket, &EgressMessage::Closed { id, seq: seq + 1 }).await;
            ControlFlow::Closed
        }
    }
}

/// Flushes both speaker buffers unconditionally (close and shutdown paths).
async fn flush_all(
    session: &mut Session,
    job_tx: &mpsc::Sender<FlushJob>,
    ctx: &Arc<ListenerContext>,
    force: bool,
) {
    let sample_rate = session.sample_rate;
    let call_id = session.call_id.clone();
    for buffer in session.buffers_mut() {
        if force || !buffer.pcm.is_empty() {
            flush_buffer(buffer, &call_id, sample_rate, job_tx, ctx, true).await;
        }
    }
}

/// Drains one speaker buffer into the flush queue.
///
/// Returns `false` when the queue is full and the caller should treat the
/// connection as overloaded. `blocking` waits for space instead (used on
/// close, where dropping the tail chunk would lose audio).
async fn flush_buffer(
    buffer: &mut SpeakerBuffer,
    call_id: &str,
    sample_rate: u32,
    job_tx: &mpsc::Sender<FlushJob>,
    ctx: &Arc<ListenerContext>,
    blocking: bool,
) -> bool {
    if buffer.pcm.is_empty() {
        buffer.last_flush = Instant::now();
        return true;
    }
    let pcm = std::mem::take(&mut buffer.pcm);
    buffer.last_flush = Instant::now();

    let payload = json!({
        "call_id": call_id,
        "audio_b64": BASE64_STANDARD.encode(&pcm),
        "audio_encoding": "pcm_s16le",
        "sample_rate": sample_rate,
        "channels": 1,
        "speaker": buffer.speaker,
        "metadata": {"source": "audiohook"},
    });

    if blocking {
        enqueue(job_tx, FlushJob::Audio(payload), ctx).await;
        true
    } else {
        match job_tx.try_send(FlushJob::Audio(payload)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::error!(
                    "[AudioHook] Flush queue full for {}, forwarding stalled",
                    call_id
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => true,
        }
    }
}

async fn enqueue(job_tx: &mpsc::Sender<FlushJob>, job: FlushJob, ctx: &Arc<ListenerContext>) {
    if ctx.dry_run {
        let what = match &job {
            FlushJob::Audio(p) => format!(
                "audio chunk ({} b64 chars)",
                p["audio_b64"].as_str().map(str::len).unwrap_or(0)
            ),
            FlushJob::Event(p) => format!("event {}", p["event_type"]),
        };
        log::info!("[AudioHook] (dry-run) would forward {}", what);
        return;
    }
    let _ = job_tx.send(job).await;
}

/// Consumes flush jobs and delivers them with retry.
fn spawn_forwarder(
    ctx: Arc<ListenerContext>,
    mut job_rx: mpsc::Receiver<FlushJob>,
) -> tokio::task::JoinHandle<()> {
    let audio_forwarder = Forwarder::new(
        ctx.http.clone(),
        ctx.config.target_audio_ingest_url.clone(),
        ctx.config.ingest_token.clone(),
        ctx.config.retry,
    );
    let event_forwarder = Forwarder::new(
        ctx.http.clone(),
        ctx.config.target_event_ingest_url.clone(),
        ctx.config.ingest_token.clone(),
        ctx.config.retry,
    );
    tokio::spawn(async move {
        while let Some(job) = job_rx.recv().await {
            let result = match &job {
                FlushJob::Audio(payload) => audio_forwarder.send(payload).await,
                FlushJob::Event(payload) => event_forwarder.send(payload).await,
            };
            match (result, &job) {
                (Ok(()), FlushJob::Audio(_)) => {
                    ctx.status.bump(|s| s.forwarded_chunks += 1);
                }
                (Ok(()), FlushJob::Event(_)) => {
                    ctx.status.bump(|s| s.forwarded_events += 1);
                }
                (Err(e), _) => {
                    log::error!("[AudioHook] Forward failed after retries: {}", e);
                    ctx.status.bump(|s| s.errors += 1);
                }
            }
        }
    })
}

async fn send_egress(socket: &mut WebSocket, message: &EgressMessage) {
    if let Ok(text) = serde_json::to_string(message) {
        let _ = socket.send(Message::Text(text.into())).await;
    }
}

async fn close_overloaded(socket: &mut WebSocket) {
    log::error!("[AudioHook] Buffer overload, closing connection");
    let _ = socket
        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
            code: OVERLOAD_CLOSE_CODE,
            reason: "audio buffer overload".into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_session() -> Session {
        Session::new(
            "conv-1".into(),
            &MediaOffer {
                kind: "audio".into(),
                format: "L16".into(),
                rate: 16_000,
                channels: vec!["external".into(), "internal".into()],
            },
        )
    }

    #[test]
    fn stereo_frames_deinterleave_left_agent_right_customer() {
        let mut session = stereo_session();
        // Two stereo samples, big-endian L16: L=0x0102, R=0x0304, then
        // L=0x0506, R=0x0708.
        let frame = [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        session.ingest_frame(&frame).unwrap();
        // Little-endian output per speaker.
        assert_eq!(session.agent.pcm, vec![0x02, 0x01, 0x06, 0x05]);
        assert_eq!(session.customer.pcm, vec![0x04, 0x03, 0x08, 0x07]);
    }

    #[test]
    fn mono_frames_route_to_customer() {
        let mut session = Session::new(
            "conv-1".into(),
            &MediaOffer {
                kind: "audio".into(),
                format: "PCMU".into(),
                rate: 8000,
                channels: vec!["external".into()],
            },
        );
        session.ingest_frame(&[0xFFu8; 160]).unwrap();
        assert!(session.agent.pcm.is_empty());
        assert_eq!(session.customer.pcm.len(), 320);
    }

    #[test]
    fn buffer_duration_math() {
        let mut buffer = SpeakerBuffer::new(Speaker::Agent);
        // 300ms of 8kHz mono S16LE = 4800 bytes.
        buffer.pcm = vec![0u8; 4800];
        assert_eq!(buffer.duration_ms(8000), 300);
        assert_eq!(buffer.duration_ms(16_000), 150);
    }
}
