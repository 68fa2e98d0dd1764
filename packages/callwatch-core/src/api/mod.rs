//! HTTP/SSE API layer.
//!
//! This module contains thin handlers that delegate to the ingest service
//! and shared stores. It provides router construction and server startup.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::alerts::AlertEvaluator;
use crate::audio::LiveAudioStore;
use crate::config::RealtimeConfig;
use crate::events::CallEventBus;
use crate::ingest::IngestService;
use crate::repository::RealtimeRepository;

pub mod http;
pub mod response;
pub mod sse;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to a TCP port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared application state for the API layer.
///
/// This is the one context struct threaded through handlers and workers;
/// all business logic lives in the services it holds.
#[derive(Clone)]
pub struct AppState {
    /// Store for calls, events, and alerts.
    pub repository: Arc<RealtimeRepository>,
    /// Rolling audio buffers.
    pub audio: Arc<LiveAudioStore>,
    /// Topic-per-call fan-out to SSE subscribers.
    pub bus: Arc<CallEventBus>,
    /// Ingest and alerting pipeline.
    pub ingest: Arc<IngestService>,
    /// Immutable runtime configuration.
    pub config: Arc<RealtimeConfig>,
    /// Signalled on process shutdown; SSE streams close with a final envelope.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wires all realtime services from configuration.
    pub fn new(config: RealtimeConfig) -> Self {
        let repository = Arc::new(RealtimeRepository::new());
        let audio = Arc::new(LiveAudioStore::new(
            config.audio_window_seconds,
            Some(config.audio_dir.clone()),
        ));
        let bus = Arc::new(CallEventBus::new());
        let evaluator = AlertEvaluator::from_config(&config);
        let ingest = Arc::new(IngestService::new(
            Arc::clone(&repository),
            Arc::clone(&audio),
            Arc::clone(&bus),
            evaluator,
        ));
        Self {
            repository,
            audio,
            bus,
            ingest,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Starts the HTTP server on the configured bind address.
///
/// Serves until the state's shutdown token fires, then drains gracefully.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let addr = format!("{}:{}", state.config.bind_host, state.config.bind_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Server listening on http://{}", addr);

    let shutdown = state.shutdown.clone();
    let app = http::create_router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
