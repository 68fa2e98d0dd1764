//! Genesys notification connector worker.
//!
//! Maintains an authenticated notification-channel subscription and pumps
//! normalized events into the ingest API:
//!
//! ```text
//! starting → connecting → authenticated → channel_created → subscribed → running
//!   ↘ (any step fails) → degraded → (backoff) → connecting
//! running → (WS close / error) → degraded → connecting
//! ```
//!
//! Failures never kill the worker: every session error degrades, backs off,
//! and reconnects until the cancellation token fires.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::config::GenesysConfig;
use crate::error::{CallwatchError, CallwatchResult};
use crate::forward::Forwarder;
use crate::genesys::normalize::{normalize_frame, NormalizedFrame};
use crate::genesys::oauth::TokenSource;
use crate::genesys::topics::TopicBuilder;
use crate::health::{StatusWriter, WorkerState};

/// WebSocket read timeout; the provider heartbeats every 30 s.
const WS_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Status file heartbeat cadence.
const STATUS_HEARTBEAT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ChannelResponse {
    id: String,
    #[serde(rename = "connectUri")]
    connect_uri: String,
}

/// Long-running notification connector.
pub struct GenesysConnector {
    config: GenesysConfig,
    http: reqwest::Client,
    tokens: TokenSource,
    forwarder: Forwarder,
    topic_builder: Option<TopicBuilder>,
    status: StatusWriter,
    dry_run: bool,
}

impl GenesysConnector {
    /// Builds the connector from validated configuration.
    pub fn new(config: GenesysConfig, dry_run: bool) -> CallwatchResult<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_seconds))
            .build()
            .map_err(|e| CallwatchError::Configuration(e.to_string()))?;

        let tokens = TokenSource::new(
            http.clone(),
            config.login_base_url.clone(),
            config.client_id.clone(),
            config.client_secret.clone(),
        );
        let forwarder = Forwarder::new(
            http.clone(),
            config.target_ingest_url.clone(),
            config.ingest_token.clone(),
            config.retry,
        );
        let topic_builder = config.topic_builder.enabled.then(|| {
            TopicBuilder::new(
                http.clone(),
                config.api_base_url.clone(),
                config.topic_builder.clone(),
            )
        });
        let status = StatusWriter::new(config.status_path.clone());

        Ok(Self {
            config,
            http,
            tokens,
            forwarder,
            topic_builder,
            status,
            dry_run,
        })
    }

    /// Runs until the cancellation token fires.
    pub async fn run(&self, cancel: CancellationToken) {
        if self.dry_run {
            log::info!("[Genesys] Running in dry-run mode: events observed, not forwarded");
        }
        loop {
            match self.session(&cancel).await {
                Ok(()) => break,
                Err(e) => {
                    self.status
                        .record_error(WorkerState::Degraded, &format!("{}: {}", e.code(), e));
                    log::warn!("[Genesys] Session failed, reconnecting: {}", e);
                    if let CallwatchError::Auth(_) = e {
                        self.tokens.invalidate();
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(
                            self.config.reconnect_delay_seconds,
                        )) => {}
                    }
                }
            }
        }
        self.status.set_state(WorkerState::Stopped);
        log::info!("[Genesys] Connector stopped");
    }

    /// One connect-subscribe-consume session. `Ok` means cancellation.
    async fn session(&self, cancel: &CancellationToken) -> CallwatchResult<()> {
        self.status.set_state(WorkerState::Connecting);
        let bearer = self.tokens.bearer().await?;
        self.status.set_state(WorkerState::Authenticated);

        let channel = self.create_channel(&bearer).await?;
        self.status.set_state(WorkerState::ChannelCreated);

        let topics = self.gather_topics(&bearer).await?;
        if topics.is_empty() {
            return Err(CallwatchError::Configuration(
                "no subscription topics: set GENESYS_SUBSCRIPTION_TOPICS or enable the topic builder"
                    .into(),
            ));
        }
        self.subscribe_topics(&bearer, &channel.id, &topics).await?;
        self.status.update(|s| {
            s.state = WorkerState::Subscribed;
            s.topics_count = Some(topics.len());
        });

        let (mut ws, _) = connect_async(channel.connect_uri.as_str())
            .await
            .map_err(|e| CallwatchError::Upstream(format!("websocket connect failed: {}", e)))?;
        self.status.set_state(WorkerState::Running);
        log::info!(
            "[Genesys] Consuming channel {} with {} topic(s)",
            channel.id,
            topics.len()
        );

        let mut heartbeat = tokio::time::interval(STATUS_HEARTBEAT);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let refresh_period = Duration::from_secs(self.config.topic_builder.refresh_seconds.max(1));
        let mut refresh = tokio::time::interval(refresh_period);
        refresh.reset(); // skip the immediate first tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = ws.close(None).await;
                    return Ok(());
                }

                _ = heartbeat.tick() => {
                    self.status.heartbeat();
                }

                _ = refresh.tick(), if self.topic_builder.is_some() => {
                    // Periodic re-discovery; failures degrade the session so
                    // the normal reconnect path rebuilds everything.
                    let bearer = self.tokens.bearer().await?;
                    let topics = self.gather_topics(&bearer).await?;
                    if !topics.is_empty() {
                        self.subscribe_topics(&bearer, &channel.id, &topics).await?;
                        self.status.update(|s| s.topics_count = Some(topics.len()));
                        log::info!("[Genesys] Refreshed subscriptions: {} topic(s)", topics.len());
                    }
                }

                frame = tokio::time::timeout(WS_READ_TIMEOUT, ws.next()) => {
                    match frame {
                        Err(_) => {
                            return Err(CallwatchError::Upstream(
                                "websocket read timed out".into(),
                            ));
                        }
                        Ok(None) => {
                            return Err(CallwatchError::Upstream(
                                "websocket closed by provider".into(),
                            ));
                        }
                        Ok(Some(Err(e))) => {
                            return Err(CallwatchError::Upstream(format!(
                                "websocket error: {}",
                                e
                            )));
                        }
                        Ok(Some(Ok(Message::Ping(data)))) => {
                            let _ = ws.send(Message::Pong(data)).await;
                        }
                        Ok(Some(Ok(Message::Close(_)))) => {
                            return Err(CallwatchError::Upstream(
                                "websocket close frame received".into(),
                            ));
                        }
                        Ok(Some(Ok(Message::Text(text)))) => {
                            self.handle_text(&text).await;
                        }
                        Ok(Some(Ok(_))) => {} // binary/pong frames are not part of the protocol
                    }
                }
            }
        }
    }

    /// Parses and dispatches one text frame.
    ///
    /// Malformed frames are logged, counted, and dropped; the session stays up.
    async fn handle_text(&self, text: &str) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("[Genesys] Dropping malformed frame: {}", e);
                self.status.bump(|s| s.errors += 1);
                return;
            }
        };

        match normalize_frame(&frame) {
            NormalizedFrame::KeepAlive => {
                log::debug!("[Genesys] Channel heartbeat");
                self.status.heartbeat();
            }
            NormalizedFrame::Ignored => {
                log::debug!("[Genesys] Ignoring frame without usable payload");
            }
            NormalizedFrame::Event(payload) => {
                if self.dry_run {
                    log::info!("[Genesys] (dry-run) normalized event: {}", payload);
                    return;
                }
                match self.forwarder.send(&payload).await {
                    Ok(()) => {
                        self.status.bump(|s| s.forwarded_events += 1);
                    }
                    Err(e) => {
                        // Retry budget exhausted: count and keep consuming so
                        // one bad delivery never drops the channel.
                        log::error!("[Genesys] Forward failed after retries: {}", e);
                        self.status.bump(|s| s.errors += 1);
                    }
                }
            }
        }
    }

    async fn create_channel(&self, bearer: &str) -> CallwatchResult<ChannelResponse> {
        let url = format!("{}/api/v2/notifications/channels", self.config.api_base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(bearer)
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| CallwatchError::Upstream(format!("channel create failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 401 {
            return Err(CallwatchError::Auth("channel create rejected".into()));
        }
        if !status.is_success() {
            return Err(CallwatchError::Upstream(format!(
                "channel create returned HTTP {}",
                status
            )));
        }
        response
            .json()
            .await
            .map_err(|e| CallwatchError::Protocol(format!("malformed channel response: {}", e)))
    }

    async fn subscribe_topics(
        &self,
        bearer: &str,
        channel_id: &str,
        topics: &[String],
    ) -> CallwatchResult<()> {
        let url = format!(
            "{}/api/v2/notifications/channels/{}/subscriptions",
            self.config.api_base_url, channel_id
        );
        let body: Vec<Value> = topics.iter().map(|t| json!({ "id": t })).collect();
        let response = self
            .http
            .put(&url)
            .bearer_auth(bearer)
            .json(&body)
            .send()
            .await
            .map_err(|e| CallwatchError::Upstream(format!("subscribe failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 401 {
            return Err(CallwatchError::Auth("subscribe rejected".into()));
        }
        if !status.is_success() {
            return Err(CallwatchError::Upstream(format!(
                "subscribe returned HTTP {}",
                status
            )));
        }
        Ok(())
    }

    /// Union of manually configured topics and discovered ones.
    async fn gather_topics(&self, bearer: &str) -> CallwatchResult<Vec<String>> {
        let mut topics = self.config.subscription_topics.clone();
        if let Some(builder) = &self.topic_builder {
            let discovered = builder.build(bearer).await?;
            for topic in discovered {
                if !topics.contains(&topic) {
                    topics.push(topic);
                }
            }
        }
        Ok(topics)
    }
}

/// Runs the standalone topic builder once and returns the topics.
///
/// Backs the `build-genesys-topics` CLI command.
pub async fn build_topics_once(config: &GenesysConfig) -> CallwatchResult<Vec<String>> {
    config.validate()?;
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_seconds))
        .build()
        .map_err(|e| CallwatchError::Configuration(e.to_string()))?;
    let tokens = TokenSource::new(
        http.clone(),
        config.login_base_url.clone(),
        config.client_id.clone(),
        config.client_secret.clone(),
    );
    let builder = TopicBuilder::new(
        http,
        config.api_base_url.clone(),
        config.topic_builder.clone(),
    );
    let bearer = tokens.bearer().await?;
    let mut topics = config.subscription_topics.clone();
    for topic in builder.build(&bearer).await? {
        if !topics.contains(&topic) {
            topics.push(topic);
        }
    }
    Ok(topics)
}
