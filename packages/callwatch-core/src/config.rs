//! Typed configuration for the realtime plane.
//!
//! All knobs are environment-driven and loaded once at startup into immutable
//! structs ([`RealtimeConfig`], [`GenesysConfig`], [`AudioHookConfig`]).
//! Defaults match the documented interface table; validation failures surface
//! as [`CallwatchError::Configuration`](crate::error::CallwatchError).

use std::path::PathBuf;

use serde::Serialize;

use crate::error::{CallwatchError, CallwatchResult};

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_list(name: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(name) {
        Ok(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}

/// Default escalation phrases for the keyword rule.
const DEFAULT_KEYWORD_TRIGGERS: &[&str] = &[
    "supervisor",
    "manager",
    "escalate",
    "complaint",
    "lawyer",
    "refund",
    "cancel my account",
];

/// Configuration for the ingest API, alert evaluator, and audio store.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeConfig {
    /// Host to bind the HTTP/SSE server to.
    pub bind_host: String,
    /// Port to bind the HTTP/SSE server to.
    pub bind_port: u16,
    /// Shared bearer token required on ingest endpoints when non-empty.
    #[serde(skip_serializing)]
    pub ingest_token: String,
    /// Sentiment at or below this fires `negative_sentiment`.
    pub negative_sentiment_threshold: f64,
    /// Post-update risk at or above this fires `high_risk`.
    pub high_risk_threshold: f64,
    /// Per-(call, type) alert suppression window in seconds.
    pub alert_cooldown_seconds: u64,
    /// Escalation phrases matched case-insensitively on word boundaries.
    pub keyword_triggers: Vec<String>,
    /// Rolling audio window size in seconds.
    pub audio_window_seconds: u32,
    /// Maximum decoded PCM bytes accepted per audio chunk.
    pub audio_max_chunk_bytes: usize,
    /// Directory for the rolling audio store's disk mirror.
    pub audio_dir: PathBuf,
    /// Directory scanned for fallback call recordings.
    pub uploads_dir: PathBuf,
    /// Directory for worker status files.
    pub runtime_dir: PathBuf,
    /// Staleness threshold for the connector health probe (seconds).
    pub connector_health_stale_seconds: u64,
    /// Staleness threshold for the audiohook health probe (seconds).
    pub audiohook_health_stale_seconds: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".into(),
            bind_port: 8000,
            ingest_token: String::new(),
            negative_sentiment_threshold: -0.45,
            high_risk_threshold: 0.72,
            alert_cooldown_seconds: 75,
            keyword_triggers: DEFAULT_KEYWORD_TRIGGERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            audio_window_seconds: 300,
            audio_max_chunk_bytes: 2_000_000,
            audio_dir: PathBuf::from("./data/realtime_audio"),
            uploads_dir: PathBuf::from("./data/uploads"),
            runtime_dir: PathBuf::from("./runtime"),
            connector_health_stale_seconds: 120,
            audiohook_health_stale_seconds: 120,
        }
    }
}

impl RealtimeConfig {
    /// Loads configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_host: env_string("REALTIME_BIND_HOST", &defaults.bind_host),
            bind_port: env_parse("REALTIME_BIND_PORT", defaults.bind_port),
            ingest_token: env_string("REALTIME_INGEST_TOKEN", ""),
            negative_sentiment_threshold: env_parse(
                "REALTIME_NEGATIVE_SENTIMENT_THRESHOLD",
                defaults.negative_sentiment_threshold,
            ),
            high_risk_threshold: env_parse(
                "REALTIME_HIGH_RISK_THRESHOLD",
                defaults.high_risk_threshold,
            ),
            alert_cooldown_seconds: env_parse(
                "REALTIME_ALERT_COOLDOWN_SECONDS",
                defaults.alert_cooldown_seconds,
            ),
            keyword_triggers: env_list(
                "REALTIME_SUPERVISOR_KEYWORD_TRIGGERS",
                DEFAULT_KEYWORD_TRIGGERS,
            ),
            audio_window_seconds: env_parse(
                "REALTIME_AUDIO_WINDOW_SECONDS",
                defaults.audio_window_seconds,
            ),
            audio_max_chunk_bytes: env_parse(
                "REALTIME_AUDIO_MAX_CHUNK_BYTES",
                defaults.audio_max_chunk_bytes,
            ),
            audio_dir: PathBuf::from(env_string(
                "REALTIME_AUDIO_DIR",
                &defaults.audio_dir.to_string_lossy(),
            )),
            uploads_dir: PathBuf::from(env_string(
                "REALTIME_UPLOADS_DIR",
                &defaults.uploads_dir.to_string_lossy(),
            )),
            runtime_dir: PathBuf::from(env_string(
                "REALTIME_RUNTIME_DIR",
                &defaults.runtime_dir.to_string_lossy(),
            )),
            connector_health_stale_seconds: env_parse(
                "GENESYS_CONNECTOR_HEALTH_STALE_SECONDS",
                defaults.connector_health_stale_seconds,
            ),
            audiohook_health_stale_seconds: env_parse(
                "GENESYS_AUDIOHOOK_HEALTH_STALE_SECONDS",
                defaults.audiohook_health_stale_seconds,
            ),
        }
    }

    /// Validates ranges that would otherwise cause silent misbehavior.
    pub fn validate(&self) -> CallwatchResult<()> {
        if self.audio_window_seconds == 0 {
            return Err(CallwatchError::Configuration(
                "REALTIME_AUDIO_WINDOW_SECONDS must be >= 1".into(),
            ));
        }
        if self.audio_max_chunk_bytes == 0 {
            return Err(CallwatchError::Configuration(
                "REALTIME_AUDIO_MAX_CHUNK_BYTES must be >= 1".into(),
            ));
        }
        if !(-1.0..=1.0).contains(&self.negative_sentiment_threshold) {
            return Err(CallwatchError::Configuration(
                "REALTIME_NEGATIVE_SENTIMENT_THRESHOLD must be within [-1, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.high_risk_threshold) {
            return Err(CallwatchError::Configuration(
                "REALTIME_HIGH_RISK_THRESHOLD must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }

    /// Path of the connector's status file.
    #[must_use]
    pub fn connector_status_path(&self) -> PathBuf {
        std::env::var("GENESYS_CONNECTOR_STATUS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| self.runtime_dir.join("genesys_connector_status.json"))
    }

    /// Path of the audiohook listener's status file.
    #[must_use]
    pub fn audiohook_status_path(&self) -> PathBuf {
        std::env::var("GENESYS_AUDIOHOOK_STATUS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| self.runtime_dir.join("genesys_audiohook_status.json"))
    }
}

/// Retry/backoff policy shared by the connector and listener forwarders.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RetryPolicy {
    /// Maximum delivery attempts before giving up on a payload.
    pub max_attempts: u32,
    /// Base backoff in seconds; doubled per attempt, jittered ±20%.
    pub backoff_seconds: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_seconds: 0.5,
        }
    }
}

/// Topic builder knobs for queue/user discovery.
#[derive(Debug, Clone, Serialize)]
pub struct TopicBuilderConfig {
    /// Whether the connector runs periodic topic discovery.
    pub enabled: bool,
    /// Re-discovery interval in seconds.
    pub refresh_seconds: u64,
    /// Substring filter applied to queue names (empty = all).
    pub queue_filter: String,
    /// Substring filter applied to user names (empty = all).
    pub user_filter: String,
    /// Page size for list calls.
    pub page_size: u32,
    /// Hard cap on emitted topics.
    pub max_topics: usize,
    /// Emit `v2.routing.queues.{id}.conversations` topics.
    pub include_queues: bool,
    /// Emit `v2.users.{id}.conversations` topics.
    pub include_users: bool,
}

impl Default for TopicBuilderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            refresh_seconds: 900,
            queue_filter: String::new(),
            user_filter: String::new(),
            page_size: 100,
            max_topics: 500,
            include_queues: true,
            include_users: false,
        }
    }
}

/// Configuration for the Genesys notification connector.
#[derive(Debug, Clone, Serialize)]
pub struct GenesysConfig {
    /// OAuth token endpoint base, e.g. `https://login.mypurecloud.com`.
    pub login_base_url: String,
    /// REST API base, e.g. `https://api.mypurecloud.com`.
    pub api_base_url: String,
    /// OAuth client id (client-credentials grant).
    #[serde(skip_serializing)]
    pub client_id: String,
    /// OAuth client secret.
    #[serde(skip_serializing)]
    pub client_secret: String,
    /// Manually configured subscription topics (union with discovered).
    pub subscription_topics: Vec<String>,
    /// Ingest endpoint normalized events are forwarded to.
    pub target_ingest_url: String,
    /// Token sent in `X-Cloud-Token` on forwarded payloads.
    #[serde(skip_serializing)]
    pub ingest_token: String,
    /// Timeout for provider HTTP calls, in seconds.
    pub http_timeout_seconds: u64,
    /// Forwarding retry policy.
    pub retry: RetryPolicy,
    /// Delay before reconnecting after a degraded transition, in seconds.
    pub reconnect_delay_seconds: u64,
    /// Topic builder configuration.
    pub topic_builder: TopicBuilderConfig,
    /// Status file location.
    pub status_path: PathBuf,
}

impl GenesysConfig {
    /// Loads connector configuration from the environment.
    pub fn from_env() -> Self {
        let runtime_dir = PathBuf::from(env_string("REALTIME_RUNTIME_DIR", "./runtime"));
        Self {
            login_base_url: env_string("GENESYS_LOGIN_BASE_URL", "https://login.mypurecloud.com"),
            api_base_url: env_string("GENESYS_API_BASE_URL", "https://api.mypurecloud.com"),
            client_id: env_string("GENESYS_CLIENT_ID", ""),
            client_secret: env_string("GENESYS_CLIENT_SECRET", ""),
            subscription_topics: env_list("GENESYS_SUBSCRIPTION_TOPICS", &[]),
            target_ingest_url: env_string(
                "GENESYS_TARGET_INGEST_URL",
                "http://127.0.0.1:8000/api/realtime/events",
            ),
            ingest_token: env_string("REALTIME_INGEST_TOKEN", ""),
            http_timeout_seconds: env_parse("GENESYS_HTTP_TIMEOUT_SECONDS", 10),
            retry: RetryPolicy {
                max_attempts: env_parse("GENESYS_RETRY_MAX_ATTEMPTS", 5),
                backoff_seconds: env_parse("GENESYS_RETRY_BACKOFF_SECONDS", 0.5),
            },
            reconnect_delay_seconds: env_parse("GENESYS_RECONNECT_DELAY_SECONDS", 5),
            topic_builder: TopicBuilderConfig {
                enabled: env_bool("GENESYS_TOPIC_BUILDER_ENABLED", false),
                refresh_seconds: env_parse("GENESYS_TOPIC_BUILDER_REFRESH_SECONDS", 900),
                queue_filter: env_string("GENESYS_TOPIC_BUILDER_QUEUE_FILTER", ""),
                user_filter: env_string("GENESYS_TOPIC_BUILDER_USER_FILTER", ""),
                page_size: env_parse("GENESYS_TOPIC_BUILDER_PAGE_SIZE", 100),
                max_topics: env_parse("GENESYS_TOPIC_BUILDER_MAX_TOPICS", 500),
                include_queues: env_bool("GENESYS_TOPIC_BUILDER_INCLUDE_QUEUES", true),
                include_users: env_bool("GENESYS_TOPIC_BUILDER_INCLUDE_USERS", false),
            },
            status_path: std::env::var("GENESYS_CONNECTOR_STATUS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| runtime_dir.join("genesys_connector_status.json")),
        }
    }

    /// Validates that credentials required for the OAuth exchange are present.
    pub fn validate(&self) -> CallwatchResult<()> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(CallwatchError::Configuration(
                "GENESYS_CLIENT_ID and GENESYS_CLIENT_SECRET are required".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(CallwatchError::Configuration(
                "GENESYS_RETRY_MAX_ATTEMPTS must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the AudioHook media listener.
#[derive(Debug, Clone, Serialize)]
pub struct AudioHookConfig {
    /// Host the listener binds to.
    pub host: String,
    /// Port the listener binds to.
    pub port: u16,
    /// WebSocket upgrade path.
    pub path: String,
    /// Minimum buffered audio before an interval flush, in milliseconds.
    pub min_chunk_duration_ms: u64,
    /// Cadence of interval flush checks, in milliseconds.
    pub flush_interval_ms: u64,
    /// Buffered duration that forces an immediate flush, in milliseconds.
    pub max_chunk_duration_ms: u64,
    /// Audio chunk ingest endpoint flushes are POSTed to.
    pub target_audio_ingest_url: String,
    /// Event ingest endpoint for `event` and synthetic `end` payloads.
    pub target_event_ingest_url: String,
    /// Token sent in `X-Cloud-Token` on forwarded payloads.
    #[serde(skip_serializing)]
    pub ingest_token: String,
    /// Forwarding retry policy.
    pub retry: RetryPolicy,
    /// Status file location.
    pub status_path: PathBuf,
}

impl AudioHookConfig {
    /// Loads listener configuration from the environment.
    pub fn from_env() -> Self {
        let runtime_dir = PathBuf::from(env_string("REALTIME_RUNTIME_DIR", "./runtime"));
        Self {
            host: env_string("GENESYS_AUDIOHOOK_HOST", "0.0.0.0"),
            port: env_parse("GENESYS_AUDIOHOOK_PORT", 8081),
            path: env_string("GENESYS_AUDIOHOOK_PATH", "/audiohook"),
            min_chunk_duration_ms: env_parse("GENESYS_AUDIOHOOK_MIN_CHUNK_DURATION_MS", 300),
            flush_interval_ms: env_parse("GENESYS_AUDIOHOOK_FLUSH_INTERVAL_MS", 750),
            max_chunk_duration_ms: env_parse("GENESYS_AUDIOHOOK_MAX_CHUNK_DURATION_MS", 2000),
            target_audio_ingest_url: env_string(
                "GENESYS_AUDIOHOOK_TARGET_AUDIO_INGEST_URL",
                "http://127.0.0.1:8000/api/realtime/audio/chunk",
            ),
            target_event_ingest_url: env_string(
                "GENESYS_AUDIOHOOK_TARGET_EVENT_INGEST_URL",
                "http://127.0.0.1:8000/api/realtime/events",
            ),
            ingest_token: env_string("REALTIME_INGEST_TOKEN", ""),
            retry: RetryPolicy {
                max_attempts: env_parse("GENESYS_AUDIOHOOK_RETRY_MAX_ATTEMPTS", 5),
                backoff_seconds: env_parse("GENESYS_AUDIOHOOK_RETRY_BACKOFF_SECONDS", 0.5),
            },
            status_path: std::env::var("GENESYS_AUDIOHOOK_STATUS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| runtime_dir.join("genesys_audiohook_status.json")),
        }
    }

    /// Validates flush-policy orderings that must hold for the buffer loop.
    pub fn validate(&self) -> CallwatchResult<()> {
        if self.max_chunk_duration_ms < self.min_chunk_duration_ms {
            return Err(CallwatchError::Configuration(
                "GENESYS_AUDIOHOOK_MAX_CHUNK_DURATION_MS must be >= min chunk duration".into(),
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(CallwatchError::Configuration(
                "GENESYS_AUDIOHOOK_FLUSH_INTERVAL_MS must be >= 1".into(),
            ));
        }
        Ok(())
    }
}
