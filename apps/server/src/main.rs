//! Callwatch Server - realtime call telemetry API and workers.
//!
//! One binary, four long-running commands: the ingest/SSE API server, the
//! Genesys notification connector, the AudioHook media listener, and the
//! one-shot topic builder. Workers run until SIGINT/SIGTERM, flush their
//! state, and exit cleanly.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use callwatch_core::{
    build_topics_once, start_server, AppState, AudioHookConfig, AudioHookListener,
    CallwatchError, GenesysConfig, GenesysConnector, RealtimeConfig,
};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Exit code for configuration errors.
const EXIT_CONFIG: u8 = 1;

/// Exit code for unrecoverable runtime errors.
const EXIT_RUNTIME: u8 = 2;

/// Callwatch Server - realtime contact-center telemetry.
#[derive(Parser, Debug)]
#[command(name = "callwatch-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "CALLWATCH_LOG_LEVEL")]
    log_level: log::LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the realtime ingest API and SSE streamer.
    Serve {
        /// Bind port (overrides REALTIME_BIND_PORT).
        #[arg(short = 'p', long)]
        port: Option<u16>,
    },

    /// Run the Genesys notification connector worker.
    RunGenesysConnector {
        /// Observe and log events without forwarding them.
        #[arg(long)]
        dry_run: bool,
    },

    /// Run the AudioHook media listener worker.
    RunGenesysAudiohookListener {
        /// Accept and decode media without forwarding it.
        #[arg(long)]
        dry_run: bool,
    },

    /// Discover queues/users and print subscription topics.
    BuildGenesysTopics {
        /// Substring filter on queue names.
        #[arg(long)]
        queue_filter: Option<String>,

        /// Substring filter on user names.
        #[arg(long)]
        user_filter: Option<String>,

        /// Cap on emitted topics.
        #[arg(long)]
        limit: Option<usize>,

        /// Also emit per-user conversation topics.
        #[arg(long)]
        include_users: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Callwatch Server v{}", env!("CARGO_PKG_VERSION"));

    match run(args.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            let code = if e.chain().any(|cause| {
                matches!(
                    cause.downcast_ref::<CallwatchError>(),
                    Some(CallwatchError::Configuration(_))
                )
            }) {
                EXIT_CONFIG
            } else {
                EXIT_RUNTIME
            };
            ExitCode::from(code)
        }
    }
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Serve { port } => serve(port).await,
        Command::RunGenesysConnector { dry_run } => run_connector(dry_run).await,
        Command::RunGenesysAudiohookListener { dry_run } => run_listener(dry_run).await,
        Command::BuildGenesysTopics {
            queue_filter,
            user_filter,
            limit,
            include_users,
        } => build_topics(queue_filter, user_filter, limit, include_users).await,
    }
}

/// Runs the ingest API and SSE streamer until shutdown.
async fn serve(port: Option<u16>) -> Result<()> {
    let mut config = RealtimeConfig::from_env();
    if let Some(port) = port {
        config.bind_port = port;
    }
    config.validate().context("Invalid realtime configuration")?;

    log::info!(
        "Configuration: bind={}:{}, audio_window={}s, cooldown={}s",
        config.bind_host,
        config.bind_port,
        config.audio_window_seconds,
        config.alert_cooldown_seconds
    );

    let state = AppState::new(config);
    let shutdown = state.shutdown.clone();

    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(state).await {
            log::error!("Server error: {}", e);
        }
    });

    shutdown_signal().await;
    log::info!("Shutdown signal received, cleaning up...");

    // Closes SSE subscribers with a final envelope and drains the server.
    shutdown.cancel();
    if tokio::time::timeout(Duration::from_secs(5), server_handle)
        .await
        .is_err()
    {
        log::warn!("Server did not drain within 5s, exiting anyway");
    }

    log::info!("Shutdown complete");
    Ok(())
}

/// Runs the notification connector until shutdown.
async fn run_connector(dry_run: bool) -> Result<()> {
    let config = GenesysConfig::from_env();
    let connector =
        GenesysConnector::new(config, dry_run).context("Failed to build Genesys connector")?;

    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();
    let worker = tokio::spawn(async move { connector.run(worker_cancel).await });

    shutdown_signal().await;
    log::info!("Shutdown signal received, stopping connector...");
    cancel.cancel();
    if tokio::time::timeout(Duration::from_secs(5), worker).await.is_err() {
        log::warn!("Connector did not stop within 5s, exiting anyway");
    }
    Ok(())
}

/// Runs the media listener until shutdown.
async fn run_listener(dry_run: bool) -> Result<()> {
    let config = AudioHookConfig::from_env();
    let listener =
        AudioHookListener::new(config, dry_run).context("Failed to build AudioHook listener")?;

    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();
    let worker = tokio::spawn(async move {
        if let Err(e) = listener.run(worker_cancel).await {
            log::error!("Listener error: {}", e);
        }
    });

    shutdown_signal().await;
    log::info!("Shutdown signal received, stopping listener...");
    cancel.cancel();
    if tokio::time::timeout(Duration::from_secs(5), worker).await.is_err() {
        log::warn!("Listener did not stop within 5s, exiting anyway");
    }
    Ok(())
}

/// Discovers topics once and prints them, one per line.
async fn build_topics(
    queue_filter: Option<String>,
    user_filter: Option<String>,
    limit: Option<usize>,
    include_users: bool,
) -> Result<()> {
    let mut config = GenesysConfig::from_env();
    config.topic_builder.enabled = true;
    if let Some(filter) = queue_filter {
        config.topic_builder.queue_filter = filter;
    }
    if let Some(filter) = user_filter {
        config.topic_builder.user_filter = filter;
    }
    if let Some(limit) = limit {
        config.topic_builder.max_topics = limit;
    }
    if include_users {
        config.topic_builder.include_users = true;
    }

    let topics = build_topics_once(&config)
        .await
        .context("Topic discovery failed")?;
    log::info!("Discovered {} topic(s)", topics.len());
    for topic in topics {
        println!("{}", topic);
    }
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
