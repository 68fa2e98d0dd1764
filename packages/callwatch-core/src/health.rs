//! Worker heartbeat files and health evaluation.
//!
//! Each long-running worker owns a [`StatusWriter`] that persists its state
//! atomically (temp file + rename) on every meaningful transition and on a
//! periodic heartbeat. Health probes read the file back and judge staleness.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::utils::{atomic_write, now_millis};

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Connecting,
    Authenticated,
    ChannelCreated,
    Subscribed,
    Running,
    Degraded,
    Stopped,
    Error,
}

impl WorkerState {
    /// States that make a worker unhealthy regardless of file freshness.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error | Self::Stopped)
    }
}

/// Snapshot persisted to a worker's status file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub state: WorkerState,
    /// Unix milliseconds of the last write.
    pub updated_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub forwarded_events: u64,
    #[serde(default)]
    pub forwarded_chunks: u64,
    #[serde(default)]
    pub active_connections: u64,
    #[serde(default)]
    pub errors: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics_count: Option<usize>,
}

impl WorkerStatus {
    fn new(state: WorkerState) -> Self {
        Self {
            state,
            updated_at: now_millis(),
            last_error: None,
            forwarded_events: 0,
            forwarded_chunks: 0,
            active_connections: 0,
            errors: 0,
            topics_count: None,
        }
    }
}

/// Health probe response for a worker status file.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub state: WorkerState,
    pub age_seconds: u64,
    pub stale_after_seconds: u64,
    pub status_path: String,
    pub status: WorkerStatus,
}

/// Reads a worker's status file and evaluates freshness.
///
/// `healthy` requires the file to be younger than `stale_after_seconds` and
/// the state to be non-terminal. IO and parse failures bubble up so probes
/// can answer 500.
pub fn read_health(
    path: &Path,
    stale_after_seconds: u64,
    now_ms: u64,
) -> std::io::Result<HealthReport> {
    let raw = std::fs::read_to_string(path)?;
    let status: WorkerStatus = serde_json::from_str(&raw)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let age_seconds = now_ms.saturating_sub(status.updated_at) / 1000;
    let healthy = age_seconds <= stale_after_seconds && !status.state.is_terminal();
    Ok(HealthReport {
        healthy,
        state: status.state,
        age_seconds,
        stale_after_seconds,
        status_path: path.display().to_string(),
        status,
    })
}

/// Owns a worker's status file and serializes writes.
pub struct StatusWriter {
    path: PathBuf,
    status: Mutex<WorkerStatus>,
}

impl StatusWriter {
    /// Creates a writer and persists the initial `starting` record.
    pub fn new(path: PathBuf) -> Self {
        let writer = Self {
            path,
            status: Mutex::new(WorkerStatus::new(WorkerState::Starting)),
        };
        writer.flush();
        writer
    }

    /// Transitions the worker state and persists.
    pub fn set_state(&self, state: WorkerState) {
        {
            let mut status = self.status.lock();
            if status.state != state {
                log::info!(
                    "[Status] {} -> {:?}",
                    self.path.file_name().and_then(|n| n.to_str()).unwrap_or("worker"),
                    state
                );
            }
            status.state = state;
            status.updated_at = now_millis();
        }
        self.flush();
    }

    /// Records a fatal or degraded-transition error and persists.
    pub fn record_error(&self, state: WorkerState, error: &str) {
        {
            let mut status = self.status.lock();
            status.state = state;
            status.last_error = Some(error.to_string());
            status.errors += 1;
            status.updated_at = now_millis();
        }
        self.flush();
    }

    /// Applies a counter mutation and persists.
    pub fn update<F: FnOnce(&mut WorkerStatus)>(&self, mutate: F) {
        {
            let mut status = self.status.lock();
            mutate(&mut status);
            status.updated_at = now_millis();
        }
        self.flush();
    }

    /// Applies a counter mutation without touching the file.
    ///
    /// High-frequency counters accumulate in memory and reach disk on the
    /// next heartbeat or transition.
    pub fn bump<F: FnOnce(&mut WorkerStatus)>(&self, mutate: F) {
        mutate(&mut self.status.lock());
    }

    /// Refreshes `updated_at` without changing anything else.
    pub fn heartbeat(&self) {
        {
            self.status.lock().updated_at = now_millis();
        }
        self.flush();
    }

    fn flush(&self) {
        let payload = {
            let status = self.status.lock();
            serde_json::to_vec(&*status).unwrap_or_default()
        };
        if let Err(e) = atomic_write(&self.path, &payload) {
            log::warn!(
                "[Status] Failed to write {}: {}",
                self.path.display(),
                e
            );
        }
    }
}
