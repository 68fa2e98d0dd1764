//! Retrying JSON forwarder for worker-to-ingest delivery.
//!
//! Both the notification connector and the media listener POST normalized
//! payloads to the ingest API. Transient failures (5xx, network) are retried
//! with exponential backoff and ±20% jitter; 4xx responses are terminal for
//! a payload since retrying cannot fix them.

use std::time::Duration;

use rand::Rng;
use serde_json::Value;

use crate::config::RetryPolicy;
use crate::error::{CallwatchError, CallwatchResult};

/// JSON forwarder bound to one target URL.
pub struct Forwarder {
    client: reqwest::Client,
    url: String,
    token: String,
    retry: RetryPolicy,
}

impl Forwarder {
    /// Creates a forwarder; `token` is sent as `X-Cloud-Token` when non-empty.
    pub fn new(client: reqwest::Client, url: String, token: String, retry: RetryPolicy) -> Self {
        Self {
            client,
            url,
            token,
            retry,
        }
    }

    /// Delivers one payload, retrying transient failures.
    ///
    /// Backoff is `base × 2^attempt`, jittered ±20%. After the final attempt
    /// the last error is returned; callers count it and keep consuming.
    pub async fn send(&self, payload: &Value) -> CallwatchResult<()> {
        let mut last_error = None;

        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let delay = backoff_delay(self.retry.backoff_seconds, attempt);
                log::info!(
                    "[Forward] Retrying {} (attempt {}/{}) after {:.2}s",
                    self.url,
                    attempt + 1,
                    self.retry.max_attempts,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
            }

            match self.try_send(payload).await {
                Ok(()) => return Ok(()),
                Err(e @ CallwatchError::Upstream(_)) => {
                    log::warn!("[Forward] {} transient error: {}", self.url, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| CallwatchError::Upstream("retry budget empty".into())))
    }

    async fn try_send(&self, payload: &Value) -> CallwatchResult<()> {
        let mut request = self.client.post(&self.url).json(payload);
        if !self.token.is_empty() {
            request = request.header("X-Cloud-Token", &self.token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| CallwatchError::Upstream(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_server_error() {
            Err(CallwatchError::Upstream(format!("HTTP {}", status)))
        } else if status.as_u16() == 401 || status.as_u16() == 403 {
            Err(CallwatchError::Auth(format!("HTTP {}", status)))
        } else {
            Err(CallwatchError::Protocol(format!("HTTP {}", status)))
        }
    }
}

/// Exponential backoff with ±20% jitter.
fn backoff_delay(base_seconds: f64, attempt: u32) -> Duration {
    let exp = base_seconds * f64::powi(2.0, attempt.saturating_sub(1) as i32);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_secs_f64((exp * jitter).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt_within_jitter() {
        for attempt in 1..5u32 {
            let expected = 0.5 * f64::powi(2.0, attempt as i32 - 1);
            let delay = backoff_delay(0.5, attempt).as_secs_f64();
            assert!(
                delay >= expected * 0.8 - 1e-9 && delay <= expected * 1.2 + 1e-9,
                "attempt {} delay {} outside [{}, {}]",
                attempt,
                delay,
                expected * 0.8,
                expected * 1.2
            );
        }
    }
}
