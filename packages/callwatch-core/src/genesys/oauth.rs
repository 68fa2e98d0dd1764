//! OAuth client-credentials token source.
//!
//! Tokens are cached behind a guarded pointer and re-acquired at least 60
//! seconds before expiry, so worker loops can call [`TokenSource::bearer`]
//! on every request without hammering the login endpoint.

use parking_lot::RwLock;
use serde::Deserialize;

use crate::error::{CallwatchError, CallwatchResult};
use crate::utils::now_millis;

/// Refresh margin before expiry, in milliseconds.
const REFRESH_MARGIN_MS: u64 = 60_000;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    /// Unix milliseconds past which the token must be refreshed.
    refresh_after_ms: u64,
}

/// Client-credentials token cache for the provider login endpoint.
pub struct TokenSource {
    client: reqwest::Client,
    login_base_url: String,
    client_id: String,
    client_secret: String,
    cached: RwLock<Option<CachedToken>>,
}

impl TokenSource {
    /// Creates a token source for `POST {login_base_url}/oauth/token`.
    pub fn new(
        client: reqwest::Client,
        login_base_url: String,
        client_id: String,
        client_secret: String,
    ) -> Self {
        Self {
            client,
            login_base_url,
            client_id,
            client_secret,
            cached: RwLock::new(None),
        }
    }

    /// Returns a valid bearer token, fetching or refreshing as needed.
    pub async fn bearer(&self) -> CallwatchResult<String> {
        if let Some(token) = self.cached.read().as_ref() {
            if now_millis() < token.refresh_after_ms {
                return Ok(token.access_token.clone());
            }
        }
        let token = self.fetch().await?;
        let bearer = token.access_token.clone();
        *self.cached.write() = Some(token);
        Ok(bearer)
    }

    /// Drops the cached token, forcing re-acquisition on next use.
    ///
    /// Called when the API answers 401 despite a fresh-looking token.
    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }

    async fn fetch(&self) -> CallwatchResult<CachedToken> {
        let url = format!("{}/oauth/token", self.login_base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| CallwatchError::Upstream(format!("token request failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(CallwatchError::Auth(format!(
                "OAuth rejected with HTTP {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(CallwatchError::Upstream(format!(
                "OAuth endpoint returned HTTP {}",
                status
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| CallwatchError::Protocol(format!("malformed token response: {}", e)))?;

        let lifetime_ms = body.expires_in.saturating_mul(1000);
        log::info!(
            "[Genesys] OAuth token acquired (expires in {}s)",
            body.expires_in
        );
        Ok(CachedToken {
            access_token: body.access_token,
            refresh_after_ms: now_millis() + lifetime_ms.saturating_sub(REFRESH_MARGIN_MS),
        })
    }
}
