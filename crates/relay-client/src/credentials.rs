use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use relay_core::errors::RelayError;

pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

struct CachedToken {
    token: SecretString,
    obtained_at: Instant,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: String,
}

/// Exchanges the long-lived access token for short-lived JWTs.
///
/// Every path that may authenticate runs under one async mutex, so at most
/// one exchange is in flight and waiters observe its result.
pub struct CredentialProvider {
    http: Client,
    auth_url: String,
    access_token: SecretString,
    lifetime: Duration,
    margin: Duration,
    cached: Mutex<Option<CachedToken>>,
    auth_count: AtomicU64,
}

impl CredentialProvider {
    pub fn new(
        http: Client,
        endpoint: &str,
        access_token: SecretString,
        lifetime: Duration,
        margin: Duration,
    ) -> Self {
        Self {
            http,
            auth_url: format!("{}/api/auth", endpoint.trim_end_matches('/')),
            access_token,
            lifetime,
            margin,
            cached: Mutex::new(None),
            auth_count: AtomicU64::new(0),
        }
    }

    /// A currently valid token, authenticating if none is cached or the
    /// cached one is inside the refresh margin.
    pub async fn get(&self) -> Result<SecretString, RelayError> {
        let mut cached = self.cached.lock().await;
        if let Some(current) = cached.as_ref() {
            if !self.is_stale(current) {
                return Ok(current.token.clone());
            }
        }
        self.authenticate(&mut cached).await
    }

    /// Re-authenticate unconditionally.
    pub async fn force_refresh(&self) -> Result<SecretString, RelayError> {
        let mut cached = self.cached.lock().await;
        self.authenticate(&mut cached).await
    }

    /// Refresh after the server rejected `rejected`.
    ///
    /// If another caller already replaced that token while we waited for the
    /// lock, its result is reused without a second round-trip.
    pub async fn refresh_after_rejection(
        &self,
        rejected: &SecretString,
    ) -> Result<SecretString, RelayError> {
        let mut cached = self.cached.lock().await;
        if let Some(current) = cached.as_ref() {
            if current.token.expose_secret() != rejected.expose_secret() && !self.is_stale(current)
            {
                debug!("token already refreshed by a concurrent request");
                return Ok(current.token.clone());
            }
        }
        self.authenticate(&mut cached).await
    }

    /// Number of token exchanges performed so far.
    pub fn auth_count(&self) -> u64 {
        self.auth_count.load(Ordering::Relaxed)
    }

    fn is_stale(&self, token: &CachedToken) -> bool {
        token.obtained_at.elapsed() >= self.lifetime.saturating_sub(self.margin)
    }

    async fn authenticate(
        &self,
        slot: &mut Option<CachedToken>,
    ) -> Result<SecretString, RelayError> {
        let _ = self.auth_count.fetch_add(1, Ordering::Relaxed);
        info!("requesting session token");

        let resp = self
            .http
            .post(&self.auth_url)
            .timeout(AUTH_TIMEOUT)
            .json(&serde_json::json!({ "accessToken": self.access_token.expose_secret() }))
            .send()
            .await
            .map_err(|e| RelayError::AuthenticationFailed(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            warn!(status, "token exchange rejected");
            return Err(RelayError::AuthenticationFailed(format!("status {status}: {body}")));
        }

        let body: AuthResponse = resp
            .json()
            .await
            .map_err(|e| RelayError::AuthenticationFailed(e.to_string()))?;

        let token = SecretString::from(body.token);
        *slot = Some(CachedToken {
            token: token.clone(),
            obtained_at: Instant::now(),
        });
        info!(lifetime_secs = self.lifetime.as_secs(), "session token obtained");
        Ok(token)
    }
}
