use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use relay_core::OutputLevel;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Relay configuration. Field names are camelCase in `settings.json`.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Base URL of the HAPI server, without the `/api` suffix.
    pub endpoint: String,
    /// Long-lived access token exchanged for short-lived JWTs.
    pub access_token: String,
    /// Optional HTTP or SOCKS proxy for all traffic.
    pub proxy_url: Option<String>,
    pub jwt_lifetime_secs: u64,
    /// Refresh this long before the JWT lifetime runs out.
    pub refresh_before_secs: u64,
    pub output_level: OutputLevel,
    pub debounce_ms: u64,
    /// Maximum characters per delivered notification chunk.
    pub notify_chunk_len: usize,
    /// SQLite file for user preferences.
    pub store_path: String,
    /// Extra webhook URLs that receive every notification.
    pub webhooks: Vec<String>,
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            access_token: String::new(),
            proxy_url: None,
            jwt_lifetime_secs: 900,
            refresh_before_secs: 180,
            output_level: OutputLevel::Detail,
            debounce_ms: 500,
            notify_chunk_len: 4200,
            store_path: relay_home().join("relay.db").to_string_lossy().into_owned(),
            webhooks: Vec::new(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl fmt::Debug for RelaySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySettings")
            .field("endpoint", &self.endpoint)
            .field("access_token", &"[REDACTED]")
            .field("proxy_url", &self.proxy_url)
            .field("jwt_lifetime_secs", &self.jwt_lifetime_secs)
            .field("refresh_before_secs", &self.refresh_before_secs)
            .field("output_level", &self.output_level)
            .field("debounce_ms", &self.debounce_ms)
            .field("notify_chunk_len", &self.notify_chunk_len)
            .field("store_path", &self.store_path)
            .field("webhooks", &self.webhooks)
            .field("log_level", &self.log_level)
            .field("json_logs", &self.json_logs)
            .finish()
    }
}

impl RelaySettings {
    pub fn jwt_lifetime(&self) -> Duration {
        Duration::from_secs(self.jwt_lifetime_secs)
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_before_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Checks the values the relay cannot start without.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(SettingsError::InvalidValue("endpoint is empty".into()));
        }
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(SettingsError::InvalidValue(format!(
                "endpoint must be an http(s) URL: {}",
                self.endpoint
            )));
        }
        if self.access_token.trim().is_empty() {
            return Err(SettingsError::InvalidValue("accessToken is empty".into()));
        }
        if self.refresh_before_secs >= self.jwt_lifetime_secs {
            return Err(SettingsError::InvalidValue(
                "refreshBeforeSecs must be smaller than jwtLifetimeSecs".into(),
            ));
        }
        if self.notify_chunk_len == 0 {
            return Err(SettingsError::InvalidValue("notifyChunkLen must be positive".into()));
        }
        Ok(())
    }
}

/// `~/.hapi-relay`, falling back to `/tmp` when `HOME` is unset.
pub fn relay_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".hapi-relay")
}
