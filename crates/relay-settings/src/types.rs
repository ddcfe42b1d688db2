//! Settings schema. Every section deserializes with defaults for missing keys,
//! so a partial settings file only needs the values it changes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object (`~/.relay/settings.json`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    pub server: ServerSettings,
    pub client: ClientSettings,
    pub coordinator: CoordinatorSettings,
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Cross-field checks that per-value range parsing cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.server.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatIntervalMs must be positive".into(),
            ));
        }
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueCapacity must be positive".into(),
            ));
        }
        if self.client.max_reconnect_delay_ms < self.client.initial_reconnect_delay_ms {
            return Err(SettingsError::InvalidValue(format!(
                "client.maxReconnectDelayMs ({}) is below client.initialReconnectDelayMs ({})",
                self.client.max_reconnect_delay_ms, self.client.initial_reconnect_delay_ms
            )));
        }
        Ok(())
    }
}

/// Stream server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port. 0 picks an ephemeral port.
    pub port: u16,
    /// Interval between `: heartbeat` comment frames.
    pub heartbeat_interval_ms: u64,
    /// Outbound frame queue per connection.
    pub send_queue_capacity: usize,
    /// Bearer tokens accepted by the stream and publish routes.
    pub api_tokens: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            heartbeat_interval_ms: 30_000,
            send_queue_capacity: 256,
            api_tokens: Vec::new(),
        }
    }
}

/// Stream consumer settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Stream endpoint.
    pub url: String,
    /// Bearer token sent with every connect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub max_reconnect_attempts: u32,
    pub initial_reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    /// Upper bound (exclusive) of the random delay added to each backoff.
    pub max_jitter_ms: u64,
    /// Reconnect when nothing (not even a heartbeat) arrives for this long.
    /// 0 disables the check.
    pub idle_timeout_ms: u64,
    /// Give up on a connect that has not produced response headers after
    /// this long. 0 waits indefinitely.
    pub open_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8787/api/events".to_string(),
            token: None,
            max_reconnect_attempts: 10,
            initial_reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 30_000,
            max_jitter_ms: 1000,
            idle_timeout_ms: 90_000,
            open_timeout_ms: 30_000,
        }
    }
}

/// Request de-duplication and result cache settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoordinatorSettings {
    /// How long a successful result is served from cache.
    pub cache_ttl_ms: u64,
    /// How long an in-flight request may be joined before a new one starts.
    pub pending_stale_ms: u64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 1000,
            pending_stale_ms: 5000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Per-module level overrides, e.g. `{"relay_server::stream": "debug"}`.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}
