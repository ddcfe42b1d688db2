//! Server configuration.

use std::time::Duration;

use relay_settings::ServerSettings;
use secrecy::SecretString;

/// Default interval between heartbeat comment frames.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration for the relay server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Per-connection stream settings.
    pub connection: ConnectionConfig,
    /// Bearer tokens accepted by the authenticated routes.
    pub api_tokens: Vec<SecretString>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            connection: ConnectionConfig::default(),
            api_tokens: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// `host:port` string suitable for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            connection: ConnectionConfig {
                heartbeat_interval: Duration::from_millis(settings.heartbeat_interval_ms),
                send_queue_capacity: settings.send_queue_capacity.max(1),
            },
            api_tokens: settings
                .api_tokens
                .iter()
                .map(|t| SecretString::from(t.clone()))
                .collect(),
        }
    }
}

/// Settings for one stream connection.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub heartbeat_interval: Duration,
    /// Frames buffered for a slow reader before new frames are dropped.
    pub send_queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            send_queue_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.bind_addr(), "127.0.0.1:0");
        assert_eq!(cfg.connection.heartbeat_interval, Duration::from_secs(30));
        assert!(cfg.api_tokens.is_empty());
    }

    #[test]
    fn from_settings() {
        let settings = ServerSettings {
            host: "0.0.0.0".into(),
            port: 9000,
            heartbeat_interval_ms: 500,
            send_queue_capacity: 8,
            api_tokens: vec!["tok".into()],
        };
        let cfg = ServerConfig::from(&settings);
        assert_eq!(cfg.bind_addr(), "0.0.0.0:9000");
        assert_eq!(cfg.connection.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(cfg.connection.send_queue_capacity, 8);
        assert_eq!(cfg.api_tokens[0].expose_secret(), "tok");
    }
}
