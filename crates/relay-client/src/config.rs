//! Runtime configuration for the stream consumer and the request coordinator.

use std::time::Duration;

use relay_core::frame::DEFAULT_MAX_FRAME_BYTES;
use relay_settings::{ClientSettings, CoordinatorSettings};
use secrecy::SecretString;

/// Stream consumer configuration.
#[derive(Clone, Debug)]
pub struct StreamClientConfig {
    /// Full stream endpoint URL.
    pub url: String,
    /// Bearer token sent on every connect.
    pub token: Option<SecretString>,
    /// Reconnects attempted after the first failure before giving up.
    pub max_reconnect_attempts: u32,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Exclusive upper bound of the random delay added to each backoff.
    pub max_jitter: Duration,
    /// Treat the stream as dead when no bytes arrive for this long.
    pub idle_timeout: Option<Duration>,
    /// Abandon a connect that has produced no response by then.
    pub open_timeout: Option<Duration>,
    /// Frames larger than this are dropped and reported as malformed.
    pub max_frame_bytes: usize,
}

impl StreamClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(SecretString::from(token.into()));
        self
    }
}

impl Default for StreamClientConfig {
    fn default() -> Self {
        Self::from(&ClientSettings::default())
    }
}

impl From<&ClientSettings> for StreamClientConfig {
    fn from(s: &ClientSettings) -> Self {
        Self {
            url: s.url.clone(),
            token: s.token.clone().map(SecretString::from),
            max_reconnect_attempts: s.max_reconnect_attempts,
            initial_reconnect_delay: Duration::from_millis(s.initial_reconnect_delay_ms),
            max_reconnect_delay: Duration::from_millis(s.max_reconnect_delay_ms),
            max_jitter: Duration::from_millis(s.max_jitter_ms),
            idle_timeout: (s.idle_timeout_ms > 0).then(|| Duration::from_millis(s.idle_timeout_ms)),
            open_timeout: (s.open_timeout_ms > 0).then(|| Duration::from_millis(s.open_timeout_ms)),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Request coordinator configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// How long a successful result is served from cache.
    pub cache_ttl: Duration,
    /// How long an in-flight request may be joined before a fresh one starts.
    pub pending_stale: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&CoordinatorSettings::default())
    }
}

impl From<&CoordinatorSettings> for CoordinatorConfig {
    fn from(s: &CoordinatorSettings) -> Self {
        Self {
            cache_ttl: Duration::from_millis(s.cache_ttl_ms),
            pending_stale: Duration::from_millis(s.pending_stale_ms),
        }
    }
}
