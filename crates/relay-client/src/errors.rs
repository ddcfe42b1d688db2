//! Stream consumer errors.

/// Failures observed while consuming an event stream.
///
/// Reported through the client's error handler; none of them are fatal to
/// the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("stream endpoint rejected credentials ({status})")]
    Unauthorized { status: u16 },
    #[error("stream endpoint returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String, raw: String },
    #[error("stream closed by server")]
    ConnectionClosed,
    #[error("gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },
}

impl StreamError {
    /// Classify a non-success HTTP status from the stream endpoint.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        match status {
            401 | 403 => Self::Unauthorized { status },
            _ => Self::HttpStatus {
                status,
                body: body.into(),
            },
        }
    }

    /// Whether a fresh connection attempt could plausibly succeed without
    /// outside intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::StreamInterrupted(_) | Self::ConnectionClosed => true,
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::Unauthorized { .. } | Self::MalformedFrame { .. } | Self::ReconnectExhausted { .. } => {
                false
            }
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "unauthorized",
            Self::HttpStatus { .. } => "http_status",
            Self::Network(_) => "network",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::MalformedFrame { .. } => "malformed_frame",
            Self::ConnectionClosed => "connection_closed",
            Self::ReconnectExhausted { .. } => "reconnect_exhausted",
        }
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.to_string());
        }
        Self::Network(err.to_string())
    }
}
