/// Failures while encoding or decoding wire frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("failed to serialize event: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("malformed data frame: {reason}")]
    Malformed { reason: String, raw: String },
    #[error("frame exceeds {limit} bytes")]
    Oversized { limit: usize },
}

impl FrameError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Serialize(_) => "serialize",
            Self::Malformed { .. } => "malformed",
            Self::Oversized { .. } => "oversized",
        }
    }
}
