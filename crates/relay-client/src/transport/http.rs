use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use super::{ByteStream, Transport};
use crate::config::StreamClientConfig;
use crate::errors::StreamError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on reading the body of a rejected connect.
const ERROR_BODY_TIMEOUT: Duration = Duration::from_secs(5);
/// Rejection bodies are truncated to this many bytes.
const ERROR_BODY_LIMIT: usize = 4096;

/// Streams over HTTP with `reqwest`.
///
/// No overall request timeout is set: the response body stays open for the
/// life of the stream. The client bounds the wait for response headers with
/// its open timeout and stream liveness with its idle timeout.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    token: Option<SecretString>,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, token: Option<SecretString>) -> Result<Self, StreamError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| StreamError::Network(e.to_string()))?;
        Ok(Self::with_client(client, url, token))
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            client,
            url: url.into(),
            token,
        }
    }

    pub fn from_config(config: &StreamClientConfig) -> Result<Self, StreamError> {
        Self::new(config.url.clone(), config.token.clone())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self) -> Result<ByteStream, StreamError> {
        let mut request = self
            .client
            .get(&self.url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(StreamError::from_status(status.as_u16(), body));
        }
        debug!(url = %self.url, "stream response received");

        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| StreamError::StreamInterrupted(e.to_string())));
        Ok(Box::pin(chunks))
    }
}

/// Best-effort read of a rejection body: time-limited and truncated.
async fn error_body(response: reqwest::Response) -> String {
    let mut chunks = response.bytes_stream();
    let mut body = Vec::new();
    let read = async {
        while let Some(Ok(chunk)) = chunks.next().await {
            body.extend_from_slice(&chunk);
            if body.len() >= ERROR_BODY_LIMIT {
                break;
            }
        }
    };
    if tokio::time::timeout(ERROR_BODY_TIMEOUT, read).await.is_err() {
        debug!("timed out reading error body");
    }
    body.truncate(ERROR_BODY_LIMIT);
    String::from_utf8_lossy(&body).into_owned()
}
