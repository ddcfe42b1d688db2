//! `RelayServer`: axum routes for the event stream, publishing, health and
//! metrics.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_core::{Event, EventBus};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::{extract_credential, Authenticator, Identity, StaticTokenAuthenticator};
use crate::config::{ConnectionConfig, ServerConfig};
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::metrics::AUTH_REJECTIONS_TOTAL;
use crate::registry::ConnectionRegistry;
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::stream::{FrameStream, StreamConnection};

/// Path of the stream (GET) and publish (POST) routes.
pub const EVENTS_PATH: &str = "/api/events";

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub bus: EventBus,
    pub registry: Arc<ConnectionRegistry>,
    pub authenticator: Arc<dyn Authenticator>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub connection: ConnectionConfig,
    pub start_time: Instant,
    pub metrics: Option<PrometheusHandle>,
}

pub struct RelayServer {
    config: ServerConfig,
    bus: EventBus,
    registry: Arc<ConnectionRegistry>,
    authenticator: Arc<dyn Authenticator>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl RelayServer {
    /// Create a server publishing from `bus`, authenticating against the
    /// configured bearer tokens.
    pub fn new(config: ServerConfig, bus: EventBus) -> Self {
        if config.api_tokens.is_empty() {
            warn!("no api tokens configured, every stream and publish request will be rejected");
        }
        let authenticator = Arc::new(StaticTokenAuthenticator::new(config.api_tokens.clone()));
        let registry = Arc::new(ConnectionRegistry::new());
        Self {
            config,
            bus,
            shutdown: Arc::new(ShutdownCoordinator::new(Arc::clone(&registry))),
            registry,
            authenticator,
            start_time: Instant::now(),
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Serve `GET /metrics` from this recorder handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            bus: self.bus.clone(),
            registry: Arc::clone(&self.registry),
            authenticator: Arc::clone(&self.authenticator),
            shutdown: Arc::clone(&self.shutdown),
            connection: self.config.connection.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route(EVENTS_PATH, get(stream_events).post(publish_event))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and serve in a background task.
    pub async fn start(self) -> Result<ServerHandle, ServerError> {
        let addr = self.config.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let router = self.router();
        let token = self.shutdown.listener_token();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "relay server stopped with error");
            }
        });

        info!(%local_addr, "relay server listening");
        Ok(ServerHandle {
            local_addr,
            bus: self.bus,
            registry: self.registry,
            shutdown: self.shutdown,
            task,
        })
    }
}

/// A running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    bus: EventBus,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://<addr><path>`.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.local_addr, path)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Close every stream and stop accepting, waiting up to `timeout` for
    /// the listener.
    pub async fn shutdown(self, timeout: Option<Duration>) -> ShutdownReport {
        let report = self.shutdown.graceful_shutdown(self.task, timeout).await;
        info!(
            streams_closed = report.streams_closed,
            timed_out = report.timed_out,
            "relay server shut down"
        );
        report
    }
}

#[derive(Debug, Default, Deserialize)]
struct AuthQuery {
    access_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub delivered: usize,
}

async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    access_token: Option<&str>,
    route: &'static str,
) -> Result<Identity, ServerError> {
    let credential = extract_credential(headers, access_token);
    match state.authenticator.authenticate(credential).await {
        Some(identity) => Ok(identity),
        None => {
            counter!(AUTH_REJECTIONS_TOTAL, "route" => route).increment(1);
            warn!(route, has_credential = credential.is_some(), "rejected unauthenticated request");
            Err(ServerError::Unauthorized)
        }
    }
}

/// GET /api/events
#[instrument(skip_all, fields(connection_id))]
async fn stream_events(
    State(state): State<AppState>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let identity = authorize(&state, &headers, query.access_token.as_deref(), "stream").await?;

    let (conn, body) = StreamConnection::open(
        identity,
        &state.bus,
        &state.connection,
        state.shutdown.connection_token(),
        Some(&state.registry),
    );
    let _ = tracing::Span::current().record("connection_id", conn.id().as_str());

    Ok(stream_response(&headers, body))
}

fn stream_response(request_headers: &HeaderMap, body: FrameStream) -> Response {
    let mut response = Response::new(Body::from_stream(body));
    let headers = response.headers_mut();
    let _ = headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    let _ = headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    let _ = headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    let _ = headers.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));

    if let Some(origin) = request_headers.get(header::ORIGIN) {
        let _ = headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        let _ = headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        let _ = headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    }
    response
}

/// POST /api/events
#[instrument(skip_all)]
async fn publish_event(
    State(state): State<AppState>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<PublishResponse>, ServerError> {
    let identity = authorize(&state, &headers, query.access_token.as_deref(), "publish").await?;

    let event: Event =
        serde_json::from_slice(&body).map_err(|e| ServerError::BadRequest(e.to_string()))?;
    if event.kind().is_none() {
        debug!(event_type = %event.event_type, "publishing event outside the catalog");
    }

    let delivered = state.bus.publish(&event);
    info!(
        subject = %identity.subject,
        event_type = %event.event_type,
        delivered,
        "event published"
    );
    Ok(Json(PublishResponse { delivered }))
}

/// GET /health. 503 once shutdown has begun.
async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let health = health::health_check(
        state.start_time,
        &state.registry,
        &state.bus,
        &state.connection,
        state.shutdown.is_shutting_down(),
    );
    let status = if health.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use futures::StreamExt;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use secrecy::SecretString;
    use tower::ServiceExt;

    const TOKEN: &str = "test-token";

    fn make_server() -> RelayServer {
        let config = ServerConfig {
            api_tokens: vec![SecretString::from(TOKEN.to_string())],
            ..ServerConfig::default()
        };
        RelayServer::new(config, EventBus::new())
    }

    fn stream_request() -> axum::http::request::Builder {
        Request::builder()
            .uri(EVENTS_PATH)
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn stream_without_credentials_is_401_and_subscribes_nothing() {
        let server = make_server();
        let app = server.router();

        let req = Request::builder().uri(EVENTS_PATH).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(server.bus().subscriber_count(), 0);
        assert_eq!(server.registry().count(), 0);
        assert_eq!(json_body(resp).await["code"], "unauthorized");
    }

    #[tokio::test]
    async fn stream_with_wrong_token_is_401() {
        let server = make_server();
        let req = Request::builder()
            .uri(format!("{EVENTS_PATH}?access_token=nope"))
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(server.bus().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn stream_headers_without_origin() {
        let server = make_server();
        let resp = server
            .router()
            .oneshot(stream_request().body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let headers = resp.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache, no-transform");
        assert_eq!(headers[header::CONNECTION], "keep-alive");
        assert_eq!(headers["x-accel-buffering"], "no");
        assert!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
        assert!(headers.get(header::VARY).is_none());
    }

    #[tokio::test]
    async fn stream_echoes_origin() {
        let server = make_server();
        let req = stream_request()
            .header(header::ORIGIN, "https://boards.example")
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();

        let headers = resp.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://boards.example");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert_eq!(headers[header::VARY], "Origin");
    }

    #[tokio::test]
    async fn stream_body_carries_connected_then_events() {
        let server = make_server();
        let resp = server
            .router()
            .oneshot(stream_request().body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(server.registry().count(), 1);
        assert_eq!(server.bus().subscriber_count(), 1);

        let mut frames = resp.into_body().into_data_stream();
        let first = frames.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b": connected\n\n");

        server.bus().publish(&Event::notification_new("u1"));
        let second = frames.next().await.unwrap().unwrap();
        assert_eq!(
            &second[..],
            b"data: {\"type\":\"notification_new\",\"payload\":{\"userId\":\"u1\"}}\n\n"
        );

        // Client goes away: the body is dropped and the connection cleaned up.
        drop(frames);
        assert_eq!(server.registry().count(), 0);
        assert_eq!(server.bus().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_ends_open_streams() {
        let server = make_server();
        let resp = server
            .router()
            .oneshot(stream_request().body(Body::empty()).unwrap())
            .await
            .unwrap();
        let mut frames = resp.into_body().into_data_stream();
        let _connected = frames.next().await.unwrap().unwrap();

        assert_eq!(server.shutdown().initiate(), 1);

        assert!(frames.next().await.is_none());
        // The heartbeat task observes the cancellation and tears down.
        for _ in 0..10 {
            if server.bus().subscriber_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(server.bus().subscriber_count(), 0);
        assert_eq!(server.registry().count(), 0);
    }

    #[tokio::test]
    async fn publish_requires_auth() {
        let server = make_server();
        let req = Request::builder()
            .method("POST")
            .uri(EVENTS_PATH)
            .body(Body::from(r#"{"type":"board_updated","payload":{"boardId":"b1"}}"#))
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn publish_fans_out_to_bus() {
        let server = make_server();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = server.bus().subscribe(move |e| sink.lock().push(e.clone()));

        let req = Request::builder()
            .method("POST")
            .uri(EVENTS_PATH)
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"type":"board_updated","payload":{"boardId":"b1"}}"#))
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["delivered"], 1);
        assert_eq!(seen.lock()[0].board_id(), Some("b1"));
    }

    #[tokio::test]
    async fn publish_rejects_non_object_payload() {
        let server = make_server();
        let req = Request::builder()
            .method("POST")
            .uri(EVENTS_PATH)
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::from(r#"{"type":"board_updated","payload":"b1"}"#))
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["code"], "bad_request");
    }

    #[tokio::test]
    async fn health_reports_connections() {
        let server = make_server();
        let _listener = server.bus().subscribe(|_| {});

        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let parsed = json_body(resp).await;
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 0);
        assert_eq!(parsed["subscribers"], 1);
        assert_eq!(parsed["local_subscribers"], 1);
        assert_eq!(parsed["heartbeat_interval_ms"], 30_000);
    }

    #[tokio::test]
    async fn health_is_unavailable_while_draining() {
        let server = make_server();
        let _ = server.shutdown().initiate();

        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(resp).await["status"], "draining");
    }

    #[tokio::test]
    async fn metrics_route_absent_without_recorder() {
        let server = make_server();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_route_renders_recorder() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!(crate::metrics::EVENTS_PUBLISHED_TOTAL).increment(3);
        });
        let server = make_server().with_metrics(handle);

        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("relay_events_published_total 3"), "got: {text}");
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let req = Request::builder().uri("/nonexistent").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
