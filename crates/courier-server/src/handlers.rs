//! HTTP handlers for the Courier server.
//!
//! This module hosts the connection gate (`/ws`), the HTTP endpoints and the
//! server lifecycle.

use crate::auth::{self, Authenticator, StaticTokenAuthenticator};
use crate::config::{BusBackend, BusConfig, Config, GroupEntry};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use courier_core::{Bus, GroupDirectory, Hub, InMemoryBus, InMemoryGroupDirectory};
use courier_protocol::{codec, MessageEventData, UserId};
use courier_transport::axum_ws;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The presence and delivery core.
    pub hub: Arc<Hub>,
    /// Server configuration.
    pub config: Config,
    /// Token verification for the connection gate.
    pub authenticator: Arc<dyn Authenticator>,
}

impl AppState {
    /// Create app state around a hub, authenticating with the configured tokens.
    #[must_use]
    pub fn new(config: Config, hub: Arc<Hub>) -> Self {
        let authenticator = Arc::new(StaticTokenAuthenticator::new(config.auth.token_map()));
        Self {
            hub,
            config,
            authenticator,
        }
    }
}

/// Why the gate refused a connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateRejection {
    #[error("missing or invalid token")]
    Unauthorized,

    #[error("server at connection capacity")]
    AtCapacity,
}

impl GateRejection {
    fn reason(&self) -> &'static str {
        match self {
            GateRejection::Unauthorized => "unauthorized",
            GateRejection::AtCapacity => "capacity",
        }
    }
}

impl IntoResponse for GateRejection {
    fn into_response(self) -> Response {
        let status = match self {
            GateRejection::Unauthorized => StatusCode::UNAUTHORIZED,
            GateRejection::AtCapacity => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    token: Option<String>,
}

/// Run the HTTP/WebSocket server until a shutdown signal arrives.
///
/// The bus and group directory are built from configuration.
///
/// # Errors
///
/// Returns an error if the bus is unreachable or the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let bus = build_bus(&config.bus).await?;
    let directory = Arc::new(build_directory(&config.groups));
    serve(config, bus, directory).await
}

/// Run the server on a caller-supplied bus and group directory.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn serve(
    config: Config,
    bus: Arc<dyn Bus>,
    directory: Arc<dyn GroupDirectory>,
) -> Result<()> {
    let hub = Arc::new(Hub::new(config.to_hub_config(), bus, directory));
    hub.start();

    if config.auth.tokens.is_empty() {
        warn!("No auth tokens configured, every connection will be refused");
    }

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config, hub.clone()));
    let app = router(state.clone());

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Courier server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, state.config.transport.websocket_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Upgraded sockets are not tracked by the server, close them here
            let closed = hub.shutdown().await;
            info!(closed, "Closed live sessions");
        })
        .await
        .context("Server error")?;

    Ok(())
}

/// Connect the configured bus backend.
async fn build_bus(config: &BusConfig) -> Result<Arc<dyn Bus>> {
    match config.backend {
        BusBackend::Memory => {
            info!("Using in-memory bus, fanout stays within this instance");
            Ok(Arc::new(InMemoryBus::new()))
        }
        #[cfg(feature = "redis")]
        BusBackend::Redis => {
            let bus = courier_core::RedisBus::connect(&config.redis_url)
                .await
                .with_context(|| format!("Failed to connect to {}", config.redis_url))?;
            Ok(Arc::new(bus))
        }
        #[cfg(not(feature = "redis"))]
        BusBackend::Redis => {
            anyhow::bail!("Redis bus selected but built without the `redis` feature")
        }
    }
}

/// Seed a group directory from configuration.
fn build_directory(groups: &[GroupEntry]) -> InMemoryGroupDirectory {
    let directory = InMemoryGroupDirectory::new();
    for group in groups {
        directory.set_members(group.id, group.members.iter().copied());
    }
    if !groups.is_empty() {
        info!(groups = groups.len(), "Loaded group membership");
    }
    directory
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/online/:user_id", get(online_handler))
        .route("/messages", post(send_message_handler))
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received shutdown signal, cleaning up...");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "online_users": state.hub.registry().online_count(),
    }))
}

/// Presence lookup for one user on this instance.
async fn online_handler(
    Path(user_id): Path<UserId>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(json!({
        "user_id": user_id,
        "online": state.hub.registry().is_online(user_id),
    }))
}

/// Body of `POST /messages`.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    to_user_id: UserId,
    #[serde(default)]
    group_id: i64,
    #[serde(default)]
    msg_type: i8,
    content: String,
}

/// Publish a chat message from the authenticated user to the bus.
///
/// Every instance, this one included, delivers it to the recipients it hosts.
async fn send_message_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<SendMessageRequest>,
) -> Response {
    let Some(from_user_id) = auth::extract_token(None, &headers)
        .and_then(|token| state.authenticator.authenticate(&token))
    else {
        return GateRejection::Unauthorized.into_response();
    };

    if (request.to_user_id > 0) == (request.group_id > 0) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "exactly one of to_user_id or group_id is required" })),
        )
            .into_response();
    }

    let message = MessageEventData {
        id: 0,
        from_user_id,
        to_user_id: request.to_user_id,
        group_id: request.group_id,
        msg_type: request.msg_type,
        content: request.content,
        created_at: chrono::Utc::now().to_rfc3339(),
    };

    match state.hub.bridge().publish_message(&message).await {
        Ok(receivers) => {
            debug!(from_user_id, receivers, "Message published");
            (StatusCode::ACCEPTED, Json(json!({ "receivers": receivers }))).into_response()
        }
        Err(e) => {
            error!(from_user_id, error = %e, "Failed to publish message");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "bus unavailable" })),
            )
                .into_response()
        }
    }
}

/// Decide whether a connection may proceed and for which user.
pub fn admit(
    state: &AppState,
    params: &ConnectParams,
    headers: &HeaderMap,
) -> Result<UserId, GateRejection> {
    let user_id = auth::extract_token(params.token.as_deref(), headers)
        .and_then(|token| state.authenticator.authenticate(&token))
        .ok_or(GateRejection::Unauthorized)?;

    // A reconnecting user replaces their own session and does not add to the count
    let registry = state.hub.registry();
    if registry.online_count() >= state.config.limits.max_connections
        && !registry.is_online(user_id)
    {
        return Err(GateRejection::AtCapacity);
    }

    Ok(user_id)
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let user_id = match admit(&state, &params, &headers) {
        Ok(user_id) => user_id,
        Err(rejection) => {
            warn!(reason = rejection.reason(), "Connection refused");
            metrics::record_rejection(rejection.reason());
            return rejection.into_response();
        }
    };

    // Oversized frames are discarded by the session, not fatal to the socket
    ws.max_message_size(codec::MAX_FRAME_SIZE)
        .on_upgrade(move |socket| handle_websocket(socket, user_id, state))
}

/// Hand an upgraded socket to the hub.
async fn handle_websocket(
    socket: axum::extract::ws::WebSocket,
    user_id: UserId,
    state: Arc<AppState>,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    debug!(user_id, "WebSocket connected");

    let (sink, source) = axum_ws::split(socket);
    state
        .hub
        .serve_connection(user_id, Box::new(sink), Box::new(source))
        .await;

    debug!(user_id, "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenEntry;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, HeaderValue, Request};
    use courier_core::Session;
    use serde_json::Value;
    use tower::ServiceExt;

    fn state_with(config: Config) -> Arc<AppState> {
        state_on_bus(config, Arc::new(InMemoryBus::new()))
    }

    fn state_on_bus(config: Config, bus: Arc<InMemoryBus>) -> Arc<AppState> {
        let hub = Arc::new(Hub::new(
            config.to_hub_config(),
            bus,
            Arc::new(InMemoryGroupDirectory::new()),
        ));
        Arc::new(AppState::new(config, hub))
    }

    fn config_with_tokens() -> Config {
        let mut config = Config::default();
        config.auth.tokens = vec![
            TokenEntry {
                token: "alice-token".to_string(),
                user_id: 1,
            },
            TokenEntry {
                token: "bob-token".to_string(),
                user_id: 2,
            },
        ];
        config
    }

    fn params(token: Option<&str>) -> ConnectParams {
        ConnectParams {
            token: token.map(str::to_string),
        }
    }

    async fn get_json(state: Arc<AppState>, uri: &str) -> (StatusCode, Value) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn post_message(state: Arc<AppState>, token: Option<&str>, body: Value) -> StatusCode {
        let mut request = Request::builder()
            .method("POST")
            .uri("/messages")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = request.body(Body::from(body.to_string())).unwrap();
        router(state).oneshot(request).await.unwrap().status()
    }

    #[test]
    fn test_admit_requires_valid_token() {
        let state = state_with(config_with_tokens());

        assert_eq!(
            admit(&state, &params(None), &HeaderMap::new()),
            Err(GateRejection::Unauthorized)
        );
        assert_eq!(
            admit(&state, &params(Some("wrong")), &HeaderMap::new()),
            Err(GateRejection::Unauthorized)
        );
        assert_eq!(
            admit(&state, &params(Some("alice-token")), &HeaderMap::new()),
            Ok(1)
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer bob-token"),
        );
        assert_eq!(admit(&state, &params(None), &headers), Ok(2));
    }

    #[test]
    fn test_admit_enforces_capacity() {
        let mut config = config_with_tokens();
        config.limits.max_connections = 1;
        let state = state_with(config);

        let (session, _queue) = Session::new(1, 4);
        state.hub.registry().register(session);

        assert_eq!(
            admit(&state, &params(Some("bob-token")), &HeaderMap::new()),
            Err(GateRejection::AtCapacity)
        );
        // Reconnecting user replaces their own session
        assert_eq!(
            admit(&state, &params(Some("alice-token")), &HeaderMap::new()),
            Ok(1)
        );
    }

    #[test]
    fn test_rejection_status_codes() {
        assert_eq!(
            GateRejection::Unauthorized.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GateRejection::AtCapacity.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_health_reports_online_users() {
        let state = state_with(Config::default());
        let (session, _queue) = Session::new(5, 4);
        state.hub.registry().register(session);

        let (status, body) = get_json(state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["online_users"], 1);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_online_lookup() {
        let state = state_with(Config::default());
        let (session, _queue) = Session::new(5, 4);
        state.hub.registry().register(session);

        let (_, body) = get_json(state.clone(), "/online/5").await;
        assert_eq!(body, json!({"user_id": 5, "online": true}));

        let (_, body) = get_json(state, "/online/6").await;
        assert_eq!(body, json!({"user_id": 6, "online": false}));
    }

    #[tokio::test]
    async fn test_send_message_publishes_to_bus() {
        let bus = Arc::new(InMemoryBus::new());
        let state = state_on_bus(config_with_tokens(), bus.clone());
        let mut direct = bus.subscribe(&["im:message".to_string()]).await.unwrap();

        let status = post_message(
            state,
            Some("alice-token"),
            json!({"to_user_id": 2, "content": "hi bob"}),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let published = direct.next().await.unwrap();
        let envelope = codec::decode(&published.payload).unwrap();
        assert_eq!(envelope.event, "message");
        assert_eq!(envelope.data["from_user_id"], 1);
        assert_eq!(envelope.data["to_user_id"], 2);
        assert_eq!(envelope.data["content"], "hi bob");
    }

    #[tokio::test]
    async fn test_send_message_rejects_bad_requests() {
        let state = state_with(config_with_tokens());

        let body = json!({"to_user_id": 2, "content": "hi"});
        assert_eq!(
            post_message(state.clone(), None, body.clone()).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            post_message(state.clone(), Some("wrong"), body).await,
            StatusCode::UNAUTHORIZED
        );

        // Needs exactly one target
        assert_eq!(
            post_message(state.clone(), Some("alice-token"), json!({"content": "hi"})).await,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            post_message(
                state,
                Some("alice-token"),
                json!({"to_user_id": 2, "group_id": 10, "content": "hi"})
            )
            .await,
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_directory_seeded_from_config() {
        let groups = vec![
            GroupEntry {
                id: 10,
                members: vec![1, 2, 3],
            },
            GroupEntry {
                id: 11,
                members: vec![],
            },
        ];
        let directory = build_directory(&groups);

        assert_eq!(directory.members(10).await.unwrap(), vec![1, 2, 3]);
        assert!(directory.members(12).await.is_err());
    }

    #[tokio::test]
    async fn test_build_bus_by_backend() {
        assert!(build_bus(&BusConfig::default()).await.is_ok());

        let broken = BusConfig {
            backend: BusBackend::Redis,
            redis_url: "not a url".to_string(),
            ..BusConfig::default()
        };
        assert!(build_bus(&broken).await.is_err());
    }
}
