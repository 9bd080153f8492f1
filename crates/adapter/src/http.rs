//! HTTP server and endpoints.

use crate::backend::BackendStatus;
use crate::error::GatewayError;
use crate::manager::BackendManager;
use crate::registry::HealthState;
use crate::session::{Session, SessionGuard, SessionManager, SessionTransport};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use futures::Stream;
use mcp_mux_protocol::{JsonRpcError, JsonRpcResponse, Message, RequestId};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, VecDeque};
use std::convert::Infallible;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub heartbeat_interval: Duration,
    pub max_post_body_bytes: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            max_post_body_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Shared application state.
pub struct AppState {
    pub backends: Arc<BackendManager>,
    pub sessions: Arc<SessionManager>,
    pub settings: HttpSettings,
    pub start_time: Instant,
    pub version: &'static str,
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl AppState {
    pub fn new(
        backends: Arc<BackendManager>,
        sessions: Arc<SessionManager>,
        settings: HttpSettings,
    ) -> Self {
        Self {
            backends,
            sessions,
            settings,
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION"),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
        }
    }
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.settings.max_post_body_bytes;
    Router::new()
        // Gateway-wide
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/tools", get(tools))
        // Per backend
        .route("/{name}/sse", get(sse))
        .route("/{name}/mcp", post(mcp))
        .route("/{name}/health", get(backend_health))
        .route("/{name}/restart", post(restart))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Attach request counting middleware (total + failed).
pub fn with_request_counting(router: Router, state: Arc<AppState>) -> Router {
    use axum::{
        body::Body,
        http::Request,
        middleware::{Next, from_fn_with_state},
    };

    async fn count_requests(
        State(state): State<Arc<AppState>>,
        request: Request<Body>,
        next: Next,
    ) -> Response {
        let should_count = !request.uri().path().ends_with("/health");

        if should_count {
            state.total_requests.fetch_add(1, Ordering::Relaxed);
        }
        let response = next.run(request).await;
        if should_count && !response.status().is_success() {
            state.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        response
    }

    router.layer(from_fn_with_state(state, count_requests))
}

/// A JSON-RPC error body with the HTTP status matching the failure.
fn rpc_error(id: Option<RequestId>, err: &GatewayError) -> Response {
    rpc_error_with_status(err.http_status(), id, err.to_rpc_error())
}

fn rpc_error_with_status(status: StatusCode, id: Option<RequestId>, err: JsonRpcError) -> Response {
    (
        status,
        Json(Message::Response(JsonRpcResponse::error(id, err))),
    )
        .into_response()
}

// ============================================================================
// Health / Status / Discovery
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// GET /health - Always returns 200 if the gateway is running.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

#[derive(Serialize)]
struct StatusResponse {
    version: &'static str,
    uptime_seconds: u64,
    backends: BTreeMap<String, BackendStatus>,
    sessions: SessionStats,
    stats: StatsInfo,
}

#[derive(Serialize)]
struct SessionStats {
    active: usize,
    opened_total: u64,
}

#[derive(Serialize)]
struct StatsInfo {
    total_requests: u64,
    failed_requests: u64,
}

/// GET /status - Detailed status information.
async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: state.version,
        uptime_seconds: state.start_time.elapsed().as_secs(),
        backends: state.backends.get_all_status(),
        sessions: SessionStats {
            active: state.sessions.len(),
            opened_total: state.sessions.opened_total(),
        },
        stats: StatsInfo {
            total_requests: state.total_requests.load(Ordering::Relaxed),
            failed_requests: state.failed_requests.load(Ordering::Relaxed),
        },
    })
}

/// GET /tools - Cached tool lists of every healthy backend, keyed by backend name.
async fn tools(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, Vec<Value>>> {
    Json(
        state
            .backends
            .healthy_tools()
            .into_iter()
            .map(|(name, tools)| (name, tools.as_ref().clone()))
            .collect(),
    )
}

#[derive(Serialize)]
struct BackendHealthResponse {
    status: HealthState,
    backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    uptime: Option<u64>,
    pending_count: usize,
}

/// GET /{name}/health - 200 when healthy, 503 otherwise.
async fn backend_health(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    let backend = match state.backends.get_backend(&name) {
        Ok(b) => b,
        Err(e) => return rpc_error(None, &e),
    };
    let status = backend.status();
    let code = if status.health == HealthState::Healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(BackendHealthResponse {
            status: status.health,
            backend: status.name,
            uptime: status.uptime_secs,
            pending_count: status.pending_count,
        }),
    )
        .into_response()
}

/// POST /{name}/restart - Operator restart; clears crash bookkeeping.
async fn restart(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    tracing::info!(backend = %name, "restart requested over HTTP");
    match state.backends.restart(&name).await {
        Ok(()) => {
            let health = state
                .backends
                .get_backend(&name)
                .map_or(HealthState::Unknown, |b| b.descriptor().health());
            Json(json!({ "status": "restarted", "backend": name, "health": health }))
                .into_response()
        }
        Err(e) => rpc_error(None, &e),
    }
}

// ============================================================================
// SSE stream
// ============================================================================

struct EventStream {
    guard: SessionGuard,
    outbound: mpsc::Receiver<Message>,
    heartbeat: tokio::time::Interval,
    preamble: VecDeque<Event>,
    finished: bool,
}

fn message_event(msg: &Message) -> Event {
    Event::default()
        .event("message")
        .data(msg.to_value().to_string())
}

fn close_event(session: &Session) -> Event {
    let reason = session
        .close_reason()
        .unwrap_or(GatewayError::SessionClosed);
    Event::default().event("close").data(
        json!({
            "reason": reason.kind(),
            "message": reason.to_string(),
        })
        .to_string(),
    )
}

/// GET /{name}/sse - Opens a streaming session.
///
/// Emits `connection`, then `endpoint` (where to POST, plus the cached tool list), then
/// backend pushes and responses as `message` events, with `ping` heartbeats in between.
async fn sse(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Response> {
    let opened = state
        .sessions
        .open(&name, SessionTransport::SseStream)
        .map_err(|e| rpc_error(None, &e))?;
    let Some(outbound) = opened.outbound else {
        return Err(rpc_error(
            None,
            &GatewayError::InvalidRequest("streaming session has no outbound queue".to_string()),
        ));
    };
    let session = opened.session;
    let session_id = session.id().to_string();
    tracing::info!(backend = %name, session_id = %session_id, "SSE client connected");

    let descriptor = session.backend().descriptor();
    let tools = descriptor.tools();
    let connection = Event::default().event("connection").data(
        json!({
            "service": "mcp-mux",
            "version": state.version,
            "backend": name,
            "sessionId": session_id,
            "serverInfo": descriptor.server_info(),
        })
        .to_string(),
    );
    let endpoint = Event::default().event("endpoint").data(
        json!({
            "uri": format!("/{name}/mcp?sessionId={session_id}"),
            "sessionId": session_id,
            "tools": &*tools,
        })
        .to_string(),
    );

    let period = state.settings.heartbeat_interval;
    let stream_state = EventStream {
        guard: SessionGuard::new(state.sessions.clone(), session),
        outbound,
        heartbeat: tokio::time::interval_at(tokio::time::Instant::now() + period, period),
        preamble: VecDeque::from([connection, endpoint]),
        finished: false,
    };

    let stream = futures::stream::unfold(stream_state, |mut st| async move {
        if let Some(event) = st.preamble.pop_front() {
            return Some((Ok::<Event, Infallible>(event), st));
        }
        if st.finished {
            return None;
        }
        let session = st.guard.session().clone();
        tokio::select! {
            biased;
            msg = st.outbound.recv() => msg.map(|m| (Ok(message_event(&m)), st)),
            () = session.closed().cancelled() => {
                st.finished = true;
                Some((Ok(close_event(&session)), st))
            }
            // Heartbeats are not session activity.
            _ = st.heartbeat.tick() => {
                let ping = Event::default().event("ping").data(
                    json!({ "ts": chrono::Utc::now().to_rfc3339() }).to_string(),
                );
                Some((Ok(ping), st))
            }
        }
    });

    Ok(Sse::new(stream))
}

// ============================================================================
// JSON-RPC over POST
// ============================================================================

#[derive(Debug, Deserialize)]
struct McpQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// POST /{name}/mcp - One JSON-RPC message.
///
/// With a streaming session id the request is accepted (202) and its response is delivered on
/// the stream. Without one, an ephemeral session carries this single call and the response is
/// returned in the body.
async fn mcp(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<McpQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return rpc_error_with_status(
                StatusCode::BAD_REQUEST,
                None,
                JsonRpcError::parse_error(e),
            );
        }
    };
    let message = match Message::from_value(value) {
        Ok(m) => m,
        Err(e) => {
            return rpc_error_with_status(
                StatusCode::BAD_REQUEST,
                None,
                JsonRpcError::invalid_request(e),
            );
        }
    };

    let session_id = query.session_id.or_else(|| {
        headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });
    let bound = match session_id {
        Some(id) => match bound_session(&state, &name, &id) {
            Ok(session) => Some(session),
            Err(e) => {
                let request_id = match &message {
                    Message::Request(r) => Some(r.id.clone()),
                    _ => None,
                };
                return rpc_error(request_id, &e);
            }
        },
        None => None,
    };

    match message {
        Message::Request(request) => {
            let request_id = request.id.clone();
            if let Some(session) = bound {
                if session.transport() != SessionTransport::SyncHttp {
                    spawn_streamed_call(state.sessions.clone(), session, request);
                    return StatusCode::ACCEPTED.into_response();
                }
                return match state.sessions.send(&session, request).await {
                    Ok(resp) => Json(Message::Response(resp)).into_response(),
                    Err(e) => rpc_error(Some(request_id), &e),
                };
            }

            let opened = match state.sessions.open(&name, SessionTransport::SyncHttp) {
                Ok(o) => o,
                Err(e) => return rpc_error(Some(request_id), &e),
            };
            let guard = SessionGuard::new(state.sessions.clone(), opened.session);
            match state.sessions.send(guard.session(), request).await {
                Ok(resp) => Json(Message::Response(resp)).into_response(),
                Err(e) => rpc_error(Some(request_id), &e),
            }
        }
        Message::Notification(notification) => {
            let result = match bound {
                Some(session) => state.sessions.notify(&session, notification).await,
                None => match state.sessions.open(&name, SessionTransport::SyncHttp) {
                    Ok(opened) => {
                        let guard = SessionGuard::new(state.sessions.clone(), opened.session);
                        state.sessions.notify(guard.session(), notification).await
                    }
                    Err(e) => Err(e),
                },
            };
            match result {
                Ok(()) => StatusCode::ACCEPTED.into_response(),
                Err(e) => rpc_error(None, &e),
            }
        }
        Message::Response(response) => {
            // The gateway never forwards backend-initiated requests, so there is nothing to match.
            tracing::debug!(backend = %name, id = ?response.id, "discarding client response");
            StatusCode::ACCEPTED.into_response()
        }
    }
}

fn bound_session(
    state: &AppState,
    backend: &str,
    id: &str,
) -> crate::error::Result<Arc<Session>> {
    let session = state.sessions.get(id)?;
    if session.backend_name() != backend {
        return Err(GatewayError::UnknownSession(id.to_string()));
    }
    if session.closed().is_cancelled() {
        return Err(GatewayError::SessionClosed);
    }
    Ok(session)
}

fn spawn_streamed_call(
    sessions: Arc<SessionManager>,
    session: Arc<Session>,
    request: mcp_mux_protocol::JsonRpcRequest,
) {
    tokio::spawn(async move {
        let id = request.id.clone();
        let response = match sessions.send(&session, request).await {
            Ok(resp) => resp,
            Err(GatewayError::SessionClosed) => return,
            Err(e) => JsonRpcResponse::error(Some(id), e.to_rpc_error()),
        };
        if let Err(e) = session.push(Message::Response(response)) {
            tracing::debug!(session_id = %session.id(), error = %e, "response not delivered");
        }
    });
}
