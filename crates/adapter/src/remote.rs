//! Remote backends: MCP services that already speak HTTP.
//!
//! JSON-RPC messages are POSTed to the backend URL. The upstream may answer with plain JSON or
//! with an SSE stream carrying the response (and possibly notifications first). An upstream
//! `mcp-session-id` issued at `initialize` is reused for every later request and re-established
//! once if the upstream forgets it (HTTP 404).

use crate::backend::{
    Backend, BackendStatus, collect_tools, ensure_accepting, gateway_initialize_params,
};
use crate::error::{GatewayError, Result};
use crate::registry::{BackendDescriptor, HealthState, TransportKind};
use crate::session::SessionId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mcp_mux_protocol::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message, RequestId, methods,
};
use parking_lot::{Mutex, RwLock};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

const MCP_SESSION_ID: &str = "mcp-session-id";
const ACCEPT_BOTH: &str = "application/json, text/event-stream";

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub connect_timeout: Duration,
    /// Deadline for `initialize` + `tools/list`.
    pub startup_timeout: Duration,
    /// Deadline for notifications and probes.
    pub request_timeout: Duration,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            startup_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

enum Exchange {
    Response(JsonRpcResponse),
    /// The upstream no longer recognises our `mcp-session-id`.
    SessionExpired,
}

#[derive(Debug, Default)]
struct ConnectionState {
    connected_at: Option<Instant>,
    reconnects: u32,
    last_reconnect: Option<DateTime<Utc>>,
}

pub struct RemoteBackend {
    name: Arc<str>,
    descriptor: Arc<BackendDescriptor>,
    url: String,
    settings: Arc<RemoteSettings>,
    http: reqwest::Client,
    upstream_session: RwLock<Option<String>>,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    notifications: broadcast::Sender<JsonRpcNotification>,
    connection: Mutex<ConnectionState>,
    lifecycle: tokio::sync::Mutex<()>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl RemoteBackend {
    pub fn new(
        descriptor: Arc<BackendDescriptor>,
        url: String,
        settings: Arc<RemoteSettings>,
        http: reqwest::Client,
    ) -> Self {
        let (notifications, _) = broadcast::channel(256);
        Self {
            name: Arc::from(descriptor.name()),
            descriptor,
            url,
            settings,
            http,
            upstream_session: RwLock::new(None),
            next_id: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            notifications,
            connection: Mutex::new(ConnectionState::default()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    fn allocate_id(&self) -> i64 {
        i64::try_from(self.next_id.fetch_add(1, Ordering::Relaxed)).unwrap_or(i64::MAX)
    }

    fn map_send_error(&self, e: &reqwest::Error, timeout: Duration) -> GatewayError {
        if e.is_timeout() {
            GatewayError::timeout(&self.name, timeout)
        } else {
            GatewayError::remote(&self.name, e)
        }
    }

    async fn post(&self, body: &Message, timeout: Duration) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .post(&self.url)
            .header(ACCEPT, ACCEPT_BOTH)
            .timeout(timeout)
            .json(body);
        if let Some(session) = self.upstream_session.read().clone() {
            request = request.header(MCP_SESSION_ID, session);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.map_send_error(&e, timeout))?;

        if let Some(session) = response
            .headers()
            .get(MCP_SESSION_ID)
            .and_then(|v| v.to_str().ok())
        {
            *self.upstream_session.write() = Some(session.to_string());
        }
        Ok(response)
    }

    /// One POST of `request` under a gateway-allocated id; the caller's id is restored.
    async fn exchange_once(&self, request: &JsonRpcRequest, timeout: Duration) -> Result<Exchange> {
        let upstream_id = self.allocate_id();
        let mut outbound = request.clone();
        outbound.id = RequestId::Number(upstream_id);

        let had_session = self.upstream_session.read().is_some();
        let response = self.post(&Message::Request(outbound), timeout).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND && had_session {
            return Ok(Exchange::SessionExpired);
        }
        if !status.is_success() {
            return Err(GatewayError::remote(
                &self.name,
                format!("{} answered HTTP {status}", request.method),
            ));
        }

        let mut reply = self.read_response(response, upstream_id, timeout).await?;
        reply.id = Some(request.id.clone());
        Ok(Exchange::Response(reply))
    }

    async fn exchange(
        &self,
        request: &JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        match self.exchange_once(request, timeout).await? {
            Exchange::Response(r) => Ok(r),
            Exchange::SessionExpired => {
                tracing::info!(backend = %self.name, "upstream session expired; re-initializing");
                self.initialize(timeout).await?;
                match self.exchange_once(request, timeout).await? {
                    Exchange::Response(r) => Ok(r),
                    Exchange::SessionExpired => Err(GatewayError::remote(
                        &self.name,
                        "upstream rejected a freshly initialized session",
                    )),
                }
            }
        }
    }

    async fn initialize(&self, timeout: Duration) -> Result<Value> {
        *self.upstream_session.write() = None;
        let init = JsonRpcRequest::new(0, methods::INITIALIZE, Some(gateway_initialize_params()));
        let Exchange::Response(response) = self.exchange_once(&init, timeout).await? else {
            return Err(GatewayError::remote(&self.name, "initialize was rejected"));
        };
        let server_info = response.outcome.map_err(|e| {
            GatewayError::remote(&self.name, format!("initialize failed: {e}"))
        })?;

        self.post_notification(JsonRpcNotification::new(methods::INITIALIZED, None), timeout)
            .await?;
        Ok(server_info)
    }

    async fn post_notification(
        &self,
        notification: JsonRpcNotification,
        timeout: Duration,
    ) -> Result<()> {
        let response = self
            .post(&Message::Notification(notification), timeout)
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::remote(
                &self.name,
                format!("notification answered HTTP {}", response.status()),
            ));
        }
        Ok(())
    }

    /// Pull the response for `upstream_id` out of a JSON or SSE body.
    async fn read_response(
        &self,
        mut response: reqwest::Response,
        upstream_id: i64,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let wanted = Some(RequestId::Number(upstream_id));

        if !is_stream {
            let body = response
                .bytes()
                .await
                .map_err(|e| self.map_send_error(&e, timeout))?;
            return match serde_json::from_slice::<Message>(&body) {
                Ok(Message::Response(r)) if r.id == wanted || r.id.is_none() => Ok(r),
                Ok(other) => Err(GatewayError::remote(
                    &self.name,
                    format!("unexpected reply: {:?}", other.method()),
                )),
                Err(e) => Err(GatewayError::remote(
                    &self.name,
                    format!("invalid JSON-RPC body: {e}"),
                )),
            };
        }

        let mut events = SseDecoder::default();
        loop {
            let chunk = response
                .chunk()
                .await
                .map_err(|e| self.map_send_error(&e, timeout))?;
            let payloads = match &chunk {
                Some(bytes) => events.push(bytes),
                None => events.finish(),
            };
            for data in payloads {
                match serde_json::from_str::<Message>(&data) {
                    Ok(Message::Response(r)) if r.id == wanted => return Ok(r),
                    Ok(Message::Notification(n)) => {
                        let _ = self.notifications.send(n);
                    }
                    Ok(other) => {
                        tracing::debug!(
                            backend = %self.name,
                            method = ?other.method(),
                            "ignoring unrelated upstream message"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            backend = %self.name,
                            error = %e,
                            "discarding malformed SSE data"
                        );
                    }
                }
            }
            if chunk.is_none() {
                return Err(GatewayError::remote(
                    &self.name,
                    "event stream ended without a response",
                ));
            }
        }
    }

    async fn connect(&self) -> Result<()> {
        let timeout = self.settings.startup_timeout;
        let server_info = self.initialize(timeout).await?;
        let tools = collect_tools(&self.name, move |req| async move {
            self.exchange(&req, timeout).await
        })
        .await?;

        tracing::info!(
            backend = %self.name,
            url = %self.url,
            tools = tools.len(),
            "Remote backend connected"
        );
        self.descriptor.set_server_info(server_info);
        self.descriptor.set_tools(tools);
        self.connection.lock().connected_at = Some(Instant::now());
        Ok(())
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    fn descriptor(&self) -> &Arc<BackendDescriptor> {
        &self.descriptor
    }

    fn status(&self) -> BackendStatus {
        let connection = self.connection.lock();
        BackendStatus {
            name: self.name.to_string(),
            transport: TransportKind::Remote,
            health: self.descriptor.health(),
            uptime_secs: connection.connected_at.map(|t| t.elapsed().as_secs()),
            pending_count: self.in_flight.load(Ordering::Acquire),
            active_sessions: self.descriptor.active_sessions(),
            tool_count: self.descriptor.tools().len(),
            restart_count: connection.reconnects,
            consecutive_failures: 0,
            last_restart: connection.last_reconnect,
            pid: None,
        }
    }

    async fn start(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.descriptor.set_health(HealthState::Starting);
        match self.connect().await {
            Ok(()) => {
                self.descriptor.set_health(HealthState::Healthy);
                Ok(())
            }
            Err(e) => {
                // The health monitor keeps probing and promotes it once reachable.
                self.descriptor.set_health(HealthState::Degraded);
                Err(e)
            }
        }
    }

    async fn call(
        &self,
        _session: &SessionId,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        ensure_accepting(&self.descriptor)?;
        let _in_flight = InFlight::enter(&self.in_flight);
        self.exchange(&request, timeout).await
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<()> {
        ensure_accepting(&self.descriptor)?;
        self.post_notification(notification, self.settings.request_timeout)
            .await
    }

    /// Each call is its own HTTP request, so the session manager's cancellation already
    /// abandons it; nothing is tracked per session here.
    fn release_session(&self, _session: &SessionId) {}

    fn subscribe(&self) -> broadcast::Receiver<JsonRpcNotification> {
        self.notifications.subscribe()
    }

    async fn probe(&self) -> Result<()> {
        if self.descriptor.server_info().is_none() {
            let _guard = self.lifecycle.lock().await;
            return self.connect().await;
        }
        let ping = JsonRpcRequest::new(0, methods::PING, Some(json!({})));
        // Any well-formed JSON-RPC answer proves the upstream is alive.
        self.exchange(&ping, self.settings.request_timeout)
            .await
            .map(|_| ())
    }

    fn pending_count(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    async fn restart(&self) -> Result<()> {
        tracing::info!(backend = %self.name, "operator reconnect requested");
        {
            let mut connection = self.connection.lock();
            connection.reconnects = connection.reconnects.saturating_add(1);
            connection.last_reconnect = Some(Utc::now());
        }
        self.start().await
    }

    async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        let session = self.upstream_session.write().take();
        if let Some(session) = session {
            // Best effort; the upstream may not support explicit termination.
            let _ = self
                .http
                .delete(&self.url)
                .header(MCP_SESSION_ID, session)
                .timeout(Duration::from_secs(2))
                .send()
                .await;
        }
        self.connection.lock().connected_at = None;
        self.descriptor.set_health(HealthState::Unknown);
    }
}

/// Incremental `text/event-stream` decoder yielding each event's `data` payload.
#[derive(Debug, Default)]
struct SseDecoder {
    buf: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            self.line(line.trim_end_matches(['\n', '\r']), &mut out);
        }
        out
    }

    fn finish(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            let rest = String::from_utf8_lossy(&rest);
            self.line(rest.trim_end_matches('\r'), &mut out);
        }
        self.line("", &mut out);
        out
    }

    fn line(&mut self, line: &str, out: &mut Vec<String>) {
        if line.is_empty() {
            if !self.data.is_empty() {
                out.push(self.data.join("\n"));
                self.data.clear();
            }
            return;
        }
        if let Some(data) = line.strip_prefix("data:") {
            self.data
                .push(data.strip_prefix(' ').unwrap_or(data).to_string());
        }
        // `event:`, `id:`, `retry:` and comments carry nothing we need.
    }
}
