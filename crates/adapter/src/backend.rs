//! Backend trait for unified backend management.
//!
//! Process-backed and remote backends both implement [`Backend`], so the session manager, the
//! health monitor and the HTTP front door treat them uniformly.

use crate::error::{GatewayError, Result};
use crate::registry::{BackendDescriptor, HealthState, TransportKind};
use crate::session::SessionId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mcp_mux_protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, methods};
use serde::Serialize;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Upper bound on `tools/list` pages followed during discovery.
const MAX_TOOL_PAGES: usize = 64;

/// Status information for a backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub transport: TransportKind,
    pub health: HealthState,
    /// Seconds since the current process (or remote connection) came up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    pub pending_count: usize,
    pub active_sessions: usize,
    pub tool_count: usize,
    pub restart_count: u32,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_restart: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Common interface for all backend kinds.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Get the backend's name.
    fn name(&self) -> &str {
        self.descriptor().name()
    }

    fn descriptor(&self) -> &Arc<BackendDescriptor>;

    fn transport(&self) -> TransportKind {
        self.descriptor().transport()
    }

    fn status(&self) -> BackendStatus;

    /// Bring the backend up (spawn + handshake, or connect + initialize).
    async fn start(&self) -> Result<()>;

    /// Forward one request on behalf of `session` and wait for its correlated response.
    ///
    /// The response carries the caller's original id.
    async fn call(
        &self,
        session: &SessionId,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse>;

    /// Forward a client notification. No response is expected.
    async fn notify(&self, notification: JsonRpcNotification) -> Result<()>;

    /// Fail every request still pending for `session` with `SessionClosed`.
    fn release_session(&self, session: &SessionId);

    /// Backend-initiated notifications.
    fn subscribe(&self) -> broadcast::Receiver<JsonRpcNotification>;

    /// Cheap liveness check used by the health monitor.
    async fn probe(&self) -> Result<()>;

    fn pending_count(&self) -> usize;

    /// Operator-requested restart: clears crash bookkeeping and starts over.
    async fn restart(&self) -> Result<()>;

    /// Shutdown the backend gracefully. Never triggers restart logic.
    async fn shutdown(&self);
}

/// Reject new work unless the backend is healthy.
pub(crate) fn ensure_accepting(descriptor: &BackendDescriptor) -> Result<()> {
    match descriptor.health() {
        HealthState::Healthy => Ok(()),
        state => Err(GatewayError::BackendUnhealthy {
            name: descriptor.name().to_string(),
            state,
        }),
    }
}

/// Follow `tools/list` pagination until the backend stops returning `nextCursor`.
///
/// `page` issues one `tools/list` request with the given params.
pub(crate) async fn collect_tools<F, Fut>(backend: &str, mut page: F) -> Result<Vec<Value>>
where
    F: FnMut(JsonRpcRequest) -> Fut,
    Fut: Future<Output = Result<JsonRpcResponse>>,
{
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;

    for page_no in 0..MAX_TOOL_PAGES {
        let params = match &cursor {
            Some(c) => json!({ "cursor": c }),
            None => json!({}),
        };
        let page_no = i64::try_from(page_no).unwrap_or(i64::MAX);
        let response = page(JsonRpcRequest::new(page_no, methods::TOOLS_LIST, Some(params))).await?;
        let result = response.outcome.map_err(|e| {
            GatewayError::remote(backend, format!("tools/list rejected: {e}"))
        })?;

        if let Some(items) = result.get("tools").and_then(Value::as_array) {
            tools.extend(items.iter().cloned());
        }

        cursor = result
            .get("nextCursor")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        if cursor.is_none() {
            return Ok(tools);
        }
    }

    tracing::warn!(
        backend = %backend,
        pages = MAX_TOOL_PAGES,
        "tools/list pagination did not terminate; keeping what was collected"
    );
    Ok(tools)
}

/// `initialize` params the gateway sends on its own behalf.
pub(crate) fn gateway_initialize_params() -> Value {
    json!({
        "protocolVersion": mcp_mux_protocol::MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "mcp-mux",
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_mux_protocol::RequestId;

    #[tokio::test]
    async fn collect_tools_follows_cursor() {
        let mut seen_cursors = Vec::new();
        let tools = collect_tools("echo", |req| {
            let cursor = req
                .params
                .as_ref()
                .and_then(|p| p.get("cursor"))
                .and_then(Value::as_str)
                .map(str::to_string);
            seen_cursors.push(cursor.clone());
            let result = match cursor.as_deref() {
                None => json!({"tools": [{"name": "a"}], "nextCursor": "p2"}),
                Some("p2") => json!({"tools": [{"name": "b"}]}),
                Some(other) => panic!("unexpected cursor {other}"),
            };
            async move { Ok(JsonRpcResponse::success(RequestId::Number(0), result)) }
        })
        .await
        .unwrap();

        let names: Vec<_> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(seen_cursors, vec![None, Some("p2".to_string())]);
    }

    #[tokio::test]
    async fn collect_tools_surfaces_rpc_errors() {
        let err = collect_tools("echo", |_| async {
            Ok(JsonRpcResponse::error(
                Some(RequestId::Number(0)),
                mcp_mux_protocol::JsonRpcError::method_not_found("tools/list"),
            ))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::Remote { .. }));
    }
}
