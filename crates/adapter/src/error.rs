//! Gateway error taxonomy.
//!
//! Every variant maps to a JSON-RPC error object so that clients always receive a well-formed
//! error, and to an HTTP status for the front door.

use crate::registry::HealthState;
use axum::http::StatusCode;
use mcp_mux_protocol::{JsonRpcError, ProtocolError};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

pub mod codes {
    pub const UNKNOWN_BACKEND: i64 = -32001;
    pub const BACKEND_UNHEALTHY: i64 = -32002;
    pub const TIMEOUT: i64 = -32003;
    pub const BACKEND_RESTARTED: i64 = -32004;
    pub const SESSION_CLOSED: i64 = -32005;
    pub const SLOW_CONSUMER: i64 = -32006;
    pub const OVERLOADED: i64 = -32007;
    pub const TRANSPORT: i64 = -32008;
    pub const UNKNOWN_SESSION: i64 = -32009;
    pub const REMOTE: i64 = -32010;
    pub const BACKEND_STOPPED: i64 = -32011;
}

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    #[error("unknown session '{0}'")]
    UnknownSession(String),

    #[error("backend '{name}' is {state}")]
    BackendUnhealthy { name: String, state: HealthState },

    #[error("backend '{0}' restarted before responding")]
    BackendRestarted(String),

    #[error("backend '{0}' was stopped")]
    BackendStopped(String),

    #[error("request to '{backend}' timed out after {timeout_ms}ms")]
    Timeout { backend: String, timeout_ms: u64 },

    #[error("session closed")]
    SessionClosed,

    #[error("session outbound queue is full")]
    SlowConsumer,

    #[error("backend '{0}' write queue is full")]
    Overloaded(String),

    #[error("transport failure on '{backend}': {reason}")]
    Transport { backend: String, reason: String },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("remote backend '{backend}' failed: {reason}")]
    Remote { backend: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("startup failed: {0}")]
    Startup(String),
}

impl GatewayError {
    pub fn timeout(backend: &str, timeout: std::time::Duration) -> Self {
        GatewayError::Timeout {
            backend: backend.to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn transport(backend: &str, reason: impl std::fmt::Display) -> Self {
        GatewayError::Transport {
            backend: backend.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn remote(backend: &str, reason: impl std::fmt::Display) -> Self {
        GatewayError::Remote {
            backend: backend.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Stable machine-readable name, carried in `error.data.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::UnknownBackend(_) => "unknown_backend",
            GatewayError::UnknownSession(_) => "unknown_session",
            GatewayError::BackendUnhealthy { .. } => "backend_unhealthy",
            GatewayError::BackendRestarted(_) => "backend_restarted",
            GatewayError::BackendStopped(_) => "backend_stopped",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::SessionClosed => "session_closed",
            GatewayError::SlowConsumer => "slow_consumer",
            GatewayError::Overloaded(_) => "overloaded",
            GatewayError::Transport { .. } => "transport",
            GatewayError::Protocol(_) => "protocol",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::Remote { .. } => "remote",
            GatewayError::Config(_) => "config",
            GatewayError::Startup(_) => "startup",
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            GatewayError::UnknownBackend(_) => codes::UNKNOWN_BACKEND,
            GatewayError::UnknownSession(_) => codes::UNKNOWN_SESSION,
            GatewayError::BackendUnhealthy { .. } => codes::BACKEND_UNHEALTHY,
            GatewayError::BackendRestarted(_) => codes::BACKEND_RESTARTED,
            GatewayError::BackendStopped(_) => codes::BACKEND_STOPPED,
            GatewayError::Timeout { .. } => codes::TIMEOUT,
            GatewayError::SessionClosed => codes::SESSION_CLOSED,
            GatewayError::SlowConsumer => codes::SLOW_CONSUMER,
            GatewayError::Overloaded(_) => codes::OVERLOADED,
            GatewayError::Transport { .. } => codes::TRANSPORT,
            GatewayError::Remote { .. } => codes::REMOTE,
            GatewayError::Protocol(_) => JsonRpcError::PARSE_ERROR,
            GatewayError::InvalidRequest(_) => JsonRpcError::INVALID_REQUEST,
            GatewayError::Config(_) | GatewayError::Startup(_) => JsonRpcError::INTERNAL_ERROR,
        }
    }

    pub fn backend(&self) -> Option<&str> {
        match self {
            GatewayError::UnknownBackend(name)
            | GatewayError::BackendRestarted(name)
            | GatewayError::BackendStopped(name)
            | GatewayError::Overloaded(name)
            | GatewayError::BackendUnhealthy { name, .. }
            | GatewayError::Timeout { backend: name, .. }
            | GatewayError::Transport { backend: name, .. }
            | GatewayError::Remote { backend: name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            GatewayError::UnknownBackend(_) | GatewayError::UnknownSession(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::BackendUnhealthy { .. }
            | GatewayError::BackendStopped(_)
            | GatewayError::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BackendRestarted(_)
            | GatewayError::Transport { .. }
            | GatewayError::Remote { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::SessionClosed | GatewayError::SlowConsumer => StatusCode::GONE,
            GatewayError::Protocol(_) | GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Config(_) | GatewayError::Startup(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn to_rpc_error(&self) -> JsonRpcError {
        let mut data = json!({ "kind": self.kind() });
        if let Some(backend) = self.backend() {
            data["backend"] = json!(backend);
        }
        if let GatewayError::BackendUnhealthy { state, .. } = self {
            data["state"] = json!(state);
        }
        JsonRpcError::new(self.code(), self.to_string()).with_data(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_error_carries_kind_and_backend() {
        let err = GatewayError::BackendUnhealthy {
            name: "echo".to_string(),
            state: HealthState::Degraded,
        };
        let rpc = err.to_rpc_error();
        assert_eq!(rpc.code, codes::BACKEND_UNHEALTHY);
        assert_eq!(rpc.message, "backend 'echo' is degraded");
        let data = rpc.data.unwrap();
        assert_eq!(data["kind"], "backend_unhealthy");
        assert_eq!(data["backend"], "echo");
        assert_eq!(data["state"], "degraded");
    }

    #[test]
    fn unknown_backend_is_not_found() {
        let err = GatewayError::UnknownBackend("x".into());
        assert_eq!(err.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(err.code(), codes::UNKNOWN_BACKEND);
    }

    #[test]
    fn timeout_reports_milliseconds() {
        let err = GatewayError::timeout("echo", std::time::Duration::from_millis(1500));
        assert_eq!(err.to_string(), "request to 'echo' timed out after 1500ms");
        assert_eq!(err.http_status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
