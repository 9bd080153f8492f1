//! Client sessions multiplexed over shared backends.
//!
//! A session binds one client connection to one backend. It never owns the backend process;
//! it only holds a reference to the shared [`Backend`], and its outstanding requests live in
//! that backend's correlation map tagged with the session id.
//!
//! Lifecycle: `Opening -> Active -> Closing -> Closed`. Closed is terminal; the id is dropped
//! from the table and, being a random v4 UUID, is never handed out again.

use crate::backend::{Backend, ensure_accepting};
use crate::error::{GatewayError, Result};
use crate::manager::BackendManager;
use crate::registry::BackendDescriptor;
use crate::timeouts::CallTimeouts;
use chrono::{DateTime, Utc};
use mcp_mux_protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message, methods};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Opaque, globally unique session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(Arc<str>);

impl SessionId {
    pub fn new() -> Self {
        Self(Arc::from(Uuid::new_v4().simple().to_string()))
    }

    /// Id used for requests the gateway issues on its own behalf (handshake, probes).
    pub fn system() -> Self {
        Self(Arc::from("mcp-mux"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionTransport {
    /// Long-lived SSE stream; responses to POSTs are pushed on the stream.
    SseStream,
    /// One POST, one response.
    SyncHttp,
    /// Direct stdio bridge.
    Pipe,
}

impl SessionTransport {
    fn is_streaming(self) -> bool {
        !matches!(self, SessionTransport::SyncHttp)
    }

    /// A pipe lives as long as the gateway process, so it is never idle-reaped.
    fn reaped_when_idle(self) -> bool {
        !matches!(self, SessionTransport::Pipe)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Opening,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub timeouts: CallTimeouts,
    /// Capacity of a streaming session's outbound queue.
    pub queue_capacity: usize,
    pub janitor_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(900),
            timeouts: CallTimeouts::default(),
            queue_capacity: 64,
            janitor_interval: Duration::from_millis(500),
        }
    }
}

pub struct Session {
    id: SessionId,
    backend: Arc<dyn Backend>,
    transport: SessionTransport,
    created_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    state: Mutex<SessionState>,
    in_flight: AtomicUsize,
    outbound: Option<mpsc::Sender<Message>>,
    closed: CancellationToken,
    close_reason: Mutex<Option<GatewayError>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("backend", &self.backend.name())
            .field("transport", &self.transport)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn transport(&self) -> SessionTransport {
        self.transport
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock())
    }

    /// Cancelled once the session starts closing.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn close_reason(&self) -> Option<GatewayError> {
        self.close_reason.lock().clone()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            SessionState::Opening | SessionState::Active => Ok(()),
            SessionState::Closing | SessionState::Closed => Err(GatewayError::SessionClosed),
        }
    }

    fn mark_active(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Opening {
            *state = SessionState::Active;
        }
    }

    /// Queue a frame for the client. A full queue closes the session as a slow consumer.
    pub(crate) fn push(&self, msg: Message) -> Result<()> {
        let Some(outbound) = &self.outbound else {
            return Err(GatewayError::InvalidRequest(
                "session has no outbound stream".to_string(),
            ));
        };
        if self.closed.is_cancelled() {
            return Err(GatewayError::SessionClosed);
        }
        match outbound.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    session_id = %self.id,
                    backend = %self.backend.name(),
                    "outbound queue full; disconnecting slow consumer"
                );
                self.close(GatewayError::SlowConsumer);
                Err(GatewayError::SlowConsumer)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close(GatewayError::SessionClosed);
                Err(GatewayError::SessionClosed)
            }
        }
    }

    /// Idempotent. Fails this session's pending requests without touching other sessions.
    pub(crate) fn close(&self, reason: GatewayError) -> bool {
        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return false;
            }
            *state = SessionState::Closing;
        }
        *self.close_reason.lock() = Some(reason.clone());

        // Wakes every `send` still waiting on this session.
        self.closed.cancel();
        self.backend.release_session(&self.id);
        self.backend.descriptor().session_closed();

        *self.state.lock() = SessionState::Closed;
        tracing::debug!(
            session_id = %self.id,
            backend = %self.backend.name(),
            reason = %reason,
            "session closed"
        );
        true
    }

    fn begin_call(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight(&self.in_flight)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A freshly opened session and, for streaming transports, the receiving end of its queue.
pub struct Opened {
    pub session: Arc<Session>,
    pub outbound: Option<mpsc::Receiver<Message>>,
}

pub struct SessionManager {
    backends: Arc<BackendManager>,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    settings: SessionSettings,
    opened_total: AtomicU64,
}

impl SessionManager {
    pub fn new(backends: Arc<BackendManager>, settings: SessionSettings) -> Self {
        Self {
            backends,
            sessions: RwLock::new(HashMap::new()),
            settings,
            opened_total: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn backends(&self) -> &Arc<BackendManager> {
        &self.backends
    }

    /// Open a session against `backend`, which must currently be healthy.
    pub fn open(&self, backend: &str, transport: SessionTransport) -> Result<Opened> {
        let backend = self.backends.get_backend(backend)?;
        ensure_accepting(backend.descriptor())?;

        let (outbound_tx, outbound_rx) = if transport.is_streaming() {
            let (tx, rx) = mpsc::channel(self.settings.queue_capacity.max(1));
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let session = Arc::new(Session {
            id: SessionId::new(),
            backend: backend.clone(),
            transport,
            created_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            // Streaming sessions need no priming round-trip.
            state: Mutex::new(if transport.is_streaming() {
                SessionState::Active
            } else {
                SessionState::Opening
            }),
            in_flight: AtomicUsize::new(0),
            outbound: outbound_tx,
            closed: CancellationToken::new(),
            close_reason: Mutex::new(None),
        });

        backend.descriptor().session_opened();
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());
        self.opened_total.fetch_add(1, Ordering::Relaxed);

        if transport.is_streaming() {
            spawn_notification_forwarder(session.clone());
        }

        tracing::debug!(
            session_id = %session.id,
            backend = %backend.name(),
            ?transport,
            "session opened"
        );
        Ok(Opened {
            session,
            outbound: outbound_rx,
        })
    }

    pub fn get(&self, id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownSession(id.to_string()))
    }

    /// Forward `request` and wait for its response.
    ///
    /// Suspends only this caller. Resolves with `SessionClosed` if the session closes first.
    pub async fn send(
        &self,
        session: &Session,
        request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse> {
        session.ensure_open()?;
        session.touch();

        if let Some(local) = local_response(session.backend.descriptor(), &request) {
            session.mark_active();
            return Ok(local);
        }

        let timeout = self.settings.timeouts.for_params(request.params.as_ref());
        let _in_flight = session.begin_call();
        let result = tokio::select! {
            biased;
            () = session.closed.cancelled() => Err(GatewayError::SessionClosed),
            r = session.backend.call(&session.id, request, timeout) => r,
        };

        session.touch();
        if result.is_ok() {
            session.mark_active();
        }
        result
    }

    pub async fn notify(&self, session: &Session, notification: JsonRpcNotification) -> Result<()> {
        session.ensure_open()?;
        session.touch();
        if notification.method == methods::INITIALIZED {
            // The gateway already initialized the shared backend.
            return Ok(());
        }
        session.backend.notify(notification).await
    }

    /// Close and retire a session. Returns `false` if it was already gone.
    pub fn close(&self, id: &SessionId, reason: GatewayError) -> bool {
        let Some(session) = self.sessions.write().remove(id) else {
            return false;
        };
        session.close(reason);
        true
    }

    pub fn close_all(&self, reason: &GatewayError) {
        let sessions: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close(reason.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn opened_total(&self) -> u64 {
        self.opened_total.load(Ordering::Relaxed)
    }

    /// Close sessions idle for longer than the idle timeout; drop already-closed ones.
    pub fn reap_idle(&self, now: Instant) -> usize {
        let idle_timeout = self.settings.idle_timeout;
        let victims: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write();
            let ids: Vec<SessionId> = sessions
                .values()
                .filter(|s| {
                    s.closed.is_cancelled()
                        || (s.transport.reaped_when_idle()
                            && s.in_flight() == 0
                            && s.idle_for(now) >= idle_timeout)
                })
                .map(|s| s.id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        let mut reaped = 0;
        for session in victims {
            if session.close(GatewayError::SessionClosed) {
                tracing::info!(
                    session_id = %session.id,
                    backend = %session.backend_name(),
                    idle_secs = session.idle_for(now).as_secs(),
                    "closing idle session"
                );
                reaped += 1;
            }
        }
        reaped
    }

    pub fn spawn_janitor(self: &Arc<Self>, ct: CancellationToken) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(manager.settings.janitor_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = ct.cancelled() => break,
                    _ = tick.tick() => {
                        manager.reap_idle(Instant::now());
                    }
                }
            }
        })
    }
}

/// Closes its session when dropped (client disconnect, handler cancelled, request done).
pub struct SessionGuard {
    manager: Arc<SessionManager>,
    session: Arc<Session>,
}

impl SessionGuard {
    pub fn new(manager: Arc<SessionManager>, session: Arc<Session>) -> Self {
        Self { manager, session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.manager
            .close(&self.session.id, GatewayError::SessionClosed);
    }
}

/// Requests the gateway answers itself instead of forwarding.
///
/// The shared backend is initialized once by the supervisor, so a client's `initialize` is
/// answered from the cached result.
fn local_response(
    descriptor: &BackendDescriptor,
    request: &JsonRpcRequest,
) -> Option<JsonRpcResponse> {
    match request.method.as_str() {
        methods::INITIALIZE => descriptor
            .server_info()
            .map(|info| JsonRpcResponse::success(request.id.clone(), info)),
        methods::PING => Some(JsonRpcResponse::success(request.id.clone(), json!({}))),
        _ => None,
    }
}

fn spawn_notification_forwarder(session: Arc<Session>) {
    let mut notifications = session.backend.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = session.closed.cancelled() => break,
                next = notifications.recv() => match next {
                    Ok(n) => {
                        if session.push(Message::Notification(n)).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(
                            session_id = %session.id,
                            missed,
                            "session fell behind backend notifications"
                        );
                        session.close(GatewayError::SlowConsumer);
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}
