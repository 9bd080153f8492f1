//! Request/response correlation for one backend process.
//!
//! A single task owns the pending-request map. Callers talk to it over a channel, and the
//! process reader feeds it every decoded message, so only this task ever resolves an entry.
//!
//! Correlation ids come from a counter shared by every generation of the backend's process, so
//! an id handed out before a restart is never reused after it.

use crate::error::{GatewayError, Result};
use crate::session::SessionId;
use bytes::Bytes;
use mcp_mux_protocol::{
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message, RequestId,
    encode, methods,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

/// Why a correlator is going away; decides the error pending callers see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The process died or its pipes broke.
    Crashed,
    /// Replaced on operator request.
    Restarting,
    /// Explicit stop.
    Stopped,
}

enum Command {
    Dispatch {
        session: SessionId,
        request: JsonRpcRequest,
        deadline: Instant,
        timeout: Duration,
        reply: oneshot::Sender<Result<JsonRpcResponse>>,
    },
    CloseSession(SessionId),
    Shutdown(ShutdownReason),
}

struct Pending {
    session: SessionId,
    client_id: RequestId,
    method: String,
    deadline: Instant,
    timeout: Duration,
    reply: oneshot::Sender<Result<JsonRpcResponse>>,
}

/// Cheap, cloneable handle to a running correlator.
#[derive(Clone)]
pub struct CorrelatorHandle {
    backend: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    pending: Arc<AtomicUsize>,
}

impl CorrelatorHandle {
    /// Send `request` and wait for its response (or a synthesized error).
    pub async fn call(
        &self,
        session: &SessionId,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Dispatch {
                session: session.clone(),
                request,
                deadline: Instant::now() + timeout,
                timeout,
                reply,
            })
            .map_err(|_| GatewayError::BackendRestarted(self.backend.to_string()))?;

        // The actor always answers before dropping a reply slot, except when it is torn down
        // mid-flight; treat that as a restart.
        rx.await
            .unwrap_or_else(|_| Err(GatewayError::BackendRestarted(self.backend.to_string())))
    }

    pub fn close_session(&self, session: &SessionId) {
        let _ = self.commands.send(Command::CloseSession(session.clone()));
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.commands.send(Command::Shutdown(reason));
    }

    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }
}

pub struct CorrelatorConfig {
    pub backend: Arc<str>,
    pub generation: u64,
    pub sweep_interval: Duration,
}

/// Spawn the correlation actor.
///
/// * `inbound` - every message decoded from the backend's stdout, in order.
/// * `writer` - the backend's single stdin writer queue.
/// * `notifications` - fan-out for backend-initiated notifications.
pub fn spawn(
    config: CorrelatorConfig,
    next_id: Arc<AtomicU64>,
    inbound: mpsc::Receiver<Message>,
    writer: mpsc::Sender<Bytes>,
    notifications: broadcast::Sender<JsonRpcNotification>,
) -> (CorrelatorHandle, tokio::task::JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = CorrelatorHandle {
        backend: config.backend.clone(),
        commands: commands_tx,
        pending: pending.clone(),
    };

    let actor = Correlator {
        backend: config.backend,
        generation: config.generation,
        next_id,
        pending: HashMap::new(),
        gauge: pending,
        writer,
        notifications,
    };
    let task = tokio::spawn(actor.run(commands_rx, inbound, config.sweep_interval));
    (handle, task)
}

struct Correlator {
    backend: Arc<str>,
    generation: u64,
    next_id: Arc<AtomicU64>,
    pending: HashMap<i64, Pending>,
    gauge: Arc<AtomicUsize>,
    writer: mpsc::Sender<Bytes>,
    notifications: broadcast::Sender<JsonRpcNotification>,
}

impl Correlator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::Receiver<Message>,
        sweep_interval: Duration,
    ) {
        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inbound_open = true;

        let reason = loop {
            tokio::select! {
                biased;
                cmd = commands.recv() => match cmd {
                    Some(Command::Dispatch { session, request, deadline, timeout, reply }) => {
                        self.dispatch(session, request, deadline, timeout, reply);
                    }
                    Some(Command::CloseSession(session)) => self.close_session(&session),
                    Some(Command::Shutdown(reason)) => break reason,
                    // Every handle is gone; nobody can be waiting.
                    None => break ShutdownReason::Stopped,
                },
                msg = inbound.recv(), if inbound_open => match msg {
                    Some(msg) => self.on_backend_message(msg),
                    // Reader finished; the exit watcher will send Shutdown.
                    None => inbound_open = false,
                },
                _ = sweep.tick() => self.expire(Instant::now()),
            }
        };

        self.fail_all(reason);
        tracing::debug!(
            backend = %self.backend,
            generation = self.generation,
            ?reason,
            "correlator stopped"
        );
    }

    fn update_gauge(&self) {
        self.gauge.store(self.pending.len(), Ordering::Relaxed);
    }

    fn allocate_id(&self) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        i64::try_from(id).unwrap_or(i64::MAX)
    }

    fn dispatch(
        &mut self,
        session: SessionId,
        mut request: JsonRpcRequest,
        deadline: Instant,
        timeout: Duration,
        reply: oneshot::Sender<Result<JsonRpcResponse>>,
    ) {
        if reply.is_closed() {
            return;
        }

        let correlation_id = self.allocate_id();
        let client_id = std::mem::replace(&mut request.id, RequestId::Number(correlation_id));
        let method = request.method.clone();
        let frame = encode(&Message::Request(request));

        match self.writer.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(backend = %self.backend, "stdin queue full; rejecting request");
                let _ = reply.send(Err(GatewayError::Overloaded(self.backend.to_string())));
                return;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                let _ = reply.send(Err(GatewayError::transport(
                    &self.backend,
                    "stdin writer is closed",
                )));
                return;
            }
        }

        tracing::trace!(
            backend = %self.backend,
            session_id = %session,
            correlation_id,
            %method,
            "request forwarded"
        );
        self.pending.insert(
            correlation_id,
            Pending {
                session,
                client_id,
                method,
                deadline,
                timeout,
                reply,
            },
        );
        self.update_gauge();
    }

    fn on_backend_message(&mut self, msg: Message) {
        match msg {
            Message::Response(response) => self.on_response(response),
            Message::Notification(notification) => {
                // No subscribers is fine.
                let _ = self.notifications.send(notification);
            }
            Message::Request(request) => self.on_backend_request(request),
        }
    }

    fn on_response(&mut self, mut response: JsonRpcResponse) {
        let Some(RequestId::Number(correlation_id)) = response.id else {
            tracing::warn!(
                backend = %self.backend,
                id = ?response.id,
                error = ?response.outcome.as_ref().err(),
                "backend response without a usable id"
            );
            return;
        };

        let Some(pending) = self.pending.remove(&correlation_id) else {
            // Timed out, or its session is gone.
            tracing::debug!(
                backend = %self.backend,
                correlation_id,
                "discarding response for unknown correlation id"
            );
            return;
        };
        self.update_gauge();

        response.id = Some(pending.client_id);
        let _ = pending.reply.send(Ok(response));
    }

    /// Backend-to-client requests cannot be attributed to one session on a shared process.
    fn on_backend_request(&self, request: JsonRpcRequest) {
        let response = if request.method == methods::PING {
            JsonRpcResponse::success(request.id, json!({}))
        } else {
            tracing::debug!(
                backend = %self.backend,
                method = %request.method,
                "refusing backend-initiated request"
            );
            JsonRpcResponse::error(
                Some(request.id),
                JsonRpcError::method_not_found(&request.method),
            )
        };
        if self
            .writer
            .try_send(encode(&Message::Response(response)))
            .is_err()
        {
            tracing::warn!(backend = %self.backend, "could not answer backend request");
        }
    }

    fn close_session(&mut self, session: &SessionId) {
        let ids: Vec<i64> = self
            .pending
            .iter()
            .filter(|(_, p)| &p.session == session)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(p) = self.pending.remove(&id) {
                let _ = p.reply.send(Err(GatewayError::SessionClosed));
            }
        }
        self.update_gauge();
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<i64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now || p.reply.is_closed())
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return;
        }
        for id in expired {
            if let Some(p) = self.pending.remove(&id) {
                if !p.reply.is_closed() {
                    tracing::debug!(
                        backend = %self.backend,
                        session_id = %p.session,
                        correlation_id = id,
                        method = %p.method,
                        "request deadline elapsed"
                    );
                }
                let _ = p.reply.send(Err(GatewayError::timeout(&self.backend, p.timeout)));
            }
        }
        self.update_gauge();
    }

    fn fail_all(&mut self, reason: ShutdownReason) {
        let count = self.pending.len();
        for (_, p) in self.pending.drain() {
            let err = match reason {
                ShutdownReason::Crashed | ShutdownReason::Restarting => {
                    GatewayError::BackendRestarted(self.backend.to_string())
                }
                ShutdownReason::Stopped => GatewayError::BackendStopped(self.backend.to_string()),
            };
            let _ = p.reply.send(Err(err));
        }
        self.update_gauge();
        if count > 0 {
            tracing::warn!(
                backend = %self.backend,
                generation = self.generation,
                failed = count,
                ?reason,
                "failed pending requests"
            );
        }
    }
}
