//! Process supervision for stdio backends.
//!
//! Exactly one OS process runs per backend, no matter how many clients are connected. Each
//! incarnation is a [`ProcessHandle`] generation: its own pipes, reader/writer tasks and
//! correlation actor. A crash replaces the whole generation; nothing carries over except the
//! correlation-id counter, which is shared so ids are never reused.

use crate::backend::{
    Backend, BackendStatus, collect_tools, ensure_accepting, gateway_initialize_params,
};
use crate::correlator::{self, CorrelatorConfig, CorrelatorHandle, ShutdownReason};
use crate::error::{GatewayError, Result};
use crate::registry::{BackendDescriptor, HealthState, LaunchSpec, TransportKind};
use crate::session::SessionId;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use mcp_mux_protocol::{
    DEFAULT_MAX_FRAME_BYTES, Decoded, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    LineCodec, Message, encode, methods,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, timeout};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

/// Messages decoded from stdout waiting for the correlator.
const INBOUND_QUEUE: usize = 256;
const NOTIFICATION_FANOUT: usize = 256;
/// How long `shutdown` waits for a killed process to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

// ============================================================================
// Launching
// ============================================================================

/// Control over a launched child.
#[async_trait]
pub trait ChildControl: Send {
    /// Wait for the child to exit; returns its exit code when the OS reports one.
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;

    async fn kill(&mut self) -> std::io::Result<()>;
}

/// A freshly spawned backend with its stdio pipes.
pub struct LaunchedProcess {
    pub pid: Option<u32>,
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub child: Box<dyn ChildControl>,
}

/// Spawns backend processes. Swappable so the supervisor can be driven without real processes.
pub trait Launcher: Send + Sync {
    fn launch(&self, backend: &str, spec: &LaunchSpec) -> std::io::Result<LaunchedProcess>;
}

/// Launches real OS processes with piped stdio.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandLauncher;

struct TokioChild(tokio::process::Child);

#[async_trait]
impl ChildControl for TokioChild {
    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self.0.wait().await?.code())
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.0.kill().await
    }
}

impl Launcher for CommandLauncher {
    fn launch(&self, backend: &str, spec: &LaunchSpec) -> std::io::Result<LaunchedProcess> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Keep terminal signals aimed at the gateway away from its children.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let missing =
            |pipe: &str| std::io::Error::other(format!("{pipe} of '{backend}' was not captured"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take();

        Ok(LaunchedProcess {
            pid: child.id(),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as BoxedReader),
            child: Box::new(TokioChild(child)),
        })
    }
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone)]
pub struct ProcessSettings {
    /// Spawn + `initialize` + `tools/list`.
    pub startup_timeout: Duration,
    pub restart_backoff_min: Duration,
    pub restart_backoff_max: Duration,
    /// Consecutive failed restarts before the backend is left `crashed`.
    pub max_restarts: u32,
    /// Capacity of the stdin write queue.
    pub write_queue: usize,
    pub max_frame_bytes: usize,
    /// How often the correlator sweeps expired deadlines.
    pub sweep_interval: Duration,
    /// Health probes also re-run `tools/list`.
    pub probe_refreshes_tools: bool,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(30),
            restart_backoff_min: Duration::from_secs(1),
            restart_backoff_max: Duration::from_secs(30),
            max_restarts: 5,
            write_queue: 256,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            sweep_interval: Duration::from_millis(100),
            probe_refreshes_tools: true,
        }
    }
}

/// Exponential backoff: min * 2^(failures-1), capped at max.
pub(crate) fn compute_backoff_delay(
    min: Duration,
    max: Duration,
    consecutive_failures: u32,
) -> Duration {
    if consecutive_failures == 0 {
        return Duration::from_millis(0);
    }

    let min_ms = u64::try_from(min.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);

    let exp = (consecutive_failures - 1).min(30);
    let candidate = min_ms.saturating_mul(1u64 << exp);
    Duration::from_millis(candidate.min(max_ms))
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Process Handle
// ============================================================================

/// One incarnation of a backend process.
pub struct ProcessHandle {
    generation: u64,
    pid: Option<u32>,
    started_at: Instant,
    correlator: CorrelatorHandle,
    writer: mpsc::Sender<Bytes>,
    stop: CancellationToken,
    stop_reason: Mutex<ShutdownReason>,
    /// Cancelled once the child has been reaped.
    exited: CancellationToken,
}

impl ProcessHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_alive(&self) -> bool {
        !self.exited.is_cancelled()
    }

    /// Queue one encoded frame for stdin through the single writer path.
    pub fn write(&self, backend: &str, frame: Bytes) -> Result<()> {
        match self.writer.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(GatewayError::Overloaded(backend.to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(GatewayError::transport(backend, "stdin writer is closed"))
            }
        }
    }

    /// Ask the exit watcher to kill the process. Never leads to a restart.
    pub fn stop(&self, reason: ShutdownReason) {
        *self.stop_reason.lock() = reason;
        self.stop.cancel();
    }

    async fn reaped(&self) {
        self.exited.cancelled().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitCause {
    /// Died on its own or its pipes broke.
    Crashed { code: Option<i32> },
    Stopped(ShutdownReason),
}

#[derive(Debug)]
struct ExitReport {
    generation: u64,
    cause: ExitCause,
    uptime: Duration,
}

/// Wire a launched process to a fresh correlator and its I/O tasks.
fn spawn_handle(
    name: &Arc<str>,
    launched: LaunchedProcess,
    generation: u64,
    settings: &ProcessSettings,
    next_id: Arc<AtomicU64>,
    notifications: broadcast::Sender<JsonRpcNotification>,
) -> (Arc<ProcessHandle>, oneshot::Receiver<ExitReport>) {
    let LaunchedProcess {
        pid,
        stdin,
        stdout,
        stderr,
        child,
    } = launched;

    let (writer_tx, writer_rx) = mpsc::channel::<Bytes>(settings.write_queue.max(1));
    let (inbound_tx, inbound_rx) = mpsc::channel::<Message>(INBOUND_QUEUE);
    let (correlator, _task) = correlator::spawn(
        CorrelatorConfig {
            backend: name.clone(),
            generation,
            sweep_interval: settings.sweep_interval,
        },
        next_id,
        inbound_rx,
        writer_tx.clone(),
        notifications,
    );

    let handle = Arc::new(ProcessHandle {
        generation,
        pid,
        started_at: Instant::now(),
        correlator,
        writer: writer_tx,
        stop: CancellationToken::new(),
        stop_reason: Mutex::new(ShutdownReason::Crashed),
        exited: CancellationToken::new(),
    });

    let pipe_failed = CancellationToken::new();
    tokio::spawn(write_loop(
        name.clone(),
        stdin,
        writer_rx,
        pipe_failed.clone(),
        handle.exited.clone(),
    ));
    tokio::spawn(read_loop(
        name.clone(),
        stdout,
        settings.max_frame_bytes,
        inbound_tx,
        pipe_failed.clone(),
    ));
    if let Some(stderr) = stderr {
        tokio::spawn(stderr_loop(name.clone(), stderr));
    }

    let (exit_tx, exit_rx) = oneshot::channel();
    tokio::spawn(watch_child(
        name.clone(),
        child,
        handle.clone(),
        pipe_failed,
        exit_tx,
    ));

    (handle, exit_rx)
}

async fn write_loop(
    backend: Arc<str>,
    mut stdin: BoxedWriter,
    mut frames: mpsc::Receiver<Bytes>,
    pipe_failed: CancellationToken,
    exited: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            () = exited.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let written = async {
            stdin.write_all(&frame).await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            tracing::warn!(backend = %backend, error = %e, "stdin write failed");
            pipe_failed.cancel();
            break;
        }
    }
}

async fn read_loop(
    backend: Arc<str>,
    stdout: BoxedReader,
    max_frame_bytes: usize,
    inbound: mpsc::Sender<Message>,
    pipe_failed: CancellationToken,
) {
    let mut frames = FramedRead::new(stdout, LineCodec::new(max_frame_bytes));
    while let Some(item) = frames.next().await {
        match item {
            Ok(Decoded::Messages(messages)) => {
                for msg in messages {
                    if inbound.send(msg).await.is_err() {
                        return;
                    }
                }
            }
            Ok(Decoded::Malformed(e)) => {
                tracing::warn!(
                    backend = %backend,
                    error = %e,
                    "discarding malformed frame from backend"
                );
            }
            Err(e) => {
                tracing::warn!(backend = %backend, error = %e, "stdout read failed");
                break;
            }
        }
    }
    tracing::debug!(backend = %backend, "backend stdout closed");
    pipe_failed.cancel();
}

async fn stderr_loop(backend: Arc<str>, stderr: BoxedReader) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(backend = %backend, line = %line, "backend stderr");
    }
}

async fn watch_child(
    backend: Arc<str>,
    mut child: Box<dyn ChildControl>,
    handle: Arc<ProcessHandle>,
    pipe_failed: CancellationToken,
    exit_tx: oneshot::Sender<ExitReport>,
) {
    enum Wake {
        Exited(std::io::Result<Option<i32>>),
        Stop,
        PipeFailed,
    }

    let wake = tokio::select! {
        status = child.wait() => Wake::Exited(status),
        () = handle.stop.cancelled() => Wake::Stop,
        () = pipe_failed.cancelled() => Wake::PipeFailed,
    };

    let code = match wake {
        Wake::Exited(status) => status.ok().flatten(),
        Wake::Stop | Wake::PipeFailed => {
            if let Err(e) = child.kill().await {
                tracing::debug!(backend = %backend, error = %e, "kill failed (already exited?)");
            }
            child.wait().await.ok().flatten()
        }
    };

    let cause = if handle.stop.is_cancelled() {
        ExitCause::Stopped(*handle.stop_reason.lock())
    } else {
        ExitCause::Crashed { code }
    };
    let reason = match cause {
        ExitCause::Stopped(reason) => reason,
        ExitCause::Crashed { .. } => ShutdownReason::Crashed,
    };

    // Fail everything pending on this generation before anyone can observe the exit.
    handle.correlator.shutdown(reason);
    handle.exited.cancel();

    tracing::debug!(
        backend = %backend,
        generation = handle.generation,
        ?cause,
        "backend process reaped"
    );
    let _ = exit_tx.send(ExitReport {
        generation: handle.generation,
        cause,
        uptime: handle.uptime(),
    });
}

// ============================================================================
// Process Backend
// ============================================================================

#[derive(Debug, Default)]
struct RestartState {
    restart_count: u32,
    consecutive_failures: u32,
    last_restart: Option<DateTime<Utc>>,
    loop_running: bool,
}

/// A backend served by one supervised child process.
#[derive(Clone)]
pub struct ProcessBackend {
    name: Arc<str>,
    descriptor: Arc<BackendDescriptor>,
    launch: LaunchSpec,
    settings: Arc<ProcessSettings>,
    launcher: Arc<dyn Launcher>,
    /// The live generation, if any.
    current: Arc<RwLock<Option<Arc<ProcessHandle>>>>,
    /// Correlation ids, shared by every generation.
    next_id: Arc<AtomicU64>,
    generations: Arc<AtomicU64>,
    notifications: broadcast::Sender<JsonRpcNotification>,
    restart_state: Arc<Mutex<RestartState>>,
    /// Serializes start, restart and shutdown.
    lifecycle: Arc<tokio::sync::Mutex<()>>,
    shutdown: CancellationToken,
}

impl ProcessBackend {
    pub fn new(
        descriptor: Arc<BackendDescriptor>,
        launch: LaunchSpec,
        settings: Arc<ProcessSettings>,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_FANOUT);
        Self {
            name: Arc::from(descriptor.name()),
            descriptor,
            launch,
            settings,
            launcher,
            current: Arc::new(RwLock::new(None)),
            next_id: Arc::new(AtomicU64::new(1)),
            generations: Arc::new(AtomicU64::new(0)),
            notifications,
            restart_state: Arc::new(Mutex::new(RestartState::default())),
            lifecycle: Arc::new(tokio::sync::Mutex::new(())),
            shutdown: CancellationToken::new(),
        }
    }

    fn current_handle(&self) -> Option<Arc<ProcessHandle>> {
        self.current.read().clone()
    }

    fn live_handle(&self) -> Result<Arc<ProcessHandle>> {
        self.current_handle()
            .filter(|h| h.is_alive())
            .ok_or_else(|| GatewayError::BackendUnhealthy {
                name: self.name.to_string(),
                state: self.descriptor.health(),
            })
    }

    /// Launch a new generation and run the MCP handshake. Caller holds the lifecycle lock.
    async fn start_generation(&self) -> Result<()> {
        tracing::info!(
            backend = %self.name,
            command = %self.launch.command,
            "Starting backend process"
        );
        self.descriptor.set_health(HealthState::Starting);

        let launched = match self.launcher.launch(&self.name, &self.launch) {
            Ok(launched) => launched,
            Err(e) => {
                self.descriptor.set_health(HealthState::Crashed);
                return Err(GatewayError::Startup(format!(
                    "failed to spawn '{}': {e}",
                    self.name
                )));
            }
        };

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let (handle, exit_rx) = spawn_handle(
            &self.name,
            launched,
            generation,
            &self.settings,
            self.next_id.clone(),
            self.notifications.clone(),
        );

        let startup_timeout = self.settings.startup_timeout;
        let handshake = match timeout(startup_timeout, self.handshake(&handle)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Startup(format!(
                "startup timeout after {}s for '{}'",
                startup_timeout.as_secs(),
                self.name
            ))),
        };
        let (server_info, tools) = match handshake {
            Ok(v) => v,
            Err(e) => {
                handle.stop(ShutdownReason::Crashed);
                self.descriptor.set_health(HealthState::Crashed);
                return Err(match e {
                    GatewayError::Startup(_) => e,
                    other => GatewayError::Startup(format!(
                        "handshake with '{}' failed: {other}",
                        self.name
                    )),
                });
            }
        };

        let server_name = server_info
            .pointer("/serverInfo/name")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        tracing::info!(
            backend = %self.name,
            generation,
            pid = ?handle.pid(),
            server = %server_name,
            tools = tools.len(),
            "Backend process ready"
        );

        self.descriptor.set_server_info(server_info);
        self.descriptor.set_tools(tools);
        *self.current.write() = Some(handle.clone());
        self.descriptor.set_health(HealthState::Healthy);

        tokio::spawn(self.clone().watch_exit(exit_rx));
        self.spawn_tools_refresher(handle);
        Ok(())
    }

    /// `initialize`, `notifications/initialized`, then the full `tools/list`.
    async fn handshake(&self, handle: &ProcessHandle) -> Result<(Value, Vec<Value>)> {
        let system = SessionId::system();
        let startup_timeout = self.settings.startup_timeout;

        let init = handle
            .correlator
            .call(
                &system,
                JsonRpcRequest::new(0, methods::INITIALIZE, Some(gateway_initialize_params())),
                startup_timeout,
            )
            .await?;
        let server_info = init.outcome.map_err(|e| {
            GatewayError::Startup(format!("'{}' rejected initialize: {e}", self.name))
        })?;

        let initialized = JsonRpcNotification::new(methods::INITIALIZED, None);
        handle.write(&self.name, encode(&Message::Notification(initialized)))?;

        let tools = self.list_tools(handle, startup_timeout).await?;
        Ok((server_info, tools))
    }

    async fn list_tools(&self, handle: &ProcessHandle, deadline: Duration) -> Result<Vec<Value>> {
        let system = SessionId::system();
        collect_tools(&self.name, |req| {
            let correlator = handle.correlator.clone();
            let system = system.clone();
            async move { correlator.call(&system, req, deadline).await }
        })
        .await
    }

    async fn refresh_tools(&self, handle: &ProcessHandle) -> Result<()> {
        let tools = self.list_tools(handle, self.settings.startup_timeout).await?;
        tracing::debug!(backend = %self.name, tools = tools.len(), "tool list refreshed");
        self.descriptor.set_tools(tools);
        Ok(())
    }

    fn spawn_tools_refresher(&self, handle: Arc<ProcessHandle>) {
        let mut notifications = self.notifications.subscribe();
        let backend = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = handle.reaped() => break,
                    next = notifications.recv() => match next {
                        Ok(n) if n.method == methods::TOOLS_LIST_CHANGED => {
                            if let Err(e) = backend.refresh_tools(&handle).await {
                                tracing::warn!(
                                    backend = %backend.name,
                                    error = %e,
                                    "tool list refresh failed"
                                );
                            }
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    async fn watch_exit(self, exit: oneshot::Receiver<ExitReport>) {
        let Ok(report) = exit.await else { return };

        {
            let mut current = self.current.write();
            // A newer generation already took over.
            if current.as_ref().map(|h| h.generation) != Some(report.generation) {
                return;
            }
            *current = None;
        }

        let ExitCause::Crashed { code } = report.cause else {
            return;
        };
        tracing::warn!(
            backend = %self.name,
            generation = report.generation,
            exit_code = ?code,
            uptime_ms = millis(report.uptime),
            "backend process exited unexpectedly"
        );
        self.descriptor.set_health(HealthState::Crashed);

        {
            let mut rs = self.restart_state.lock();
            // A long healthy run forgives earlier crashes.
            if report.uptime >= self.settings.restart_backoff_max {
                rs.consecutive_failures = 0;
            }
            rs.consecutive_failures = rs.consecutive_failures.saturating_add(1);
        }
        self.spawn_restart_loop();
    }

    fn spawn_restart_loop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        {
            let mut rs = self.restart_state.lock();
            if rs.loop_running {
                return;
            }
            rs.loop_running = true;
        }

        let backend = self.clone();
        tokio::spawn(async move {
            backend.background_restart_loop().await;
            backend.restart_state.lock().loop_running = false;
        });
    }

    async fn background_restart_loop(&self) {
        loop {
            let failures = self.restart_state.lock().consecutive_failures;
            if failures > self.settings.max_restarts {
                tracing::error!(
                    backend = %self.name,
                    attempts = self.settings.max_restarts,
                    "giving up on backend; operator restart required"
                );
                self.descriptor.set_health(HealthState::Crashed);
                return;
            }

            let delay = compute_backoff_delay(
                self.settings.restart_backoff_min,
                self.settings.restart_backoff_max,
                failures,
            );
            tracing::info!(
                backend = %self.name,
                attempt = failures,
                delay_ms = millis(delay),
                "scheduling backend restart"
            );
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }

            let _guard = self.lifecycle.lock().await;
            if self.shutdown.is_cancelled() || self.current_handle().is_some() {
                return;
            }
            match self.start_generation().await {
                Ok(()) => {
                    let mut rs = self.restart_state.lock();
                    rs.restart_count = rs.restart_count.saturating_add(1);
                    rs.last_restart = Some(Utc::now());
                    return;
                }
                Err(e) => {
                    tracing::warn!(backend = %self.name, error = %e, "backend restart failed");
                    let mut rs = self.restart_state.lock();
                    rs.consecutive_failures = rs.consecutive_failures.saturating_add(1);
                }
            }
        }
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    fn descriptor(&self) -> &Arc<BackendDescriptor> {
        &self.descriptor
    }

    fn status(&self) -> BackendStatus {
        let current = self.current_handle();
        let rs = self.restart_state.lock();
        BackendStatus {
            name: self.name.to_string(),
            transport: TransportKind::Process,
            health: self.descriptor.health(),
            uptime_secs: current.as_ref().map(|h| h.uptime().as_secs()),
            pending_count: current
                .as_ref()
                .map_or(0, |h| h.correlator.pending_count()),
            active_sessions: self.descriptor.active_sessions(),
            tool_count: self.descriptor.tools().len(),
            restart_count: rs.restart_count,
            consecutive_failures: rs.consecutive_failures,
            last_restart: rs.last_restart,
            pid: current.and_then(|h| h.pid()),
        }
    }

    async fn start(&self) -> Result<()> {
        let guard = self.lifecycle.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(GatewayError::BackendStopped(self.name.to_string()));
        }
        if self.current_handle().is_some() {
            return Ok(());
        }

        let result = self.start_generation().await;
        drop(guard);
        if let Err(e) = &result {
            tracing::warn!(backend = %self.name, error = %e, "backend failed to start");
            self.restart_state.lock().consecutive_failures = 1;
            self.spawn_restart_loop();
        }
        result
    }

    async fn call(
        &self,
        session: &SessionId,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        ensure_accepting(&self.descriptor)?;
        let handle = self.live_handle()?;
        handle.correlator.call(session, request, timeout).await
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<()> {
        ensure_accepting(&self.descriptor)?;
        let handle = self.live_handle()?;
        handle.write(&self.name, encode(&Message::Notification(notification)))
    }

    fn release_session(&self, session: &SessionId) {
        // Older generations already failed everything they held.
        if let Some(handle) = self.current_handle() {
            handle.correlator.close_session(session);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<JsonRpcNotification> {
        self.notifications.subscribe()
    }

    async fn probe(&self) -> Result<()> {
        let handle = self
            .current_handle()
            .filter(|h| h.is_alive())
            .ok_or_else(|| GatewayError::transport(&self.name, "process is not running"))?;
        if self.settings.probe_refreshes_tools {
            self.refresh_tools(&handle).await?;
        }
        Ok(())
    }

    fn pending_count(&self) -> usize {
        self.current_handle()
            .map_or(0, |h| h.correlator.pending_count())
    }

    async fn restart(&self) -> Result<()> {
        let guard = self.lifecycle.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(GatewayError::BackendStopped(self.name.to_string()));
        }
        tracing::info!(backend = %self.name, "operator restart requested");

        self.restart_state.lock().consecutive_failures = 0;
        let old = self.current.write().take();
        if let Some(old) = old {
            old.stop(ShutdownReason::Restarting);
        }

        let result = self.start_generation().await;
        drop(guard);
        match &result {
            Ok(()) => {
                let mut rs = self.restart_state.lock();
                rs.restart_count = rs.restart_count.saturating_add(1);
                rs.last_restart = Some(Utc::now());
            }
            Err(e) => {
                tracing::warn!(backend = %self.name, error = %e, "operator restart failed");
                self.restart_state.lock().consecutive_failures = 1;
                self.spawn_restart_loop();
            }
        }
        result
    }

    async fn shutdown(&self) {
        tracing::info!(backend = %self.name, "Stopping backend process");
        self.shutdown.cancel();
        let _guard = self.lifecycle.lock().await;

        let handle = self.current.write().take();
        if let Some(handle) = handle {
            handle.stop(ShutdownReason::Stopped);
            if timeout(REAP_TIMEOUT, handle.reaped()).await.is_err() {
                tracing::warn!(backend = %self.name, "backend process did not exit in time");
            }
        }
        self.descriptor.set_health(HealthState::Unknown);
    }
}
