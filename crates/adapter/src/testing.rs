//! In-process stand-ins for backend processes.
//!
//! [`ScriptedLauncher`] hands the supervisor duplex pipes wired to a small scripted MCP server,
//! so supervision, correlation and sessions can be exercised without spawning anything.

use crate::backend::Backend;
use crate::manager::{BackendFactory, BackendManager};
use crate::registry::{BackendSpec, LaunchSpec, Registry};
use crate::remote::RemoteSettings;
use crate::session::{SessionManager, SessionSettings};
use crate::supervisor::{ChildControl, LaunchedProcess, Launcher, ProcessSettings};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

const PIPE_BUFFER: usize = 64 * 1024;
const EXIT_KILLED: i32 = 137;
const EXIT_CRASHED: i32 = 1;

#[derive(Debug, Clone)]
pub(crate) struct EchoOptions {
    /// Write a non-JSON line before anything else.
    pub garbage_first: bool,
    /// Answer `initialize` with an error.
    pub fail_initialize: bool,
    /// Tools advertised by `tools/list`, one per page.
    pub tools: Vec<&'static str>,
}

impl Default for EchoOptions {
    fn default() -> Self {
        Self {
            garbage_first: false,
            fail_initialize: false,
            tools: vec!["echo"],
        }
    }
}

#[derive(Default)]
struct Recorder {
    launches: AtomicUsize,
    failing_launches: AtomicUsize,
    requests: AtomicUsize,
    notifications: Mutex<Vec<String>>,
    wire_ids: Mutex<Vec<i64>>,
    current_crash: Mutex<Option<CancellationToken>>,
    crash_by_backend: Mutex<HashMap<String, CancellationToken>>,
}

pub(crate) struct ScriptedLauncher {
    options: EchoOptions,
    recorder: Arc<Recorder>,
}

impl ScriptedLauncher {
    pub fn new(options: EchoOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            recorder: Arc::new(Recorder::default()),
        })
    }

    /// Launch attempts so far, failed ones included.
    pub fn launches(&self) -> usize {
        self.recorder.launches.load(Ordering::SeqCst)
    }

    /// Requests received across every scripted process.
    pub fn requests_seen(&self) -> usize {
        self.recorder.requests.load(Ordering::SeqCst)
    }

    pub fn notifications_seen(&self) -> Vec<String> {
        self.recorder.notifications.lock().clone()
    }

    /// Numeric request ids as they appeared on the scripted processes' stdin.
    pub fn wire_ids(&self) -> Vec<i64> {
        self.recorder.wire_ids.lock().clone()
    }

    /// Make the most recent process exit with a non-zero code.
    pub fn crash_current(&self) {
        if let Some(token) = self.recorder.current_crash.lock().as_ref() {
            token.cancel();
        }
    }

    /// Make the latest process of `backend` exit with a non-zero code.
    pub fn crash_backend(&self, backend: &str) {
        if let Some(token) = self.recorder.crash_by_backend.lock().get(backend) {
            token.cancel();
        }
    }

    /// The next `n` launch attempts fail to spawn.
    pub fn fail_next_launches(&self, n: usize) {
        self.recorder.failing_launches.store(n, Ordering::SeqCst);
    }
}

impl Launcher for ScriptedLauncher {
    fn launch(&self, backend: &str, _spec: &LaunchSpec) -> std::io::Result<LaunchedProcess> {
        self.recorder.launches.fetch_add(1, Ordering::SeqCst);
        let failing = self.recorder.failing_launches.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| n.checked_sub(1),
        );
        if failing.is_ok() {
            return Err(std::io::Error::other(format!(
                "scripted launch of '{backend}' refused"
            )));
        }

        let (stdin, script_in) = tokio::io::duplex(PIPE_BUFFER);
        let (script_out, stdout) = tokio::io::duplex(PIPE_BUFFER);
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        let crash = CancellationToken::new();
        *self.recorder.current_crash.lock() = Some(crash.clone());
        self.recorder
            .crash_by_backend
            .lock()
            .insert(backend.to_string(), crash.clone());

        tokio::spawn(run_script(
            self.options.clone(),
            self.recorder.clone(),
            script_in,
            script_out,
            kill.clone(),
            crash,
            exit_tx,
        ));

        Ok(LaunchedProcess {
            pid: None,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: None,
            child: Box::new(ScriptedChild { exit: exit_rx, kill }),
        })
    }
}

struct ScriptedChild {
    exit: watch::Receiver<Option<i32>>,
    kill: CancellationToken,
}

#[async_trait]
impl ChildControl for ScriptedChild {
    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        match self.exit.wait_for(Option::is_some).await {
            Ok(code) => Ok(*code),
            Err(_) => Ok(None),
        }
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.kill.cancel();
        Ok(())
    }
}

fn tool(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("scripted {name}"),
        "inputSchema": {"type": "object"}
    })
}

fn reply(id: &Value, result: Value) -> String {
    json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string()
}

async fn run_script(
    options: EchoOptions,
    recorder: Arc<Recorder>,
    stdin: DuplexStream,
    mut stdout: DuplexStream,
    kill: CancellationToken,
    crash: CancellationToken,
    exit: watch::Sender<Option<i32>>,
) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
            {
                break;
            }
        }
    });

    if options.garbage_first {
        let _ = out_tx.send("this is not json".to_string());
    }

    let mut tools: Vec<String> = options.tools.iter().map(|t| (*t).to_string()).collect();
    let mut lines = BufReader::new(stdin).lines();
    let code = loop {
        let line = tokio::select! {
            () = kill.cancelled() => break EXIT_KILLED,
            () = crash.cancelled() => break EXIT_CRASHED,
            line = lines.next_line() => line,
        };
        let Ok(Some(line)) = line else { break 0 };
        let Ok(msg) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let Some(method) = msg.get("method").and_then(Value::as_str) else {
            continue;
        };
        let Some(id) = msg.get("id").cloned() else {
            recorder.notifications.lock().push(method.to_string());
            continue;
        };

        recorder.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(n) = id.as_i64() {
            recorder.wire_ids.lock().push(n);
        }
        let params = msg.get("params").cloned().unwrap_or(Value::Null);

        match method {
            "initialize" if options.fail_initialize => {
                let _ = out_tx.send(
                    json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": -32603, "message": "scripted initialize failure"}
                    })
                    .to_string(),
                );
            }
            "initialize" => {
                let _ = out_tx.send(reply(
                    &id,
                    json!({
                        "protocolVersion": mcp_mux_protocol::MCP_PROTOCOL_VERSION,
                        "capabilities": {"tools": {"listChanged": true}},
                        "serverInfo": {"name": "scripted-echo", "version": "0.0.0"}
                    }),
                ));
            }
            "tools/list" => {
                let page = params
                    .get("cursor")
                    .and_then(Value::as_str)
                    .and_then(|c| c.parse::<usize>().ok())
                    .unwrap_or(0);
                let mut result = json!({
                    "tools": tools.get(page).map(|t| vec![tool(t)]).unwrap_or_default()
                });
                if page + 1 < tools.len() {
                    result["nextCursor"] = json!((page + 1).to_string());
                }
                let _ = out_tx.send(reply(&id, result));
            }
            "ping" => {
                let _ = out_tx.send(reply(&id, json!({})));
            }
            "announce" => {
                let _ = out_tx.send(
                    json!({
                        "jsonrpc": "2.0",
                        "method": "notifications/message",
                        "params": {"level": "info", "data": "hello"}
                    })
                    .to_string(),
                );
                let _ = out_tx.send(reply(&id, json!({})));
            }
            "add_tool" => {
                if let Some(name) = params.get("name").and_then(Value::as_str) {
                    tools.push(name.to_string());
                }
                let _ = out_tx.send(
                    json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"})
                        .to_string(),
                );
                let _ = out_tx.send(reply(&id, json!({})));
            }
            _ => {
                let delay = params.get("delayMs").and_then(Value::as_u64).unwrap_or(0);
                let line = reply(&id, json!({ "echo": params }));
                if delay == 0 {
                    let _ = out_tx.send(line);
                } else {
                    let out = out_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        let _ = out.send(line);
                    });
                }
            }
        }
    };

    // Dropping the writer closes stdout, which the reader sees as EOF.
    writer.abort();
    let _ = exit.send(Some(code));
}

/// Backoff and sweep intervals short enough for tests.
pub(crate) fn test_process_settings() -> ProcessSettings {
    ProcessSettings {
        startup_timeout: Duration::from_secs(2),
        restart_backoff_min: Duration::from_millis(10),
        restart_backoff_max: Duration::from_millis(40),
        sweep_interval: Duration::from_millis(10),
        probe_refreshes_tools: true,
        ..ProcessSettings::default()
    }
}

/// A manager plus session layer over one scripted backend named `echo`.
pub(crate) struct TestGateway {
    pub launcher: Arc<ScriptedLauncher>,
    pub manager: Arc<BackendManager>,
    pub sessions: Arc<SessionManager>,
}

impl TestGateway {
    pub async fn start(options: EchoOptions) -> Self {
        Self::start_with(options, |_| {}).await
    }

    pub async fn start_with(
        options: EchoOptions,
        configure: impl FnOnce(&mut SessionSettings),
    ) -> Self {
        let launcher = ScriptedLauncher::new(options);
        let factory = BackendFactory::new(
            launcher.clone(),
            test_process_settings(),
            RemoteSettings::default(),
        )
        .unwrap();
        let manager = Arc::new(BackendManager::new(Arc::new(Registry::new()), factory));
        manager
            .register(BackendSpec::process(
                "echo",
                LaunchSpec {
                    command: "scripted-echo".to_string(),
                    args: Vec::new(),
                    env: BTreeMap::new(),
                },
            ))
            .unwrap();
        assert_eq!(manager.start_all().await, 0, "scripted backend did not start");

        let mut settings = SessionSettings::default();
        configure(&mut settings);
        let sessions = Arc::new(SessionManager::new(manager.clone(), settings));
        Self {
            launcher,
            manager,
            sessions,
        }
    }

    pub fn backend(&self, name: &str) -> Arc<dyn Backend> {
        self.manager.get_backend(name).unwrap()
    }
}
