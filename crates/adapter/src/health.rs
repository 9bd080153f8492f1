//! Periodic liveness probes.
//!
//! Process backends are probed with a cheap request over their existing pipes; remote backends
//! with `ping` (or a fresh `initialize` if they never came up). A backend that misses
//! `failure_threshold` consecutive probes is marked degraded; one successful probe clears the
//! count and brings it back. Crash recovery stays with the supervisor.

use crate::backend::Backend;
use crate::error::GatewayError;
use crate::manager::BackendManager;
use crate::registry::{HealthState, TransportKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub interval: Duration,
    pub failure_threshold: u32,
    pub probe_timeout: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            failure_threshold: 3,
            probe_timeout: Duration::from_secs(10),
        }
    }
}

pub struct HealthMonitor {
    backends: Arc<BackendManager>,
    settings: HealthSettings,
    failures: Mutex<HashMap<String, u32>>,
}

impl HealthMonitor {
    pub fn new(backends: Arc<BackendManager>, settings: HealthSettings) -> Self {
        Self {
            backends,
            settings,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// One probe round over every registered backend.
    pub async fn probe_all(&self) {
        let backends = self.backends.get_all_backends();
        self.probe_backends(&backends).await;
    }

    pub(crate) async fn probe_backends(&self, backends: &[Arc<dyn Backend>]) {
        let targets: Vec<_> = backends.iter().filter(|&b| should_probe(&**b)).collect();
        let results = futures::future::join_all(targets.iter().map(|b| async move {
            match tokio::time::timeout(self.settings.probe_timeout, b.probe()).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::timeout(b.name(), self.settings.probe_timeout)),
            }
        }))
        .await;

        let mut failures = self.failures.lock();
        failures.retain(|name, _| backends.iter().any(|b| b.name() == name));

        for (backend, result) in targets.into_iter().zip(results) {
            let descriptor = backend.descriptor();
            match result {
                Ok(()) => {
                    failures.remove(backend.name());
                    let state = descriptor.health();
                    let recoverable = state == HealthState::Degraded
                        || (backend.transport() == TransportKind::Remote
                            && state == HealthState::Unknown);
                    if recoverable && descriptor.transition_health(state, HealthState::Healthy) {
                        tracing::info!(
                            backend = %backend.name(),
                            from = %state,
                            "backend recovered"
                        );
                    }
                }
                Err(e) => {
                    let count = failures.entry(backend.name().to_string()).or_insert(0);
                    *count = count.saturating_add(1);
                    tracing::warn!(
                        backend = %backend.name(),
                        consecutive = *count,
                        error = %e,
                        "health probe failed"
                    );
                    if *count >= self.settings.failure_threshold
                        && descriptor.transition_health(HealthState::Healthy, HealthState::Degraded)
                    {
                        tracing::warn!(
                            backend = %backend.name(),
                            threshold = self.settings.failure_threshold,
                            "backend marked degraded"
                        );
                    }
                }
            }
        }
    }

    pub fn consecutive_failures(&self, backend: &str) -> u32 {
        self.failures.lock().get(backend).copied().unwrap_or(0)
    }

    pub fn spawn(self: Arc<Self>, ct: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; backends were just started.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = ct.cancelled() => break,
                    _ = ticker.tick() => self.probe_all().await,
                }
            }
            tracing::debug!("health monitor stopped");
        })
    }
}

/// Starting backends are mid-handshake; crashed or stopped processes belong to the supervisor.
fn should_probe(backend: &dyn Backend) -> bool {
    match backend.descriptor().health() {
        HealthState::Starting => false,
        HealthState::Crashed | HealthState::Unknown => backend.transport() == TransportKind::Remote,
        HealthState::Healthy | HealthState::Degraded => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendStatus;
    use crate::error::Result;
    use crate::registry::{BackendDescriptor, BackendSpec, LaunchSpec, Registry};
    use crate::remote::RemoteSettings;
    use crate::session::SessionId;
    use crate::supervisor::ProcessSettings;
    use crate::testing::ScriptedLauncher;
    use async_trait::async_trait;
    use mcp_mux_protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    struct FakeBackend {
        descriptor: Arc<BackendDescriptor>,
        reachable: AtomicBool,
        probes: AtomicUsize,
    }

    impl FakeBackend {
        fn new(spec: BackendSpec, health: HealthState) -> Arc<Self> {
            let descriptor = Arc::new(BackendDescriptor::new(spec));
            descriptor.set_health(health);
            Arc::new(Self {
                descriptor,
                reachable: AtomicBool::new(true),
                probes: AtomicUsize::new(0),
            })
        }
    }

    fn process_spec(name: &str) -> BackendSpec {
        BackendSpec::process(
            name,
            LaunchSpec {
                command: "true".to_string(),
                args: Vec::new(),
                env: std::collections::BTreeMap::new(),
            },
        )
    }

    #[async_trait]
    impl Backend for FakeBackend {
        fn descriptor(&self) -> &Arc<BackendDescriptor> {
            &self.descriptor
        }

        fn status(&self) -> BackendStatus {
            BackendStatus {
                name: self.name().to_string(),
                transport: self.transport(),
                health: self.descriptor.health(),
                uptime_secs: None,
                pending_count: 0,
                active_sessions: 0,
                tool_count: 0,
                restart_count: 0,
                consecutive_failures: 0,
                last_restart: None,
                pid: None,
            }
        }

        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn call(
            &self,
            _session: &SessionId,
            _request: JsonRpcRequest,
            _timeout: Duration,
        ) -> Result<JsonRpcResponse> {
            unreachable!("health probes never call")
        }

        async fn notify(&self, _notification: JsonRpcNotification) -> Result<()> {
            Ok(())
        }

        fn release_session(&self, _session: &SessionId) {}

        fn subscribe(&self) -> broadcast::Receiver<JsonRpcNotification> {
            broadcast::channel(1).1
        }

        async fn probe(&self) -> Result<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.reachable.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(GatewayError::transport(self.name(), "unreachable"))
            }
        }

        fn pending_count(&self) -> usize {
            0
        }

        async fn restart(&self) -> Result<()> {
            Ok(())
        }

        async fn shutdown(&self) {}
    }

    fn monitor(threshold: u32) -> HealthMonitor {
        let factory = crate::manager::BackendFactory::new(
            ScriptedLauncher::new(crate::testing::EchoOptions::default()),
            ProcessSettings::default(),
            RemoteSettings::default(),
        )
        .unwrap();
        let manager = Arc::new(BackendManager::new(Arc::new(Registry::new()), factory));
        HealthMonitor::new(
            manager,
            HealthSettings {
                failure_threshold: threshold,
                ..HealthSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn degrades_only_after_threshold_and_recovers_on_success() {
        let monitor = monitor(3);
        let fake = FakeBackend::new(process_spec("flaky"), HealthState::Healthy);
        let backends: Vec<Arc<dyn Backend>> = vec![fake.clone()];
        fake.reachable.store(false, Ordering::SeqCst);

        monitor.probe_backends(&backends).await;
        monitor.probe_backends(&backends).await;
        assert_eq!(fake.descriptor.health(), HealthState::Healthy);
        assert_eq!(monitor.consecutive_failures("flaky"), 2);

        monitor.probe_backends(&backends).await;
        assert_eq!(fake.descriptor.health(), HealthState::Degraded);

        fake.reachable.store(true, Ordering::SeqCst);
        monitor.probe_backends(&backends).await;
        assert_eq!(fake.descriptor.health(), HealthState::Healthy);
        assert_eq!(monitor.consecutive_failures("flaky"), 0);
    }

    #[tokio::test]
    async fn a_single_success_resets_the_failure_streak() {
        let monitor = monitor(2);
        let fake = FakeBackend::new(process_spec("blip"), HealthState::Healthy);
        let backends: Vec<Arc<dyn Backend>> = vec![fake.clone()];

        fake.reachable.store(false, Ordering::SeqCst);
        monitor.probe_backends(&backends).await;
        fake.reachable.store(true, Ordering::SeqCst);
        monitor.probe_backends(&backends).await;
        fake.reachable.store(false, Ordering::SeqCst);
        monitor.probe_backends(&backends).await;
        assert_eq!(fake.descriptor.health(), HealthState::Healthy);
    }

    #[tokio::test]
    async fn crashed_and_starting_processes_are_left_to_the_supervisor() {
        let monitor = monitor(1);
        let crashed = FakeBackend::new(process_spec("crashed"), HealthState::Crashed);
        let starting = FakeBackend::new(process_spec("starting"), HealthState::Starting);
        let backends: Vec<Arc<dyn Backend>> = vec![crashed.clone(), starting.clone()];

        monitor.probe_backends(&backends).await;
        assert_eq!(crashed.probes.load(Ordering::SeqCst), 0);
        assert_eq!(starting.probes.load(Ordering::SeqCst), 0);
        assert_eq!(crashed.descriptor.health(), HealthState::Crashed);
    }

    #[tokio::test]
    async fn unreachable_remote_is_promoted_once_it_answers() {
        let monitor = monitor(1);
        let remote = FakeBackend::new(
            BackendSpec::remote("api", "http://127.0.0.1:1/mcp"),
            HealthState::Degraded,
        );
        let backends: Vec<Arc<dyn Backend>> = vec![remote.clone()];

        remote.reachable.store(false, Ordering::SeqCst);
        monitor.probe_backends(&backends).await;
        assert_eq!(remote.descriptor.health(), HealthState::Degraded);

        remote.reachable.store(true, Ordering::SeqCst);
        monitor.probe_backends(&backends).await;
        assert_eq!(remote.descriptor.health(), HealthState::Healthy);
    }

    #[tokio::test]
    async fn failure_counts_of_removed_backends_are_pruned() {
        let monitor = monitor(5);
        let gone = FakeBackend::new(process_spec("gone"), HealthState::Healthy);
        gone.reachable.store(false, Ordering::SeqCst);
        monitor.probe_backends(&[gone.clone() as Arc<dyn Backend>]).await;
        assert_eq!(monitor.consecutive_failures("gone"), 1);

        monitor.probe_backends(&[]).await;
        assert_eq!(monitor.consecutive_failures("gone"), 0);
    }
}
