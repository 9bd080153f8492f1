//! Owns the live backend instances and keeps them in step with the registry.

use crate::backend::{Backend, BackendStatus};
use crate::error::{GatewayError, Result};
use crate::registry::{BackendDescriptor, BackendSpec, Endpoint, Registry, ReloadPlan};
use crate::remote::{RemoteBackend, RemoteSettings};
use crate::supervisor::{Launcher, ProcessBackend, ProcessSettings};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// How often a retired backend is checked for remaining sessions.
const DRAIN_POLL: Duration = Duration::from_millis(200);

/// Builds the right [`Backend`] for a descriptor's transport.
pub struct BackendFactory {
    launcher: Arc<dyn Launcher>,
    process: Arc<ProcessSettings>,
    remote: Arc<RemoteSettings>,
    http: reqwest::Client,
}

impl BackendFactory {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        process: ProcessSettings,
        remote: RemoteSettings,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(remote.connect_timeout)
            .build()
            .map_err(|e| GatewayError::Startup(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            launcher,
            process: Arc::new(process),
            remote: Arc::new(remote),
            http,
        })
    }

    pub fn build(&self, descriptor: Arc<BackendDescriptor>) -> Arc<dyn Backend> {
        match &descriptor.spec().endpoint {
            Endpoint::Process(launch) => Arc::new(ProcessBackend::new(
                descriptor.clone(),
                launch.clone(),
                self.process.clone(),
                self.launcher.clone(),
            )),
            Endpoint::Remote { url } => Arc::new(RemoteBackend::new(
                descriptor.clone(),
                url.clone(),
                self.remote.clone(),
                self.http.clone(),
            )),
        }
    }
}

/// Manages all backends (both process and remote).
pub struct BackendManager {
    registry: Arc<Registry>,
    backends: RwLock<HashMap<String, Arc<dyn Backend>>>,
    factory: BackendFactory,
}

impl BackendManager {
    pub fn new(registry: Arc<Registry>, factory: BackendFactory) -> Self {
        Self {
            registry,
            backends: RwLock::new(HashMap::new()),
            factory,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Register a backend and build its instance. Does not start it.
    pub fn register(&self, spec: BackendSpec) -> Result<Arc<dyn Backend>> {
        let descriptor = self.registry.register(spec)?;
        let backend = self.factory.build(descriptor);
        self.backends
            .write()
            .insert(backend.name().to_string(), backend.clone());
        Ok(backend)
    }

    /// Get a backend by name.
    pub fn get_backend(&self, name: &str) -> Result<Arc<dyn Backend>> {
        self.backends
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownBackend(name.to_string()))
    }

    /// All backends, ordered by name.
    pub fn get_all_backends(&self) -> Vec<Arc<dyn Backend>> {
        let mut backends: Vec<_> = self.backends.read().values().cloned().collect();
        backends.sort_by(|a, b| a.name().cmp(b.name()));
        backends
    }

    pub fn get_all_status(&self) -> BTreeMap<String, BackendStatus> {
        self.backends
            .read()
            .iter()
            .map(|(name, backend)| (name.clone(), backend.status()))
            .collect()
    }

    /// Cached tool lists of every backend that is currently healthy.
    pub fn healthy_tools(&self) -> BTreeMap<String, Arc<Vec<Value>>> {
        self.backends
            .read()
            .values()
            .filter(|b| b.descriptor().is_healthy())
            .map(|b| (b.name().to_string(), b.descriptor().tools()))
            .collect()
    }

    /// Start every backend concurrently. Returns how many failed their first start.
    ///
    /// A failed backend stays registered; its supervisor keeps retrying with backoff.
    pub async fn start_all(&self) -> usize {
        let backends = self.get_all_backends();
        let results = futures::future::join_all(backends.iter().map(|b| b.start())).await;

        let mut failures = 0;
        for (backend, result) in backends.iter().zip(results) {
            if let Err(e) = result {
                failures += 1;
                tracing::warn!(backend = %backend.name(), error = %e, "backend did not start");
            }
        }
        failures
    }

    /// Operator restart of one backend.
    pub async fn restart(&self, name: &str) -> Result<()> {
        self.get_backend(name)?.restart().await
    }

    pub async fn shutdown_all(&self) {
        tracing::info!("Shutting down all backends");
        let backends = self.get_all_backends();
        futures::future::join_all(backends.iter().map(|b| b.shutdown())).await;
    }

    pub fn is_empty(&self) -> bool {
        self.backends.read().is_empty()
    }

    /// Apply a new backend set.
    ///
    /// Added backends are started, unchanged ones are left alone, and removed or redefined ones
    /// stop accepting sessions immediately but are only shut down once their sessions drain.
    pub async fn apply_reload(&self, specs: Vec<BackendSpec>) -> Result<ReloadPlan> {
        let plan = self.registry.reload(specs)?;
        if plan.is_noop() {
            tracing::info!("Reload: no backend changes");
            return Ok(plan);
        }

        let mut to_start = Vec::new();
        let mut retired = Vec::new();
        {
            let mut backends = self.backends.write();
            for old in &plan.removed {
                if let Some(backend) = backends.remove(old.name()) {
                    retired.push(backend);
                }
            }
            for (_, new) in &plan.replaced {
                let backend = self.factory.build(new.clone());
                if let Some(old) = backends.insert(new.name().to_string(), backend.clone()) {
                    retired.push(old);
                }
                to_start.push(backend);
            }
            for new in &plan.added {
                let backend = self.factory.build(new.clone());
                backends.insert(new.name().to_string(), backend.clone());
                to_start.push(backend);
            }
        }

        tracing::info!(
            added = plan.added.len(),
            replaced = plan.replaced.len(),
            removed = plan.removed.len(),
            unchanged = plan.unchanged.len(),
            "Reload applied"
        );

        for backend in retired {
            tokio::spawn(drain_and_stop(backend));
        }
        let results = futures::future::join_all(to_start.iter().map(|b| b.start())).await;
        for (backend, result) in to_start.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(
                    backend = %backend.name(),
                    error = %e,
                    "reloaded backend did not start"
                );
            }
        }
        Ok(plan)
    }
}

/// Wait until no session references `backend`, then stop it.
async fn drain_and_stop(backend: Arc<dyn Backend>) {
    let descriptor = backend.descriptor().clone();
    if descriptor.active_sessions() > 0 {
        tracing::info!(
            backend = %backend.name(),
            sessions = descriptor.active_sessions(),
            "Draining sessions before stopping backend"
        );
    }
    while descriptor.active_sessions() > 0 {
        tokio::time::sleep(DRAIN_POLL).await;
    }
    backend.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{HealthState, LaunchSpec};
    use crate::session::{SessionManager, SessionSettings, SessionTransport};
    use crate::testing::{EchoOptions, ScriptedLauncher, test_process_settings};
    use std::collections::BTreeMap as Map;

    fn spec(name: &str, arg: &str) -> BackendSpec {
        BackendSpec::process(
            name,
            LaunchSpec {
                command: "scripted-echo".to_string(),
                args: vec![arg.to_string()],
                env: Map::new(),
            },
        )
    }

    fn manager(launcher: Arc<ScriptedLauncher>) -> Arc<BackendManager> {
        let factory =
            BackendFactory::new(launcher, test_process_settings(), RemoteSettings::default())
                .unwrap();
        Arc::new(BackendManager::new(Arc::new(Registry::new()), factory))
    }

    #[tokio::test]
    async fn healthy_tools_omits_unhealthy_backends() {
        let launcher = ScriptedLauncher::new(EchoOptions::default());
        let manager = manager(launcher);
        manager.register(spec("a", "1")).unwrap();
        manager.register(spec("b", "1")).unwrap();
        assert_eq!(manager.start_all().await, 0);
        assert_eq!(
            manager.healthy_tools().keys().collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        manager
            .get_backend("b")
            .unwrap()
            .descriptor()
            .set_health(HealthState::Degraded);
        assert_eq!(manager.healthy_tools().keys().collect::<Vec<_>>(), vec!["a"]);
    }

    #[tokio::test]
    async fn reload_leaves_unchanged_backends_running() {
        let launcher = ScriptedLauncher::new(EchoOptions::default());
        let manager = manager(launcher.clone());
        manager.register(spec("keep", "1")).unwrap();
        manager.register(spec("swap", "1")).unwrap();
        manager.register(spec("drop", "1")).unwrap();
        manager.start_all().await;
        assert_eq!(launcher.launches(), 3);
        let kept = manager.get_backend("keep").unwrap();

        let plan = manager
            .apply_reload(vec![spec("keep", "1"), spec("swap", "2"), spec("new", "1")])
            .await
            .unwrap();
        assert_eq!(plan.unchanged, vec!["keep".to_string()]);
        assert_eq!(plan.replaced.len(), 1);
        assert_eq!(plan.removed.len(), 1);
        assert_eq!(plan.added.len(), 1);

        // Only the redefined and the new backend were launched.
        assert_eq!(launcher.launches(), 5);
        assert!(Arc::ptr_eq(&kept, &manager.get_backend("keep").unwrap()));
        assert!(matches!(
            manager.get_backend("drop"),
            Err(GatewayError::UnknownBackend(_))
        ));
        assert!(manager.get_backend("new").unwrap().descriptor().is_healthy());
    }

    #[tokio::test]
    async fn removed_backend_stops_only_after_sessions_drain() {
        let launcher = ScriptedLauncher::new(EchoOptions::default());
        let manager = manager(launcher);
        manager.register(spec("old", "1")).unwrap();
        manager.start_all().await;
        let sessions = Arc::new(SessionManager::new(
            manager.clone(),
            SessionSettings::default(),
        ));
        let opened = sessions.open("old", SessionTransport::SyncHttp).unwrap();
        let old = manager.get_backend("old").unwrap();

        manager.apply_reload(Vec::new()).await.unwrap();
        tokio::time::sleep(DRAIN_POLL * 2).await;
        assert!(old.descriptor().is_healthy());
        assert!(matches!(
            sessions.open("old", SessionTransport::SyncHttp),
            Err(GatewayError::UnknownBackend(_))
        ));

        sessions.close(opened.session.id(), GatewayError::SessionClosed);
        for _ in 0..100 {
            if old.descriptor().health() == HealthState::Unknown {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("drained backend was never stopped");
    }
}
