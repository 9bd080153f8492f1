//! Backend registry: the catalog of named backends and their shared descriptors.
//!
//! A [`BackendDescriptor`] is created once per configured backend and shared (via `Arc`) by the
//! supervisor, the health monitor and every session bound to it. Health is written only by the
//! process supervisor and the health monitor; everything else reads it.

use crate::error::{GatewayError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// How the gateway reaches a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Supervised child process speaking JSON-RPC over stdio.
    Process,
    /// Already-HTTP MCP service.
    Remote,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Process => write!(f, "process"),
            TransportKind::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Unknown,
    Starting,
    Healthy,
    Degraded,
    Crashed,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Unknown => write!(f, "unknown"),
            HealthState::Starting => write!(f, "starting"),
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Crashed => write!(f, "crashed"),
        }
    }
}

/// Command line for a process-backed backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum Endpoint {
    Process(LaunchSpec),
    Remote { url: String },
}

/// Externally supplied definition of one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendSpec {
    pub name: String,
    #[serde(flatten)]
    pub endpoint: Endpoint,
}

impl BackendSpec {
    pub fn process(name: impl Into<String>, launch: LaunchSpec) -> Self {
        Self {
            name: name.into(),
            endpoint: Endpoint::Process(launch),
        }
    }

    pub fn remote(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: Endpoint::Remote { url: url.into() },
        }
    }

    pub fn transport(&self) -> TransportKind {
        match self.endpoint {
            Endpoint::Process(_) => TransportKind::Process,
            Endpoint::Remote { .. } => TransportKind::Remote,
        }
    }
}

/// Live, shared view of one registered backend.
#[derive(Debug)]
pub struct BackendDescriptor {
    spec: BackendSpec,
    health: RwLock<HealthState>,
    /// Cached `tools/list` entries (raw MCP tool objects).
    tools: RwLock<Arc<Vec<Value>>>,
    /// Cached `initialize` result.
    server_info: RwLock<Option<Value>>,
    active_sessions: AtomicUsize,
}

impl BackendDescriptor {
    pub fn new(spec: BackendSpec) -> Self {
        Self {
            spec,
            health: RwLock::new(HealthState::Unknown),
            tools: RwLock::new(Arc::new(Vec::new())),
            server_info: RwLock::new(None),
            active_sessions: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &BackendSpec {
        &self.spec
    }

    pub fn transport(&self) -> TransportKind {
        self.spec.transport()
    }

    pub fn health(&self) -> HealthState {
        *self.health.read()
    }

    pub fn is_healthy(&self) -> bool {
        self.health() == HealthState::Healthy
    }

    /// Returns the previous state. Only the supervisor and the health monitor call this.
    pub(crate) fn set_health(&self, next: HealthState) -> HealthState {
        let prev = std::mem::replace(&mut *self.health.write(), next);
        if prev != next {
            tracing::info!(backend = %self.spec.name, from = %prev, to = %next, "health changed");
        }
        prev
    }

    /// Transition only if the current state is `expected`. Returns whether it happened.
    pub(crate) fn transition_health(&self, expected: HealthState, next: HealthState) -> bool {
        let mut health = self.health.write();
        if *health != expected {
            return false;
        }
        *health = next;
        drop(health);
        if expected != next {
            tracing::info!(
                backend = %self.spec.name,
                from = %expected,
                to = %next,
                "health changed"
            );
        }
        true
    }

    pub fn tools(&self) -> Arc<Vec<Value>> {
        self.tools.read().clone()
    }

    pub(crate) fn set_tools(&self, tools: Vec<Value>) {
        *self.tools.write() = Arc::new(tools);
    }

    pub fn server_info(&self) -> Option<Value> {
        self.server_info.read().clone()
    }

    pub(crate) fn set_server_info(&self, info: Value) {
        *self.server_info.write() = Some(info);
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Acquire)
    }

    pub(crate) fn session_opened(&self) -> usize {
        self.active_sessions.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn session_closed(&self) -> usize {
        let prev = self
            .active_sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }
}

/// Outcome of [`Registry::reload`].
#[derive(Debug, Default)]
pub struct ReloadPlan {
    /// Newly registered; need starting.
    pub added: Vec<Arc<BackendDescriptor>>,
    /// Definition changed: `(old, new)`. The old one is out of the registry and must drain.
    pub replaced: Vec<(Arc<BackendDescriptor>, Arc<BackendDescriptor>)>,
    /// No longer configured; out of the registry and must drain.
    pub removed: Vec<Arc<BackendDescriptor>>,
    pub unchanged: Vec<String>,
}

impl ReloadPlan {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.replaced.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    backends: RwLock<BTreeMap<String, Arc<BackendDescriptor>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, spec: BackendSpec) -> Result<Arc<BackendDescriptor>> {
        let mut backends = self.backends.write();
        if backends.contains_key(&spec.name) {
            return Err(GatewayError::Config(format!(
                "backend '{}' is already registered",
                spec.name
            )));
        }
        let descriptor = Arc::new(BackendDescriptor::new(spec));
        backends.insert(descriptor.name().to_string(), descriptor.clone());
        Ok(descriptor)
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<BackendDescriptor>> {
        self.backends
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownBackend(name.to_string()))
    }

    pub fn list(&self) -> Vec<Arc<BackendDescriptor>> {
        self.backends.read().values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.read().is_empty()
    }

    /// Swap in a new backend set, keeping descriptors whose definition did not change.
    pub fn reload(&self, specs: Vec<BackendSpec>) -> Result<ReloadPlan> {
        let mut incoming: HashMap<String, BackendSpec> = HashMap::with_capacity(specs.len());
        for spec in specs {
            let name = spec.name.clone();
            if incoming.insert(name.clone(), spec).is_some() {
                return Err(GatewayError::Config(format!(
                    "backend '{name}' is defined more than once"
                )));
            }
        }

        let mut plan = ReloadPlan::default();
        let mut backends = self.backends.write();

        let gone: Vec<String> = backends
            .keys()
            .filter(|name| !incoming.contains_key(*name))
            .cloned()
            .collect();
        for name in gone {
            if let Some(old) = backends.remove(&name) {
                plan.removed.push(old);
            }
        }

        for (name, spec) in incoming {
            match backends.get(&name) {
                Some(existing) if existing.spec() == &spec => plan.unchanged.push(name),
                Some(existing) => {
                    let old = existing.clone();
                    let new = Arc::new(BackendDescriptor::new(spec));
                    backends.insert(name, new.clone());
                    plan.replaced.push((old, new));
                }
                None => {
                    let new = Arc::new(BackendDescriptor::new(spec));
                    backends.insert(name, new.clone());
                    plan.added.push(new);
                }
            }
        }

        plan.unchanged.sort();
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(cmd: &str) -> BackendSpec {
        BackendSpec::process(
            "echo",
            LaunchSpec {
                command: cmd.to_string(),
                args: vec![],
                env: BTreeMap::new(),
            },
        )
    }

    #[test]
    fn lookup_unknown_backend_fails() {
        let registry = Registry::new();
        let err = registry.lookup("nope").unwrap_err();
        assert!(matches!(err, GatewayError::UnknownBackend(ref n) if n == "nope"));
    }

    #[test]
    fn register_rejects_duplicates() {
        let registry = Registry::new();
        registry.register(echo("a")).unwrap();
        assert!(registry.register(echo("b")).is_err());
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn reload_diffs_added_removed_replaced_and_unchanged() {
        let registry = Registry::new();
        let kept = registry
            .register(BackendSpec::remote("search", "http://a/mcp"))
            .unwrap();
        let old_echo = registry.register(echo("node")).unwrap();
        registry
            .register(BackendSpec::remote("gone", "http://b/mcp"))
            .unwrap();

        let plan = registry
            .reload(vec![
                BackendSpec::remote("search", "http://a/mcp"),
                echo("python"),
                BackendSpec::remote("fresh", "http://c/mcp"),
            ])
            .unwrap();

        assert_eq!(plan.unchanged, vec!["search".to_string()]);
        assert_eq!(plan.added.len(), 1);
        assert_eq!(plan.added[0].name(), "fresh");
        assert_eq!(plan.removed.len(), 1);
        assert_eq!(plan.removed[0].name(), "gone");
        assert_eq!(plan.replaced.len(), 1);
        assert!(Arc::ptr_eq(&plan.replaced[0].0, &old_echo));

        // Unchanged entries keep their descriptor (and therefore their process).
        assert!(Arc::ptr_eq(&registry.lookup("search").unwrap(), &kept));
        assert!(registry.lookup("gone").is_err());
        assert!(!Arc::ptr_eq(&registry.lookup("echo").unwrap(), &old_echo));
    }

    #[test]
    fn reload_rejects_duplicate_names() {
        let registry = Registry::new();
        assert!(registry.reload(vec![echo("a"), echo("b")]).is_err());
    }

    #[test]
    fn session_counter_never_underflows() {
        let d = BackendDescriptor::new(echo("a"));
        assert_eq!(d.session_opened(), 1);
        assert_eq!(d.session_closed(), 0);
        assert_eq!(d.session_closed(), 0);
        assert_eq!(d.active_sessions(), 0);
    }

    #[test]
    fn transition_health_is_conditional() {
        let d = BackendDescriptor::new(echo("a"));
        assert!(!d.transition_health(HealthState::Healthy, HealthState::Degraded));
        d.set_health(HealthState::Healthy);
        assert!(d.transition_health(HealthState::Healthy, HealthState::Degraded));
        assert_eq!(d.health(), HealthState::Degraded);
    }
}
