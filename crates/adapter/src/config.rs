//! Configuration parsing and validation.
//!
//! Sources, lowest precedence first: built-in defaults, the config file (`gateway` + `servers`),
//! legacy `mcpServers` JSON files, then CLI flags / `MCP_MUX_*` env vars (clap handles CLI > env).

use crate::env::expand_env_string as expand;
use crate::env::serde_helpers::{deserialize_option_bool_env, deserialize_option_u64_env};
use crate::error::{GatewayError, Result};
use crate::health::HealthSettings;
use crate::registry::{BackendSpec, LaunchSpec};
use crate::remote::RemoteSettings;
use crate::session::SessionSettings;
use crate::supervisor::ProcessSettings;
use crate::timeouts::{CallTimeouts, DEFAULT_CALL_TIMEOUT_SECS, DEFAULT_MAX_CALL_TIMEOUT_SECS};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "mcp-mux")]
#[command(
    version,
    about = "Multiplex stdio MCP servers behind one HTTP + SSE endpoint"
)]
pub struct CliArgs {
    /// Path to YAML config file (JSON when the extension is `.json`).
    #[arg(short = 'c', long = "config", env = "MCP_MUX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path(s) to MCP servers JSON config (mcpServers format).
    /// Can be specified multiple times.
    #[arg(
        short = 'm',
        long = "mcp-config",
        env = "MCP_MUX_MCP_CONFIG",
        value_delimiter = ':'
    )]
    pub mcp_config: Vec<PathBuf>,

    /// Print the fully resolved configuration and exit.
    #[arg(long = "print-effective-config")]
    pub print_effective_config: bool,

    /// HTTP bind address (ip:port)
    #[arg(short = 'b', long, env = "MCP_MUX_BIND")]
    pub bind: Option<String>,

    /// Log level. Supports tracing filter syntax.
    #[arg(short = 'l', long = "log-level", env = "MCP_MUX_LOG")]
    pub log_level: Option<String>,

    /// Default deadline for forwarded requests (seconds)
    #[arg(long, env = "MCP_MUX_CALL_TIMEOUT")]
    pub call_timeout: Option<u64>,

    /// Max time for a backend to spawn, initialize and list tools (seconds)
    #[arg(long, env = "MCP_MUX_STARTUP_TIMEOUT")]
    pub startup_timeout: Option<u64>,

    /// Close sessions idle for this long (seconds)
    #[arg(long, env = "MCP_MUX_IDLE_TIMEOUT")]
    pub idle_timeout: Option<u64>,

    /// Minimum restart backoff in milliseconds.
    #[arg(long, env = "MCP_MUX_RESTART_BACKOFF_MIN_MS")]
    pub restart_backoff_min_ms: Option<u64>,

    /// Maximum restart backoff in milliseconds.
    #[arg(long, env = "MCP_MUX_RESTART_BACKOFF_MAX_MS")]
    pub restart_backoff_max_ms: Option<u64>,

    /// Consecutive failed restarts before a backend is left crashed.
    #[arg(long, env = "MCP_MUX_MAX_RESTARTS")]
    pub max_restarts: Option<u32>,

    /// Seconds between health probes.
    #[arg(long, env = "MCP_MUX_HEALTH_INTERVAL")]
    pub health_interval: Option<u64>,

    /// Serve one backend over this process's stdin/stdout instead of HTTP.
    #[arg(long, value_name = "BACKEND")]
    pub stdio: Option<String>,
}

// ============================================================================
// Gateway settings
// ============================================================================

const DEFAULT_BIND: &str = "127.0.0.1:3000";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 900;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 15;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;
const DEFAULT_HEALTH_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_JANITOR_INTERVAL_MS: u64 = 500;
const DEFAULT_SESSION_QUEUE: usize = 64;
const DEFAULT_WRITE_QUEUE: usize = 256;
const DEFAULT_MAX_POST_BODY_BYTES: usize = 4 * 1024 * 1024;
const DEFAULT_MAX_RESTARTS: u32 = 5;
const DEFAULT_RESTART_BACKOFF_MIN_MS: u64 = 1000;
const DEFAULT_RESTART_BACKOFF_MAX_MS: u64 = 30000;

/// Effective gateway settings (after merging defaults + config + env + CLI).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySettings {
    pub bind: String,
    pub log_level: String,
    pub call_timeout: u64,
    pub max_call_timeout: u64,
    pub startup_timeout: u64,
    pub idle_timeout: u64,
    pub heartbeat_interval: u64,
    pub health_interval: u64,
    pub health_failure_threshold: u32,
    pub probe_refreshes_tools: bool,
    pub janitor_interval_ms: u64,
    pub session_queue: usize,
    pub write_queue: usize,
    pub max_post_body_bytes: usize,
    pub max_frame_bytes: usize,
    pub max_restarts: u32,
    pub restart_backoff: RestartBackoff,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartBackoff {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            call_timeout: DEFAULT_CALL_TIMEOUT_SECS,
            max_call_timeout: DEFAULT_MAX_CALL_TIMEOUT_SECS,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT_SECS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT_SECS,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            health_interval: DEFAULT_HEALTH_INTERVAL_SECS,
            health_failure_threshold: DEFAULT_HEALTH_FAILURE_THRESHOLD,
            probe_refreshes_tools: true,
            janitor_interval_ms: DEFAULT_JANITOR_INTERVAL_MS,
            session_queue: DEFAULT_SESSION_QUEUE,
            write_queue: DEFAULT_WRITE_QUEUE,
            max_post_body_bytes: DEFAULT_MAX_POST_BODY_BYTES,
            max_frame_bytes: mcp_mux_protocol::DEFAULT_MAX_FRAME_BYTES,
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_backoff: RestartBackoff {
                min_ms: DEFAULT_RESTART_BACKOFF_MIN_MS,
                max_ms: DEFAULT_RESTART_BACKOFF_MAX_MS,
            },
        }
    }
}

impl GatewaySettings {
    pub fn call_timeouts(&self) -> CallTimeouts {
        CallTimeouts {
            default: Duration::from_secs(self.call_timeout),
            max: Duration::from_secs(self.max_call_timeout),
        }
    }

    pub fn heartbeat_interval_duration(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    pub fn process_settings(&self) -> ProcessSettings {
        ProcessSettings {
            startup_timeout: Duration::from_secs(self.startup_timeout),
            restart_backoff_min: Duration::from_millis(self.restart_backoff.min_ms),
            restart_backoff_max: Duration::from_millis(self.restart_backoff.max_ms),
            max_restarts: self.max_restarts,
            write_queue: self.write_queue,
            max_frame_bytes: self.max_frame_bytes,
            probe_refreshes_tools: self.probe_refreshes_tools,
            ..ProcessSettings::default()
        }
    }

    pub fn remote_settings(&self) -> RemoteSettings {
        RemoteSettings {
            startup_timeout: Duration::from_secs(self.startup_timeout),
            ..RemoteSettings::default()
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            idle_timeout: Duration::from_secs(self.idle_timeout),
            timeouts: self.call_timeouts(),
            queue_capacity: self.session_queue,
            janitor_interval: Duration::from_millis(self.janitor_interval_ms),
        }
    }

    pub fn health_settings(&self) -> HealthSettings {
        HealthSettings {
            interval: Duration::from_secs(self.health_interval),
            failure_threshold: self.health_failure_threshold,
            ..HealthSettings::default()
        }
    }
}

/// `gateway:` section as written in the config file (all fields optional).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GatewaySection {
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub call_timeout: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub max_call_timeout: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub startup_timeout: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub idle_timeout: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub heartbeat_interval: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub health_interval: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub health_failure_threshold: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_bool_env")]
    pub probe_refreshes_tools: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub janitor_interval_ms: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub session_queue: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub write_queue: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub max_post_body_bytes: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub max_frame_bytes: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub max_restarts: Option<u64>,
    #[serde(default)]
    pub restart_backoff: RestartBackoffConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RestartBackoffConfig {
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub min_ms: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_option_u64_env")]
    pub max_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

// ============================================================================
// Servers
// ============================================================================

/// Legacy MCP JSON configuration format.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpConfigFile {
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, ProcessServerConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProcessServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerConfig {
    Process {
        #[serde(flatten)]
        config: ProcessServerConfig,
    },
    Remote { url: String },
}

impl ServerConfig {
    fn into_spec(self, name: String) -> BackendSpec {
        match self {
            ServerConfig::Process { config } => BackendSpec::process(
                name,
                LaunchSpec {
                    command: config.command,
                    args: config.args,
                    env: config.env,
                },
            ),
            ServerConfig::Remote { url } => BackendSpec::remote(name, url),
        }
    }
}

// ============================================================================
// Effective Configuration
// ============================================================================

/// Merged configuration from all sources.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub cli: CliArgs,
    pub gateway: GatewaySettings,
    pub servers: BTreeMap<String, ServerConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveConfig {
    pub gateway: GatewaySettings,
    pub servers: BTreeMap<String, ServerConfig>,
}

impl GatewayConfig {
    pub fn effective(&self) -> EffectiveConfig {
        EffectiveConfig {
            gateway: self.gateway.clone(),
            servers: self.servers.clone(),
        }
    }

    /// Backend definitions for the registry, ordered by name.
    pub fn backend_specs(&self) -> Vec<BackendSpec> {
        self.servers
            .iter()
            .map(|(name, server)| server.clone().into_spec(name.clone()))
            .collect()
    }

    /// Load and merge configuration from CLI args, env, and config files.
    pub fn load(cli: CliArgs) -> Result<Self> {
        if cli.config.is_none() && cli.mcp_config.is_empty() {
            return Err(GatewayError::Config(
                "No configuration provided. Use --config or --mcp-config".to_string(),
            ));
        }

        let mut gateway = GatewaySettings::default();
        let mut servers: BTreeMap<String, ServerConfig> = BTreeMap::new();

        // 1) Config file.
        if let Some(config_path) = &cli.config {
            let file = load_config_file(config_path)?;
            apply_gateway_section(&mut gateway, file.gateway)?;
            for (name, server) in file.servers {
                servers.insert(name, expand_server_env_vars(server)?);
            }
        }

        // 2) Legacy `--mcp-config` files.
        apply_legacy_mcp_configs(&mut servers, &cli.mcp_config)?;

        // 3) CLI/ENV overrides.
        apply_cli_overrides(&mut gateway, &cli)?;

        validate(&mut gateway)?;

        Ok(Self {
            cli,
            gateway,
            servers,
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::Config(format!("Failed to read {}: {}", path.display(), e)))?;

    if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&content)
            .map_err(|e| GatewayError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    } else {
        serde_yaml::from_str(&content)
            .map_err(|e| GatewayError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }
}

fn to_usize(field: &str, v: u64) -> Result<usize> {
    usize::try_from(v).map_err(|_| GatewayError::Config(format!("{field} is too large: {v}")))
}

fn to_u32(field: &str, v: u64) -> Result<u32> {
    u32::try_from(v).map_err(|_| GatewayError::Config(format!("{field} is too large: {v}")))
}

fn apply_gateway_section(gateway: &mut GatewaySettings, section: GatewaySection) -> Result<()> {
    if let Some(bind) = section.bind {
        gateway.bind = expand_env_string(&bind)?;
    }
    if let Some(level) = section.log_level {
        gateway.log_level = expand_env_string(&level)?;
    }
    if let Some(v) = section.call_timeout {
        gateway.call_timeout = v;
    }
    if let Some(v) = section.max_call_timeout {
        gateway.max_call_timeout = v;
    }
    if let Some(v) = section.startup_timeout {
        gateway.startup_timeout = v;
    }
    if let Some(v) = section.idle_timeout {
        gateway.idle_timeout = v;
    }
    if let Some(v) = section.heartbeat_interval {
        gateway.heartbeat_interval = v;
    }
    if let Some(v) = section.health_interval {
        gateway.health_interval = v;
    }
    if let Some(v) = section.health_failure_threshold {
        gateway.health_failure_threshold = to_u32("healthFailureThreshold", v)?;
    }
    if let Some(v) = section.probe_refreshes_tools {
        gateway.probe_refreshes_tools = v;
    }
    if let Some(v) = section.janitor_interval_ms {
        gateway.janitor_interval_ms = v;
    }
    if let Some(v) = section.session_queue {
        gateway.session_queue = to_usize("sessionQueue", v)?;
    }
    if let Some(v) = section.write_queue {
        gateway.write_queue = to_usize("writeQueue", v)?;
    }
    if let Some(v) = section.max_post_body_bytes {
        gateway.max_post_body_bytes = to_usize("maxPostBodyBytes", v)?;
    }
    if let Some(v) = section.max_frame_bytes {
        gateway.max_frame_bytes = to_usize("maxFrameBytes", v)?;
    }
    if let Some(v) = section.max_restarts {
        gateway.max_restarts = to_u32("maxRestarts", v)?;
    }
    if let Some(v) = section.restart_backoff.min_ms {
        gateway.restart_backoff.min_ms = v;
    }
    if let Some(v) = section.restart_backoff.max_ms {
        gateway.restart_backoff.max_ms = v;
    }
    Ok(())
}

fn apply_cli_overrides(gateway: &mut GatewaySettings, cli: &CliArgs) -> Result<()> {
    if let Some(bind) = &cli.bind {
        gateway.bind = expand_env_string(bind)?;
    }

    // Precedence for log level:
    // CLI flag (--log-level) / MCP_MUX_LOG env (via clap) > RUST_LOG env > config file > defaults
    if let Some(level) = &cli.log_level {
        gateway.log_level.clone_from(level);
    } else if let Ok(level) = std::env::var("RUST_LOG") {
        gateway.log_level = level;
    }

    if let Some(v) = cli.call_timeout {
        gateway.call_timeout = v;
    }
    if let Some(v) = cli.startup_timeout {
        gateway.startup_timeout = v;
    }
    if let Some(v) = cli.idle_timeout {
        gateway.idle_timeout = v;
    }
    if let Some(v) = cli.restart_backoff_min_ms {
        gateway.restart_backoff.min_ms = v;
    }
    if let Some(v) = cli.restart_backoff_max_ms {
        gateway.restart_backoff.max_ms = v;
    }
    if let Some(v) = cli.max_restarts {
        gateway.max_restarts = v;
    }
    if let Some(v) = cli.health_interval {
        gateway.health_interval = v;
    }
    Ok(())
}

fn validate(gateway: &mut GatewaySettings) -> Result<()> {
    if gateway.restart_backoff.min_ms > gateway.restart_backoff.max_ms {
        return Err(GatewayError::Config(format!(
            "Invalid restart backoff: minMs ({}) must be <= maxMs ({})",
            gateway.restart_backoff.min_ms, gateway.restart_backoff.max_ms
        )));
    }

    for (field, value) in [
        ("callTimeout", gateway.call_timeout),
        ("maxCallTimeout", gateway.max_call_timeout),
        ("startupTimeout", gateway.startup_timeout),
        ("idleTimeout", gateway.idle_timeout),
        ("heartbeatInterval", gateway.heartbeat_interval),
        ("healthInterval", gateway.health_interval),
        ("janitorIntervalMs", gateway.janitor_interval_ms),
    ] {
        if value == 0 {
            return Err(GatewayError::Config(format!("{field} must be > 0")));
        }
    }

    if gateway.health_failure_threshold == 0 {
        return Err(GatewayError::Config(
            "healthFailureThreshold must be >= 1".to_string(),
        ));
    }
    for (field, value) in [
        ("sessionQueue", gateway.session_queue),
        ("writeQueue", gateway.write_queue),
        ("maxPostBodyBytes", gateway.max_post_body_bytes),
        ("maxFrameBytes", gateway.max_frame_bytes),
    ] {
        if value == 0 {
            return Err(GatewayError::Config(format!("{field} must be >= 1")));
        }
    }

    if gateway.call_timeout > gateway.max_call_timeout {
        tracing::warn!(
            call_timeout = gateway.call_timeout,
            max_call_timeout = gateway.max_call_timeout,
            "callTimeout exceeds maxCallTimeout; clamping"
        );
        gateway.call_timeout = gateway.max_call_timeout;
    }
    Ok(())
}

fn apply_legacy_mcp_configs(
    servers: &mut BTreeMap<String, ServerConfig>,
    paths: &[PathBuf],
) -> Result<()> {
    let mut seen_paths: Vec<PathBuf> = Vec::new();
    for path in paths {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
        if seen_paths.contains(&canonical) {
            continue;
        }
        seen_paths.push(canonical);

        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let file: McpConfigFile = serde_json::from_str(&content).map_err(|e| {
            GatewayError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        for (name, server_config) in file.mcp_servers {
            let expanded = ServerConfig::Process {
                config: expand_process_env_vars(server_config)?,
            };
            merge_server(servers, name, expanded, &path.display().to_string())?;
        }
    }
    Ok(())
}

fn merge_server(
    servers: &mut BTreeMap<String, ServerConfig>,
    name: String,
    new_server: ServerConfig,
    source: &str,
) -> Result<()> {
    match servers.get(&name) {
        None => {
            servers.insert(name, new_server);
            Ok(())
        }
        // Identical definitions from several files are deduplicated.
        Some(existing) if *existing == new_server => Ok(()),
        Some(_) => Err(GatewayError::Config(format!(
            "Conflicting configurations for server '{name}' from {source}"
        ))),
    }
}

fn expand_server_env_vars(server: ServerConfig) -> Result<ServerConfig> {
    match server {
        ServerConfig::Process { config } => Ok(ServerConfig::Process {
            config: expand_process_env_vars(config)?,
        }),
        ServerConfig::Remote { url } => Ok(ServerConfig::Remote {
            url: expand_env_string(&url)?,
        }),
    }
}

fn expand_process_env_vars(mut config: ProcessServerConfig) -> Result<ProcessServerConfig> {
    config.command = expand_env_string(&config.command)?;
    config.args = config
        .args
        .into_iter()
        .map(|arg| expand_env_string(&arg))
        .collect::<Result<Vec<_>>>()?;
    config.env = config
        .env
        .into_iter()
        .map(|(k, v)| Ok((k, expand_env_string(&v)?)))
        .collect::<Result<BTreeMap<_, _>>>()?;
    Ok(config)
}

/// Expand ${VAR} patterns in a string.
pub fn expand_env_string(s: &str) -> Result<String> {
    expand(s).map_err(GatewayError::Config)
}

// ============================================================================
// Tests
// ============================================================================
