//! mcp-mux
//!
//! Serve stdio-based MCP servers to many clients over HTTP + SSE.

use clap::Parser;
use mcp_mux::config::{CliArgs, GatewayConfig};
use mcp_mux::error::GatewayError;
use mcp_mux::health::HealthMonitor;
use mcp_mux::http::{AppState, HttpSettings, create_router, with_request_counting};
use mcp_mux::manager::{BackendFactory, BackendManager};
use mcp_mux::registry::Registry;
use mcp_mux::session::SessionManager;
use mcp_mux::stdio_bridge;
use mcp_mux::supervisor::CommandLauncher;
use std::io::{IsTerminal as _, stderr, stdout};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();
    let config = GatewayConfig::load(cli)?;

    if config.cli.print_effective_config {
        let json = serde_json::to_string_pretty(&config.effective())?;
        println!("{json}");
        return Ok(());
    }

    let stdio_backend = config.cli.stdio.clone();
    init_logging(&config.gateway.log_level, stdio_backend.is_some());

    tracing::info!("Starting mcp-mux v{}", VERSION);

    let specs = config.backend_specs();
    tracing::info!("Loaded {} backend(s) from config", specs.len());
    if specs.is_empty() {
        tracing::warn!("No backends configured. Gateway will start but serve nothing.");
    }

    let settings = &config.gateway;
    let factory = BackendFactory::new(
        Arc::new(CommandLauncher),
        settings.process_settings(),
        settings.remote_settings(),
    )?;
    let backends = Arc::new(BackendManager::new(Arc::new(Registry::new()), factory));
    for spec in specs {
        backends.register(spec)?;
    }

    if !backends.is_empty() {
        tracing::info!("Starting all backends...");
        let failed = backends.start_all().await;
        if failed == 0 {
            tracing::info!("All backends started successfully");
        } else {
            tracing::warn!(failed, "Some backends failed to start; supervisor will retry");
        }
    }

    let ct = CancellationToken::new();
    let sessions = Arc::new(SessionManager::new(
        backends.clone(),
        settings.session_settings(),
    ));
    sessions.spawn_janitor(ct.child_token());
    Arc::new(HealthMonitor::new(backends.clone(), settings.health_settings()))
        .spawn(ct.child_token());

    #[cfg(unix)]
    spawn_reload_on_sighup(config.cli.clone(), backends.clone(), ct.child_token());

    if let Some(backend) = stdio_backend {
        let bridge = stdio_bridge::serve(
            sessions.clone(),
            &backend,
            tokio::io::stdin(),
            tokio::io::stdout(),
            settings.max_frame_bytes,
        );
        let result = tokio::select! {
            result = bridge => result,
            () = shutdown_signal() => Ok(()),
        };
        shutdown(&sessions, &backends, &ct).await;
        result?;
        tracing::info!("Gateway shut down gracefully");
        return Ok(());
    }

    let state = Arc::new(AppState::new(
        backends.clone(),
        sessions.clone(),
        HttpSettings {
            heartbeat_interval: settings.heartbeat_interval_duration(),
            max_post_body_bytes: settings.max_post_body_bytes,
        },
    ));
    let app = with_request_counting(create_router(state.clone()), state);

    let addr: SocketAddr = settings
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", settings.bind, e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Starting HTTP server on {}", listener.local_addr()?);

    let ct_clone = ct.clone();
    let server = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            ct_clone.cancelled().await;
        });

        if let Err(e) = server.await {
            tracing::error!(error = %e, "http server stopped with error");
        }
    });

    shutdown_signal().await;
    shutdown(&sessions, &backends, &ct).await;
    let _ = server.await;

    tracing::info!("Gateway shut down gracefully");
    Ok(())
}

/// Initialize logging based on the log level string.
///
/// In stdio mode stdout carries protocol frames, so logs go to stderr.
fn init_logging(log_level: &str, stdio_mode: bool) {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let is_tty = if stdio_mode {
        stderr().is_terminal()
    } else {
        stdout().is_terminal()
    };

    match (is_tty, stdio_mode) {
        (true, false) => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init(),
        (false, false) => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        (true, true) => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(stderr),
            )
            .init(),
        (false, true) => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(stderr))
            .init(),
    }
}

/// Re-read the same config sources on SIGHUP and apply the backend diff.
#[cfg(unix)]
fn spawn_reload_on_sighup(cli: CliArgs, backends: Arc<BackendManager>, ct: CancellationToken) {
    let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())
        .expect("Failed to install SIGHUP handler");

    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = ct.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
            }

            tracing::info!("Received SIGHUP, reloading configuration");
            let config = match GatewayConfig::load(cli.clone()) {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!(error = %e, "reload rejected; keeping current backends");
                    continue;
                }
            };
            match backends.apply_reload(config.backend_specs()).await {
                Ok(plan) => tracing::info!(
                    added = plan.added.len(),
                    replaced = plan.replaced.len(),
                    removed = plan.removed.len(),
                    unchanged = plan.unchanged.len(),
                    "configuration reloaded"
                ),
                Err(e) => tracing::error!(error = %e, "reload failed"),
            }
        }
    });
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}

async fn shutdown(sessions: &SessionManager, backends: &BackendManager, ct: &CancellationToken) {
    ct.cancel();
    sessions.close_all(&GatewayError::SessionClosed);
    backends.shutdown_all().await;
}
